//! Authentication mechanisms and the credential listener surface.
//!
//! Mechanisms are negotiated per peer; the attachment validates requested
//! mechanism lists against the factory registry when peer security is
//! enabled. Key agreement itself happens in the transport-side auth
//! conversation, which consumes these types.

use std::collections::HashSet;
use std::sync::Mutex;

use meshbus_core::status::Status;
use zeroize::Zeroizing;

use crate::message::Message;

/// A pluggable authentication mechanism.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthMechanism {
    /// Anonymous (no credentials).
    Anonymous,
    /// External (transport-provided credentials).
    External,
    /// SRP key exchange.
    Srp,
    /// SRP with a logon table.
    Logon,
    /// ECDHE with no authentication.
    EcdheNull,
    /// ECDHE with a pre-shared key.
    EcdhePsk,
    /// ECDHE with a SPEKE password.
    EcdheSpeke,
    /// ECDHE with ECDSA identity certificates.
    EcdheEcdsa,
}

impl AuthMechanism {
    /// Canonical mechanism name used in `enable_peer_security` lists.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Anonymous => "ANONYMOUS",
            Self::External => "EXTERNAL",
            Self::Srp => "ALLJOYN_SRP_KEYX",
            Self::Logon => "ALLJOYN_SRP_LOGON",
            Self::EcdheNull => "ALLJOYN_ECDHE_NULL",
            Self::EcdhePsk => "ALLJOYN_ECDHE_PSK",
            Self::EcdheSpeke => "ALLJOYN_ECDHE_SPEKE",
            Self::EcdheEcdsa => "ALLJOYN_ECDHE_ECDSA",
        }
    }

    /// Parses a canonical mechanism name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "ANONYMOUS" => Some(Self::Anonymous),
            "EXTERNAL" => Some(Self::External),
            "ALLJOYN_SRP_KEYX" => Some(Self::Srp),
            "ALLJOYN_SRP_LOGON" => Some(Self::Logon),
            "ALLJOYN_ECDHE_NULL" => Some(Self::EcdheNull),
            "ALLJOYN_ECDHE_PSK" => Some(Self::EcdhePsk),
            "ALLJOYN_ECDHE_SPEKE" => Some(Self::EcdheSpeke),
            "ALLJOYN_ECDHE_ECDSA" => Some(Self::EcdheEcdsa),
            _ => None,
        }
    }
}

/// Credentials supplied by an [`AuthListener`]. Secret fields wipe on drop.
#[derive(Default)]
pub struct Credentials {
    /// Password / pre-shared key / SPEKE secret.
    pub password: Option<Zeroizing<String>>,
    /// User name (logon mechanisms).
    pub user_name: Option<String>,
    /// PEM certificate chain (ECDSA mechanism).
    pub cert_chain: Option<String>,
    /// PEM private key (ECDSA mechanism).
    pub private_key: Option<Zeroizing<String>>,
    /// Credential expiration in seconds, if limited.
    pub expiration: Option<u32>,
}

impl Credentials {
    /// Credentials carrying only a password.
    #[must_use]
    pub fn with_password(password: &str) -> Self {
        Self {
            password: Some(Zeroizing::new(password.to_string())),
            ..Self::default()
        }
    }
}

/// Application-supplied credential source for authentication rounds.
pub trait AuthListener: Send + Sync {
    /// Provide credentials for a round. Return `None` to refuse.
    fn request_credentials(
        &self,
        mechanism: AuthMechanism,
        peer_name: &str,
        attempt: u16,
    ) -> Option<Credentials>;

    /// Verify the peer's credentials (ECDSA chains). Defaults to accept.
    fn verify_credentials(
        &self,
        _mechanism: AuthMechanism,
        _peer_name: &str,
        _credentials: &Credentials,
    ) -> bool {
        true
    }

    /// A security violation involving this listener's peer was reported.
    fn security_violation(&self, _status: Status, _msg: &Message) {}

    /// An authentication conversation finished.
    fn authentication_complete(&self, _mechanism: AuthMechanism, _peer_name: &str, _success: bool) {
    }
}

/// Registry of available mechanism factories.
///
/// Mutex poisoning indicates a panic in another thread, which is
/// unrecoverable.
#[derive(Default)]
pub struct AuthManager {
    registered: Mutex<HashSet<AuthMechanism>>,
}

#[allow(clippy::missing_panics_doc)]
impl AuthManager {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a mechanism factory.
    pub fn register_mechanism(&self, mechanism: AuthMechanism) {
        self.registered.lock().unwrap().insert(mechanism);
    }

    /// Unregisters a mechanism factory.
    pub fn unregister_mechanism(&self, mechanism: AuthMechanism) {
        self.registered.lock().unwrap().remove(&mechanism);
    }

    /// Validates a space-separated mechanism list against the registry,
    /// returning the parsed mechanisms in order.
    ///
    /// # Errors
    ///
    /// [`Status::InvalidAuthMechanism`] on an unknown or unregistered name.
    pub fn check_names(&self, list: &str) -> Result<Vec<AuthMechanism>, Status> {
        let registered = self.registered.lock().unwrap();
        let mut mechanisms = Vec::new();
        for name in list.split_whitespace() {
            let mechanism =
                AuthMechanism::from_name(name).ok_or(Status::InvalidAuthMechanism)?;
            if !registered.contains(&mechanism) {
                return Err(Status::InvalidAuthMechanism);
            }
            mechanisms.push(mechanism);
        }
        Ok(mechanisms)
    }
}

/// Logon entries for the SRP-logon mechanism.
///
/// Mutex poisoning indicates a panic in another thread, which is
/// unrecoverable.
#[derive(Default)]
pub struct LogonTable {
    entries: Mutex<Vec<(String, Zeroizing<String>)>>,
}

#[allow(clippy::missing_panics_doc)]
impl LogonTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a user's logon entry.
    pub fn add_entry(&self, user_name: &str, password: &str) {
        let mut entries = self.entries.lock().unwrap();
        let password = Zeroizing::new(password.to_string());
        if let Some(entry) = entries.iter_mut().find(|(user, _)| user == user_name) {
            entry.1 = password;
        } else {
            entries.push((user_name.to_string(), password));
        }
    }

    /// True if the user has an entry.
    #[must_use]
    pub fn has_entry(&self, user_name: &str) -> bool {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .any(|(user, _)| user == user_name)
    }
}
