//! Application claim states, manifest templates, and the permission
//! configurator.
//!
//! The *manifest template* is what an application is willing to grant;
//! the *policy* installed by the certificate authority during claiming is
//! what is actually enforced. Both share the same rule model.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::sync::{Condvar, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::cert::CertificateX509;
use crate::crypto::{EccKeyPair, EccPrivateKey, KeyInfo};
use crate::status::Status;

/// Claim lifecycle state of an application.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ApplicationState {
    /// The application refuses claim attempts.
    NotClaimable,
    /// The application accepts a claim ceremony.
    Claimable,
    /// A certificate authority has claimed the application.
    Claimed,
    /// The application requests a policy update from its authority.
    NeedUpdate,
}

impl ApplicationState {
    /// Whether the transition `self` → `to` is allowed.
    ///
    /// Moving from `Claimed` back to `Claimable` is forbidden; that path
    /// requires a factory reset. An application may move itself to
    /// `NeedUpdate` only once claimed.
    #[must_use]
    pub const fn can_transition_to(self, to: Self) -> bool {
        match (self, to) {
            (Self::NotClaimable, Self::Claimable)
            | (Self::Claimable, Self::NotClaimable)
            | (Self::Claimable, Self::Claimed)
            | (Self::Claimed, Self::NeedUpdate)
            | (Self::NeedUpdate, Self::Claimed) => true,
            _ => self as u8 == to as u8,
        }
    }

    /// Wire code used in `State` signals.
    #[must_use]
    pub const fn code(self) -> u16 {
        match self {
            Self::NotClaimable => 0,
            Self::Claimable => 1,
            Self::Claimed => 2,
            Self::NeedUpdate => 3,
        }
    }

    /// Parses a wire code.
    #[must_use]
    pub const fn from_code(code: u16) -> Option<Self> {
        match code {
            0 => Some(Self::NotClaimable),
            1 => Some(Self::Claimable),
            2 => Some(Self::Claimed),
            3 => Some(Self::NeedUpdate),
            _ => None,
        }
    }
}

/// Bitmask of bootstrap authentication mechanisms acceptable for claiming.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClaimCapabilities(pub u16);

impl ClaimCapabilities {
    /// Claim over ECDHE_NULL.
    pub const ECDHE_NULL: Self = Self(0x01);
    /// Claim over ECDHE_PSK.
    pub const ECDHE_PSK: Self = Self(0x02);
    /// Claim over ECDHE_SPEKE.
    pub const ECDHE_SPEKE: Self = Self(0x04);

    /// No capabilities.
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    /// True if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two capability masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Minimum number of hex digits a SPEKE claim password must carry.
pub const MIN_SPEKE_PASSWORD_HEX_DIGITS: usize = 6;

/// Validates a password exposed for ECDHE_SPEKE claiming.
///
/// # Errors
///
/// Returns [`Status::BadArg`]\(1\) if the password is shorter than six hex
/// digits or contains non-hex characters.
pub fn validate_speke_password(password: &str) -> Result<(), Status> {
    if password.len() < MIN_SPEKE_PASSWORD_HEX_DIGITS
        || !password.chars().all(|c| c.is_ascii_hexdigit())
    {
        return Err(Status::BadArg(1));
    }
    Ok(())
}

/// Action bits granted by a manifest or policy member entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ActionMask(pub u8);

impl ActionMask {
    /// The member may be provided (implemented and announced).
    pub const PROVIDE: Self = Self(0x01);
    /// The member may be observed (signals received, properties read).
    pub const OBSERVE: Self = Self(0x02);
    /// The member may be modified (methods called, properties written).
    pub const MODIFY: Self = Self(0x04);

    /// True if every bit of `other` is set in `self`.
    #[must_use]
    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    /// Union of two masks.
    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }
}

/// Kind of interface member a rule entry names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberType {
    /// A method member.
    Method,
    /// A signal member.
    Signal,
    /// A property member.
    Property,
}

/// One member entry of a permission rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberEntry {
    /// Member name; `*` is the wildcard.
    pub member_name: String,
    /// Member kind; `None` matches any kind.
    pub member_type: Option<MemberType>,
    /// Granted actions.
    pub action_mask: ActionMask,
}

impl MemberEntry {
    /// Builds an entry.
    #[must_use]
    pub fn new(name: &str, member_type: Option<MemberType>, action_mask: ActionMask) -> Self {
        Self {
            member_name: name.to_string(),
            member_type,
            action_mask,
        }
    }

    /// True if this entry covers the given member name and kind.
    #[must_use]
    pub fn matches(&self, name: &str, member_type: MemberType) -> bool {
        (self.member_name == "*" || self.member_name == name)
            && self.member_type.map_or(true, |t| t == member_type)
    }
}

/// One rule: an interface name plus its member entries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionRule {
    /// Interface the rule applies to; `*` is the wildcard.
    pub interface_name: String,
    /// Member entries.
    pub members: Vec<MemberEntry>,
}

impl PermissionRule {
    /// Builds a rule.
    #[must_use]
    pub fn new(interface_name: &str, members: Vec<MemberEntry>) -> Self {
        Self {
            interface_name: interface_name.to_string(),
            members,
        }
    }

    /// Actions this rule grants for a member, unioned over matching entries.
    #[must_use]
    pub fn granted_actions(&self, member: &str, member_type: MemberType) -> ActionMask {
        self.members
            .iter()
            .filter(|entry| entry.matches(member, member_type))
            .fold(ActionMask::default(), |acc, entry| {
                acc.union(entry.action_mask)
            })
    }
}

/// A manifest template: the rules an application offers at claim time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestTemplate {
    /// The offered rules.
    pub rules: Vec<PermissionRule>,
}

impl ManifestTemplate {
    /// Default manifest for a producer: wildcard methods and properties
    /// with the provide action.
    #[must_use]
    pub fn default_producer(interface_name: &str) -> Self {
        Self {
            rules: vec![PermissionRule::new(
                interface_name,
                vec![
                    MemberEntry::new("*", Some(MemberType::Method), ActionMask::PROVIDE),
                    MemberEntry::new("*", Some(MemberType::Property), ActionMask::PROVIDE),
                ],
            )],
        }
    }

    /// Default manifest for a consumer: one wildcard member of unspecified
    /// kind with modify and observe actions.
    #[must_use]
    pub fn default_consumer(interface_name: &str) -> Self {
        Self {
            rules: vec![PermissionRule::new(
                interface_name,
                vec![MemberEntry::new(
                    "*",
                    None,
                    ActionMask::MODIFY.union(ActionMask::OBSERVE),
                )],
            )],
        }
    }

    /// Serializes the template to its JSON document form.
    ///
    /// # Errors
    ///
    /// Propagates serializer failure.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Parses the JSON document form.
    ///
    /// # Errors
    ///
    /// Propagates parse failure.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }
}

/// A CA-installed policy: versioned, serial-numbered rules that are
/// actually enforced.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PermissionPolicy {
    /// Specification version of the policy format.
    pub version: u16,
    /// Monotonic serial assigned by the authority.
    pub serial: u32,
    /// Enforced rules.
    pub rules: Vec<PermissionRule>,
}

impl PermissionPolicy {
    /// Builds a policy.
    #[must_use]
    pub const fn new(serial: u32, rules: Vec<PermissionRule>) -> Self {
        Self {
            version: 1,
            serial,
            rules,
        }
    }

    /// Actions the policy grants for `(interface, member, kind)`.
    #[must_use]
    pub fn granted_actions(
        &self,
        interface: &str,
        member: &str,
        member_type: MemberType,
    ) -> ActionMask {
        self.rules
            .iter()
            .filter(|rule| rule.interface_name == "*" || rule.interface_name == interface)
            .fold(ActionMask::default(), |acc, rule| {
                acc.union(rule.granted_actions(member, member_type))
            })
    }
}

/// Callbacks attached alongside peer security for management ceremonies.
pub trait PermissionConfigurationListener: Send + Sync {
    /// The application was factory reset; perform application-specific
    /// cleanup. Returning an error surfaces a failed reset to the manager.
    fn factory_reset(&self) -> Result<(), Status> {
        Ok(())
    }
    /// The installed policy changed.
    fn policy_changed(&self) {}
    /// A management session started.
    fn start_management(&self) {}
    /// A management session ended.
    fn end_management(&self) {}
}

/// Errors from the permission configurator.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum PermissionError {
    /// The requested state transition is not allowed.
    #[error("invalid application state transition")]
    InvalidStateTransition,
    /// The operation requires a signing key pair.
    #[error("no signing key pair has been generated")]
    NoSigningKey,
    /// The operation requires the application to be claimable.
    #[error("application is not claimable")]
    NotClaimable,
}

impl From<PermissionError> for Status {
    fn from(err: PermissionError) -> Self {
        match err {
            PermissionError::InvalidStateTransition | PermissionError::NotClaimable => {
                Status::InvalidApplicationState
            }
            PermissionError::NoSigningKey => Status::KeyUnavailable,
        }
    }
}

struct ConfiguratorInner {
    state: ApplicationState,
    manifest_template: ManifestTemplate,
    policy: Option<PermissionPolicy>,
    signing_key: Option<EccKeyPair>,
    claim_capabilities: ClaimCapabilities,
}

/// Exposes the limited permission-management surface to the application.
pub struct PermissionConfigurator {
    inner: Mutex<ConfiguratorInner>,
    state_changed: Condvar,
    /// Invoked (outside the lock) after every state change; the attachment
    /// uses this to emit the `State` signal.
    state_callback: Mutex<Option<Box<dyn Fn(ApplicationState) + Send + Sync>>>,
}

impl Default for PermissionConfigurator {
    fn default() -> Self {
        Self::new()
    }
}

impl PermissionConfigurator {
    /// Creates a configurator in the not-claimable state.
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(ConfiguratorInner {
                state: ApplicationState::NotClaimable,
                manifest_template: ManifestTemplate::default(),
                policy: None,
                signing_key: None,
                claim_capabilities: ClaimCapabilities::ECDHE_NULL
                    .union(ClaimCapabilities::ECDHE_PSK)
                    .union(ClaimCapabilities::ECDHE_SPEKE),
            }),
            state_changed: Condvar::new(),
            state_callback: Mutex::new(None),
        }
    }

    /// Registers the state-change callback, replacing any previous one.
    pub fn set_state_callback(&self, callback: Box<dyn Fn(ApplicationState) + Send + Sync>) {
        *self.state_callback.lock().unwrap() = Some(callback);
    }

    /// Current application state.
    #[must_use]
    pub fn application_state(&self) -> ApplicationState {
        self.inner.lock().unwrap().state
    }

    /// Requests a state transition.
    ///
    /// # Errors
    ///
    /// [`PermissionError::InvalidStateTransition`] for forbidden moves
    /// (notably `Claimed` → `Claimable`).
    pub fn set_application_state(&self, to: ApplicationState) -> Result<(), PermissionError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if !inner.state.can_transition_to(to) {
                return Err(PermissionError::InvalidStateTransition);
            }
            if inner.state == to {
                return Ok(());
            }
            info!(from = ?inner.state, to = ?to, "application state transition");
            inner.state = to;
            self.state_changed.notify_all();
        }
        self.fire_state_callback(to);
        Ok(())
    }

    /// Sets the claimable flag. Not allowed once claimed.
    ///
    /// # Errors
    ///
    /// [`PermissionError::InvalidStateTransition`] when claimed.
    pub fn set_claimable(&self, claimable: bool) -> Result<(), PermissionError> {
        let target = if claimable {
            ApplicationState::Claimable
        } else {
            ApplicationState::NotClaimable
        };
        self.set_application_state(target)
    }

    /// Installs the manifest template. An unclaimable application becomes
    /// claimable once it has declared a template.
    pub fn set_manifest_template(&self, template: ManifestTemplate) {
        let became_claimable = {
            let mut inner = self.inner.lock().unwrap();
            inner.manifest_template = template;
            if inner.state == ApplicationState::NotClaimable {
                inner.state = ApplicationState::Claimable;
                self.state_changed.notify_all();
                true
            } else {
                false
            }
        };
        if became_claimable {
            self.fire_state_callback(ApplicationState::Claimable);
        }
    }

    /// The declared manifest template.
    #[must_use]
    pub fn manifest_template(&self) -> ManifestTemplate {
        self.inner.lock().unwrap().manifest_template.clone()
    }

    /// Acceptable claim mechanisms.
    #[must_use]
    pub fn claim_capabilities(&self) -> ClaimCapabilities {
        self.inner.lock().unwrap().claim_capabilities
    }

    /// Declares the acceptable claim mechanisms.
    pub fn set_claim_capabilities(&self, capabilities: ClaimCapabilities) {
        self.inner.lock().unwrap().claim_capabilities = capabilities;
    }

    /// Generates (or replaces) the signing key pair.
    pub fn generate_signing_key_pair(&self) {
        self.inner.lock().unwrap().signing_key = Some(EccKeyPair::generate());
    }

    /// Public half of the signing key.
    ///
    /// # Errors
    ///
    /// [`PermissionError::NoSigningKey`] before generation.
    pub fn get_signing_public_key(&self) -> Result<KeyInfo, PermissionError> {
        let inner = self.inner.lock().unwrap();
        inner
            .signing_key
            .as_ref()
            .map(|pair| KeyInfo::new(pair.public_key.clone()))
            .ok_or(PermissionError::NoSigningKey)
    }

    /// Private half of the signing key (for the local claim ceremony).
    ///
    /// # Errors
    ///
    /// [`PermissionError::NoSigningKey`] before generation.
    pub fn signing_private_key(&self) -> Result<EccPrivateKey, PermissionError> {
        let inner = self.inner.lock().unwrap();
        inner
            .signing_key
            .as_ref()
            .map(|pair| pair.private_key.clone())
            .ok_or(PermissionError::NoSigningKey)
    }

    /// Signs a certificate with the signing key.
    ///
    /// # Errors
    ///
    /// [`PermissionError::NoSigningKey`] before generation, or a status if
    /// the certificate cannot be encoded.
    pub fn sign_certificate(&self, cert: &mut CertificateX509) -> Result<(), Status> {
        let key = self.signing_private_key()?;
        cert.sign(&key).map_err(Status::from)
    }

    /// Installs the authority's policy, completing a claim ceremony.
    ///
    /// # Errors
    ///
    /// [`PermissionError::NotClaimable`] unless the application is
    /// claimable.
    pub fn claim(&self, policy: PermissionPolicy) -> Result<(), PermissionError> {
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.state != ApplicationState::Claimable {
                return Err(PermissionError::NotClaimable);
            }
            inner.policy = Some(policy);
            inner.state = ApplicationState::Claimed;
            self.state_changed.notify_all();
        }
        self.fire_state_callback(ApplicationState::Claimed);
        Ok(())
    }

    /// Installs an updated policy, returning a need-update application to
    /// the claimed state.
    ///
    /// # Errors
    ///
    /// [`PermissionError::InvalidStateTransition`] unless claimed or
    /// awaiting an update.
    pub fn update_policy(&self, policy: PermissionPolicy) -> Result<(), PermissionError> {
        {
            let mut inner = self.inner.lock().unwrap();
            match inner.state {
                ApplicationState::Claimed | ApplicationState::NeedUpdate => {}
                _ => return Err(PermissionError::InvalidStateTransition),
            }
            inner.policy = Some(policy);
            inner.state = ApplicationState::Claimed;
            self.state_changed.notify_all();
        }
        self.fire_state_callback(ApplicationState::Claimed);
        Ok(())
    }

    /// The installed policy, if claimed.
    #[must_use]
    pub fn policy(&self) -> Option<PermissionPolicy> {
        self.inner.lock().unwrap().policy.clone()
    }

    /// Factory reset: removes the policy and signing keys and returns the
    /// application to the claimable state.
    pub fn reset(&self) {
        {
            let mut inner = self.inner.lock().unwrap();
            inner.policy = None;
            inner.signing_key = None;
            inner.state = ApplicationState::Claimable;
            self.state_changed.notify_all();
        }
        self.fire_state_callback(ApplicationState::Claimable);
    }

    /// Blocks until the application reaches `state` or the timeout elapses.
    ///
    /// # Errors
    ///
    /// [`Status::Timeout`] if the state was not reached in time.
    pub fn wait_for_state(&self, state: ApplicationState, timeout: Duration) -> Result<(), Status> {
        let deadline = std::time::Instant::now() + timeout;
        let mut inner = self.inner.lock().unwrap();
        while inner.state != state {
            let now = std::time::Instant::now();
            if now >= deadline {
                return Err(Status::Timeout);
            }
            let (guard, result) = self
                .state_changed
                .wait_timeout(inner, deadline - now)
                .unwrap();
            inner = guard;
            if result.timed_out() && inner.state != state {
                return Err(Status::Timeout);
            }
        }
        Ok(())
    }

    fn fire_state_callback(&self, state: ApplicationState) {
        let callback = self.state_callback.lock().unwrap();
        if let Some(callback) = callback.as_ref() {
            callback(state);
        }
    }
}
