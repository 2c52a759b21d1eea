//! Per-peer security state and the peer security sub-object.
//!
//! The peer state table tracks what is known about each bus name the
//! attachment has exchanged authenticated traffic with. The peer object is
//! where inbound security violations are reported alongside the error
//! reply returned to the caller.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};

use meshbus_core::guid::Guid128;
use meshbus_core::status::Status;
use tracing::warn;

use crate::auth::{AuthListener, AuthMechanism};
use crate::message::Message;

/// Security state for one remote peer.
#[derive(Debug, Clone)]
pub struct PeerState {
    /// The peer's attachment GUID.
    pub guid: Guid128,
    /// Mechanism the peer authenticated with, once negotiated.
    pub auth_mechanism: Option<AuthMechanism>,
    /// Negotiated session key, once established.
    pub session_key: Option<Vec<u8>>,
    /// Expiration of the negotiated keys in epoch seconds.
    pub expiration: Option<u64>,
    /// Authentication protocol version the peer announced.
    pub auth_version: u32,
}

impl PeerState {
    /// Creates a peer record with nothing negotiated yet.
    #[must_use]
    pub const fn new(guid: Guid128) -> Self {
        Self {
            guid,
            auth_mechanism: None,
            session_key: None,
            expiration: None,
            auth_version: 0,
        }
    }

    /// True once a session key is in place.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.session_key.is_some()
    }
}

/// Table of peer states keyed by bus name.
#[derive(Default)]
pub struct PeerStateTable {
    peers: Mutex<HashMap<String, PeerState>>,
}

impl PeerStateTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// True if a record exists for the bus name.
    #[must_use]
    pub fn is_known_peer(&self, bus_name: &str) -> bool {
        self.peers.lock().unwrap().contains_key(bus_name)
    }

    /// The peer's record, if known.
    #[must_use]
    pub fn get(&self, bus_name: &str) -> Option<PeerState> {
        self.peers.lock().unwrap().get(bus_name).cloned()
    }

    /// Inserts or replaces a record.
    pub fn set(&self, bus_name: &str, state: PeerState) {
        self.peers.lock().unwrap().insert(bus_name.to_string(), state);
    }

    /// Removes a record.
    pub fn remove(&self, bus_name: &str) {
        self.peers.lock().unwrap().remove(bus_name);
    }

    /// Drops every record, forcing renegotiation with all peers.
    pub fn clear(&self) {
        self.peers.lock().unwrap().clear();
    }

    /// Number of known peers.
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.lock().unwrap().len()
    }

    /// True when no peer is known.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Observer for reported security violations.
pub trait SecurityViolationListener: Send + Sync {
    /// A violation was detected on an inbound message.
    fn security_violation(&self, status: Status, msg: &Message);
}

/// A recorded security violation.
#[derive(Debug, Clone)]
pub struct SecurityViolation {
    /// The violation kind.
    pub status: Status,
    /// Sender of the offending message.
    pub sender: String,
    /// Interface the message targeted.
    pub interface: String,
    /// Member the message targeted.
    pub member: String,
}

struct PeerAuthState {
    enabled: bool,
    mechanisms: Vec<AuthMechanism>,
    listener: Option<Arc<dyn AuthListener>>,
}

/// The peer security sub-object owned by the local endpoint.
pub struct PeerObj {
    auth: RwLock<PeerAuthState>,
    violations: Mutex<Vec<SecurityViolation>>,
    violation_listener: RwLock<Option<Arc<dyn SecurityViolationListener>>>,
}

impl Default for PeerObj {
    fn default() -> Self {
        Self::new()
    }
}

impl PeerObj {
    /// Creates a peer object with security disabled.
    #[must_use]
    pub fn new() -> Self {
        Self {
            auth: RwLock::new(PeerAuthState {
                enabled: false,
                mechanisms: Vec::new(),
                listener: None,
            }),
            violations: Mutex::new(Vec::new()),
            violation_listener: RwLock::new(None),
        }
    }

    /// Configures peer authentication. An empty mechanism set disables it.
    pub fn setup_peer_authentication(
        &self,
        mechanisms: Vec<AuthMechanism>,
        listener: Option<Arc<dyn AuthListener>>,
    ) {
        let mut auth = self.auth.write().unwrap();
        auth.enabled = !mechanisms.is_empty();
        auth.mechanisms = mechanisms;
        auth.listener = listener;
    }

    /// True while authentication is configured.
    #[must_use]
    pub fn authentication_enabled(&self) -> bool {
        self.auth.read().unwrap().enabled
    }

    /// The configured mechanisms.
    #[must_use]
    pub fn mechanisms(&self) -> Vec<AuthMechanism> {
        self.auth.read().unwrap().mechanisms.clone()
    }

    /// The configured auth listener.
    #[must_use]
    pub fn auth_listener(&self) -> Option<Arc<dyn AuthListener>> {
        self.auth.read().unwrap().listener.clone()
    }

    /// Registers the violation observer.
    pub fn set_security_violation_listener(
        &self,
        listener: Option<Arc<dyn SecurityViolationListener>>,
    ) {
        *self.violation_listener.write().unwrap() = listener;
    }

    /// Records a security violation detected on an inbound message and
    /// notifies the observer. The violation is handled once this returns;
    /// the caller still sends the error reply.
    pub fn handle_security_violation(&self, status: Status, msg: &Message) {
        warn!(
            status = %status,
            sender = msg.sender(),
            interface = msg.interface(),
            member = msg.member(),
            "security violation"
        );
        let violation = SecurityViolation {
            status,
            sender: msg.sender().to_string(),
            interface: msg.interface().to_string(),
            member: msg.member().to_string(),
        };
        self.violations.lock().unwrap().push(violation);
        let listener = self.violation_listener.read().unwrap().clone();
        if let Some(listener) = listener {
            if let Some(auth_listener) = self.auth_listener() {
                auth_listener.security_violation(status, msg);
            }
            listener.security_violation(status, msg);
        } else if let Some(auth_listener) = self.auth_listener() {
            auth_listener.security_violation(status, msg);
        }
    }

    /// Recorded violations, oldest first.
    #[must_use]
    pub fn violations(&self) -> Vec<SecurityViolation> {
        self.violations.lock().unwrap().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peer_state_table_basics() {
        let table = PeerStateTable::new();
        assert!(!table.is_known_peer(":1.7"));

        let guid = Guid128::generate();
        table.set(":1.7", PeerState::new(guid));
        assert!(table.is_known_peer(":1.7"));
        assert_eq!(table.get(":1.7").unwrap().guid, guid);
        assert!(!table.get(":1.7").unwrap().is_secure());

        table.clear();
        assert!(table.is_empty());
    }

    #[test]
    fn test_violation_recorded() {
        let peer = PeerObj::new();
        let call = Message::method_call(
            1,
            ":1.3",
            ":1.1",
            "/door",
            "sample.secure.Door",
            "Open",
            vec![],
            0,
            0,
        );
        peer.handle_security_violation(Status::NotEncrypted, &call);

        let violations = peer.violations();
        assert_eq!(violations.len(), 1);
        assert_eq!(violations[0].status, Status::NotEncrypted);
        assert_eq!(violations[0].sender, ":1.3");
        assert_eq!(violations[0].member, "Open");
    }

    #[test]
    fn test_authentication_toggle() {
        let peer = PeerObj::new();
        assert!(!peer.authentication_enabled());
        peer.setup_peer_authentication(vec![AuthMechanism::EcdheEcdsa], None);
        assert!(peer.authentication_enabled());
        peer.setup_peer_authentication(vec![], None);
        assert!(!peer.authentication_enabled());
    }
}
