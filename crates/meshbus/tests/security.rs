//! Peer security enablement, key management, claim-state signalling, and
//! the application-state listener contract.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{attachment_pair, wait_until};
use meshbus::auth::{AuthListener, AuthMechanism, Credentials};
use meshbus::Status;
use meshbus_core::permission::{ApplicationState, ManifestTemplate, PermissionPolicy};

struct NullAuthListener;
impl AuthListener for NullAuthListener {
    fn request_credentials(
        &self,
        _mechanism: AuthMechanism,
        _peer_name: &str,
        _attempt: u16,
    ) -> Option<Credentials> {
        Some(Credentials::default())
    }
}

#[test]
fn test_enable_peer_security_lifecycle() {
    let (_router, a, _b) = attachment_pair();
    let dir = tempfile::TempDir::new().unwrap();
    let keystore_path = dir.path().join("a.keystore");

    assert!(!a.is_peer_security_enabled());
    a.enable_peer_security(
        "ALLJOYN_ECDHE_ECDSA ALLJOYN_ECDHE_NULL",
        Some(Arc::new(NullAuthListener)),
        Some(&keystore_path),
        None,
    )
    .unwrap();
    assert!(a.is_peer_security_enabled());
    assert!(a.key_store().is_initialized());
    assert_eq!(
        a.endpoint().peer_obj().mechanisms(),
        [AuthMechanism::EcdheEcdsa, AuthMechanism::EcdheNull]
    );

    // Unknown mechanism names are rejected.
    assert_eq!(
        a.enable_peer_security("ALLJOYN_ECDHE_TELEPATHY", None, None, None)
            .unwrap_err(),
        Status::InvalidAuthMechanism
    );

    // An empty list disables security and clears keys.
    a.enable_peer_security("", None, None, None).unwrap();
    assert!(!a.is_peer_security_enabled());
    assert!(a.key_store().is_empty());
}

#[test]
fn test_key_expiration_api() {
    let (_router, a, _b) = attachment_pair();
    a.enable_peer_security("ALLJOYN_ECDHE_NULL", None, None, None)
        .unwrap();

    let peer_guid = meshbus_core::Guid128::generate();
    a.key_store()
        .add_key(
            meshbus_core::keystore::KeyStoreKey::remote(peer_guid),
            meshbus_core::keystore::KeyBlob::new(b"negotiated-master-secret", 1),
        )
        .unwrap();

    let guid_str = peer_guid.to_hex();
    assert_eq!(a.get_key_expiration(&guid_str).unwrap(), u32::MAX);
    a.set_key_expiration(&guid_str, 3600).unwrap();
    let remaining = a.get_key_expiration(&guid_str).unwrap();
    assert!((3590..=3600).contains(&remaining), "remaining={remaining}");

    // Zero expiration deletes the key.
    a.set_key_expiration(&guid_str, 0).unwrap();
    assert_eq!(a.get_key_expiration(&guid_str).unwrap_err(), Status::KeyUnavailable);

    assert_eq!(a.clear_keys("not-a-guid").unwrap_err(), Status::InvalidGuid);
    assert_eq!(a.clear_keys(&guid_str).unwrap_err(), Status::KeyUnavailable);
}

#[test]
fn test_logon_entries() {
    let (_router, a, _b) = attachment_pair();
    a.add_logon_entry("ALLJOYN_SRP_LOGON", "alice", "secret").unwrap();
    assert_eq!(
        a.add_logon_entry("ALLJOYN_ECDHE_NULL", "alice", "secret")
            .unwrap_err(),
        Status::InvalidAuthMechanism
    );
    assert_eq!(
        a.add_logon_entry("", "alice", "secret").unwrap_err(),
        Status::BadArg(2)
    );
    assert_eq!(
        a.add_logon_entry("ALLJOYN_SRP_LOGON", "", "secret").unwrap_err(),
        Status::BadArg(3)
    );
}

#[test]
fn test_state_signal_reaches_application_state_listener() {
    let (_router, a, b) = attachment_pair();

    struct Recording {
        states: Mutex<Vec<(String, ApplicationState)>>,
    }
    impl meshbus::listener::ApplicationStateListener for Recording {
        fn state(&self, bus_name: &str, _public_key: &[u8], state: ApplicationState) {
            self.states.lock().unwrap().push((bus_name.to_string(), state));
        }
    }
    let listener = Arc::new(Recording {
        states: Mutex::new(Vec::new()),
    });
    let as_trait: Arc<dyn meshbus::listener::ApplicationStateListener> = listener.clone();
    a.register_application_state_listener(as_trait.clone()).unwrap();

    // B walks the claim ceremony; each transition broadcasts State.
    b.permission_configurator()
        .set_manifest_template(ManifestTemplate::default_producer("sample.secure.Door"));
    b.permission_configurator().generate_signing_key_pair();
    b.permission_configurator()
        .claim(PermissionPolicy::new(1, vec![]))
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        let states = listener.states.lock().unwrap();
        states
            .iter()
            .any(|(name, state)| *name == b.unique_name() && *state == ApplicationState::Claimable)
            && states
                .iter()
                .any(|(name, state)| *name == b.unique_name() && *state == ApplicationState::Claimed)
    }));

    // After unregistering, transitions no longer reach the listener.
    a.unregister_application_state_listener(&as_trait).unwrap();
    let before = listener.states.lock().unwrap().len();
    b.permission_configurator()
        .set_application_state(ApplicationState::NeedUpdate)
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(listener.states.lock().unwrap().len(), before);

    assert_eq!(
        a.unregister_application_state_listener(&as_trait).unwrap_err(),
        Status::ApplicationStateListenerMissing
    );
}

#[test]
fn test_bus_listener_lifecycle_and_quiescence() {
    let (_router, a, _b) = attachment_pair();

    #[derive(Default)]
    struct Lifecycle {
        registered: AtomicUsize,
        unregistered: AtomicUsize,
        stopping: AtomicUsize,
    }
    impl meshbus::listener::BusListener for Lifecycle {
        fn listener_registered(&self) {
            self.registered.fetch_add(1, Ordering::SeqCst);
        }
        fn listener_unregistered(&self) {
            self.unregistered.fetch_add(1, Ordering::SeqCst);
        }
        fn bus_stopping(&self) {
            self.stopping.fetch_add(1, Ordering::SeqCst);
        }
    }

    let listener = Arc::new(Lifecycle::default());
    let as_trait: Arc<dyn meshbus::listener::BusListener> = listener.clone();
    a.register_bus_listener(as_trait.clone());
    assert_eq!(listener.registered.load(Ordering::SeqCst), 1);

    a.unregister_bus_listener(&as_trait);
    assert_eq!(listener.unregistered.load(Ordering::SeqCst), 1);

    // No callback after unregister: stop must not reach this listener.
    a.stop().unwrap();
    a.join().unwrap();
    assert_eq!(listener.stopping.load(Ordering::SeqCst), 0);
}

#[test]
fn test_claim_ceremony_and_management_callbacks() {
    let (_router, a, _b) = attachment_pair();

    #[derive(Default)]
    struct Management {
        resets: AtomicUsize,
        policy_changes: AtomicUsize,
        sessions: AtomicUsize,
    }
    impl meshbus_core::permission::PermissionConfigurationListener for Management {
        fn factory_reset(&self) -> Result<(), Status> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        fn policy_changed(&self) {
            self.policy_changes.fetch_add(1, Ordering::SeqCst);
        }
        fn start_management(&self) {
            self.sessions.fetch_add(1, Ordering::SeqCst);
        }
        fn end_management(&self) {
            self.sessions.fetch_add(1, Ordering::SeqCst);
        }
    }

    let management = Arc::new(Management::default());
    a.enable_peer_security(
        "ALLJOYN_ECDHE_ECDSA",
        None,
        None,
        Some(management.clone()),
    )
    .unwrap();

    // Claim requires the claimable state.
    assert_eq!(
        a.claim(PermissionPolicy::new(1, vec![])).unwrap_err(),
        Status::InvalidApplicationState
    );
    a.permission_configurator()
        .set_manifest_template(ManifestTemplate::default_producer("sample.secure.Door"));

    a.claim(PermissionPolicy::new(1, vec![])).unwrap();
    a.wait_for_claimed_state(Duration::from_secs(1)).unwrap();
    assert_eq!(management.policy_changes.load(Ordering::SeqCst), 1);

    a.start_management();
    a.update_policy(PermissionPolicy::new(2, vec![])).unwrap();
    a.end_management();
    assert_eq!(management.policy_changes.load(Ordering::SeqCst), 2);
    assert_eq!(management.sessions.load(Ordering::SeqCst), 2);

    a.factory_reset().unwrap();
    assert_eq!(management.resets.load(Ordering::SeqCst), 1);
    assert_eq!(
        a.permission_configurator().application_state(),
        meshbus_core::permission::ApplicationState::Claimable
    );
    assert!(a.permission_configurator().policy().is_none());
}

#[test]
fn test_get_peer_guid() {
    let (_router, a, _b) = attachment_pair();
    // Own GUID for the empty name and the attachment's own unique name.
    assert_eq!(a.get_peer_guid("").unwrap(), a.global_guid_string());
    assert_eq!(
        a.get_peer_guid(&a.unique_name()).unwrap(),
        a.global_guid_string()
    );
    assert_eq!(a.get_peer_guid(":1.999").unwrap_err(), Status::NoPeerGuid);
}
