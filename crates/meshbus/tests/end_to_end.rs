//! End-to-end scenarios over the bundled in-process router: method calls,
//! timeouts, the encryption contract, and name ownership.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::{attachment_pair, register_door, wait_until, DOOR_IFACE, DOOR_PATH};
use meshbus::args::MsgArg;
use meshbus::iface::SecurityPolicy;
use meshbus::message::MessageType;
use meshbus::names;
use meshbus::Status;

#[test]
fn test_simple_method_call() {
    let (_router, a, b) = attachment_pair();
    let calls = register_door(&a, SecurityPolicy::Inherit, false, Duration::ZERO);

    let reply = b
        .method_call(
            &a.unique_name(),
            DOOR_PATH,
            DOOR_IFACE,
            "Open",
            vec![],
            Duration::from_secs(5),
        )
        .unwrap();

    assert_eq!(reply.msg_type(), MessageType::MethodReturn);
    assert_eq!(reply.args(), &[MsgArg::Boolean(true)]);
    assert_eq!(calls.load(Ordering::SeqCst), 1);

    a.stop().unwrap();
    a.join().unwrap();
    b.stop().unwrap();
    b.join().unwrap();
}

#[test]
fn test_method_call_timeout_and_late_reply_dropped() {
    let (_router, a, b) = attachment_pair();
    // The handler sleeps well past the caller's deadline.
    let calls = register_door(&a, SecurityPolicy::Inherit, false, Duration::from_millis(500));

    let begun = Instant::now();
    let reply = b
        .method_call(
            &a.unique_name(),
            DOOR_PATH,
            DOOR_IFACE,
            "Open",
            vec![],
            Duration::from_millis(100),
        )
        .unwrap();
    let elapsed = begun.elapsed();

    // Exactly one reply: the synthesized timeout, roughly at the deadline.
    assert_eq!(reply.msg_type(), MessageType::Error);
    assert_eq!(reply.error_name(), "org.alljoyn.Bus.Timeout");
    assert_eq!(reply.status(), Some(Status::Timeout));
    assert!(elapsed >= Duration::from_millis(90), "fired early: {elapsed:?}");
    assert!(elapsed < Duration::from_millis(450), "fired late: {elapsed:?}");

    // The handler does fire on A; its late reply is discarded by B's
    // reply registry.
    assert!(wait_until(Duration::from_secs(2), || {
        calls.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(500));
    assert_eq!(b.endpoint().outstanding_replies(), 0);
}

#[test]
fn test_encryption_required_rejects_clear_call() {
    let (_router, a, b) = attachment_pair();
    let calls = register_door(&a, SecurityPolicy::Required, false, Duration::ZERO);

    let reply = b
        .method_call(
            &a.unique_name(),
            DOOR_PATH,
            DOOR_IFACE,
            "Open",
            vec![],
            Duration::from_secs(5),
        )
        .unwrap();

    assert_eq!(reply.msg_type(), MessageType::Error);
    assert_eq!(reply.error_name(), "org.alljoyn.Bus.SecurityViolation");
    // The handler never ran.
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    // The peer sub-object recorded the violation.
    let violations = a.endpoint().peer_obj().violations();
    assert_eq!(violations.len(), 1);
    assert_eq!(violations[0].status, Status::NotEncrypted);
    assert_eq!(violations[0].member, "Open");
    assert_eq!(violations[0].sender, b.unique_name());
}

#[test]
fn test_secure_object_marks_descendants() {
    let (_router, a, _b) = attachment_pair();

    let mut iface = a
        .create_interface("test.secure.Nested", SecurityPolicy::Inherit)
        .unwrap();
    iface.add_method("M", "", "", "").unwrap();
    iface.activate();
    let iface = a.register_interface(iface).unwrap();

    let mut parent = meshbus::object::BusObject::new("/secure").unwrap();
    parent.add_interface(iface.clone(), false).unwrap();
    a.register_bus_object(Arc::new(parent), true).unwrap();

    let mut child = meshbus::object::BusObject::new("/secure/child").unwrap();
    child.add_interface(iface, false).unwrap();
    // Registered without the secure flag, but inherits it from the parent.
    a.register_bus_object(Arc::new(child), false).unwrap();

    assert!(a.endpoint().is_object_secure("/secure/child"));
}

#[test]
fn test_placeholder_parents_and_replacement() {
    let (_router, a, _b) = attachment_pair();

    let object = meshbus::object::BusObject::new("/a/b/c").unwrap();
    a.register_bus_object(Arc::new(object), false).unwrap();

    // Every strict path prefix is present, as a placeholder.
    for prefix in ["/", "/a", "/a/b"] {
        assert!(
            a.endpoint().has_object_or_placeholder(prefix),
            "{prefix} missing"
        );
        assert!(!a.endpoint().has_object(prefix), "{prefix} should be a placeholder");
    }

    // A real registration replaces the placeholder.
    let replacement = meshbus::object::BusObject::new("/a/b").unwrap();
    a.register_bus_object(Arc::new(replacement), false).unwrap();
    assert!(a.endpoint().has_object("/a/b"));

    // But a real path cannot be taken twice.
    let duplicate = meshbus::object::BusObject::new("/a/b/c").unwrap();
    assert_eq!(
        a.register_bus_object(Arc::new(duplicate), false).unwrap_err(),
        Status::ObjectAlreadyExists
    );

    // Unregistering the subtree removes the placeholders' children.
    a.unregister_bus_object("/a/b").unwrap();
    assert!(!a.endpoint().has_object_or_placeholder("/a/b/c"));
}

#[test]
fn test_unknown_object_returns_service_unknown() {
    let (_router, a, b) = attachment_pair();
    register_door(&a, SecurityPolicy::Inherit, false, Duration::ZERO);

    let reply = b
        .method_call(
            &a.unique_name(),
            "/no/such/object",
            DOOR_IFACE,
            "Open",
            vec![],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reply.error_name(), "org.freedesktop.DBus.Error.ServiceUnknown");

    // Wrong member on a real object diagnoses no-such-member.
    let reply = b
        .method_call(
            &a.unique_name(),
            DOOR_PATH,
            DOOR_IFACE,
            "Close",
            vec![],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reply.error_name(), "org.alljoyn.Bus.NoSuchMember");
}

#[test]
fn test_peer_interface_answered_locally() {
    let (_router, a, b) = attachment_pair();

    let reply = b
        .method_call(
            &a.unique_name(),
            "/ignored",
            names::PEER_INTERFACE,
            "Ping",
            vec![],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reply.msg_type(), MessageType::MethodReturn);
    assert!(reply.args().is_empty());

    let reply = b
        .method_call(
            &a.unique_name(),
            "/ignored",
            names::PEER_INTERFACE,
            "GetMachineId",
            vec![],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(
        reply.args().first().and_then(MsgArg::as_str),
        Some(a.global_guid_string().as_str())
    );
}

#[test]
fn test_properties_interface() {
    let (_router, a, b) = attachment_pair();
    register_door(&a, SecurityPolicy::Inherit, false, Duration::ZERO);

    // Get.
    let reply = b
        .method_call(
            &a.unique_name(),
            DOOR_PATH,
            names::PROPERTIES_INTERFACE,
            "Get",
            vec![
                MsgArg::String(DOOR_IFACE.to_string()),
                MsgArg::String("IsOpen".to_string()),
            ],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reply.msg_type(), MessageType::MethodReturn);
    let value = reply.args().first().and_then(MsgArg::as_variant).unwrap();
    assert_eq!(value.as_bool(), Some(false));

    // GetAll.
    let reply = b
        .method_call(
            &a.unique_name(),
            DOOR_PATH,
            names::PROPERTIES_INTERFACE,
            "GetAll",
            vec![MsgArg::String(DOOR_IFACE.to_string())],
            Duration::from_secs(5),
        )
        .unwrap();
    let dict = reply.args().first().unwrap();
    assert!(meshbus::args::dict_get(dict, "IsOpen").is_some());

    // Set on a read-only property.
    let reply = b
        .method_call(
            &a.unique_name(),
            DOOR_PATH,
            names::PROPERTIES_INTERFACE,
            "Set",
            vec![
                MsgArg::String(DOOR_IFACE.to_string()),
                MsgArg::String("IsOpen".to_string()),
                MsgArg::Variant(Box::new(MsgArg::Boolean(true))),
            ],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reply.error_name(), "org.alljoyn.Bus.PropertyAccessDenied");

    // No such property.
    let reply = b
        .method_call(
            &a.unique_name(),
            DOOR_PATH,
            names::PROPERTIES_INTERFACE,
            "Get",
            vec![
                MsgArg::String(DOOR_IFACE.to_string()),
                MsgArg::String("Bogus".to_string()),
            ],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reply.error_name(), "org.alljoyn.Bus.NoSuchProperty");
}

#[test]
fn test_request_name_dispositions() {
    let (_router, a, b) = attachment_pair();
    let name = "sample.door.service";

    a.request_name(name, 0).unwrap();
    assert_eq!(a.request_name(name, 0).unwrap_err(), Status::NameAlreadyOwner);
    assert!(a.name_has_owner(name).unwrap());
    assert_eq!(a.get_name_owner(name).unwrap(), a.unique_name());

    // Owned, without do-not-queue: queued.
    assert_eq!(b.request_name(name, 0).unwrap_err(), Status::NameInQueue);
    // Owned, with do-not-queue: exists.
    assert_eq!(
        b.request_name(name, names::NAME_FLAG_DO_NOT_QUEUE)
            .unwrap_err(),
        Status::NameExists
    );

    // Release promotes the queued requester.
    a.release_name(name).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        b.name_has_owner(name).unwrap_or(false)
            && b.get_name_owner(name).unwrap_or_default() == b.unique_name()
    }));

    assert_eq!(b.release_name("un.owned.name").unwrap_err(), Status::NameNotFound);
    assert_eq!(a.release_name(name).unwrap_err(), Status::NameNotOwner);
}

#[test]
fn test_bad_names_rejected_before_send() {
    let (_router, a, _b) = attachment_pair();
    assert_eq!(a.request_name("nodots", 0).unwrap_err(), Status::BadBusName);
    assert_eq!(
        a.request_name(":1.1", 0).unwrap_err(),
        Status::BadBusName
    );
    assert_eq!(
        a.create_interface("not-an-interface", SecurityPolicy::Inherit)
            .unwrap_err(),
        Status::BadArg(1)
    );
}

#[test]
fn test_ping_dispositions() {
    let (_router, a, b) = attachment_pair();
    b.ping(&a.unique_name(), Duration::from_secs(1)).unwrap();
    assert_eq!(
        b.ping("no.such.name", Duration::from_secs(1)).unwrap_err(),
        Status::NameNotFound
    );
}

#[test]
fn test_signal_delivery_with_match_rules() {
    let (_router, a, b) = attachment_pair();

    // Both sides know the interface; B emits, A subscribes.
    for bus in [&a, &b] {
        let mut iface = bus
            .create_interface("test.events.Clock", SecurityPolicy::Inherit)
            .unwrap();
        iface.add_signal("Tick", "u", "count").unwrap();
        iface.activate();
        bus.register_interface(iface).unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::<u32>::new()));
    let seen_in_handler = seen.clone();
    let receiver = meshbus::handlers::next_receiver_id();
    a.register_signal_handler(
        receiver,
        Arc::new(move |_member, _path, msg| {
            if let Some(count) = msg.args().first().and_then(MsgArg::as_u32) {
                seen_in_handler.lock().unwrap().push(count);
            }
        }),
        "test.events.Clock",
        "Tick",
    )
    .unwrap();
    a.add_match("type='signal',interface='test.events.Clock'").unwrap();

    b.emit_signal("", "/clock", "test.events.Clock", "Tick", vec![MsgArg::Uint32(7)], 0, 0)
        .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        seen.lock().unwrap().as_slice() == [7]
    }));

    // Unregister, then emit again: the handler must never fire after the
    // unregister call returns.
    a.unregister_signal_handler(receiver, "test.events.Clock", "Tick")
        .unwrap();
    b.emit_signal("", "/clock", "test.events.Clock", "Tick", vec![MsgArg::Uint32(8)], 0, 0)
        .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(seen.lock().unwrap().as_slice(), [7]);
}

#[test]
fn test_announce_and_who_implements() {
    let (_router, a, b) = attachment_pair();

    // B declares the About interface so it can emit announcements.
    let mut about = b
        .create_interface(names::ABOUT_INTERFACE, SecurityPolicy::Off)
        .unwrap();
    about
        .add_signal("Announce", "qqa(oas)a{sv}", "version,port,objects,data")
        .unwrap();
    about.activate();
    b.register_interface(about).unwrap();

    struct Recording {
        announcements: Mutex<Vec<(String, u16)>>,
    }
    impl meshbus::listener::AboutListener for Recording {
        fn announced(
            &self,
            bus_name: &str,
            _version: u16,
            port: meshbus::SessionPort,
            _objects: &MsgArg,
            _data: &MsgArg,
        ) {
            self.announcements
                .lock()
                .unwrap()
                .push((bus_name.to_string(), port));
        }
    }
    let listener = Arc::new(Recording {
        announcements: Mutex::new(Vec::new()),
    });
    a.register_about_listener(listener.clone());
    a.who_implements(&[DOOR_IFACE]).unwrap();

    let description = MsgArg::Array(
        "(oas)".to_string(),
        vec![MsgArg::Struct(vec![
            MsgArg::ObjectPath(DOOR_PATH.to_string()),
            MsgArg::Array("s".to_string(), vec![MsgArg::String(DOOR_IFACE.to_string())]),
        ])],
    );
    b.emit_signal(
        "",
        "/About",
        names::ABOUT_INTERFACE,
        "Announce",
        vec![
            MsgArg::Uint16(1),
            MsgArg::Uint16(42),
            description,
            meshbus::args::dict_sv(vec![]),
        ],
        0,
        meshbus::message::flags::SESSIONLESS,
    )
    .unwrap();

    assert!(wait_until(Duration::from_secs(2), || {
        listener
            .announcements
            .lock()
            .unwrap()
            .iter()
            .any(|(name, port)| *name == b.unique_name() && *port == 42)
    }));

    // An announcement for a different interface does not match.
    let other = MsgArg::Array(
        "(oas)".to_string(),
        vec![MsgArg::Struct(vec![
            MsgArg::ObjectPath("/other".to_string()),
            MsgArg::Array("s".to_string(), vec![MsgArg::String("other.Iface".to_string())]),
        ])],
    );
    b.emit_signal(
        "",
        "/About",
        names::ABOUT_INTERFACE,
        "Announce",
        vec![MsgArg::Uint16(1), MsgArg::Uint16(9), other, meshbus::args::dict_sv(vec![])],
        0,
        meshbus::message::flags::SESSIONLESS,
    )
    .unwrap();
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(listener.announcements.lock().unwrap().len(), 1);
}

#[test]
fn test_discovery_found_and_lost() {
    let (_router, a, b) = attachment_pair();

    #[derive(Default)]
    struct Discovery {
        found: Mutex<Vec<String>>,
        lost: Mutex<Vec<String>>,
    }
    impl meshbus::listener::BusListener for Discovery {
        fn found_advertised_name(&self, name: &str, _transport: u16, _prefix: &str) {
            self.found.lock().unwrap().push(name.to_string());
        }
        fn lost_advertised_name(&self, name: &str, _transport: u16, _prefix: &str) {
            self.lost.lock().unwrap().push(name.to_string());
        }
    }
    let listener = Arc::new(Discovery::default());
    b.register_bus_listener(listener.clone());

    a.advertise_name("sample.door.north", meshbus::session::TRANSPORT_LOCAL)
        .unwrap();
    b.find_advertised_name("sample.door").unwrap();
    assert_eq!(
        b.find_advertised_name("sample.door").unwrap_err(),
        Status::AlreadyDiscovering
    );

    assert!(wait_until(Duration::from_secs(2), || {
        listener.found.lock().unwrap().contains(&"sample.door.north".to_string())
    }));

    a.cancel_advertise_name("sample.door.north", meshbus::session::TRANSPORT_LOCAL)
        .unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        listener.lost.lock().unwrap().contains(&"sample.door.north".to_string())
    }));

    b.cancel_find_advertised_name("sample.door").unwrap();
    assert_eq!(
        b.cancel_find_advertised_name("sample.door").unwrap_err(),
        Status::Fail
    );
}
