//! Session scenarios: join/leave, self-join disambiguation, multipoint
//! membership events, session loss, and the blocking-call guard.

mod common;

use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{attachment_pair, register_door, wait_until, AcceptAll, RecordingSessionListener};
use meshbus::args::MsgArg;
use meshbus::handlers::MethodResult;
use meshbus::iface::SecurityPolicy;
use meshbus::session::{SessionLostReason, SessionOpts, SessionSide};
use meshbus::Status;

const PORT: meshbus::SessionPort = 42;

#[test]
fn test_point_to_point_join_and_leave() {
    let (_router, a, b) = attachment_pair();
    let accept = AcceptAll::new();
    a.bind_session_port(PORT, &SessionOpts::default(), accept.clone())
        .unwrap();

    let (id, opts) = b
        .join_session(&a.unique_name(), PORT, None, &SessionOpts::default())
        .unwrap();
    assert_ne!(id, 0);
    assert!(!opts.multipoint);

    // Host-side bookkeeping: the accept callback fired and the host table
    // has the session with the joiner recorded.
    assert!(wait_until(Duration::from_secs(2), || {
        !accept.joined.lock().unwrap().is_empty()
    }));
    let joined = accept.joined.lock().unwrap();
    assert_eq!(joined[0].0, PORT);
    assert_eq!(joined[0].1, id);
    assert_eq!(joined[0].2, b.unique_name());
    drop(joined);
    assert!(a.sessions().exists(SessionSide::Host, id));
    assert!(b.sessions().exists(SessionSide::Joiner, id));

    // Joining the same hosted port twice is rejected.
    assert_eq!(
        b.join_session(&a.unique_name(), PORT, None, &SessionOpts::default())
            .unwrap_err(),
        Status::JoinAlreadyJoined
    );

    b.leave_joined_session(id).unwrap();
    assert!(!b.sessions().exists(SessionSide::Joiner, id));
    // Leaving again: the session is gone.
    assert_eq!(b.leave_joined_session(id).unwrap_err(), Status::LeaveNoSession);
}

#[test]
fn test_join_dispositions() {
    let (_router, a, b) = attachment_pair();

    // No port bound.
    assert_eq!(
        b.join_session(&a.unique_name(), 77, None, &SessionOpts::default())
            .unwrap_err(),
        Status::JoinNoSession
    );

    // Unknown host.
    assert_eq!(
        b.join_session("un.known.host", 77, None, &SessionOpts::default())
            .unwrap_err(),
        Status::JoinUnreachable
    );

    // Host rejects.
    struct RejectAll;
    impl meshbus::listener::SessionPortListener for RejectAll {
        fn accept_session_joiner(
            &self,
            _port: meshbus::SessionPort,
            _joiner: &str,
            _opts: &SessionOpts,
        ) -> bool {
            false
        }
    }
    a.bind_session_port(PORT, &SessionOpts::default(), Arc::new(RejectAll))
        .unwrap();
    assert_eq!(
        b.join_session(&a.unique_name(), PORT, None, &SessionOpts::default())
            .unwrap_err(),
        Status::JoinRejected
    );

    // Incompatible options.
    let raw = SessionOpts {
        traffic: meshbus::session::TrafficType::RawReliable,
        ..SessionOpts::default()
    };
    assert_eq!(
        b.join_session(&a.unique_name(), PORT, None, &raw).unwrap_err(),
        Status::JoinBadOpts
    );
}

#[test]
fn test_self_join_disambiguation() {
    let (_router, a, _b) = attachment_pair();
    let accept = AcceptAll::new();
    a.bind_session_port(PORT, &SessionOpts::multipoint(), accept)
        .unwrap();

    let host_listener = Arc::new(RecordingSessionListener::default());
    let joined_listener = Arc::new(RecordingSessionListener::default());

    // A joins its own hosted port.
    let (id, opts) = a
        .join_session(&a.unique_name(), PORT, None, &SessionOpts::multipoint())
        .unwrap();
    assert!(opts.multipoint);

    // Both tables hold the id; the multipoint flag is (eventually) true on
    // both entries via the membership-change signal.
    assert!(a.sessions().is_self_join(id));
    assert!(wait_until(Duration::from_secs(2), || {
        a.sessions().is_multipoint(SessionSide::Host, id) == Some(true)
            && a.sessions().is_multipoint(SessionSide::Joiner, id) == Some(true)
    }));

    // The dual-side listener setter is ambiguous for a self-join.
    assert_eq!(
        a.set_session_listener(id, Some(host_listener.clone())),
        Err(Status::Fail)
    );
    // Side-selective setters succeed independently.
    a.set_hosted_session_listener(id, Some(host_listener)).unwrap();
    a.set_joined_session_listener(id, Some(joined_listener)).unwrap();
}

#[test]
fn test_multipoint_membership_events() {
    let (router, a, b) = attachment_pair();
    let c = meshbus::runtime::attach_to_private_router("client-c", &router).unwrap();

    let accept = AcceptAll::new();
    a.bind_session_port(PORT, &SessionOpts::multipoint(), accept)
        .unwrap();

    let b_listener = Arc::new(RecordingSessionListener::default());
    let (id, _) = b
        .join_session(
            &a.unique_name(),
            PORT,
            Some(b_listener.clone()),
            &SessionOpts::multipoint(),
        )
        .unwrap();

    // A second joiner lands in the same session and B sees the addition.
    let (id2, _) = c
        .join_session(&a.unique_name(), PORT, None, &SessionOpts::multipoint())
        .unwrap();
    assert_eq!(id, id2);
    assert!(wait_until(Duration::from_secs(2), || {
        b_listener
            .members_added
            .lock()
            .unwrap()
            .contains(&c.unique_name())
    }));
    assert!(wait_until(Duration::from_secs(2), || {
        b.sessions()
            .participants(SessionSide::Joiner, id)
            .is_some_and(|p| p.contains(&c.unique_name()) && p.contains(&a.unique_name()))
    }));

    // C leaves; B sees the removal.
    c.leave_joined_session(id).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        b_listener
            .members_removed
            .lock()
            .unwrap()
            .contains(&c.unique_name())
    }));
}

#[test]
fn test_remove_session_member() {
    let (_router, a, b) = attachment_pair();
    let accept = AcceptAll::new();
    a.bind_session_port(PORT, &SessionOpts::multipoint(), accept)
        .unwrap();

    let b_listener = Arc::new(RecordingSessionListener::default());
    let (id, _) = b
        .join_session(
            &a.unique_name(),
            PORT,
            Some(b_listener.clone()),
            &SessionOpts::multipoint(),
        )
        .unwrap();

    // Only the binder may remove members.
    assert_eq!(
        b.remove_session_member(id, &a.unique_name()).unwrap_err(),
        Status::RemoveMemberNotBinder
    );
    assert_eq!(
        a.remove_session_member(id, ":1.999").unwrap_err(),
        Status::RemoveMemberNotFound
    );

    a.remove_session_member(id, &b.unique_name()).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        b_listener.lost.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(
        *b_listener.last_reason.lock().unwrap(),
        Some(SessionLostReason::RemovedByBinder)
    );
    assert!(!b.sessions().exists(SessionSide::Joiner, id));

    // Removing from a point-to-point session is rejected.
    let accept2 = AcceptAll::new();
    a.bind_session_port(PORT + 1, &SessionOpts::default(), accept2)
        .unwrap();
    let (p2p, _) = b
        .join_session(&a.unique_name(), PORT + 1, None, &SessionOpts::default())
        .unwrap();
    assert_eq!(
        a.remove_session_member(p2p, &b.unique_name()).unwrap_err(),
        Status::RemoveMemberNotMultipoint
    );
}

#[test]
fn test_session_lost_on_host_stop() {
    let (_router, a, b) = attachment_pair();
    let accept = AcceptAll::new();
    a.bind_session_port(PORT, &SessionOpts::default(), accept)
        .unwrap();

    let b_listener = Arc::new(RecordingSessionListener::default());
    let (id, _) = b
        .join_session(
            &a.unique_name(),
            PORT,
            Some(b_listener.clone()),
            &SessionOpts::default(),
        )
        .unwrap();

    a.stop().unwrap();
    a.join().unwrap();

    // Exactly one SessionLost lands at B and the entry is gone.
    assert!(wait_until(Duration::from_secs(2), || {
        b_listener.lost.load(Ordering::SeqCst) == 1
    }));
    std::thread::sleep(Duration::from_millis(100));
    assert_eq!(b_listener.lost.load(Ordering::SeqCst), 1);
    assert!(!b.sessions().exists(SessionSide::Joiner, id));

    assert_eq!(b.leave_joined_session(id).unwrap_err(), Status::LeaveNoSession);
}

#[test]
fn test_blocking_call_guard_in_dispatcher_callback() {
    let (_router, a, b) = attachment_pair();
    register_door(&b, SecurityPolicy::Inherit, false, Duration::ZERO);

    // A's handler attempts a synchronous join from inside the dispatcher
    // callback, once without and once with enable_concurrent_callbacks.
    let accept = AcceptAll::new();
    b.bind_session_port(PORT, &SessionOpts::default(), accept)
        .unwrap();

    let mut iface = a
        .create_interface("test.blocking.Probe", SecurityPolicy::Inherit)
        .unwrap();
    iface.add_method("Probe", "b", "", "escape").unwrap();
    iface.activate();
    let iface = a.register_interface(iface).unwrap();

    let outcome: Arc<Mutex<Option<Result<(), Status>>>> = Arc::new(Mutex::new(None));
    let outcome_in_handler = outcome.clone();
    let a_for_handler = a.clone();
    let b_name = b.unique_name();

    let mut probe = meshbus::object::BusObject::new("/probe").unwrap();
    probe.add_interface(iface, false).unwrap();
    probe
        .set_method_handler(
            "test.blocking.Probe",
            "Probe",
            Arc::new(move |_member, msg| {
                let escape = msg.args().first().and_then(MsgArg::as_bool).unwrap_or(false);
                if escape {
                    a_for_handler.enable_concurrent_callbacks();
                }
                let result = a_for_handler
                    .join_session(&b_name, PORT, None, &SessionOpts::default())
                    .map(|_| ());
                *outcome_in_handler.lock().unwrap() = Some(result);
                MethodResult::Reply(vec![])
            }),
        )
        .unwrap();
    a.register_bus_object(Arc::new(probe), false).unwrap();

    // Without the escape hatch: blocking-call-not-allowed.
    let reply = b
        .method_call(
            &a.unique_name(),
            "/probe",
            "test.blocking.Probe",
            "Probe",
            vec![MsgArg::Boolean(false)],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reply.msg_type(), meshbus::MessageType::MethodReturn);
    assert_eq!(
        *outcome.lock().unwrap(),
        Some(Err(Status::BlockingCallNotAllowed))
    );

    // With enable_concurrent_callbacks the join proceeds.
    let reply = b
        .method_call(
            &a.unique_name(),
            "/probe",
            "test.blocking.Probe",
            "Probe",
            vec![MsgArg::Boolean(true)],
            Duration::from_secs(5),
        )
        .unwrap();
    assert_eq!(reply.msg_type(), meshbus::MessageType::MethodReturn);
    assert_eq!(*outcome.lock().unwrap(), Some(Ok(())));
}

#[test]
fn test_join_alerted_by_stop() {
    let (_router, a, b) = attachment_pair();

    // A port whose accept callback stalls long enough for stop to land.
    struct SlowAccept;
    impl meshbus::listener::SessionPortListener for SlowAccept {
        fn accept_session_joiner(
            &self,
            _port: meshbus::SessionPort,
            _joiner: &str,
            _opts: &SessionOpts,
        ) -> bool {
            std::thread::sleep(Duration::from_millis(300));
            true
        }
    }
    a.bind_session_port(PORT, &SessionOpts::default(), Arc::new(SlowAccept))
        .unwrap();

    let b_for_thread = b.clone();
    let a_name = a.unique_name();
    let joiner = std::thread::spawn(move || {
        b_for_thread.join_session(&a_name, PORT, None, &SessionOpts::default())
    });

    std::thread::sleep(Duration::from_millis(50));
    b.stop().unwrap();

    let result = joiner.join().unwrap();
    assert_eq!(result.unwrap_err(), Status::Stopping);
    b.join().unwrap();
}

#[test]
fn test_set_link_timeout_dispositions() {
    let (_router, a, b) = attachment_pair();
    let accept = AcceptAll::new();
    a.bind_session_port(PORT, &SessionOpts::default(), accept)
        .unwrap();
    let (id, _) = b
        .join_session(&a.unique_name(), PORT, None, &SessionOpts::default())
        .unwrap();

    // The in-process link has no timeout support.
    assert_eq!(b.set_link_timeout(id, 30).unwrap_err(), Status::Fail);
    assert_eq!(
        b.set_link_timeout(9999, 30).unwrap_err(),
        Status::LeaveNoSession
    );
}
