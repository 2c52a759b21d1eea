//! Reply-context registry behaviour against a router that never answers:
//! deadlines, pause/resume, re-serialization, and shutdown flushing.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use common::init_logging;
use meshbus::attachment::BusAttachment;
use meshbus::handlers::next_receiver_id;
use meshbus::message::Message;
use meshbus::router::{Router, RouterEndpoint};
use meshbus::Status;

/// A router that swallows every message and never replies.
struct SinkRouter {
    version: Option<u32>,
    next: AtomicU32,
    endpoints: Mutex<Vec<Arc<dyn RouterEndpoint>>>,
}

impl SinkRouter {
    fn new(version: Option<u32>) -> Arc<Self> {
        Arc::new(Self {
            version,
            next: AtomicU32::new(1),
            endpoints: Mutex::new(Vec::new()),
        })
    }
}

impl Router for SinkRouter {
    fn protocol_version(&self) -> Option<u32> {
        self.version
    }
    fn generate_unique_name(&self) -> String {
        format!(":sink.{}", self.next.fetch_add(1, Ordering::Relaxed))
    }
    fn register_endpoint(&self, endpoint: Arc<dyn RouterEndpoint>) {
        self.endpoints.lock().unwrap().push(endpoint);
    }
    fn unregister_endpoint(&self, _unique_name: &str) {}
    fn push_message(&self, _msg: &Message) -> Result<(), Status> {
        Ok(())
    }
}

fn sink_attachment() -> BusAttachment {
    init_logging();
    let bus = BusAttachment::new("sink-client", 2);
    bus.start().unwrap();
    bus.connect_to_router(SinkRouter::new(Some(meshbus::names::PROTOCOL_VERSION)) as Arc<dyn Router>)
        .unwrap();
    bus
}

fn unanswered_call(
    bus: &BusAttachment,
    timeout: Duration,
) -> (u32, std::sync::mpsc::Receiver<Message>) {
    let (tx, rx) = std::sync::mpsc::channel();
    let serial = bus
        .method_call_async(
            ":sink.99",
            "/nowhere",
            "test.sink.Iface",
            "Never",
            vec![],
            timeout,
            next_receiver_id(),
            Box::new(move |reply| {
                let _ = tx.send(reply.clone());
            }),
        )
        .unwrap();
    (serial, rx)
}

#[test]
fn test_version_gating() {
    init_logging();

    // An older daemon is rejected.
    let bus = BusAttachment::new("gate", 2);
    bus.start().unwrap();
    assert_eq!(
        bus.connect_to_router(SinkRouter::new(Some(meshbus::names::PROTOCOL_VERSION - 1))
            as Arc<dyn Router>)
            .unwrap_err(),
        Status::IncompatibleDaemon
    );

    // A daemon that does not announce a version is a plain DBus daemon
    // and bypasses the check.
    bus.connect_to_router(SinkRouter::new(None) as Arc<dyn Router>)
        .unwrap();
    assert!(bus.is_connected());
}

#[test]
fn test_deadline_produces_timeout_error() {
    let bus = sink_attachment();
    let begun = Instant::now();
    let (_serial, rx) = unanswered_call(&bus, Duration::from_millis(80));

    let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(reply.error_name(), "org.alljoyn.Bus.Timeout");
    assert!(begun.elapsed() >= Duration::from_millis(70));
    assert_eq!(bus.endpoint().outstanding_replies(), 0);
}

#[test]
fn test_pause_and_resume_deadline() {
    let bus = sink_attachment();
    let (serial, rx) = unanswered_call(&bus, Duration::from_millis(80));

    // Paused: the deadline must not fire.
    assert!(bus.endpoint().pause_reply_timeout(serial));
    assert!(rx.recv_timeout(Duration::from_millis(250)).is_err());
    assert_eq!(bus.endpoint().outstanding_replies(), 1);

    // Resumed: the original (already past) deadline fires promptly.
    assert!(bus.endpoint().resume_reply_timeout(serial));
    let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(reply.status(), Some(Status::Timeout));

    // Pausing a resolved serial reports nothing to pause.
    assert!(!bus.endpoint().pause_reply_timeout(serial));
}

#[test]
fn test_unregister_reply_handler_cancels() {
    let bus = sink_attachment();
    let (serial, rx) = unanswered_call(&bus, Duration::from_millis(60));

    assert!(bus.endpoint().unregister_reply_handler(serial));
    assert!(!bus.endpoint().unregister_reply_handler(serial));
    // Neither a reply nor a timeout is delivered after cancellation.
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}

#[test]
fn test_reserialize_rekeys_context() {
    let bus = sink_attachment();
    let (serial, rx) = unanswered_call(&bus, Duration::from_secs(30));

    let new_serial = serial + 1000;
    assert!(bus.endpoint().reserialize_reply(serial, new_serial));
    assert!(!bus.endpoint().reserialize_reply(serial, new_serial));

    // A late reply under the old serial no longer matches…
    let stale = Message::error_for_serial(":sink.99", serial, "org.alljoyn.Bus.Late");
    bus.endpoint().push_message(stale).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());

    // …while the new serial resolves the context.
    let fresh = Message::error_for_serial(":sink.99", new_serial, "org.alljoyn.Bus.Late");
    bus.endpoint().push_message(fresh).unwrap();
    let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(reply.reply_serial(), new_serial);
}

#[test]
fn test_stop_flushes_pending_call_with_exiting() {
    let bus = sink_attachment();
    let (_serial, rx) = unanswered_call(&bus, Duration::from_secs(300));

    bus.stop().unwrap();
    let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(reply.error_name(), "org.alljoyn.Bus.Exiting");
    bus.join().unwrap();
}

#[test]
fn test_exactly_one_resolution_per_serial() {
    let bus = sink_attachment();
    let (serial, rx) = unanswered_call(&bus, Duration::from_millis(80));

    // The timeout resolves the context…
    let first = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(first.status(), Some(Status::Timeout));

    // …and a late wire reply for the same serial is dropped.
    let late = Message::error_for_serial(":sink.99", serial, "org.alljoyn.Bus.Late");
    bus.endpoint().push_message(late).unwrap();
    assert!(rx.recv_timeout(Duration::from_millis(200)).is_err());
}
