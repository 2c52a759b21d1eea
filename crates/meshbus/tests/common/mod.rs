//! Shared helpers for the end-to-end tests: attachment pairs on a private
//! bundled router and the sample door service.

#![allow(dead_code)] // each test binary uses its own subset

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use meshbus::args::MsgArg;
use meshbus::attachment::BusAttachment;
use meshbus::handlers::MethodResult;
use meshbus::iface::SecurityPolicy;
use meshbus::listener::{SessionListener, SessionPortListener};
use meshbus::object::BusObject;
use meshbus::router::BundledRouter;
use meshbus::session::{SessionId, SessionLostReason, SessionOpts, SessionPort};

/// The sample secure door interface name.
pub const DOOR_IFACE: &str = "sample.secure.Door";
/// The sample door object path.
pub const DOOR_PATH: &str = "/door";

/// Installs the test log subscriber once.
pub fn init_logging() {
    use std::sync::Once;
    static ONCE: Once = Once::new();
    ONCE.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(
                tracing_subscriber::EnvFilter::try_from_default_env()
                    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
            )
            .with_test_writer()
            .try_init();
    });
}

/// A fresh router with two connected attachments.
pub fn attachment_pair() -> (Arc<BundledRouter>, BusAttachment, BusAttachment) {
    init_logging();
    let router = Arc::new(BundledRouter::new());
    let a = meshbus::runtime::attach_to_private_router("service-a", &router).unwrap();
    let b = meshbus::runtime::attach_to_private_router("client-b", &router).unwrap();
    (router, a, b)
}

/// Registers the door interface and `/door` object on `bus`. The handler
/// counts invocations and optionally sleeps before replying.
pub fn register_door(
    bus: &BusAttachment,
    policy: SecurityPolicy,
    secure_object: bool,
    handler_delay: Duration,
) -> Arc<AtomicUsize> {
    let mut iface = bus.create_interface(DOOR_IFACE, policy).unwrap();
    iface.add_method("Open", "", "b", "success").unwrap();
    iface.add_signal("StateChanged", "b", "open").unwrap();
    iface
        .add_property("IsOpen", "b", meshbus::iface::PropAccess::Read)
        .unwrap();
    iface.activate();
    let iface = bus.register_interface(iface).unwrap();

    let calls = Arc::new(AtomicUsize::new(0));
    let calls_in_handler = calls.clone();
    let mut door = BusObject::new(DOOR_PATH).unwrap();
    door.add_interface(iface, true).unwrap();
    door.set_method_handler(
        DOOR_IFACE,
        "Open",
        Arc::new(move |_member, _msg| {
            calls_in_handler.fetch_add(1, Ordering::SeqCst);
            if !handler_delay.is_zero() {
                std::thread::sleep(handler_delay);
            }
            MethodResult::Reply(vec![MsgArg::Boolean(true)])
        }),
    )
    .unwrap();
    door.set_property_get_handler(Arc::new(|_iface, prop| match prop {
        "IsOpen" => Ok(MsgArg::Boolean(false)),
        _ => Err(meshbus::Status::NoSuchProperty),
    }));
    bus.register_bus_object(Arc::new(door), secure_object).unwrap();
    calls
}

/// Port listener accepting every joiner.
pub struct AcceptAll {
    /// Session ids handed to `session_joined`.
    pub joined: Mutex<Vec<(SessionPort, SessionId, String)>>,
}

impl AcceptAll {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            joined: Mutex::new(Vec::new()),
        })
    }
}

impl SessionPortListener for AcceptAll {
    fn accept_session_joiner(&self, _port: SessionPort, _joiner: &str, _opts: &SessionOpts) -> bool {
        true
    }
    fn session_joined(&self, port: SessionPort, id: SessionId, joiner: &str) {
        self.joined.lock().unwrap().push((port, id, joiner.to_string()));
    }
}

/// Session listener recording lost/member events.
#[derive(Default)]
pub struct RecordingSessionListener {
    pub lost: AtomicUsize,
    pub last_reason: Mutex<Option<SessionLostReason>>,
    pub members_added: Mutex<Vec<String>>,
    pub members_removed: Mutex<Vec<String>>,
}

impl SessionListener for RecordingSessionListener {
    fn session_lost(&self, _id: SessionId, reason: SessionLostReason) {
        *self.last_reason.lock().unwrap() = Some(reason);
        self.lost.fetch_add(1, Ordering::SeqCst);
    }
    fn session_member_added(&self, _id: SessionId, member: &str) {
        self.members_added.lock().unwrap().push(member.to_string());
    }
    fn session_member_removed(&self, _id: SessionId, member: &str) {
        self.members_removed.lock().unwrap().push(member.to_string());
    }
}

/// Polls `predicate` until it holds or the deadline passes.
pub fn wait_until(timeout: Duration, predicate: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if predicate() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    predicate()
}
