//! The local endpoint: routing of inbound messages to registered objects
//! and handlers.
//!
//! Owns the dispatcher, the reply timer, the method and signal tables, the
//! reply-context registry, the object tree, and the peer security
//! sub-object. One entry point, [`LocalEndpoint::push_message`], fans out
//! by message type:
//!
//! - method call → table lookup → security check → unmarshal → handler
//! - signal → matching-handler snapshot → security check → unmarshal →
//!   handlers
//! - method return / error → reply-context removal → decrypt check →
//!   reply handler
//!
//! A message that requires encryption is never handed to a handler in the
//! clear; the violation is reported to the peer sub-object and an error
//! reply goes back to the caller.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use meshbus_core::guid::Guid128;
use meshbus_core::status::Status;
use tracing::{debug, warn};

use crate::args::{unmarshal_check, MsgArg};
use crate::dispatch::{AlarmId, AlarmReason, DeferredWork, Dispatcher, Timer};
use crate::handlers::{
    MethodEntry, MethodResult, MethodTable, ReceiverId, SignalEntry, SignalTable,
};
use crate::iface::{Member, MemberKind, SecurityPolicy};
use crate::match_rule::MatchRule;
use crate::message::{flags, Message, MessageType};
use crate::names::{PEER_INTERFACE, PROPERTIES_INTERFACE};
use crate::object::{parent_paths, BusObject};
use crate::peer::PeerObj;
use crate::router::{Router, RouterEndpoint};
use crate::session::{SessionId, SessionOpts, SessionPort};

/// Host-side session hooks the attachment installs on its endpoint.
pub trait SessionHost: Send + Sync {
    /// Ask the bound port's listener whether to admit a joiner.
    fn accept_session_joiner(&self, port: SessionPort, joiner: &str, opts: &SessionOpts) -> bool;
    /// Record the admitted joiner and notify the port listener.
    fn session_joined(&self, port: SessionPort, id: SessionId, joiner: &str);
}

/// One-shot reply callback.
pub type ReplyHandler = Box<dyn FnOnce(&Message) + Send>;

struct ReplyRecord {
    ctx_id: u64,
    receiver: ReceiverId,
    member: Option<Member>,
    call_flags: u8,
    serial: u32,
    deadline: Instant,
    alarm_id: Option<AlarmId>,
    handler: Option<ReplyHandler>,
}

struct ObjectRecord {
    object: Arc<BusObject>,
    placeholder: bool,
    secure: bool,
    registered: bool,
}

#[derive(Default)]
struct ActiveHandlers {
    active: HashMap<ReceiverId, HashSet<ThreadId>>,
    unregistering: HashSet<ReceiverId>,
}

pub(crate) struct EndpointInner {
    guid: Guid128,
    running: AtomicBool,
    connected: AtomicBool,
    unique_name: RwLock<String>,
    serial: AtomicU32,
    next_reply_ctx: AtomicU64,
    dispatcher: Dispatcher,
    reply_timer: Timer,
    method_table: MethodTable,
    signal_table: SignalTable,
    reply_map: Mutex<HashMap<u32, ReplyRecord>>,
    objects: Mutex<BTreeMap<String, ObjectRecord>>,
    handlers: Mutex<ActiveHandlers>,
    handlers_done: Condvar,
    router: RwLock<Option<Arc<dyn Router>>>,
    peer_obj: PeerObj,
    session_host: RwLock<Weak<dyn SessionHost>>,
    cached_replies: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

/// The local endpoint.
#[derive(Clone)]
pub struct LocalEndpoint {
    inner: Arc<EndpointInner>,
}

struct NoSessionHost;
impl SessionHost for NoSessionHost {
    fn accept_session_joiner(&self, _port: SessionPort, _joiner: &str, _opts: &SessionOpts) -> bool {
        false
    }
    fn session_joined(&self, _port: SessionPort, _id: SessionId, _joiner: &str) {}
}

impl LocalEndpoint {
    /// Creates a stopped endpoint.
    #[must_use]
    pub fn new(guid: Guid128, concurrency: usize) -> Self {
        static ENDPOINT_COUNT: AtomicU64 = AtomicU64::new(0);
        let n = ENDPOINT_COUNT.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::new(EndpointInner {
            guid,
            running: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            unique_name: RwLock::new(String::new()),
            serial: AtomicU32::new(1),
            next_reply_ctx: AtomicU64::new(1),
            dispatcher: Dispatcher::new(&format!("lep-disp-{n}"), concurrency),
            reply_timer: Timer::new(&format!("lep-reply-{n}"), 1, 64),
            method_table: MethodTable::new(),
            signal_table: SignalTable::new(),
            reply_map: Mutex::new(HashMap::new()),
            objects: Mutex::new(BTreeMap::new()),
            handlers: Mutex::new(ActiveHandlers::default()),
            handlers_done: Condvar::new(),
            router: RwLock::new(None),
            peer_obj: PeerObj::new(),
            session_host: RwLock::new(Weak::<NoSessionHost>::new() as Weak<dyn SessionHost>),
            cached_replies: Mutex::new(Vec::new()),
        });
        let hooks: Weak<dyn DeferredWork> = Arc::downgrade(&inner) as Weak<dyn DeferredWork>;
        inner.dispatcher.set_hooks(hooks);
        Self { inner }
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts the dispatcher and reply timer and mints the unique name.
    pub fn start(&self, router: Arc<dyn Router>) {
        *self.inner.unique_name.write().unwrap() = router.generate_unique_name();
        *self.inner.router.write().unwrap() = Some(router);
        self.inner.dispatcher.start();
        self.inner.reply_timer.start();
        self.inner.running.store(true, Ordering::SeqCst);
    }

    /// Stops accepting work; queued messages and reply deadlines flush
    /// with the exiting reason.
    pub fn stop(&self) {
        self.inner.running.store(false, Ordering::SeqCst);
        self.inner.dispatcher.stop();
        self.inner.reply_timer.stop();
    }

    /// Waits for worker threads to exit and detaches the router.
    pub fn join(&self) {
        self.inner.dispatcher.join();
        self.inner.reply_timer.join();
        *self.inner.router.write().unwrap() = None;
        self.inner.reply_map.lock().unwrap().clear();
    }

    /// True while started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::SeqCst)
    }

    /// The endpoint's unique name.
    #[must_use]
    pub fn unique_name(&self) -> String {
        self.inner.unique_name.read().unwrap().clone()
    }

    /// The attachment's global GUID.
    #[must_use]
    pub fn guid(&self) -> Guid128 {
        self.inner.guid
    }

    /// Next outbound serial; never zero.
    #[must_use]
    pub fn next_serial(&self) -> u32 {
        loop {
            let serial = self.inner.serial.fetch_add(1, Ordering::Relaxed);
            if serial != 0 {
                return serial;
            }
        }
    }

    /// The peer security sub-object.
    #[must_use]
    pub fn peer_obj(&self) -> &PeerObj {
        &self.inner.peer_obj
    }

    /// Installs the attachment's host-side session hooks.
    pub fn set_session_host(&self, host: Weak<dyn SessionHost>) {
        *self.inner.session_host.write().unwrap() = host;
    }

    /// Marks the attachment connected and schedules registration
    /// callbacks for objects registered before connect.
    pub fn on_bus_connected(&self) {
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.dispatcher.trigger_deferred_callbacks();
    }

    /// Marks the attachment disconnected and fires `ObjectUnregistered`
    /// callbacks.
    pub fn on_bus_disconnected(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        let callbacks = {
            let mut objects = self.inner.objects.lock().unwrap();
            let mut callbacks = Vec::new();
            for record in objects.values_mut() {
                if record.registered {
                    record.registered = false;
                    if let Some(cb) = record.object.registration_callback() {
                        callbacks.push(cb);
                    }
                }
            }
            callbacks
        };
        for cb in callbacks {
            cb(false);
        }
    }

    /// The router handle this endpoint is attached to.
    #[must_use]
    pub fn router(&self) -> Option<Arc<dyn Router>> {
        self.inner.router.read().unwrap().clone()
    }

    /// Sends an outbound message through the router.
    ///
    /// # Errors
    ///
    /// [`Status::NotConnected`] without a router; routing errors pass
    /// through.
    pub fn send_message(&self, msg: &Message) -> Result<(), Status> {
        match self.router() {
            Some(router) => router.push_message(msg),
            None => Err(Status::NotConnected),
        }
    }

    /// The router-facing handle for this endpoint.
    #[must_use]
    pub fn router_endpoint(&self) -> Arc<dyn RouterEndpoint> {
        Arc::new(EndpointHandle {
            inner: Arc::downgrade(&self.inner),
        })
    }

    /// Releases the dispatcher's reentrancy lock for the remainder of the
    /// current callback.
    pub fn enable_reentrancy(&self) {
        self.inner.dispatcher.enable_concurrent_callbacks();
    }

    /// True inside one of this endpoint's dispatcher callbacks that has
    /// not enabled concurrent callbacks.
    #[must_use]
    pub fn is_reentrant_call(&self) -> bool {
        self.inner.dispatcher.is_dispatch_thread() && crate::dispatch::is_reentrant_call()
    }

    /// Queues a cached property reply for delivery on a dispatcher thread.
    pub fn schedule_cached_property_reply(&self, reply: Box<dyn FnOnce() + Send>) {
        self.inner.cached_replies.lock().unwrap().push(reply);
        self.inner.dispatcher.trigger_cached_property_reply_work();
    }

    /// Arms the observer-work category of the pending sentinel.
    pub fn trigger_observer_work(&self) {
        self.inner.dispatcher.trigger_observer_work();
    }

    // ------------------------------------------------------------------
    // Inbound path
    // ------------------------------------------------------------------

    /// Accepts an inbound message.
    ///
    /// Locally-originated messages arriving on a dispatcher thread are
    /// handled inline to avoid requeue deadlock; everything else goes
    /// through the dispatcher, marked limitable when the sender is remote.
    ///
    /// # Errors
    ///
    /// [`Status::Stopping`] when the endpoint refuses new work.
    pub fn push_message(&self, msg: Message) -> Result<(), Status> {
        if !self.is_running() {
            return Err(Status::Stopping);
        }
        let local_sender = msg.sender() == self.unique_name();
        if local_sender && self.inner.dispatcher.is_dispatch_thread() {
            return self.do_push(&msg);
        }
        let weak = Arc::downgrade(&self.inner);
        self.inner.dispatcher.dispatch(!local_sender, move |reason| {
            if reason != AlarmReason::Triggered {
                return;
            }
            if let Some(inner) = weak.upgrade() {
                let endpoint = LocalEndpoint { inner };
                let status = endpoint.do_push(&msg);
                if let Err(status) = status {
                    // Unmatched reply serials are routine (late replies are
                    // dropped); stopping is the normal shutdown path.
                    if status != Status::Stopping && status != Status::UnmatchedReplySerial {
                        warn!(status = %status, msg = %msg, "message dispatch failed; dropping");
                    }
                }
            }
        })
    }

    fn do_push(&self, msg: &Message) -> Result<(), Status> {
        if !self.is_running() {
            debug!(msg = %msg, "endpoint not running, discarding");
            return Err(Status::Stopping);
        }
        let result = match msg.msg_type() {
            MessageType::MethodCall => self.handle_method_call(msg),
            MessageType::Signal => self.handle_signal(msg),
            MessageType::MethodReturn | MessageType::Error => self.handle_method_reply(msg),
        };
        // Wake anyone blocked on unregister quiescence.
        let handlers = self.inner.handlers.lock().unwrap();
        drop(handlers);
        self.inner.handlers_done.notify_all();
        result
    }

    fn with_active_handler(&self, receiver: ReceiverId, f: impl FnOnce()) -> bool {
        let me = std::thread::current().id();
        {
            let mut handlers = self.inner.handlers.lock().unwrap();
            if handlers.unregistering.contains(&receiver) {
                return false;
            }
            handlers.active.entry(receiver).or_default().insert(me);
        }
        f();
        let mut handlers = self.inner.handlers.lock().unwrap();
        if let Some(threads) = handlers.active.get_mut(&receiver) {
            threads.remove(&me);
            if threads.is_empty() {
                handlers.active.remove(&receiver);
            }
        }
        drop(handlers);
        self.inner.handlers_done.notify_all();
        true
    }

    /// Blocks new handler invocations on `receiver` and waits for active
    /// ones to drain.
    ///
    /// # Errors
    ///
    /// [`Status::Deadlock`] when called from inside one of the receiver's
    /// own handlers.
    pub fn quiesce_receiver(&self, receiver: ReceiverId) -> Result<(), Status> {
        let me = std::thread::current().id();
        let mut handlers = self.inner.handlers.lock().unwrap();
        if handlers
            .active
            .get(&receiver)
            .is_some_and(|threads| threads.contains(&me))
        {
            warn!("attempt to unregister a receiver from its own handler");
            return Err(Status::Deadlock);
        }
        handlers.unregistering.insert(receiver);
        while handlers.active.contains_key(&receiver) {
            handlers = self.inner.handlers_done.wait(handlers).unwrap();
        }
        Ok(())
    }

    /// Re-admits a receiver after a completed unregister.
    pub fn release_receiver(&self, receiver: ReceiverId) {
        self.inner.handlers.lock().unwrap().unregistering.remove(&receiver);
    }

    // ------------------------------------------------------------------
    // Method calls
    // ------------------------------------------------------------------

    fn handle_method_call(&self, msg: &Message) -> Result<(), Status> {
        let entry = self
            .inner
            .method_table
            .find(msg.path(), msg.interface(), msg.member());

        let mut status = Status::Fail;
        let mut handled = false;

        match entry {
            None if msg.interface() == PEER_INTERFACE => return self.peer_interface(msg),
            None if msg.interface() == PROPERTIES_INTERFACE => {
                return self.properties_interface(msg)
            }
            None => {
                status = self.diagnose(msg);
            }
            Some(entry) => {
                let requires = entry.policy != SecurityPolicy::Off
                    && (entry.policy == SecurityPolicy::Required || entry.object_secure);
                if requires && !msg.is_encrypted() {
                    status = Status::NotEncrypted;
                    warn!(
                        member = msg.member(),
                        secure = entry.object_secure,
                        "method call to secure target was not encrypted"
                    );
                } else if let Err(err) = unmarshal_check(msg.args(), &entry.member.signature) {
                    status = err;
                } else {
                    let invoked = self.with_active_handler(entry.receiver, || {
                        let result = (entry.handler)(&entry.member, msg);
                        self.send_method_result(msg, result);
                    });
                    // A receiver mid-unregister silently skips its handler.
                    let _ = invoked;
                    handled = true;
                }
            }
        }

        if handled {
            return Ok(());
        }
        self.reject_method_call(msg, status)
    }

    fn reject_method_call(&self, msg: &Message, status: Status) -> Result<(), Status> {
        if msg.no_reply_expected() {
            debug!(status = %status, msg = %msg, "ignoring rejected call with no reply expected");
            return Ok(());
        }
        let (error_name, description) = match status {
            Status::NotEncrypted => {
                self.inner.peer_obj.handle_security_violation(status, msg);
                (status.error_name(), "Expected secure method call".to_string())
            }
            Status::DecryptionFailed => {
                self.inner.peer_obj.handle_security_violation(status, msg);
                (
                    status.error_name(),
                    "Unable to authenticate method call".to_string(),
                )
            }
            Status::NotAuthorized => {
                self.inner.peer_obj.handle_security_violation(status, msg);
                (status.error_name(), "Method call not authorized".to_string())
            }
            other => (other.error_name(), other.to_string()),
        };
        let reply = Message::error_reply(msg, self.next_serial(), &error_name, &description);
        self.send_message(&reply)
    }

    fn send_method_result(&self, call: &Message, result: MethodResult) {
        if call.no_reply_expected() {
            return;
        }
        let reply = match result {
            MethodResult::Reply(args) => Message::method_return(call, self.next_serial(), args),
            MethodResult::Error { name, description } => {
                Message::error_reply(call, self.next_serial(), &name, &description)
            }
            MethodResult::NoReply => return,
        };
        if let Err(status) = self.send_message(&reply) {
            debug!(status = %status, "method reply not sent");
        }
    }

    fn diagnose(&self, msg: &Message) -> Status {
        let objects = self.inner.objects.lock().unwrap();
        let Some(record) = objects.get(msg.path()) else {
            debug!(path = msg.path(), "no such object");
            return Status::NoSuchObject;
        };
        if !record.object.implements_interface(msg.interface()) {
            debug!(
                path = msg.path(),
                interface = msg.interface(),
                "object does not implement interface"
            );
            return Status::NoSuchInterface;
        }
        debug!(
            path = msg.path(),
            member = msg.member(),
            "object has no such member"
        );
        Status::NoSuchMember
    }

    /// Built-in peer interface, answered locally.
    fn peer_interface(&self, msg: &Message) -> Result<(), Status> {
        match msg.member() {
            "Ping" => {
                unmarshal_check(msg.args(), "")?;
                let reply = Message::method_return(msg, self.next_serial(), vec![]);
                self.send_message(&reply)
            }
            "GetMachineId" => {
                unmarshal_check(msg.args(), "")?;
                let reply = Message::method_return(
                    msg,
                    self.next_serial(),
                    vec![MsgArg::String(self.inner.guid.to_hex())],
                );
                self.send_message(&reply)
            }
            _ => self.reject_method_call(msg, Status::NoSuchMember),
        }
    }

    /// Built-in properties interface dispatched against the target object.
    fn properties_interface(&self, msg: &Message) -> Result<(), Status> {
        let record = {
            let objects = self.inner.objects.lock().unwrap();
            objects.get(msg.path()).map(|record| {
                (
                    record.object.clone(),
                    record.secure,
                )
            })
        };
        let Some((object, object_secure)) = record else {
            return self.reject_method_call(msg, Status::NoSuchObject);
        };

        let iface_name = match msg.args().first().and_then(MsgArg::as_str) {
            Some(name) => name.to_string(),
            None => return self.reject_method_call(msg, Status::InvalidData),
        };
        let Some(iface) = object
            .interfaces()
            .iter()
            .map(|(i, _)| i.clone())
            .find(|i| i.name() == iface_name)
        else {
            return self.reject_method_call(msg, Status::NoSuchInterface);
        };
        if iface.requires_encryption(object_secure) && !msg.is_encrypted() {
            return self.reject_method_call(msg, Status::NotEncrypted);
        }

        let receiver = object.receiver();
        let outcome: Option<MethodResult> = match msg.member() {
            "Get" => {
                let Some(prop_name) = msg.args().get(1).and_then(MsgArg::as_str) else {
                    return self.reject_method_call(msg, Status::InvalidData);
                };
                let Some(property) = iface.property(prop_name) else {
                    return self.reject_method_call(msg, Status::NoSuchProperty);
                };
                if property.access == crate::iface::PropAccess::Write {
                    Some(MethodResult::Error {
                        name: "org.alljoyn.Bus.PropertyAccessDenied".to_string(),
                        description: format!("property {prop_name} is write-only"),
                    })
                } else {
                    match object.property_get_handler() {
                        Some(handler) => {
                            let prop_name = prop_name.to_string();
                            let mut result = None;
                            self.with_active_handler(receiver, || {
                                result = Some(match handler(&iface_name, &prop_name) {
                                    Ok(value) => {
                                        MethodResult::Reply(vec![MsgArg::Variant(Box::new(value))])
                                    }
                                    Err(status) => MethodResult::Error {
                                        name: status.error_name(),
                                        description: status.to_string(),
                                    },
                                });
                            });
                            result
                        }
                        None => return self.reject_method_call(msg, Status::NoSuchProperty),
                    }
                }
            }
            "Set" => {
                let (Some(prop_name), Some(value)) = (
                    msg.args().get(1).and_then(MsgArg::as_str),
                    msg.args().get(2),
                ) else {
                    return self.reject_method_call(msg, Status::InvalidData);
                };
                let Some(property) = iface.property(prop_name) else {
                    return self.reject_method_call(msg, Status::NoSuchProperty);
                };
                if property.access == crate::iface::PropAccess::Read {
                    Some(MethodResult::Error {
                        name: "org.alljoyn.Bus.PropertyAccessDenied".to_string(),
                        description: format!("property {prop_name} is read-only"),
                    })
                } else {
                    let value = value.as_variant().unwrap_or(value).clone();
                    match object.property_set_handler() {
                        Some(handler) => {
                            let prop_name = prop_name.to_string();
                            let mut result = None;
                            self.with_active_handler(receiver, || {
                                result = Some(match handler(&iface_name, &prop_name, &value) {
                                    Ok(()) => MethodResult::Reply(vec![]),
                                    Err(status) => MethodResult::Error {
                                        name: status.error_name(),
                                        description: status.to_string(),
                                    },
                                });
                            });
                            result
                        }
                        None => return self.reject_method_call(msg, Status::NoSuchProperty),
                    }
                }
            }
            "GetAll" => {
                let handler = object.property_get_handler();
                let mut entries = Vec::new();
                if let Some(handler) = handler {
                    let mut collected = Vec::new();
                    self.with_active_handler(receiver, || {
                        for property in iface.properties() {
                            if property.access == crate::iface::PropAccess::Write {
                                continue;
                            }
                            if let Ok(value) = handler(&iface_name, &property.name) {
                                collected.push((property.name.clone(), value));
                            }
                        }
                    });
                    entries = collected;
                }
                Some(MethodResult::Reply(vec![MsgArg::Array(
                    "{sv}".to_string(),
                    entries
                        .into_iter()
                        .map(|(name, value)| {
                            MsgArg::DictEntry(
                                Box::new(MsgArg::String(name)),
                                Box::new(MsgArg::Variant(Box::new(value))),
                            )
                        })
                        .collect(),
                )]))
            }
            _ => return self.reject_method_call(msg, Status::NoSuchMember),
        };

        if let Some(result) = outcome {
            self.send_method_result(msg, result);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Signals
    // ------------------------------------------------------------------

    fn handle_signal(&self, msg: &Message) -> Result<(), Status> {
        let matched = self.inner.signal_table.find_matching(msg);
        if matched.is_empty() {
            return Ok(());
        }

        // The declared member of the first entry drives the security and
        // unmarshalling checks.
        let first = &matched[0];
        if first.policy == SecurityPolicy::Required && !msg.is_encrypted() {
            warn!(member = msg.member(), "signal from secure interface was not encrypted");
            self.inner
                .peer_obj
                .handle_security_violation(Status::NotEncrypted, msg);
            return Ok(());
        }
        if let Err(status) = unmarshal_check(msg.args(), &first.member.signature) {
            debug!(status = %status, msg = %msg, "signal argument mismatch");
            return Ok(());
        }

        for entry in matched {
            self.with_active_handler(entry.receiver, || {
                (entry.handler)(&entry.member, msg.path(), msg);
            });
        }
        Ok(())
    }

    /// Registers a signal handler.
    pub fn register_signal_handler(&self, iface_name: &str, entry: SignalEntry) {
        self.inner.signal_table.add(iface_name, entry);
    }

    /// Unregisters one signal handler registration, waiting out in-flight
    /// invocations.
    ///
    /// # Errors
    ///
    /// [`Status::Deadlock`] from inside the receiver's own handler;
    /// [`Status::Fail`] when no matching registration exists.
    pub fn unregister_signal_handler(
        &self,
        receiver: ReceiverId,
        iface_name: &str,
        member_name: &str,
        rule: Option<&MatchRule>,
    ) -> Result<(), Status> {
        self.quiesce_receiver(receiver)?;
        let result = self
            .inner
            .signal_table
            .remove(receiver, iface_name, member_name, rule);
        self.release_receiver(receiver);
        result
    }

    /// Unregisters every signal handler and reply context of a receiver.
    ///
    /// # Errors
    ///
    /// [`Status::Deadlock`] from inside the receiver's own handler.
    pub fn unregister_all_handlers(&self, receiver: ReceiverId) -> Result<(), Status> {
        self.quiesce_receiver(receiver)?;
        self.inner.signal_table.remove_all(receiver);
        {
            let mut map = self.inner.reply_map.lock().unwrap();
            let serials: Vec<u32> = map
                .values()
                .filter(|record| record.receiver == receiver)
                .map(|record| record.serial)
                .collect();
            for serial in serials {
                if let Some(record) = map.remove(&serial) {
                    if let Some(alarm_id) = record.alarm_id {
                        self.inner.reply_timer.remove_alarm(alarm_id);
                    }
                }
            }
        }
        self.release_receiver(receiver);
        Ok(())
    }

    // ------------------------------------------------------------------
    // Replies
    // ------------------------------------------------------------------

    /// Registers a reply context for an outbound method call and arms its
    /// deadline.
    ///
    /// # Errors
    ///
    /// [`Status::Stopping`] when the endpoint is not running.
    pub fn register_reply_handler(
        &self,
        receiver: ReceiverId,
        member: Option<Member>,
        call: &Message,
        timeout: Duration,
        handler: ReplyHandler,
    ) -> Result<(), Status> {
        if !self.is_running() {
            return Err(Status::Stopping);
        }
        let ctx_id = self.inner.next_reply_ctx.fetch_add(1, Ordering::Relaxed);
        let deadline = Instant::now() + timeout;
        {
            let mut map = self.inner.reply_map.lock().unwrap();
            debug_assert!(!map.contains_key(&call.serial()));
            map.insert(
                call.serial(),
                ReplyRecord {
                    ctx_id,
                    receiver,
                    member,
                    call_flags: call.flags(),
                    serial: call.serial(),
                    deadline,
                    alarm_id: None,
                    handler: Some(handler),
                },
            );
        }
        match self.arm_reply_alarm(ctx_id, timeout) {
            Ok(()) => Ok(()),
            Err(status) => {
                self.unregister_reply_handler(call.serial());
                Err(status)
            }
        }
    }

    fn arm_reply_alarm(&self, ctx_id: u64, timeout: Duration) -> Result<(), Status> {
        let weak = Arc::downgrade(&self.inner);
        let alarm_id = self.inner.reply_timer.add_alarm(timeout, false, move |reason| {
            if let Some(inner) = weak.upgrade() {
                let endpoint = LocalEndpoint { inner };
                endpoint.reply_deadline_fired(ctx_id, reason);
            }
        })?;
        let mut map = self.inner.reply_map.lock().unwrap();
        if let Some(record) = map.values_mut().find(|record| record.ctx_id == ctx_id) {
            record.alarm_id = Some(alarm_id);
        } else {
            // The reply raced the arm; disarm.
            drop(map);
            self.inner.reply_timer.remove_alarm(alarm_id);
        }
        Ok(())
    }

    /// Deadline expiry: synthesize an error reply and push it through the
    /// dispatcher so the handler runs on a dispatcher thread.
    fn reply_deadline_fired(&self, ctx_id: u64, reason: AlarmReason) {
        let serial = {
            let mut map = self.inner.reply_map.lock().unwrap();
            let Some(record) = map.values_mut().find(|record| record.ctx_id == ctx_id) else {
                // Completed by a real reply in the meantime.
                return;
            };
            // Clear the encrypted flag so the synthetic reply is accepted.
            record.call_flags &= !flags::ENCRYPTED;
            record.serial
        };

        let running = self.is_running();
        let error_name = if reason == AlarmReason::Exiting || !running {
            meshbus_core::status::ERROR_EXITING
        } else {
            meshbus_core::status::ERROR_TIMEOUT
        };
        debug!(serial, error_name, "method call deadline expired");
        let msg = Message::error_for_serial(&self.unique_name(), serial, error_name);

        let dispatched = running && self.push_message(msg.clone()).is_ok();
        if !dispatched {
            let msg =
                Message::error_for_serial(&self.unique_name(), serial, meshbus_core::status::ERROR_EXITING);
            let _ = self.handle_method_reply(&msg);
            self.inner.handlers_done.notify_all();
        }
    }

    /// Removes a reply context before its reply arrives. Returns whether a
    /// context existed.
    pub fn unregister_reply_handler(&self, serial: u32) -> bool {
        let record = self.inner.reply_map.lock().unwrap().remove(&serial);
        match record {
            Some(record) => {
                if let Some(alarm_id) = record.alarm_id {
                    self.inner.reply_timer.remove_alarm(alarm_id);
                }
                true
            }
            None => false,
        }
    }

    /// Suspends the deadline of an outstanding call (for auth round-trips).
    /// Returns whether a deadline was disarmed.
    pub fn pause_reply_timeout(&self, serial: u32) -> bool {
        let mut map = self.inner.reply_map.lock().unwrap();
        if let Some(record) = map.get_mut(&serial) {
            if let Some(alarm_id) = record.alarm_id.take() {
                return self.inner.reply_timer.remove_alarm(alarm_id);
            }
        }
        false
    }

    /// Re-arms a paused deadline with its original absolute deadline.
    /// Returns whether a deadline was re-armed.
    pub fn resume_reply_timeout(&self, serial: u32) -> bool {
        let (ctx_id, remaining) = {
            let map = self.inner.reply_map.lock().unwrap();
            let Some(record) = map.get(&serial) else {
                return false;
            };
            if record.alarm_id.is_some() {
                return false;
            }
            (
                record.ctx_id,
                record.deadline.saturating_duration_since(Instant::now()),
            )
        };
        self.arm_reply_alarm(ctx_id, remaining).is_ok()
    }

    /// Atomically rekeys a reply context when the wire serial is
    /// regenerated. Returns whether a context was rekeyed.
    pub fn reserialize_reply(&self, old_serial: u32, new_serial: u32) -> bool {
        let mut map = self.inner.reply_map.lock().unwrap();
        match map.remove(&old_serial) {
            Some(mut record) => {
                record.serial = new_serial;
                map.insert(new_serial, record);
                true
            }
            None => false,
        }
    }

    /// Outstanding reply contexts (diagnostics).
    #[must_use]
    pub fn outstanding_replies(&self) -> usize {
        self.inner.reply_map.lock().unwrap().len()
    }

    fn handle_method_reply(&self, msg: &Message) -> Result<(), Status> {
        let record = {
            let mut map = self.inner.reply_map.lock().unwrap();
            map.remove(&msg.reply_serial())
        };
        let Some(mut record) = record else {
            debug!(reply_serial = msg.reply_serial(), "unmatched reply serial; dropping");
            return Err(Status::UnmatchedReplySerial);
        };
        if let Some(alarm_id) = record.alarm_id.take() {
            self.inner.reply_timer.remove_alarm(alarm_id);
        }

        let mut delivered: Message = msg.clone();
        let mut substitute: Option<Status> = None;

        if record.call_flags & flags::ENCRYPTED != 0 && !msg.is_encrypted() {
            // Internally generated errors carry our own sender name and
            // pass through; anything else unencrypted is a violation.
            let internal = msg.msg_type() == MessageType::Error
                && msg.sender() == self.unique_name();
            if !internal {
                substitute = Some(Status::NotEncrypted);
            }
        } else if msg.msg_type() == MessageType::MethodReturn {
            let expected = record
                .member
                .as_ref()
                .map_or("*", |member| member.return_signature.as_str());
            if let Err(status) = unmarshal_check(msg.args(), expected) {
                substitute = Some(status);
            }
        }

        if let Some(status) = substitute {
            if status.is_security_violation() {
                self.inner.peer_obj.handle_security_violation(status, msg);
            }
            warn!(status = %status, "reply replaced with an internally generated error");
            delivered = Message::error_for_serial(
                &self.unique_name(),
                msg.reply_serial(),
                &status.error_name(),
            );
        }

        let handler = record.handler.take();
        if let Some(handler) = handler {
            self.with_active_handler(record.receiver, || handler(&delivered));
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Objects
    // ------------------------------------------------------------------

    /// Registers a bus object, creating placeholder ancestors as needed.
    ///
    /// # Errors
    ///
    /// [`Status::ObjectAlreadyExists`] when a real object already owns the
    /// path.
    pub fn register_object(&self, object: Arc<BusObject>, secure: bool) -> Result<(), Status> {
        let path = object.path().to_string();
        let mut secure = secure;
        {
            let mut objects = self.inner.objects.lock().unwrap();

            if let Some(existing) = objects.get(&path) {
                if !existing.placeholder {
                    return Err(Status::ObjectAlreadyExists);
                }
                // A real registration replaces the placeholder.
                objects.remove(&path);
            }

            // The secure bit inherits downward from real ancestors only;
            // a placeholder's own bit reflects the children that forced
            // its creation and must not leak sideways into unrelated
            // subtrees.
            let parents = parent_paths(&path);
            for parent in &parents {
                if let Some(record) = objects.get(parent) {
                    if !record.placeholder {
                        secure |= record.secure;
                    }
                }
            }
            for parent in &parents {
                match objects.get_mut(parent) {
                    Some(record) if record.placeholder => record.secure |= secure,
                    Some(_) => {}
                    None => {
                        let placeholder = Arc::new(
                            BusObject::new(parent).expect("parent of a legal path is legal"),
                        );
                        objects.insert(
                            parent.clone(),
                            ObjectRecord {
                                object: placeholder,
                                placeholder: true,
                                secure,
                                registered: false,
                            },
                        );
                    }
                }
            }

            for (iface, _) in object.interfaces() {
                for member in iface.members() {
                    if member.kind != MemberKind::Method {
                        continue;
                    }
                    if let Some(handler) = object.method_handler(iface.name(), &member.name) {
                        self.inner.method_table.add(MethodEntry {
                            path: path.clone(),
                            iface_name: iface.name().to_string(),
                            member: member.clone(),
                            policy: iface.security_policy(),
                            object_secure: secure,
                            receiver: object.receiver(),
                            handler,
                        });
                    }
                }
            }

            objects.insert(
                path,
                ObjectRecord {
                    object,
                    placeholder: false,
                    secure,
                    registered: false,
                },
            );
        }

        if self.inner.connected.load(Ordering::SeqCst) {
            self.inner.dispatcher.trigger_deferred_callbacks();
        }
        Ok(())
    }

    /// Unregisters an object and its subtree. Placeholder children are
    /// deleted; registered descendants fire `ObjectUnregistered`.
    ///
    /// # Errors
    ///
    /// [`Status::Deadlock`] when called from one of the object's own
    /// handlers.
    pub fn unregister_object(&self, path: &str) -> Result<(), Status> {
        let subtree: Vec<(String, ObjectRecord)> = {
            let mut objects = self.inner.objects.lock().unwrap();
            let prefix = if path == "/" {
                "/".to_string()
            } else {
                format!("{path}/")
            };
            let paths: Vec<String> = objects
                .keys()
                .filter(|p| *p == path || p.starts_with(&prefix))
                .cloned()
                .collect();
            paths
                .into_iter()
                .filter_map(|p| objects.remove(&p).map(|record| (p, record)))
                .collect()
        };

        let mut result = Ok(());
        for (p, record) in subtree {
            if record.placeholder {
                continue;
            }
            let receiver = record.object.receiver();
            match self.quiesce_receiver(receiver) {
                Ok(()) => {
                    self.inner.method_table.remove_path(&p);
                    if record.registered {
                        if let Some(cb) = record.object.registration_callback() {
                            cb(false);
                        }
                    }
                    self.release_receiver(receiver);
                }
                Err(status) => result = Err(status),
            }
        }
        result
    }

    /// True if a real (non-placeholder) object owns the path.
    #[must_use]
    pub fn has_object(&self, path: &str) -> bool {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(path)
            .is_some_and(|record| !record.placeholder)
    }

    /// True if any object (placeholder included) owns the path.
    #[must_use]
    pub fn has_object_or_placeholder(&self, path: &str) -> bool {
        self.inner.objects.lock().unwrap().contains_key(path)
    }

    /// True if the object at the path carries the secure bit.
    #[must_use]
    pub fn is_object_secure(&self, path: &str) -> bool {
        self.inner
            .objects
            .lock()
            .unwrap()
            .get(path)
            .is_some_and(|record| record.secure)
    }

    /// Announced-object description in the wire `a(oas)` form.
    #[must_use]
    pub fn announced_object_description(&self) -> MsgArg {
        let objects = self.inner.objects.lock().unwrap();
        let mut entries = Vec::new();
        for (path, record) in objects.iter() {
            if record.placeholder {
                continue;
            }
            let announced = record.object.announced_interface_names();
            if announced.is_empty() {
                continue;
            }
            entries.push(MsgArg::Struct(vec![
                MsgArg::ObjectPath(path.clone()),
                MsgArg::Array(
                    "s".to_string(),
                    announced.into_iter().map(MsgArg::String).collect(),
                ),
            ]));
        }
        MsgArg::Array("(oas)".to_string(), entries)
    }
}

impl DeferredWork for EndpointInner {
    fn perform_cached_property_reply_work(&self) {
        loop {
            let next = {
                let mut replies = self.cached_replies.lock().unwrap();
                replies.pop()
            };
            match next {
                Some(reply) => reply(),
                None => break,
            }
        }
    }

    fn perform_deferred_callbacks(&self) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        loop {
            let next = {
                let mut objects = self.objects.lock().unwrap();
                objects
                    .values_mut()
                    .find(|record| !record.placeholder && !record.registered)
                    .map(|record| {
                        record.registered = true;
                        record.object.registration_callback()
                    })
            };
            match next {
                Some(Some(cb)) => cb(true),
                Some(None) => {}
                None => break,
            }
        }
    }
}

/// Router-facing adapter for a local endpoint.
struct EndpointHandle {
    inner: Weak<EndpointInner>,
}

impl RouterEndpoint for EndpointHandle {
    fn unique_name(&self) -> String {
        self.inner
            .upgrade()
            .map(|inner| LocalEndpoint { inner }.unique_name())
            .unwrap_or_default()
    }

    fn push_message(&self, msg: Message) -> Result<(), Status> {
        match self.inner.upgrade() {
            Some(inner) => LocalEndpoint { inner }.push_message(msg),
            None => Err(Status::EndpointClosing),
        }
    }

    fn accept_session_joiner(&self, port: SessionPort, joiner: &str, opts: &SessionOpts) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let host = inner.session_host.read().unwrap().upgrade();
        host.is_some_and(|host| host.accept_session_joiner(port, joiner, opts))
    }

    fn session_joined(&self, port: SessionPort, id: SessionId, joiner: &str) {
        if let Some(inner) = self.inner.upgrade() {
            let host = inner.session_host.read().unwrap().upgrade();
            if let Some(host) = host {
                host.session_joined(port, id, joiner);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32 as TestCounter;
    use std::sync::mpsc;

    use super::*;
    use meshbus_core::guid::Guid128;

    /// Records every message pushed through it instead of routing.
    struct RecordingRouter {
        sent: Mutex<Vec<Message>>,
        tx: Mutex<Option<mpsc::Sender<Message>>>,
        next: TestCounter,
    }

    impl RecordingRouter {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(Vec::new()),
                tx: Mutex::new(None),
                next: TestCounter::new(1),
            })
        }
    }

    impl Router for RecordingRouter {
        fn protocol_version(&self) -> Option<u32> {
            Some(crate::names::PROTOCOL_VERSION)
        }
        fn generate_unique_name(&self) -> String {
            format!(":rec.{}", self.next.fetch_add(1, Ordering::Relaxed))
        }
        fn register_endpoint(&self, _endpoint: Arc<dyn RouterEndpoint>) {}
        fn unregister_endpoint(&self, _unique_name: &str) {}
        fn push_message(&self, msg: &Message) -> Result<(), Status> {
            self.sent.lock().unwrap().push(msg.clone());
            if let Some(tx) = self.tx.lock().unwrap().as_ref() {
                let _ = tx.send(msg.clone());
            }
            Ok(())
        }
    }

    fn started_endpoint() -> (LocalEndpoint, Arc<RecordingRouter>) {
        let endpoint = LocalEndpoint::new(Guid128::generate(), 2);
        let router = RecordingRouter::new();
        endpoint.start(router.clone() as Arc<dyn Router>);
        (endpoint, router)
    }

    #[test]
    fn test_peer_interface_ping_and_machine_id() {
        let (endpoint, router) = started_endpoint();
        let (tx, rx) = mpsc::channel();
        *router.tx.lock().unwrap() = Some(tx);

        let ping = Message::method_call(
            1,
            ":rec.77",
            &endpoint.unique_name(),
            "/ignored",
            PEER_INTERFACE,
            "Ping",
            vec![],
            0,
            0,
        );
        endpoint.push_message(ping).unwrap();
        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(reply.msg_type(), MessageType::MethodReturn);
        assert_eq!(reply.reply_serial(), 1);

        let get_id = Message::method_call(
            2,
            ":rec.77",
            &endpoint.unique_name(),
            "/ignored",
            PEER_INTERFACE,
            "GetMachineId",
            vec![],
            0,
            0,
        );
        endpoint.push_message(get_id).unwrap();
        let reply = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(
            reply.args().first().and_then(MsgArg::as_str),
            Some(endpoint.guid().to_hex().as_str())
        );

        endpoint.stop();
        endpoint.join();
    }

    #[test]
    fn test_cached_property_reply_runs_on_dispatcher() {
        let (endpoint, _router) = started_endpoint();
        let (tx, rx) = mpsc::channel();
        endpoint.schedule_cached_property_reply(Box::new(move || {
            tx.send(crate::dispatch::is_reentrant_call()).unwrap();
        }));
        // Delivered on a dispatcher thread, inside the reentrancy scope.
        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());

        endpoint.stop();
        endpoint.join();
    }

    #[test]
    fn test_push_after_stop_is_refused() {
        let (endpoint, _router) = started_endpoint();
        endpoint.stop();
        endpoint.join();
        let msg = Message::signal(1, ":rec.77", "", "/x", "a.b", "M", vec![], 0, 0);
        assert_eq!(endpoint.push_message(msg).unwrap_err(), Status::Stopping);
    }

    #[test]
    fn test_reserialize_and_outstanding_count() {
        let (endpoint, _router) = started_endpoint();
        let call = Message::method_call(
            10,
            &endpoint.unique_name(),
            ":rec.2",
            "/obj",
            "a.b",
            "M",
            vec![],
            0,
            0,
        );
        endpoint
            .register_reply_handler(1, None, &call, Duration::from_secs(30), Box::new(|_| {}))
            .unwrap();
        assert_eq!(endpoint.outstanding_replies(), 1);

        assert!(endpoint.reserialize_reply(10, 11));
        assert!(!endpoint.reserialize_reply(10, 12));
        assert!(endpoint.unregister_reply_handler(11));
        assert_eq!(endpoint.outstanding_replies(), 0);

        endpoint.stop();
        endpoint.join();
    }
}
