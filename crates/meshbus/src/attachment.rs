//! The bus attachment: an application's handle onto the bus.
//!
//! The attachment owns the local endpoint and layers the public API over
//! it: lifecycle (start → connect → stop → join), interface creation,
//! listener registration, name and discovery operations, session
//! operations (synchronous and asynchronous), and peer security.
//!
//! Control-plane operations are method calls to the well-known bus
//! controller; their reply dispositions map onto the fixed status table.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};
use std::time::Duration;

use meshbus_core::guid::Guid128;
use meshbus_core::keystore::{KeyStore, KeyStoreKey};
use meshbus_core::permission::{PermissionConfigurationListener, PermissionConfigurator};
use meshbus_core::status::Status;
use tracing::{debug, info, warn};

use crate::args::MsgArg;
use crate::auth::{AuthListener, AuthManager, AuthMechanism, LogonTable};
use crate::dispatch::DEFAULT_CONCURRENCY;
use crate::endpoint::{LocalEndpoint, ReplyHandler, SessionHost};
use crate::handlers::{next_receiver_id, ReceiverId, SignalEntry, SignalHandler};
use crate::iface::{InterfaceDescription, Member, MemberKind, SecurityPolicy};
use crate::listener::{
    AboutListener, ApplicationStateListener, BusListener, ListenerSet, Protected,
    SessionPortListener,
};
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageType};
use crate::names::{self, BUS_INTERFACE, BUS_WELL_KNOWN_NAME, DBUS_INTERFACE, DBUS_WELL_KNOWN_NAME};
use crate::object::BusObject;
use crate::peer::{PeerStateTable, SecurityViolationListener};
use crate::router::Router;
use crate::session::{
    MemberChangeReason, SessionDirectory, SessionId, SessionLostReason, SessionOpts, SessionPort,
    SessionSide, SessionSideMask,
};
use crate::{listener::SessionListener, runtime};

/// Completion callback for [`BusAttachment::join_session_async`]: the
/// session id and negotiated options, or the join status.
pub type JoinSessionCallback =
    Box<dyn FnOnce(Result<(SessionId, SessionOpts), Status>) + Send>;

struct JoinContext {
    state: Mutex<JoinState>,
    cond: Condvar,
}

#[derive(Default)]
struct JoinState {
    done: bool,
    alert_code: Option<u32>,
    result: Option<Result<(SessionId, SessionOpts), Status>>,
}

struct BusInner {
    app_name: String,
    concurrency: usize,
    started: AtomicBool,
    stopping: AtomicBool,
    connected: AtomicBool,
    connect_spec: Mutex<String>,
    endpoint: LocalEndpoint,
    interfaces: RwLock<HashMap<String, Arc<InterfaceDescription>>>,
    bus_listeners: ListenerSet<dyn BusListener>,
    about_listeners: ListenerSet<dyn AboutListener>,
    app_state_listeners: ListenerSet<dyn ApplicationStateListener>,
    session_port_listeners: Mutex<HashMap<SessionPort, Protected<dyn SessionPortListener>>>,
    sessions: SessionDirectory,
    join_contexts: Mutex<HashMap<u64, Arc<JoinContext>>>,
    next_join_ctx: AtomicU64,
    keystore: Arc<KeyStore>,
    auth_manager: AuthManager,
    logon_table: LogonTable,
    peer_state: PeerStateTable,
    configurator: PermissionConfigurator,
    pc_listener: RwLock<Option<Arc<dyn PermissionConfigurationListener>>>,
    control_receiver: ReceiverId,
    /// Debug-registry token; its liveness is the attachment's liveness.
    track_token: Arc<()>,
}

/// One application's handle onto the bus.
#[derive(Clone)]
pub struct BusAttachment {
    inner: Arc<BusInner>,
}

impl BusAttachment {
    /// Creates an attachment with the given application name and callback
    /// concurrency (default 4).
    #[must_use]
    pub fn new(app_name: &str, concurrency: usize) -> Self {
        let concurrency = if concurrency == 0 {
            DEFAULT_CONCURRENCY
        } else {
            concurrency
        };
        let guid = Guid128::generate();
        let inner = Arc::new(BusInner {
            app_name: app_name.to_string(),
            concurrency,
            started: AtomicBool::new(false),
            stopping: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            connect_spec: Mutex::new(String::new()),
            endpoint: LocalEndpoint::new(guid, concurrency),
            interfaces: RwLock::new(HashMap::new()),
            bus_listeners: ListenerSet::default(),
            about_listeners: ListenerSet::default(),
            app_state_listeners: ListenerSet::default(),
            session_port_listeners: Mutex::new(HashMap::new()),
            sessions: SessionDirectory::new(),
            join_contexts: Mutex::new(HashMap::new()),
            next_join_ctx: AtomicU64::new(1),
            keystore: Arc::new(KeyStore::new()),
            auth_manager: AuthManager::new(),
            logon_table: LogonTable::new(),
            peer_state: PeerStateTable::new(),
            configurator: PermissionConfigurator::new(),
            pc_listener: RwLock::new(None),
            control_receiver: next_receiver_id(),
            track_token: Arc::new(()),
        });
        runtime::track_attachment(&inner.track_token);
        Self { inner }
    }

    /// Application name the attachment was created with.
    #[must_use]
    pub fn app_name(&self) -> &str {
        &self.inner.app_name
    }

    /// Configured callback concurrency.
    #[must_use]
    pub fn concurrency(&self) -> usize {
        self.inner.concurrency
    }

    /// The attachment's global GUID string.
    #[must_use]
    pub fn global_guid_string(&self) -> String {
        self.inner.endpoint.guid().to_hex()
    }

    /// The short GUID form used in peer exchanges.
    #[must_use]
    pub fn global_guid_short_string(&self) -> String {
        self.inner.endpoint.guid().short()
    }

    /// The unique name, empty before connect.
    #[must_use]
    pub fn unique_name(&self) -> String {
        self.inner.endpoint.unique_name()
    }

    /// The connect spec in use, empty before connect.
    #[must_use]
    pub fn connect_spec(&self) -> String {
        self.inner.connect_spec.lock().unwrap().clone()
    }

    /// The local endpoint (for advanced integrations and tests).
    #[must_use]
    pub fn endpoint(&self) -> &LocalEndpoint {
        &self.inner.endpoint
    }

    /// The permission configurator.
    #[must_use]
    pub fn permission_configurator(&self) -> &PermissionConfigurator {
        &self.inner.configurator
    }

    /// The key store.
    #[must_use]
    pub fn key_store(&self) -> &KeyStore {
        &self.inner.keystore
    }

    // ------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------

    /// Starts the attachment. A second start fails.
    ///
    /// # Errors
    ///
    /// [`Status::AlreadyStarted`] on repeated start, [`Status::Stopping`]
    /// while stopping.
    pub fn start(&self) -> Result<(), Status> {
        if self.inner.started.load(Ordering::SeqCst) {
            warn!(app = %self.inner.app_name, "start called while started");
            return Err(Status::AlreadyStarted);
        }
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(Status::Stopping);
        }
        self.inner.started.store(true, Ordering::SeqCst);
        info!(app = %self.inner.app_name, "bus attachment started");
        Ok(())
    }

    /// True between start and the completion of join.
    #[must_use]
    pub fn is_started(&self) -> bool {
        self.inner.started.load(Ordering::SeqCst)
    }

    /// True after stop until join completes.
    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.inner.stopping.load(Ordering::SeqCst)
    }

    /// True while connected to a router.
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Connects using a connect spec, falling back to the bundled
    /// in-process router when the spec cannot be reached.
    ///
    /// # Errors
    ///
    /// Lifecycle errors, [`Status::TransportUnavailable`] when no
    /// transport matches, [`Status::IncompatibleDaemon`] when the remote
    /// daemon announces an older protocol version.
    pub fn connect(&self, requested_spec: &str) -> Result<(), Status> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Status::NotStarted);
        }
        if self.inner.stopping.load(Ordering::SeqCst) {
            warn!("cannot connect while the bus is stopping");
            return Err(Status::Stopping);
        }
        if self.inner.connected.load(Ordering::SeqCst) {
            return Err(Status::AlreadyConnected);
        }

        let (router, actual_spec) = match runtime::connect_transport(requested_spec) {
            Ok(router) => (router, requested_spec.to_string()),
            Err(primary) if requested_spec != runtime::BUNDLED_CONNECT_SPEC => {
                // Try the bundled in-process router.
                match runtime::bundled_router() {
                    Ok(bundled) => {
                        debug!(spec = requested_spec, "falling back to the bundled router");
                        (
                            bundled as Arc<dyn Router>,
                            runtime::BUNDLED_CONNECT_SPEC.to_string(),
                        )
                    }
                    Err(_) => return Err(primary),
                }
            }
            Err(primary) => return Err(primary),
        };

        self.connect_to_router(router)?;
        *self.inner.connect_spec.lock().unwrap() = actual_spec;
        Ok(())
    }

    /// Connects directly to a router instance.
    ///
    /// # Errors
    ///
    /// Same as [`BusAttachment::connect`], minus transport resolution.
    pub fn connect_to_router(&self, router: Arc<dyn Router>) -> Result<(), Status> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Err(Status::NotStarted);
        }
        if self.inner.connected.load(Ordering::SeqCst) {
            return Err(Status::AlreadyConnected);
        }

        // A remote daemon announcing a strictly lower protocol version is
        // rejected; one that announces none is a plain DBus daemon.
        if let Some(version) = router.protocol_version() {
            if version < names::PROTOCOL_VERSION {
                warn!(version, local = names::PROTOCOL_VERSION, "rejecting older daemon");
                return Err(Status::IncompatibleDaemon);
            }
        }

        self.inner.endpoint.start(router.clone());
        let weak_host: Weak<dyn SessionHost> =
            Arc::downgrade(&self.inner) as Weak<dyn SessionHost>;
        self.inner.endpoint.set_session_host(weak_host);
        router.register_endpoint(self.inner.endpoint.router_endpoint());
        self.inner.connected.store(true, Ordering::SeqCst);

        if let Err(status) = self.register_control_handlers() {
            // Connected but could not fully realize the connection.
            router.unregister_endpoint(&self.unique_name());
            self.inner.connected.store(false, Ordering::SeqCst);
            return Err(status);
        }

        // Claim-state transitions announce themselves bus-wide.
        let weak = Arc::downgrade(&self.inner);
        self.inner
            .configurator
            .set_state_callback(Box::new(move |state| {
                if let Some(inner) = weak.upgrade() {
                    BusAttachment { inner }.emit_state_signal(state);
                }
            }));

        self.inner.endpoint.on_bus_connected();
        info!(unique = %self.unique_name(), "connected");
        Ok(())
    }

    /// Broadcasts the sessionless `State` signal after a claim-state
    /// transition.
    fn emit_state_signal(&self, state: meshbus_core::permission::ApplicationState) {
        if !self.is_connected() {
            return;
        }
        let key_bytes: Vec<u8> = self
            .inner
            .configurator
            .get_signing_public_key()
            .map(|info| info.public_key.as_bytes().to_vec())
            .unwrap_or_default();
        let msg = Message::signal(
            self.inner.endpoint.next_serial(),
            &self.unique_name(),
            "",
            names::BUS_OBJECT_PATH,
            names::APPLICATION_INTERFACE,
            "State",
            vec![
                MsgArg::Array(
                    "y".to_string(),
                    key_bytes.into_iter().map(MsgArg::Byte).collect(),
                ),
                MsgArg::Uint16(state.code()),
            ],
            crate::message::flags::SESSIONLESS,
            0,
        );
        if let Err(status) = self.inner.endpoint.send_message(&msg) {
            debug!(status = %status, "state signal not sent");
        }
    }

    /// Disconnects from the router.
    ///
    /// # Errors
    ///
    /// [`Status::NotConnected`] when not connected.
    pub fn disconnect(&self) -> Result<(), Status> {
        if !self.inner.connected.load(Ordering::SeqCst) {
            return Err(Status::NotConnected);
        }
        if let Some(router) = self.inner.endpoint.router() {
            router.unregister_endpoint(&self.unique_name());
        }
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.endpoint.on_bus_disconnected();
        for listener in self.inner.bus_listeners.snapshot() {
            listener.bus_disconnected();
        }
        Ok(())
    }

    /// Stops the attachment without blocking: notifies listeners, stops
    /// transports, and alerts threads blocked in synchronous joins.
    ///
    /// # Errors
    ///
    /// Currently infallible; reserved for transport stop failures.
    pub fn stop(&self) -> Result<(), Status> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.stopping.store(true, Ordering::SeqCst);

        for listener in self.inner.bus_listeners.snapshot() {
            listener.bus_stopping();
        }

        if self.inner.connected.load(Ordering::SeqCst) {
            let _ = self.disconnect();
        }

        // Wake threads parked in synchronous JoinSession; they observe the
        // alert and return Stopping.
        {
            let contexts = self.inner.join_contexts.lock().unwrap();
            for context in contexts.values() {
                let mut state = context.state.lock().unwrap();
                state.alert_code = Some(1);
                context.cond.notify_all();
            }
        }

        self.inner.endpoint.stop();
        Ok(())
    }

    /// Blocks until the attachment has fully stopped, then returns it to
    /// the initial state.
    ///
    /// # Errors
    ///
    /// Currently infallible.
    pub fn join(&self) -> Result<(), Status> {
        if !self.inner.started.load(Ordering::SeqCst) {
            return Ok(());
        }

        // Wait for threads stuck in JoinSession to drain.
        loop {
            let empty = self.inner.join_contexts.lock().unwrap().is_empty();
            if empty {
                break;
            }
            std::thread::sleep(Duration::from_millis(2));
        }

        self.inner.endpoint.join();
        self.inner.peer_state.clear();
        self.inner.sessions.clear();
        self.inner.started.store(false, Ordering::SeqCst);
        self.inner.stopping.store(false, Ordering::SeqCst);
        info!(app = %self.inner.app_name, "bus attachment joined");
        Ok(())
    }

    /// Releases the dispatcher reentrancy lock for the remainder of the
    /// current callback, permitting blocking calls from inside it.
    pub fn enable_concurrent_callbacks(&self) {
        self.inner.endpoint.enable_reentrancy();
    }

    // ------------------------------------------------------------------
    // Interfaces
    // ------------------------------------------------------------------

    /// Creates a new, mutable interface description.
    ///
    /// # Errors
    ///
    /// [`Status::BadArg`]\(1\) on an illegal name;
    /// [`Status::InterfaceAlreadyExists`] if the name is registered.
    pub fn create_interface(
        &self,
        name: &str,
        security: SecurityPolicy,
    ) -> Result<InterfaceDescription, Status> {
        if self.inner.interfaces.read().unwrap().contains_key(name) {
            return Err(Status::InterfaceAlreadyExists);
        }
        InterfaceDescription::new(name, security)
    }

    /// Registers a built interface. Activate it first; registering a
    /// duplicate of an activated interface fails.
    ///
    /// # Errors
    ///
    /// [`Status::InterfaceAlreadyExists`] on duplicates.
    pub fn register_interface(
        &self,
        iface: InterfaceDescription,
    ) -> Result<Arc<InterfaceDescription>, Status> {
        let mut interfaces = self.inner.interfaces.write().unwrap();
        if let Some(existing) = interfaces.get(iface.name()) {
            if existing.is_activated() {
                return Err(Status::InterfaceAlreadyExists);
            }
        }
        let iface = Arc::new(iface);
        interfaces.insert(iface.name().to_string(), iface.clone());
        Ok(iface)
    }

    /// Looks up a registered interface.
    #[must_use]
    pub fn get_interface(&self, name: &str) -> Option<Arc<InterfaceDescription>> {
        self.inner.interfaces.read().unwrap().get(name).cloned()
    }

    /// Deletes a registered interface. Activated interfaces cannot be
    /// deleted.
    ///
    /// # Errors
    ///
    /// [`Status::NoSuchInterface`] when absent,
    /// [`Status::InterfaceAlreadyExists`] when activated.
    pub fn delete_interface(&self, name: &str) -> Result<(), Status> {
        let mut interfaces = self.inner.interfaces.write().unwrap();
        match interfaces.get(name) {
            None => Err(Status::NoSuchInterface),
            Some(iface) if iface.is_activated() => Err(Status::InterfaceAlreadyExists),
            Some(_) => {
                interfaces.remove(name);
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Objects and signal handlers
    // ------------------------------------------------------------------

    /// Registers a bus object, optionally marking it (and its subtree)
    /// secure.
    ///
    /// # Errors
    ///
    /// [`Status::ObjectAlreadyExists`] when the path is taken.
    pub fn register_bus_object(&self, object: Arc<BusObject>, secure: bool) -> Result<(), Status> {
        self.inner.endpoint.register_object(object, secure)
    }

    /// Unregisters a bus object and its subtree, blocking until handlers
    /// drain.
    ///
    /// # Errors
    ///
    /// [`Status::Deadlock`] from inside one of the object's handlers.
    pub fn unregister_bus_object(&self, path: &str) -> Result<(), Status> {
        self.inner.endpoint.unregister_object(path)
    }

    /// Registers a signal handler for a member of a registered interface,
    /// constrained to `type='signal',interface=I,member=M`.
    ///
    /// # Errors
    ///
    /// [`Status::NoSuchInterface`] / [`Status::NoSuchMember`] when the
    /// member is not declared.
    pub fn register_signal_handler(
        &self,
        receiver: ReceiverId,
        handler: SignalHandler,
        iface_name: &str,
        member_name: &str,
    ) -> Result<(), Status> {
        let rule = format!("type='signal',interface='{iface_name}',member='{member_name}'");
        self.register_signal_handler_with_rule(receiver, handler, iface_name, member_name, &rule)
    }

    /// Registers a signal handler with an explicit match rule.
    ///
    /// # Errors
    ///
    /// As [`BusAttachment::register_signal_handler`], plus
    /// [`Status::BadArg`]\(4\) for a malformed rule.
    pub fn register_signal_handler_with_rule(
        &self,
        receiver: ReceiverId,
        handler: SignalHandler,
        iface_name: &str,
        member_name: &str,
        rule: &str,
    ) -> Result<(), Status> {
        let iface = self
            .get_interface(iface_name)
            .ok_or(Status::NoSuchInterface)?;
        let member = iface.member(member_name).ok_or(Status::NoSuchMember)?;
        if member.kind != MemberKind::Signal {
            return Err(Status::NoSuchMember);
        }
        let rule = MatchRule::parse(rule).map_err(|_| Status::BadArg(4))?;
        self.inner.endpoint.register_signal_handler(
            iface_name,
            SignalEntry {
                receiver,
                handler,
                member: member.clone(),
                policy: iface.security_policy(),
                rule,
            },
        );
        Ok(())
    }

    /// Unregisters a signal handler registration.
    ///
    /// # Errors
    ///
    /// [`Status::Deadlock`] from the receiver's own handler,
    /// [`Status::Fail`] when no registration matches.
    pub fn unregister_signal_handler(
        &self,
        receiver: ReceiverId,
        iface_name: &str,
        member_name: &str,
    ) -> Result<(), Status> {
        self.inner
            .endpoint
            .unregister_signal_handler(receiver, iface_name, member_name, None)
    }

    /// Unregisters every handler belonging to a receiver.
    ///
    /// # Errors
    ///
    /// [`Status::Deadlock`] from the receiver's own handler.
    pub fn unregister_all_handlers(&self, receiver: ReceiverId) -> Result<(), Status> {
        self.inner.endpoint.unregister_all_handlers(receiver)
    }

    /// Emits a signal from an object path. An empty destination with a
    /// session id sessioncasts; an empty destination without one
    /// broadcasts to matching rules.
    ///
    /// # Errors
    ///
    /// [`Status::NotConnected`] before connect; lookup errors for
    /// undeclared members.
    #[allow(clippy::too_many_arguments)]
    pub fn emit_signal(
        &self,
        destination: &str,
        path: &str,
        iface_name: &str,
        member_name: &str,
        args: Vec<MsgArg>,
        session_id: SessionId,
        msg_flags: u8,
    ) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let iface = self
            .get_interface(iface_name)
            .ok_or(Status::NoSuchInterface)?;
        let member = iface.member(member_name).ok_or(Status::NoSuchMember)?;
        if member.kind != MemberKind::Signal {
            return Err(Status::NoSuchMember);
        }
        crate::args::unmarshal_check(&args, &member.signature)?;
        let msg = Message::signal(
            self.inner.endpoint.next_serial(),
            &self.unique_name(),
            destination,
            path,
            iface_name,
            member_name,
            args,
            msg_flags,
            session_id,
        );
        self.inner.endpoint.send_message(&msg)
    }

    // ------------------------------------------------------------------
    // Method calls
    // ------------------------------------------------------------------

    /// Issues an asynchronous method call; the handler receives the reply,
    /// a synthesized `Bus.Timeout` error, or `Bus.Exiting` during
    /// shutdown — exactly one of them.
    ///
    /// # Errors
    ///
    /// [`Status::NotConnected`] before connect, [`Status::Stopping`] when
    /// refusing new work.
    #[allow(clippy::too_many_arguments)]
    pub fn method_call_async(
        &self,
        destination: &str,
        path: &str,
        iface_name: &str,
        member_name: &str,
        args: Vec<MsgArg>,
        timeout: Duration,
        receiver: ReceiverId,
        handler: ReplyHandler,
    ) -> Result<u32, Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let member = self
            .get_interface(iface_name)
            .and_then(|iface| iface.member(member_name).cloned());
        let msg = Message::method_call(
            self.inner.endpoint.next_serial(),
            &self.unique_name(),
            destination,
            path,
            iface_name,
            member_name,
            args,
            0,
            0,
        );
        self.inner
            .endpoint
            .register_reply_handler(receiver, member, &msg, timeout, handler)?;
        let serial = msg.serial();
        if let Err(status) = self.inner.endpoint.send_message(&msg) {
            self.inner.endpoint.unregister_reply_handler(serial);
            return Err(status);
        }
        Ok(serial)
    }

    /// Issues a synchronous method call and waits for the reply message.
    ///
    /// # Errors
    ///
    /// [`Status::BlockingCallNotAllowed`] from inside a dispatcher
    /// callback that has not enabled concurrent callbacks; connection and
    /// dispatch errors otherwise. The reply itself may be an error
    /// message; the caller inspects it.
    pub fn method_call(
        &self,
        destination: &str,
        path: &str,
        iface_name: &str,
        member_name: &str,
        args: Vec<MsgArg>,
        timeout: Duration,
    ) -> Result<Message, Status> {
        if self.inner.endpoint.is_reentrant_call() {
            return Err(Status::BlockingCallNotAllowed);
        }
        let (tx, rx) = std::sync::mpsc::sync_channel::<Message>(1);
        let receiver = next_receiver_id();
        self.method_call_async(
            destination,
            path,
            iface_name,
            member_name,
            args,
            timeout,
            receiver,
            Box::new(move |reply| {
                let _ = tx.send(reply.clone());
            }),
        )?;
        // The reply registry guarantees exactly one resolution per call.
        rx.recv().map_err(|_| Status::Fail)
    }

    /// Synchronous call to the bus controller, returning the reply or the
    /// status an error reply maps to.
    fn controller_call(
        &self,
        controller: &str,
        iface: &str,
        member: &str,
        args: Vec<MsgArg>,
        timeout: Duration,
    ) -> Result<Message, Status> {
        let path = if controller == DBUS_WELL_KNOWN_NAME {
            names::DBUS_OBJECT_PATH
        } else {
            names::BUS_OBJECT_PATH
        };
        let reply = self.method_call(controller, path, iface, member, args, timeout)?;
        match reply.msg_type() {
            MessageType::Error => {
                let status = reply.status().unwrap_or(Status::ReplyIsError);
                debug!(member, error = reply.error_name(), "controller returned an error");
                Err(status)
            }
            _ => Ok(reply),
        }
    }

    fn disposition_of(reply: &Message) -> Result<u32, Status> {
        reply
            .args()
            .first()
            .and_then(MsgArg::as_u32)
            .ok_or(Status::InvalidData)
    }

    // ------------------------------------------------------------------
    // Names and matches
    // ------------------------------------------------------------------

    /// Requests ownership of a well-known name.
    ///
    /// # Errors
    ///
    /// [`Status::NameInQueue`], [`Status::NameExists`],
    /// [`Status::NameAlreadyOwner`] per the disposition; argument and
    /// connection errors otherwise.
    pub fn request_name(&self, name: &str, request_flags: u32) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        if !names::is_legal_bus_name(name) || name.starts_with(':') {
            return Err(Status::BadBusName);
        }
        let reply = self.controller_call(
            DBUS_WELL_KNOWN_NAME,
            DBUS_INTERFACE,
            "RequestName",
            vec![
                MsgArg::String(name.to_string()),
                MsgArg::Uint32(request_flags),
            ],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::REQUEST_NAME_REPLY_PRIMARY_OWNER => Ok(()),
            names::REQUEST_NAME_REPLY_IN_QUEUE => Err(Status::NameInQueue),
            names::REQUEST_NAME_REPLY_EXISTS => Err(Status::NameExists),
            names::REQUEST_NAME_REPLY_ALREADY_OWNER => Err(Status::NameAlreadyOwner),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Releases a well-known name.
    ///
    /// # Errors
    ///
    /// [`Status::NameNotFound`] / [`Status::NameNotOwner`] per the
    /// disposition.
    pub fn release_name(&self, name: &str) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            DBUS_WELL_KNOWN_NAME,
            DBUS_INTERFACE,
            "ReleaseName",
            vec![MsgArg::String(name.to_string())],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::RELEASE_NAME_REPLY_RELEASED => Ok(()),
            names::RELEASE_NAME_REPLY_NON_EXISTENT => Err(Status::NameNotFound),
            names::RELEASE_NAME_REPLY_NOT_OWNER => Err(Status::NameNotOwner),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Whether a name currently has an owner.
    ///
    /// # Errors
    ///
    /// Connection and reply errors.
    pub fn name_has_owner(&self, name: &str) -> Result<bool, Status> {
        let reply = self.controller_call(
            DBUS_WELL_KNOWN_NAME,
            DBUS_INTERFACE,
            "NameHasOwner",
            vec![MsgArg::String(name.to_string())],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        reply
            .args()
            .first()
            .and_then(MsgArg::as_bool)
            .ok_or(Status::InvalidData)
    }

    /// The unique name owning `name`.
    ///
    /// # Errors
    ///
    /// [`Status::ReplyIsError`] when the name has no owner.
    pub fn get_name_owner(&self, name: &str) -> Result<String, Status> {
        let reply = self.controller_call(
            DBUS_WELL_KNOWN_NAME,
            DBUS_INTERFACE,
            "GetNameOwner",
            vec![MsgArg::String(name.to_string())],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        reply
            .args()
            .first()
            .and_then(MsgArg::as_str)
            .map(str::to_string)
            .ok_or(Status::InvalidData)
    }

    /// Adds a match rule at the router.
    ///
    /// # Errors
    ///
    /// Connection and reply errors.
    pub fn add_match(&self, rule: &str) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        self.controller_call(
            DBUS_WELL_KNOWN_NAME,
            DBUS_INTERFACE,
            "AddMatch",
            vec![MsgArg::String(rule.to_string())],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )
        .map(|_| ())
    }

    /// Removes a match rule at the router.
    ///
    /// # Errors
    ///
    /// Connection and reply errors.
    pub fn remove_match(&self, rule: &str) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        self.controller_call(
            DBUS_WELL_KNOWN_NAME,
            DBUS_INTERFACE,
            "RemoveMatch",
            vec![MsgArg::String(rule.to_string())],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )
        .map(|_| ())
    }

    /// Pings a bus name through the router.
    ///
    /// # Errors
    ///
    /// [`Status::Timeout`], [`Status::NameNotFound`], or [`Status::Fail`]
    /// per the disposition.
    pub fn ping(&self, name: &str, timeout: Duration) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        if !names::is_legal_bus_name(name) {
            return Err(Status::BadBusName);
        }
        #[allow(clippy::cast_possible_truncation)]
        let timeout_ms = timeout.as_millis() as u32;
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "Ping",
            vec![MsgArg::String(name.to_string()), MsgArg::Uint32(timeout_ms)],
            timeout + Duration::from_millis(1000),
        )?;
        match Self::disposition_of(&reply)? {
            names::PING_REPLY_SUCCESS => Ok(()),
            names::PING_REPLY_TIMEOUT => Err(Status::Timeout),
            names::PING_REPLY_UNKNOWN_NAME => Err(Status::NameNotFound),
            names::PING_REPLY_FAILED => Err(Status::Fail),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    // ------------------------------------------------------------------
    // Discovery
    // ------------------------------------------------------------------

    /// Begins discovery of names with the given prefix on any transport.
    ///
    /// # Errors
    ///
    /// [`Status::AlreadyDiscovering`] on a duplicate prefix.
    pub fn find_advertised_name(&self, prefix: &str) -> Result<(), Status> {
        self.find_advertised_name_by_transport(prefix, crate::session::TRANSPORT_ANY)
    }

    /// Begins discovery constrained to a transport mask.
    ///
    /// # Errors
    ///
    /// [`Status::AlreadyDiscovering`] on a duplicate prefix.
    pub fn find_advertised_name_by_transport(
        &self,
        prefix: &str,
        transports: u16,
    ) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "FindAdvertisedNameByTransport",
            vec![MsgArg::String(prefix.to_string()), MsgArg::Uint16(transports)],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::FIND_NAME_REPLY_SUCCESS => Ok(()),
            names::FIND_NAME_REPLY_ALREADY_DISCOVERING => Err(Status::AlreadyDiscovering),
            names::FIND_NAME_REPLY_FAILED => Err(Status::Fail),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Cancels discovery of a prefix.
    ///
    /// # Errors
    ///
    /// [`Status::Fail`] when the prefix was not being discovered.
    pub fn cancel_find_advertised_name(&self, prefix: &str) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "CancelFindAdvertisedName",
            vec![MsgArg::String(prefix.to_string())],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::CANCEL_FIND_NAME_REPLY_SUCCESS => Ok(()),
            names::CANCEL_FIND_NAME_REPLY_FAILED => Err(Status::Fail),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Advertises a name over the masked transports.
    ///
    /// # Errors
    ///
    /// [`Status::AlreadyDiscovering`]-adjacent dispositions map to
    /// [`Status::Fail`] / [`Status::TransportUnavailable`].
    pub fn advertise_name(&self, name: &str, transports: u16) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "AdvertiseName",
            vec![MsgArg::String(name.to_string()), MsgArg::Uint16(transports)],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::ADVERTISE_REPLY_SUCCESS => Ok(()),
            names::ADVERTISE_REPLY_ALREADY_ADVERTISING => Err(Status::Fail),
            names::ADVERTISE_REPLY_TRANSPORT_NOT_AVAILABLE => Err(Status::TransportUnavailable),
            names::ADVERTISE_REPLY_FAILED => Err(Status::Fail),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Cancels an advertisement.
    ///
    /// # Errors
    ///
    /// [`Status::Fail`] when the name was not being advertised.
    pub fn cancel_advertise_name(&self, name: &str, transports: u16) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "CancelAdvertiseName",
            vec![MsgArg::String(name.to_string()), MsgArg::Uint16(transports)],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::CANCEL_ADVERTISE_REPLY_SUCCESS => Ok(()),
            names::CANCEL_ADVERTISE_REPLY_FAILED => Err(Status::Fail),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Adds an announcement match for implementations of the given
    /// interfaces.
    ///
    /// # Errors
    ///
    /// Connection and reply errors.
    pub fn who_implements(&self, interfaces: &[&str]) -> Result<(), Status> {
        self.add_match(&Self::implements_rule(interfaces))
    }

    /// Removes an announcement match added by
    /// [`BusAttachment::who_implements`].
    ///
    /// # Errors
    ///
    /// Connection and reply errors.
    pub fn cancel_who_implements(&self, interfaces: &[&str]) -> Result<(), Status> {
        self.remove_match(&Self::implements_rule(interfaces))
    }

    fn implements_rule(interfaces: &[&str]) -> String {
        let mut sorted: Vec<&str> = interfaces.to_vec();
        sorted.sort_unstable();
        sorted.dedup();
        let mut rule = names::ANNOUNCE_MATCH_RULE.to_string();
        for iface in sorted {
            rule.push_str(",implements='");
            rule.push_str(iface);
            rule.push('\'');
        }
        rule
    }

    // ------------------------------------------------------------------
    // Sessions
    // ------------------------------------------------------------------

    /// Binds a session port with a listener for inbound joiners. Returns
    /// the bound port (useful with [`crate::session::SESSION_PORT_ANY`]).
    ///
    /// # Errors
    ///
    /// [`Status::ObjectAlreadyExists`] when already bound;
    /// [`Status::InvalidData`] for rejected options.
    pub fn bind_session_port(
        &self,
        port: SessionPort,
        opts: &SessionOpts,
        listener: Arc<dyn SessionPortListener>,
    ) -> Result<SessionPort, Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "BindSessionPort",
            vec![MsgArg::Uint16(port), opts.to_msgarg()],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        let disposition = Self::disposition_of(&reply)?;
        let bound_port = reply
            .args()
            .get(1)
            .and_then(MsgArg::as_u16)
            .ok_or(Status::InvalidData)?;
        match disposition {
            names::BIND_REPLY_SUCCESS => {
                self.inner
                    .session_port_listeners
                    .lock()
                    .unwrap()
                    .insert(bound_port, Protected::new(listener));
                Ok(bound_port)
            }
            names::BIND_REPLY_ALREADY_EXISTS => Err(Status::ObjectAlreadyExists),
            names::BIND_REPLY_INVALID_OPTS => Err(Status::InvalidData),
            names::BIND_REPLY_FAILED => Err(Status::Fail),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Unbinds a session port, draining its listener.
    ///
    /// # Errors
    ///
    /// [`Status::BadArg`]\(1\) when the port was not bound by this
    /// attachment.
    pub fn unbind_session_port(&self, port: SessionPort) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "UnbindSessionPort",
            vec![MsgArg::Uint16(port)],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::UNBIND_REPLY_SUCCESS => {
                let removed = self
                    .inner
                    .session_port_listeners
                    .lock()
                    .unwrap()
                    .remove(&port);
                if let Some(listener) = removed {
                    // Our clone is the only bookkeeping reference left.
                    listener.wait_quiescent(1);
                }
                Ok(())
            }
            names::UNBIND_REPLY_BAD_PORT => Err(Status::BadArg(1)),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Joins a session asynchronously. The callback receives the status,
    /// session id, and negotiated options.
    ///
    /// # Errors
    ///
    /// [`Status::NotConnected`] / [`Status::BadBusName`] before sending.
    pub fn join_session_async(
        &self,
        session_host: &str,
        port: SessionPort,
        listener: Option<Arc<dyn SessionListener>>,
        opts: &SessionOpts,
        callback: JoinSessionCallback,
    ) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        if !names::is_legal_bus_name(session_host) {
            return Err(Status::BadBusName);
        }
        let inner = Arc::downgrade(&self.inner);
        let host_name = session_host.to_string();
        let receiver = self.inner.control_receiver;
        self.method_call_async(
            BUS_WELL_KNOWN_NAME,
            names::BUS_OBJECT_PATH,
            BUS_INTERFACE,
            "JoinSession",
            vec![
                MsgArg::String(session_host.to_string()),
                MsgArg::Uint16(port),
                opts.to_msgarg(),
            ],
            Duration::from_millis(names::JOIN_SESSION_TIMEOUT_MS),
            receiver,
            Box::new(move |reply| {
                let result = parse_join_reply(reply);
                if reply.msg_type() == MessageType::Error {
                    debug!(error = reply.error_name(), "JoinSession returned an error message");
                }
                if let (Some(inner), Ok((id, negotiated))) = (inner.upgrade(), &result) {
                    inner.sessions.insert(
                        SessionSide::Joiner,
                        *id,
                        negotiated.multipoint,
                        listener,
                        [host_name.clone()],
                    );
                }
                callback(result);
            }),
        )
        .map(|_| ())
    }

    /// Joins a session synchronously, parking the calling thread until the
    /// asynchronous completion (or an attachment stop) wakes it.
    ///
    /// # Errors
    ///
    /// [`Status::BlockingCallNotAllowed`] from a dispatcher callback
    /// without `enable_concurrent_callbacks`; [`Status::Stopping`] when
    /// stop alerted the waiter; join dispositions otherwise.
    pub fn join_session(
        &self,
        session_host: &str,
        port: SessionPort,
        listener: Option<Arc<dyn SessionListener>>,
        opts: &SessionOpts,
    ) -> Result<(SessionId, SessionOpts), Status> {
        if self.inner.endpoint.is_reentrant_call() {
            return Err(Status::BlockingCallNotAllowed);
        }
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        if !names::is_legal_bus_name(session_host) {
            return Err(Status::BadBusName);
        }
        if self.inner.stopping.load(Ordering::SeqCst) {
            return Err(Status::Stopping);
        }

        let ctx_id = self.inner.next_join_ctx.fetch_add(1, Ordering::Relaxed);
        let context = Arc::new(JoinContext {
            state: Mutex::new(JoinState::default()),
            cond: Condvar::new(),
        });
        self.inner
            .join_contexts
            .lock()
            .unwrap()
            .insert(ctx_id, context.clone());

        let completion = context.clone();
        let result = self.join_session_async(
            session_host,
            port,
            listener,
            opts,
            Box::new(move |result| {
                let mut state = completion.state.lock().unwrap();
                state.result = Some(result);
                state.done = true;
                completion.cond.notify_all();
            }),
        );

        let outcome = match result {
            Err(status) => Err(status),
            Ok(()) => {
                let mut state = context.state.lock().unwrap();
                while !state.done && state.alert_code.is_none() {
                    state = context.cond.wait(state).unwrap();
                }
                if let Some(code) = state.alert_code {
                    debug!(code, "synchronous join alerted by stop");
                    Err(Status::Stopping)
                } else {
                    state.result.take().unwrap_or(Err(Status::Fail))
                }
            }
        };

        self.inner.join_contexts.lock().unwrap().remove(&ctx_id);
        outcome
    }

    fn leave_session_inner(
        &self,
        id: SessionId,
        method: &str,
        mask: SessionSideMask,
    ) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        // Local bookkeeping first so no further callbacks land on the
        // listener after this returns.
        for side in [SessionSide::Host, SessionSide::Joiner] {
            if mask.includes(side) {
                self.inner.sessions.remove(side, id);
            }
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            method,
            vec![MsgArg::Uint32(id)],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::LEAVE_REPLY_SUCCESS => Ok(()),
            names::LEAVE_REPLY_NO_SESSION => Err(Status::LeaveNoSession),
            names::LEAVE_REPLY_FAILED => Err(Status::LeaveFailed),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Leaves a session on whichever sides this attachment participates.
    ///
    /// # Errors
    ///
    /// [`Status::LeaveNoSession`] when not a participant.
    pub fn leave_session(&self, id: SessionId) -> Result<(), Status> {
        self.leave_session_inner(id, "LeaveSession", SessionSideMask::BOTH)
    }

    /// Leaves the hosted side of a session.
    ///
    /// # Errors
    ///
    /// [`Status::LeaveNoSession`] when not hosting the session.
    pub fn leave_hosted_session(&self, id: SessionId) -> Result<(), Status> {
        self.leave_session_inner(id, "LeaveHostedSession", SessionSideMask::HOST)
    }

    /// Leaves the joined side of a session.
    ///
    /// # Errors
    ///
    /// [`Status::LeaveNoSession`] when not joined to the session.
    pub fn leave_joined_session(&self, id: SessionId) -> Result<(), Status> {
        self.leave_session_inner(id, "LeaveJoinedSession", SessionSideMask::JOINER)
    }

    /// Removes a member from a hosted multipoint session.
    ///
    /// # Errors
    ///
    /// [`Status::RemoveMemberNotBinder`] /
    /// [`Status::RemoveMemberNotMultipoint`] /
    /// [`Status::RemoveMemberNotFound`] per the disposition.
    pub fn remove_session_member(&self, id: SessionId, member: &str) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "RemoveSessionMember",
            vec![MsgArg::Uint32(id), MsgArg::String(member.to_string())],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::REMOVE_MEMBER_REPLY_SUCCESS => Ok(()),
            names::REMOVE_MEMBER_REPLY_NO_SESSION => Err(Status::LeaveNoSession),
            names::REMOVE_MEMBER_REPLY_NOT_BINDER => Err(Status::RemoveMemberNotBinder),
            names::REMOVE_MEMBER_REPLY_NOT_MULTIPOINT => Err(Status::RemoveMemberNotMultipoint),
            names::REMOVE_MEMBER_REPLY_NOT_FOUND => Err(Status::RemoveMemberNotFound),
            names::REMOVE_MEMBER_REPLY_FAILED => Err(Status::RemoveMemberFailed),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Requests the session's socket handle (raw-traffic sessions only).
    ///
    /// # Errors
    ///
    /// [`Status::Fail`] from routers without raw-traffic support.
    pub fn get_session_fd(&self, id: SessionId) -> Result<u64, Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "GetSessionFd",
            vec![MsgArg::Uint32(id)],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match reply.args().first() {
            Some(MsgArg::Handle(fd)) => Ok(*fd),
            _ => Err(Status::InvalidData),
        }
    }

    /// Negotiates an idle-link timeout for a session. Returns the granted
    /// timeout.
    ///
    /// # Errors
    ///
    /// [`Status::LeaveNoSession`] for unknown sessions; [`Status::Fail`]
    /// when the destination cannot honor timeouts.
    pub fn set_link_timeout(&self, id: SessionId, timeout_secs: u32) -> Result<u32, Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            "SetLinkTimeout",
            vec![MsgArg::Uint32(id), MsgArg::Uint32(timeout_secs)],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        let granted = reply
            .args()
            .get(1)
            .and_then(MsgArg::as_u32)
            .unwrap_or(timeout_secs);
        match Self::disposition_of(&reply)? {
            names::SET_LINK_TIMEOUT_REPLY_SUCCESS => Ok(granted),
            names::SET_LINK_TIMEOUT_REPLY_NO_DEST_SUPPORT => Err(Status::Fail),
            names::SET_LINK_TIMEOUT_REPLY_NO_SESSION => Err(Status::LeaveNoSession),
            names::SET_LINK_TIMEOUT_REPLY_FAILED => Err(Status::Fail),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    /// Sets the session listener on both sides; ambiguous (and rejected)
    /// for self-joined ids.
    ///
    /// # Errors
    ///
    /// [`Status::Fail`] for the ambiguity, [`Status::LeaveNoSession`] when
    /// no side holds the session.
    pub fn set_session_listener(
        &self,
        id: SessionId,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Result<(), Status> {
        self.inner
            .sessions
            .set_listener(id, SessionSideMask::BOTH, listener)
    }

    /// Sets the hosted-side session listener.
    ///
    /// # Errors
    ///
    /// [`Status::LeaveNoSession`] when not hosting the session.
    pub fn set_hosted_session_listener(
        &self,
        id: SessionId,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Result<(), Status> {
        self.inner
            .sessions
            .set_listener(id, SessionSideMask::HOST, listener)
    }

    /// Sets the joined-side session listener.
    ///
    /// # Errors
    ///
    /// [`Status::LeaveNoSession`] when not joined to the session.
    pub fn set_joined_session_listener(
        &self,
        id: SessionId,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Result<(), Status> {
        self.inner
            .sessions
            .set_listener(id, SessionSideMask::JOINER, listener)
    }

    /// The session directory (inspection and tests).
    #[must_use]
    pub fn sessions(&self) -> &SessionDirectory {
        &self.inner.sessions
    }

    // ------------------------------------------------------------------
    // Listeners
    // ------------------------------------------------------------------

    /// Registers a bus listener.
    pub fn register_bus_listener(&self, listener: Arc<dyn BusListener>) {
        self.inner.bus_listeners.register(listener.clone());
        listener.listener_registered();
    }

    /// Unregisters a bus listener; no callback on it runs after this
    /// returns.
    pub fn unregister_bus_listener(&self, listener: &Arc<dyn BusListener>) {
        if self.inner.bus_listeners.unregister(listener) {
            listener.listener_unregistered();
        }
    }

    /// Registers an about listener.
    pub fn register_about_listener(&self, listener: Arc<dyn AboutListener>) {
        self.inner.about_listeners.register(listener);
    }

    /// Unregisters an about listener with quiescence.
    pub fn unregister_about_listener(&self, listener: &Arc<dyn AboutListener>) {
        self.inner.about_listeners.unregister(listener);
    }

    /// Unregisters every about listener.
    pub fn unregister_all_about_listeners(&self) {
        self.inner.about_listeners.clear();
    }

    /// Registers an application-state listener, adding the standing State
    /// match rule.
    ///
    /// # Errors
    ///
    /// Propagates the `AddMatch` failure.
    pub fn register_application_state_listener(
        &self,
        listener: Arc<dyn ApplicationStateListener>,
    ) -> Result<(), Status> {
        self.inner.app_state_listeners.register(listener);
        self.add_match(names::STATE_MATCH_RULE)
    }

    /// Unregisters an application-state listener and its match rule.
    ///
    /// # Errors
    ///
    /// [`Status::ApplicationStateListenerMissing`] when not registered.
    pub fn unregister_application_state_listener(
        &self,
        listener: &Arc<dyn ApplicationStateListener>,
    ) -> Result<(), Status> {
        if !self.inner.app_state_listeners.unregister(listener) {
            return Err(Status::ApplicationStateListenerMissing);
        }
        self.remove_match(names::STATE_MATCH_RULE)
    }

    // ------------------------------------------------------------------
    // Peer security
    // ------------------------------------------------------------------

    /// Enables (or, with an empty mechanism list, disables) peer
    /// security.
    ///
    /// A non-empty list initializes the key store, registers the
    /// mechanism factories, validates the names, and clears peer state so
    /// new sessions renegotiate.
    ///
    /// # Errors
    ///
    /// [`Status::InvalidAuthMechanism`] for unknown names; key-store
    /// failures pass through.
    pub fn enable_peer_security(
        &self,
        mechanisms: &str,
        auth_listener: Option<Arc<dyn AuthListener>>,
        keystore_path: Option<&Path>,
        pc_listener: Option<Arc<dyn PermissionConfigurationListener>>,
    ) -> Result<(), Status> {
        *self.inner.pc_listener.write().unwrap() = pc_listener;

        if mechanisms.trim().is_empty() {
            // Disabling security clears the negotiated keys.
            self.inner.keystore.reset().map_err(Status::from)?;
            self.inner.peer_state.clear();
            self.inner
                .endpoint
                .peer_obj()
                .setup_peer_authentication(vec![], None);
            info!("peer security disabled");
            return Ok(());
        }

        if let Some(path) = keystore_path {
            match self.inner.keystore.init(path) {
                Ok(()) => {}
                Err(meshbus_core::keystore::KeyStoreError::AlreadyInitialized) => {}
                Err(err) => return Err(err.into()),
            }
        }

        for mechanism in [
            AuthMechanism::Anonymous,
            AuthMechanism::External,
            AuthMechanism::Srp,
            AuthMechanism::Logon,
            AuthMechanism::EcdheNull,
            AuthMechanism::EcdhePsk,
            AuthMechanism::EcdheSpeke,
            AuthMechanism::EcdheEcdsa,
        ] {
            self.inner.auth_manager.register_mechanism(mechanism);
        }
        let parsed = self.inner.auth_manager.check_names(mechanisms)?;

        // Force renegotiation with every peer.
        self.inner.peer_state.clear();
        self.inner
            .endpoint
            .peer_obj()
            .setup_peer_authentication(parsed, auth_listener);
        info!(mechanisms, "peer security enabled");
        Ok(())
    }

    /// True while peer security is configured.
    #[must_use]
    pub fn is_peer_security_enabled(&self) -> bool {
        self.inner.endpoint.peer_obj().authentication_enabled()
    }

    /// Registers the observer for reported security violations.
    pub fn set_security_violation_listener(
        &self,
        listener: Option<Arc<dyn SecurityViolationListener>>,
    ) {
        self.inner
            .endpoint
            .peer_obj()
            .set_security_violation_listener(listener);
    }

    /// Adds a logon entry for the SRP-logon mechanism.
    ///
    /// # Errors
    ///
    /// [`Status::BadArg`] on empty arguments,
    /// [`Status::InvalidAuthMechanism`] for other mechanisms.
    pub fn add_logon_entry(
        &self,
        mechanism: &str,
        user_name: &str,
        password: &str,
    ) -> Result<(), Status> {
        if mechanism.is_empty() {
            return Err(Status::BadArg(2));
        }
        if user_name.is_empty() {
            return Err(Status::BadArg(3));
        }
        if mechanism != AuthMechanism::Logon.name() {
            return Err(Status::InvalidAuthMechanism);
        }
        self.inner.logon_table.add_entry(user_name, password);
        Ok(())
    }

    /// The GUID of a peer (or of this attachment for an empty name).
    ///
    /// # Errors
    ///
    /// [`Status::NoPeerGuid`] for unknown peers.
    pub fn get_peer_guid(&self, name: &str) -> Result<String, Status> {
        if name.is_empty() || name == self.unique_name() {
            return Ok(self.global_guid_string());
        }
        self.inner
            .peer_state
            .get(name)
            .map(|peer| peer.guid.to_hex())
            .ok_or(Status::NoPeerGuid)
    }

    /// The peer-state table (inspection and the auth conversation).
    #[must_use]
    pub fn peer_state_table(&self) -> &PeerStateTable {
        &self.inner.peer_state
    }

    /// Re-reads the key store from its backing file.
    ///
    /// # Errors
    ///
    /// Key-store failures pass through.
    pub fn reload_key_store(&self) -> Result<(), Status> {
        self.inner.keystore.reload().map_err(Status::from)
    }

    /// Deletes the negotiated keys for a peer GUID.
    ///
    /// # Errors
    ///
    /// [`Status::InvalidGuid`] for malformed GUIDs,
    /// [`Status::KeyUnavailable`] when no key exists.
    pub fn clear_keys(&self, guid: &str) -> Result<(), Status> {
        let guid: Guid128 = guid.parse()?;
        let key = KeyStoreKey::remote(guid);
        if !self.inner.keystore.has_key(&key) {
            return Err(Status::KeyUnavailable);
        }
        self.inner.keystore.del_key(&key).map_err(Status::from)
    }

    /// Sets the expiration (seconds from now) of a peer's keys; zero
    /// deletes them.
    ///
    /// # Errors
    ///
    /// As [`BusAttachment::clear_keys`].
    pub fn set_key_expiration(&self, guid: &str, timeout_secs: u32) -> Result<(), Status> {
        if timeout_secs == 0 {
            return self.clear_keys(guid);
        }
        let guid: Guid128 = guid.parse()?;
        let expiration =
            meshbus_core::cert::current_epoch_seconds() + u64::from(timeout_secs);
        self.inner
            .keystore
            .set_key_expiration(&KeyStoreKey::remote(guid), expiration)
            .map_err(Status::from)
    }

    /// The remaining lifetime, in seconds, of a peer's keys.
    ///
    /// # Errors
    ///
    /// As [`BusAttachment::clear_keys`].
    pub fn get_key_expiration(&self, guid: &str) -> Result<u32, Status> {
        let guid: Guid128 = guid.parse()?;
        let expiration = self
            .inner
            .keystore
            .get_key_expiration(&KeyStoreKey::remote(guid))
            .map_err(Status::from)?;
        Ok(match expiration {
            None => u32::MAX,
            Some(epoch) => {
                let now = meshbus_core::cert::current_epoch_seconds();
                u32::try_from(epoch.saturating_sub(now)).unwrap_or(u32::MAX)
            }
        })
    }

    // ------------------------------------------------------------------
    // Claim ceremony
    // ------------------------------------------------------------------

    /// Completes a claim ceremony: installs the authority's policy and
    /// notifies the permission-configuration listener.
    ///
    /// # Errors
    ///
    /// [`Status::InvalidApplicationState`] unless claimable.
    pub fn claim(&self, policy: meshbus_core::permission::PermissionPolicy) -> Result<(), Status> {
        self.inner.configurator.claim(policy)?;
        if let Some(listener) = self.inner.pc_listener.read().unwrap().as_ref() {
            listener.policy_changed();
        }
        Ok(())
    }

    /// Installs an updated policy on a claimed (or update-requesting)
    /// application.
    ///
    /// # Errors
    ///
    /// [`Status::InvalidApplicationState`] for other states.
    pub fn update_policy(
        &self,
        policy: meshbus_core::permission::PermissionPolicy,
    ) -> Result<(), Status> {
        self.inner.configurator.update_policy(policy)?;
        if let Some(listener) = self.inner.pc_listener.read().unwrap().as_ref() {
            listener.policy_changed();
        }
        Ok(())
    }

    /// Factory reset: clears the policy, signing keys, and negotiated
    /// peer keys, returning the application to the claimable state.
    ///
    /// # Errors
    ///
    /// Key-store failures pass through; the listener's own status is
    /// returned when it vetoes the reset.
    pub fn factory_reset(&self) -> Result<(), Status> {
        self.inner.configurator.reset();
        self.inner.keystore.clear();
        self.inner.peer_state.clear();
        let listener = self.inner.pc_listener.read().unwrap().clone();
        match listener {
            Some(listener) => listener.factory_reset(),
            None => Ok(()),
        }
    }

    /// A security manager opened a management session.
    pub fn start_management(&self) {
        if let Some(listener) = self.inner.pc_listener.read().unwrap().as_ref() {
            listener.start_management();
        }
    }

    /// A security manager closed its management session.
    pub fn end_management(&self) {
        if let Some(listener) = self.inner.pc_listener.read().unwrap().as_ref() {
            listener.end_management();
        }
    }

    /// Blocks until the application reaches the claimed state.
    ///
    /// # Errors
    ///
    /// [`Status::Timeout`] if not claimed within the deadline.
    pub fn wait_for_claimed_state(&self, timeout: Duration) -> Result<(), Status> {
        self.inner
            .configurator
            .wait_for_state(meshbus_core::permission::ApplicationState::Claimed, timeout)
    }

    /// Suspend notification to the router.
    ///
    /// # Errors
    ///
    /// [`Status::Fail`] per the disposition.
    pub fn on_app_suspend(&self) -> Result<(), Status> {
        self.app_state_call("OnAppSuspend")
    }

    /// Resume notification to the router.
    ///
    /// # Errors
    ///
    /// [`Status::Fail`] per the disposition.
    pub fn on_app_resume(&self) -> Result<(), Status> {
        self.app_state_call("OnAppResume")
    }

    fn app_state_call(&self, member: &str) -> Result<(), Status> {
        if !self.is_connected() {
            return Err(Status::NotConnected);
        }
        let reply = self.controller_call(
            BUS_WELL_KNOWN_NAME,
            BUS_INTERFACE,
            member,
            vec![],
            Duration::from_millis(names::DEFAULT_CALL_TIMEOUT_MS),
        )?;
        match Self::disposition_of(&reply)? {
            names::APP_STATE_REPLY_SUCCESS => Ok(()),
            names::APP_STATE_REPLY_FAILED | names::APP_STATE_REPLY_NO_SUPPORT => Err(Status::Fail),
            _ => Err(Status::UnexpectedDisposition),
        }
    }

    // ------------------------------------------------------------------
    // Control-plane signal handlers
    // ------------------------------------------------------------------

    fn register_control_handlers(&self) -> Result<(), Status> {
        let signals: [(&str, &str, &str, &str); 7] = [
            (DBUS_INTERFACE, "NameOwnerChanged", "sss", "name,old,new"),
            (BUS_INTERFACE, "FoundAdvertisedName", "sqs", "name,transport,prefix"),
            (BUS_INTERFACE, "LostAdvertisedName", "sqs", "name,transport,prefix"),
            (
                BUS_INTERFACE,
                "SessionLostWithReasonAndDisposition",
                "uuu",
                "sessionId,reason,disposition",
            ),
            (
                BUS_INTERFACE,
                "MPSessionChangedWithReason",
                "usbu",
                "sessionId,member,added,reason",
            ),
            (names::ABOUT_INTERFACE, "Announce", "qqa(oas)a{sv}", "version,port,objects,data"),
            (names::APPLICATION_INTERFACE, "State", "ayq", "publicKey,state"),
        ];
        for (iface_name, member_name, signature, arg_names) in signals {
            let member = Member {
                kind: MemberKind::Signal,
                name: member_name.to_string(),
                signature: signature.to_string(),
                return_signature: String::new(),
                arg_names: arg_names.to_string(),
            };
            let rule = MatchRule::parse(&format!(
                "type='signal',interface='{iface_name}',member='{member_name}'"
            ))
            .map_err(|_| Status::Fail)?;
            let inner = Arc::downgrade(&self.inner);
            self.inner.endpoint.register_signal_handler(
                iface_name,
                SignalEntry {
                    receiver: self.inner.control_receiver,
                    handler: Arc::new(move |_member, _src_path, msg| {
                        if let Some(inner) = inner.upgrade() {
                            BusAttachment { inner }.control_signal(msg);
                        }
                    }),
                    member,
                    policy: SecurityPolicy::Inherit,
                    rule,
                },
            );
        }

        self.add_match(names::DBUS_MATCH_RULE)?;
        self.add_match(names::BUS_MATCH_RULE)?;
        Ok(())
    }

    /// Dispatch thread for control-plane signals.
    fn control_signal(&self, msg: &Message) {
        let args = msg.args();
        match msg.member() {
            "NameOwnerChanged" => {
                let name = args.first().and_then(MsgArg::as_str).unwrap_or_default();
                let old = args.get(1).and_then(MsgArg::as_str).filter(|s| !s.is_empty());
                let new = args.get(2).and_then(MsgArg::as_str).filter(|s| !s.is_empty());
                for listener in self.inner.bus_listeners.snapshot() {
                    listener.name_owner_changed(name, old, new);
                }
            }
            "FoundAdvertisedName" | "LostAdvertisedName" => {
                let name = args.first().and_then(MsgArg::as_str).unwrap_or_default();
                let transport = args.get(1).and_then(MsgArg::as_u16).unwrap_or_default();
                let prefix = args.get(2).and_then(MsgArg::as_str).unwrap_or_default();
                let found = msg.member() == "FoundAdvertisedName";
                for listener in self.inner.bus_listeners.snapshot() {
                    if found {
                        listener.found_advertised_name(name, transport, prefix);
                    } else {
                        listener.lost_advertised_name(name, transport, prefix);
                    }
                }
            }
            "SessionLostWithReasonAndDisposition" => {
                let id = args.first().and_then(MsgArg::as_u32).unwrap_or_default();
                let reason = SessionLostReason::from_code(
                    args.get(1).and_then(MsgArg::as_u32).unwrap_or_default(),
                );
                let Some(side) = args
                    .get(2)
                    .and_then(MsgArg::as_u32)
                    .and_then(SessionSide::from_disposition)
                else {
                    return;
                };
                self.inner.sessions.handle_session_lost(side, id, reason);
            }
            "MPSessionChangedWithReason" => {
                let id = args.first().and_then(MsgArg::as_u32).unwrap_or_default();
                let member = args.get(1).and_then(MsgArg::as_str).unwrap_or_default();
                let added = args.get(2).and_then(MsgArg::as_bool).unwrap_or_default();
                let Some(reason) = args
                    .get(3)
                    .and_then(MsgArg::as_u32)
                    .and_then(MemberChangeReason::from_code)
                else {
                    return;
                };
                self.inner.sessions.handle_member_changed(
                    id,
                    member,
                    added,
                    reason,
                    &self.unique_name(),
                );
            }
            "Announce" => {
                let version = args.first().and_then(MsgArg::as_u16).unwrap_or_default();
                let port = args.get(1).and_then(MsgArg::as_u16).unwrap_or_default();
                let (Some(objects), Some(data)) = (args.get(2), args.get(3)) else {
                    return;
                };
                for listener in self.inner.about_listeners.snapshot() {
                    listener.announced(msg.sender(), version, port, objects, data);
                }
            }
            "State" => {
                let Some(key) = args.first().and_then(MsgArg::as_array) else {
                    return;
                };
                let key: Vec<u8> = key
                    .iter()
                    .filter_map(|arg| match arg {
                        MsgArg::Byte(b) => Some(*b),
                        _ => None,
                    })
                    .collect();
                let Some(state) = args
                    .get(1)
                    .and_then(MsgArg::as_u16)
                    .and_then(meshbus_core::permission::ApplicationState::from_code)
                else {
                    return;
                };
                for listener in self.inner.app_state_listeners.snapshot() {
                    listener.state(msg.sender(), &key, state);
                }
            }
            other => {
                debug!(member = other, "unrecognized control signal");
            }
        }
    }
}

impl SessionHost for BusInner {
    fn accept_session_joiner(&self, port: SessionPort, joiner: &str, opts: &SessionOpts) -> bool {
        let listener = {
            let listeners = self.session_port_listeners.lock().unwrap();
            listeners.get(&port).cloned()
        };
        match listener {
            Some(listener) => listener.accept_session_joiner(port, joiner, opts),
            None => {
                warn!(port, "no session port listener for inbound joiner");
                false
            }
        }
    }

    fn session_joined(&self, port: SessionPort, id: SessionId, joiner: &str) {
        // New point-to-point or multipoint session; the membership-change
        // signal patches the multipoint flag up as needed.
        self.sessions.insert(
            SessionSide::Host,
            id,
            false,
            None,
            [joiner.to_string()],
        );
        let listener = {
            let listeners = self.session_port_listeners.lock().unwrap();
            listeners.get(&port).cloned()
        };
        if let Some(listener) = listener {
            listener.session_joined(port, id, joiner);
        }
    }
}

fn parse_join_reply(reply: &Message) -> Result<(SessionId, SessionOpts), Status> {
    match reply.msg_type() {
        MessageType::MethodReturn => {
            let disposition = reply.args().first().and_then(MsgArg::as_u32);
            let id = reply.args().get(1).and_then(MsgArg::as_u32).unwrap_or(0);
            let opts = reply
                .args()
                .get(2)
                .and_then(|arg| SessionOpts::from_msgarg(arg).ok())
                .unwrap_or_default();
            match disposition {
                Some(names::JOIN_REPLY_SUCCESS) => Ok((id, opts)),
                Some(names::JOIN_REPLY_NO_SESSION) => Err(Status::JoinNoSession),
                Some(names::JOIN_REPLY_UNREACHABLE) => Err(Status::JoinUnreachable),
                Some(names::JOIN_REPLY_CONNECT_FAILED) => Err(Status::JoinConnectFailed),
                Some(names::JOIN_REPLY_REJECTED) => Err(Status::JoinRejected),
                Some(names::JOIN_REPLY_BAD_SESSION_OPTS) => Err(Status::JoinBadOpts),
                Some(names::JOIN_REPLY_ALREADY_JOINED) => Err(Status::JoinAlreadyJoined),
                Some(names::JOIN_REPLY_FAILED) => Err(Status::JoinFailed),
                Some(_) => Err(Status::UnexpectedDisposition),
                None => Err(Status::InvalidData),
            }
        }
        MessageType::Error => Err(reply.status().unwrap_or(Status::ReplyIsError)),
        _ => Err(Status::Fail),
    }
}
