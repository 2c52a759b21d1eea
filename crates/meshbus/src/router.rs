//! The router seam and the bundled in-process router.
//!
//! The core consumes routers through the [`Router`] trait; real daemons sit
//! behind transports that are out of scope here. The [`BundledRouter`] is
//! the in-process fallback used when connecting to an external router
//! fails: it implements the fixed control plane (names, matches, sessions,
//! discovery) and routes messages between the endpoints attached to it.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use meshbus_core::guid::Guid128;
use meshbus_core::status::Status;
use tracing::{debug, warn};

use crate::args::MsgArg;
use crate::match_rule::MatchRule;
use crate::message::{Message, MessageType};
use crate::names::{self, BUS_INTERFACE, BUS_WELL_KNOWN_NAME, DBUS_INTERFACE, DBUS_WELL_KNOWN_NAME};
use crate::session::{
    MemberChangeReason, SessionId, SessionLostReason, SessionOpts, SessionPort, SessionSide,
};

/// An endpoint as seen by a router.
pub trait RouterEndpoint: Send + Sync {
    /// The endpoint's unique name.
    fn unique_name(&self) -> String;
    /// Delivers an inbound message to the endpoint.
    fn push_message(&self, msg: Message) -> Result<(), Status>;
    /// Asks the host application whether to admit a joiner.
    fn accept_session_joiner(&self, port: SessionPort, joiner: &str, opts: &SessionOpts) -> bool;
    /// Tells the host application a joiner was admitted.
    fn session_joined(&self, port: SessionPort, id: SessionId, joiner: &str);
}

/// A router the attachment can connect to.
pub trait Router: Send + Sync {
    /// True for routers embedded in a daemon process.
    fn is_daemon(&self) -> bool {
        false
    }
    /// Protocol version the router announces; `None` for a plain DBus
    /// daemon that does not announce one.
    fn protocol_version(&self) -> Option<u32>;
    /// Mints a unique name for a new endpoint.
    fn generate_unique_name(&self) -> String;
    /// Attaches an endpoint under the unique name it reports.
    fn register_endpoint(&self, endpoint: Arc<dyn RouterEndpoint>);
    /// Detaches an endpoint, tearing down its names and sessions.
    fn unregister_endpoint(&self, unique_name: &str);
    /// Accepts an outbound message for routing.
    fn push_message(&self, msg: &Message) -> Result<(), Status>;
}

impl std::fmt::Debug for dyn Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("dyn Router")
            .field("is_daemon", &self.is_daemon())
            .field("protocol_version", &self.protocol_version())
            .finish_non_exhaustive()
    }
}

struct NameEntry {
    owner: String,
    allow_replacement: bool,
    queue: VecDeque<(String, u32)>,
}

struct RouterSession {
    host: String,
    port: SessionPort,
    opts: SessionOpts,
    /// `(unique name, is_host)`; a self-joined attachment appears twice.
    members: Vec<(String, bool)>,
}

#[derive(Default)]
struct RouterState {
    endpoints: HashMap<String, Arc<dyn RouterEndpoint>>,
    names: HashMap<String, NameEntry>,
    matches: HashMap<String, Vec<MatchRule>>,
    ports: HashMap<(String, SessionPort), SessionOpts>,
    sessions: HashMap<SessionId, RouterSession>,
    advertised: HashMap<String, (String, u16)>,
    discovering: Vec<(String, String, u16)>,
}

type Delivery = (Arc<dyn RouterEndpoint>, Message);

/// The bundled in-process router.
pub struct BundledRouter {
    guid: Guid128,
    next_endpoint: AtomicU32,
    next_session: AtomicU32,
    serial: AtomicU32,
    state: Mutex<RouterState>,
}

impl Default for BundledRouter {
    fn default() -> Self {
        Self::new()
    }
}

impl BundledRouter {
    /// Creates an empty router.
    #[must_use]
    pub fn new() -> Self {
        Self {
            guid: Guid128::generate(),
            next_endpoint: AtomicU32::new(1),
            next_session: AtomicU32::new(1),
            serial: AtomicU32::new(1),
            state: Mutex::new(RouterState::default()),
        }
    }

    /// The router's GUID.
    #[must_use]
    pub const fn guid(&self) -> Guid128 {
        self.guid
    }

    fn next_serial(&self) -> u32 {
        self.serial.fetch_add(1, Ordering::Relaxed).max(1)
    }

    fn deliver(&self, deliveries: Vec<Delivery>) {
        for (endpoint, msg) in deliveries {
            if let Err(status) = endpoint.push_message(msg) {
                if status != Status::Stopping {
                    warn!(status = %status, "router delivery failed");
                }
            }
        }
    }

    /// Resolves a bus name (unique or well-known) to its unique name.
    fn resolve(state: &RouterState, name: &str) -> Option<String> {
        if name.starts_with(':') {
            state.endpoints.contains_key(name).then(|| name.to_string())
        } else {
            state.names.get(name).map(|entry| entry.owner.clone())
        }
    }

    fn endpoint_of(state: &RouterState, unique: &str) -> Option<Arc<dyn RouterEndpoint>> {
        state.endpoints.get(unique).cloned()
    }

    /// Broadcast `signal` to every endpoint with a matching rule, except
    /// the originator.
    fn broadcast(state: &RouterState, signal: &Message, skip: &str, out: &mut Vec<Delivery>) {
        for (unique, endpoint) in &state.endpoints {
            if unique == skip {
                continue;
            }
            let matched = state
                .matches
                .get(unique)
                .is_some_and(|rules| rules.iter().any(|rule| rule.is_match(signal)));
            if matched {
                out.push((endpoint.clone(), signal.clone()));
            }
        }
    }

    fn name_owner_changed(
        &self,
        state: &RouterState,
        name: &str,
        old: &str,
        new: &str,
        out: &mut Vec<Delivery>,
    ) {
        let signal = Message::signal(
            self.next_serial(),
            DBUS_WELL_KNOWN_NAME,
            "",
            names::DBUS_OBJECT_PATH,
            DBUS_INTERFACE,
            "NameOwnerChanged",
            vec![
                MsgArg::String(name.to_string()),
                MsgArg::String(old.to_string()),
                MsgArg::String(new.to_string()),
            ],
            0,
            0,
        );
        Self::broadcast(state, &signal, "", out);
    }

    fn session_lost_signal(
        &self,
        id: SessionId,
        reason: SessionLostReason,
        side: SessionSide,
        target: &str,
    ) -> Message {
        Message::signal(
            self.next_serial(),
            BUS_WELL_KNOWN_NAME,
            target,
            names::BUS_OBJECT_PATH,
            BUS_INTERFACE,
            "SessionLostWithReasonAndDisposition",
            vec![
                MsgArg::Uint32(id),
                MsgArg::Uint32(reason.code()),
                MsgArg::Uint32(side.disposition()),
            ],
            0,
            0,
        )
    }

    fn member_changed_signal(
        &self,
        id: SessionId,
        member: &str,
        added: bool,
        reason: MemberChangeReason,
        target: &str,
    ) -> Message {
        Message::signal(
            self.next_serial(),
            BUS_WELL_KNOWN_NAME,
            target,
            names::BUS_OBJECT_PATH,
            BUS_INTERFACE,
            "MPSessionChangedWithReason",
            vec![
                MsgArg::Uint32(id),
                MsgArg::String(member.to_string()),
                MsgArg::Boolean(added),
                MsgArg::Uint32(reason.code()),
            ],
            0,
            0,
        )
    }

    // ------------------------------------------------------------------
    // Session teardown helpers
    // ------------------------------------------------------------------

    /// Removes one membership `(member, is_host)` from a session, emitting
    /// membership/lost signals. Destroys the session when fewer than two
    /// memberships remain.
    fn remove_membership(
        &self,
        state: &mut RouterState,
        id: SessionId,
        member: &str,
        is_host: bool,
        lost_reason: SessionLostReason,
        notify_removed_member: Option<SessionLostReason>,
        out: &mut Vec<Delivery>,
    ) -> bool {
        let Some(session) = state.sessions.get_mut(&id) else {
            return false;
        };
        let Some(position) = session
            .members
            .iter()
            .position(|(m, h)| m == member && *h == is_host)
        else {
            return false;
        };
        session.members.remove(position);
        let multipoint = session.opts.multipoint;
        let remaining = session.members.clone();

        // Tell the removed member, when the removal was not its own idea.
        if let Some(reason) = notify_removed_member {
            if let Some(endpoint) = Self::endpoint_of(state, member) {
                let side = if is_host {
                    SessionSide::Host
                } else {
                    SessionSide::Joiner
                };
                out.push((endpoint, self.session_lost_signal(id, reason, side, member)));
            }
        }

        if multipoint {
            // Membership-change notifications to every remaining member,
            // including the leaver's other self-join half.
            for (unique, _) in &remaining {
                if let Some(endpoint) = Self::endpoint_of(state, unique) {
                    let reason = if unique == member {
                        MemberChangeReason::LocalMemberRemoved
                    } else {
                        MemberChangeReason::RemoteMemberRemoved
                    };
                    out.push((
                        endpoint,
                        self.member_changed_signal(id, member, false, reason, unique),
                    ));
                }
            }
        }

        if remaining.len() < 2 {
            state.sessions.remove(&id);
            for (unique, was_host) in remaining {
                if let Some(endpoint) = Self::endpoint_of(state, &unique) {
                    let side = if was_host {
                        SessionSide::Host
                    } else {
                        SessionSide::Joiner
                    };
                    out.push((
                        endpoint,
                        self.session_lost_signal(id, lost_reason, side, &unique),
                    ));
                }
            }
        }
        true
    }

    // ------------------------------------------------------------------
    // Control plane
    // ------------------------------------------------------------------

    fn handle_control(&self, call: &Message) -> Result<(), Status> {
        let mut deliveries: Vec<Delivery> = Vec::new();
        let reply = match (call.interface(), call.member()) {
            (DBUS_INTERFACE, "RequestName") => self.request_name(call, &mut deliveries),
            (DBUS_INTERFACE, "ReleaseName") => self.release_name(call, &mut deliveries),
            (DBUS_INTERFACE, "NameHasOwner") => self.name_has_owner(call),
            (DBUS_INTERFACE, "GetNameOwner") => self.get_name_owner(call),
            (DBUS_INTERFACE, "AddMatch") => self.add_match(call),
            (DBUS_INTERFACE, "RemoveMatch") => self.remove_match(call),
            (BUS_INTERFACE, "BindSessionPort") => self.bind_session_port(call),
            (BUS_INTERFACE, "UnbindSessionPort") => self.unbind_session_port(call),
            (BUS_INTERFACE, "JoinSession") => self.join_session(call, &mut deliveries),
            (BUS_INTERFACE, "LeaveSession") => self.leave_session(call, None, &mut deliveries),
            (BUS_INTERFACE, "LeaveHostedSession") => {
                self.leave_session(call, Some(true), &mut deliveries)
            }
            (BUS_INTERFACE, "LeaveJoinedSession") => {
                self.leave_session(call, Some(false), &mut deliveries)
            }
            (BUS_INTERFACE, "RemoveSessionMember") => {
                self.remove_session_member(call, &mut deliveries)
            }
            (BUS_INTERFACE, "GetSessionFd") => Err((
                "org.alljoyn.Bus.Failed".to_string(),
                "raw sessions are not supported by the bundled router".to_string(),
            )),
            (BUS_INTERFACE, "SetLinkTimeout") => self.set_link_timeout(call),
            (BUS_INTERFACE, "Ping") => self.ping(call),
            (BUS_INTERFACE, "FindAdvertisedName") => {
                self.find_name(call, crate::session::TRANSPORT_ANY, &mut deliveries)
            }
            (BUS_INTERFACE, "FindAdvertisedNameByTransport") => {
                let transports = call.args().get(1).and_then(MsgArg::as_u16).unwrap_or(0);
                self.find_name(call, transports, &mut deliveries)
            }
            (BUS_INTERFACE, "CancelFindAdvertisedName")
            | (BUS_INTERFACE, "CancelFindAdvertisedNameByTransport") => self.cancel_find(call),
            (BUS_INTERFACE, "AdvertiseName") => self.advertise_name(call, &mut deliveries),
            (BUS_INTERFACE, "CancelAdvertiseName") => {
                self.cancel_advertise_name(call, &mut deliveries)
            }
            (BUS_INTERFACE, "OnAppSuspend") | (BUS_INTERFACE, "OnAppResume") => {
                Ok(vec![MsgArg::Uint32(names::APP_STATE_REPLY_SUCCESS)])
            }
            _ => Err((
                "org.alljoyn.Bus.NoSuchMember".to_string(),
                format!("unknown controller method {}.{}", call.interface(), call.member()),
            )),
        };

        let reply_msg = match reply {
            Ok(args) => Message::method_return(call, self.next_serial(), args),
            Err((name, description)) => {
                Message::error_reply(call, self.next_serial(), &name, &description)
            }
        };

        let sender_endpoint = {
            let state = self.state.lock().unwrap();
            Self::endpoint_of(&state, call.sender())
        };
        if let Some(endpoint) = sender_endpoint {
            if !call.no_reply_expected() {
                // The reply goes first so session bookkeeping lands before
                // the membership signals that reference it.
                let result = endpoint.push_message(reply_msg);
                if let Err(status) = result {
                    debug!(status = %status, "control reply not delivered");
                }
            }
        }
        self.deliver(deliveries);
        Ok(())
    }

    fn request_name(&self, call: &Message, out: &mut Vec<Delivery>) -> ControlReply {
        let (name, flags) = match (call.args().first(), call.args().get(1)) {
            (Some(MsgArg::String(name)), Some(MsgArg::Uint32(flags))) => (name.clone(), *flags),
            _ => return control_error(Status::InvalidData),
        };
        if !names::is_legal_bus_name(&name) || name.starts_with(':') {
            return control_error(Status::BadBusName);
        }
        let caller = call.sender().to_string();
        let mut state = self.state.lock().unwrap();
        let mut owner_change: Option<(String, String)> = None;
        let disposition = match state.names.get_mut(&name) {
            None => {
                state.names.insert(
                    name.clone(),
                    NameEntry {
                        owner: caller.clone(),
                        allow_replacement: flags & names::NAME_FLAG_ALLOW_REPLACEMENT != 0,
                        queue: VecDeque::new(),
                    },
                );
                owner_change = Some((String::new(), caller.clone()));
                names::REQUEST_NAME_REPLY_PRIMARY_OWNER
            }
            Some(entry) if entry.owner == caller => names::REQUEST_NAME_REPLY_ALREADY_OWNER,
            Some(entry)
                if entry.allow_replacement && flags & names::NAME_FLAG_REPLACE_EXISTING != 0 =>
            {
                let old = std::mem::replace(&mut entry.owner, caller.clone());
                entry.allow_replacement = flags & names::NAME_FLAG_ALLOW_REPLACEMENT != 0;
                owner_change = Some((old, caller.clone()));
                names::REQUEST_NAME_REPLY_PRIMARY_OWNER
            }
            Some(_) if flags & names::NAME_FLAG_DO_NOT_QUEUE != 0 => {
                names::REQUEST_NAME_REPLY_EXISTS
            }
            Some(entry) => {
                if !entry.queue.iter().any(|(queued, _)| *queued == caller) {
                    entry.queue.push_back((caller, flags));
                }
                names::REQUEST_NAME_REPLY_IN_QUEUE
            }
        };
        if let Some((old, new)) = owner_change {
            self.name_owner_changed(&state, &name, &old, &new, out);
        }
        Ok(vec![MsgArg::Uint32(disposition)])
    }

    fn release_name(&self, call: &Message, out: &mut Vec<Delivery>) -> ControlReply {
        let Some(MsgArg::String(name)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let name = name.clone();
        let caller = call.sender();
        let mut state = self.state.lock().unwrap();
        let mut owner_change: Option<(String, String)> = None;
        let mut remove_entry = false;
        let disposition = match state.names.get_mut(&name) {
            None => names::RELEASE_NAME_REPLY_NON_EXISTENT,
            Some(entry) if entry.owner != caller => {
                // A queued request can be withdrawn through release.
                entry.queue.retain(|(queued, _)| queued != caller);
                names::RELEASE_NAME_REPLY_NOT_OWNER
            }
            Some(entry) => {
                let old = entry.owner.clone();
                match entry.queue.pop_front() {
                    Some((next, flags)) => {
                        entry.owner = next.clone();
                        entry.allow_replacement = flags & names::NAME_FLAG_ALLOW_REPLACEMENT != 0;
                        owner_change = Some((old, next));
                    }
                    None => {
                        remove_entry = true;
                        owner_change = Some((old, String::new()));
                    }
                }
                names::RELEASE_NAME_REPLY_RELEASED
            }
        };
        if remove_entry {
            state.names.remove(&name);
        }
        if let Some((old, new)) = owner_change {
            self.name_owner_changed(&state, &name, &old, &new, out);
        }
        Ok(vec![MsgArg::Uint32(disposition)])
    }

    fn name_has_owner(&self, call: &Message) -> ControlReply {
        let Some(MsgArg::String(name)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let state = self.state.lock().unwrap();
        Ok(vec![MsgArg::Boolean(Self::resolve(&state, name).is_some())])
    }

    fn get_name_owner(&self, call: &Message) -> ControlReply {
        let Some(MsgArg::String(name)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let state = self.state.lock().unwrap();
        match Self::resolve(&state, name) {
            Some(owner) => Ok(vec![MsgArg::String(owner)]),
            None => Err((
                "org.freedesktop.DBus.Error.NameHasNoOwner".to_string(),
                format!("name {name} has no owner"),
            )),
        }
    }

    fn add_match(&self, call: &Message) -> ControlReply {
        let Some(MsgArg::String(rule)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let parsed = match MatchRule::parse(rule) {
            Ok(parsed) => parsed,
            Err(status) => return control_error(status),
        };
        let mut state = self.state.lock().unwrap();
        state
            .matches
            .entry(call.sender().to_string())
            .or_default()
            .push(parsed);
        Ok(vec![])
    }

    fn remove_match(&self, call: &Message) -> ControlReply {
        let Some(MsgArg::String(rule)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let parsed = match MatchRule::parse(rule) {
            Ok(parsed) => parsed,
            Err(status) => return control_error(status),
        };
        let mut state = self.state.lock().unwrap();
        if let Some(rules) = state.matches.get_mut(call.sender()) {
            if let Some(position) = rules.iter().position(|r| *r == parsed) {
                rules.remove(position);
                return Ok(vec![]);
            }
        }
        Err((
            "org.freedesktop.DBus.Error.MatchRuleNotFound".to_string(),
            "no such match rule".to_string(),
        ))
    }

    fn bind_session_port(&self, call: &Message) -> ControlReply {
        let Some(MsgArg::Uint16(port)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let opts = match call.args().get(1).map(SessionOpts::from_msgarg) {
            Some(Ok(opts)) => opts,
            _ => {
                return Ok(vec![
                    MsgArg::Uint32(names::BIND_REPLY_INVALID_OPTS),
                    MsgArg::Uint16(*port),
                ])
            }
        };
        let caller = call.sender().to_string();
        let mut state = self.state.lock().unwrap();
        let mut port = *port;
        if port == crate::session::SESSION_PORT_ANY {
            port = (1..u16::MAX)
                .find(|p| !state.ports.contains_key(&(caller.clone(), *p)))
                .unwrap_or(1);
        }
        let disposition = if state.ports.contains_key(&(caller.clone(), port)) {
            names::BIND_REPLY_ALREADY_EXISTS
        } else {
            state.ports.insert((caller, port), opts);
            names::BIND_REPLY_SUCCESS
        };
        Ok(vec![MsgArg::Uint32(disposition), MsgArg::Uint16(port)])
    }

    fn unbind_session_port(&self, call: &Message) -> ControlReply {
        let Some(MsgArg::Uint16(port)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let caller = call.sender().to_string();
        let mut state = self.state.lock().unwrap();
        let disposition = if state.ports.remove(&(caller, *port)).is_some() {
            names::UNBIND_REPLY_SUCCESS
        } else {
            names::UNBIND_REPLY_BAD_PORT
        };
        Ok(vec![MsgArg::Uint32(disposition)])
    }

    fn join_session(&self, call: &Message, out: &mut Vec<Delivery>) -> ControlReply {
        let (host_name, port, opts) = match (
            call.args().first(),
            call.args().get(1),
            call.args().get(2),
        ) {
            (Some(MsgArg::String(host)), Some(MsgArg::Uint16(port)), Some(opts_arg)) => {
                match SessionOpts::from_msgarg(opts_arg) {
                    Ok(opts) => (host.clone(), *port, opts),
                    Err(_) => {
                        return Ok(join_reply(names::JOIN_REPLY_BAD_SESSION_OPTS, 0, &SessionOpts::default()))
                    }
                }
            }
            _ => return control_error(Status::InvalidData),
        };
        let joiner = call.sender().to_string();

        // Validate against current state, then release the lock for the
        // accept callback into host application code.
        let (host_unique, host_endpoint, bound_opts) = {
            let state = self.state.lock().unwrap();
            let Some(host_unique) = Self::resolve(&state, &host_name) else {
                return Ok(join_reply(names::JOIN_REPLY_UNREACHABLE, 0, &opts));
            };
            let Some(bound) = state.ports.get(&(host_unique.clone(), port)).copied() else {
                return Ok(join_reply(names::JOIN_REPLY_NO_SESSION, 0, &opts));
            };
            if !bound.is_compatible(&opts) {
                return Ok(join_reply(names::JOIN_REPLY_BAD_SESSION_OPTS, 0, &opts));
            }
            let already = state.sessions.values().any(|session| {
                session.host == host_unique
                    && session.port == port
                    && session.members.iter().any(|(m, h)| m == &joiner && !h)
            });
            if already {
                return Ok(join_reply(names::JOIN_REPLY_ALREADY_JOINED, 0, &opts));
            }
            let Some(endpoint) = Self::endpoint_of(&state, &host_unique) else {
                return Ok(join_reply(names::JOIN_REPLY_UNREACHABLE, 0, &opts));
            };
            (host_unique, endpoint, bound)
        };

        if !host_endpoint.accept_session_joiner(port, &joiner, &opts) {
            return Ok(join_reply(names::JOIN_REPLY_REJECTED, 0, &bound_opts));
        }

        // Commit under the lock, re-validating the binding.
        let (id, existing_members) = {
            let mut state = self.state.lock().unwrap();
            if !state.ports.contains_key(&(host_unique.clone(), port)) {
                return Ok(join_reply(names::JOIN_REPLY_NO_SESSION, 0, &bound_opts));
            }
            if bound_opts.multipoint {
                // A multipoint join attaches to the existing session for
                // this host/port when one is already running.
                let existing_id = state
                    .sessions
                    .iter()
                    .find(|(_, s)| s.host == host_unique && s.port == port)
                    .map(|(id, _)| *id);
                if let Some(id) = existing_id {
                    let session = state.sessions.get_mut(&id).expect("session just found");
                    let members_before = session.members.clone();
                    session.members.push((joiner.clone(), false));
                    (id, members_before)
                } else {
                    let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                    state.sessions.insert(
                        id,
                        RouterSession {
                            host: host_unique.clone(),
                            port,
                            opts: bound_opts,
                            members: vec![(host_unique.clone(), true), (joiner.clone(), false)],
                        },
                    );
                    (id, vec![(host_unique.clone(), true)])
                }
            } else {
                let id = self.next_session.fetch_add(1, Ordering::Relaxed);
                state.sessions.insert(
                    id,
                    RouterSession {
                        host: host_unique.clone(),
                        port,
                        opts: bound_opts,
                        members: vec![(host_unique.clone(), true), (joiner.clone(), false)],
                    },
                );
                (id, vec![(host_unique.clone(), true)])
            }
        };

        // Host-side bookkeeping and SessionJoined callback.
        host_endpoint.session_joined(port, id, &joiner);

        if bound_opts.multipoint {
            let state = self.state.lock().unwrap();
            // Everyone already in the session learns about the joiner.
            for (unique, _) in &existing_members {
                if let Some(endpoint) = Self::endpoint_of(&state, unique) {
                    let reason = if *unique == joiner {
                        MemberChangeReason::LocalMemberAdded
                    } else {
                        MemberChangeReason::RemoteMemberAdded
                    };
                    out.push((
                        endpoint,
                        self.member_changed_signal(id, &joiner, true, reason, unique),
                    ));
                }
            }
            // The joiner learns about members beyond the host it already
            // knows from the reply. (A self-joined host already received
            // its own addition through the loop above.)
            if let Some(endpoint) = Self::endpoint_of(&state, &joiner) {
                for (unique, is_host) in &existing_members {
                    if *is_host || *unique == joiner {
                        continue;
                    }
                    out.push((
                        endpoint.clone(),
                        self.member_changed_signal(
                            id,
                            unique,
                            true,
                            MemberChangeReason::RemoteMemberAdded,
                            &joiner,
                        ),
                    ));
                }
            }
        }

        Ok(join_reply(names::JOIN_REPLY_SUCCESS, id, &bound_opts))
    }

    fn leave_session(
        &self,
        call: &Message,
        host_side: Option<bool>,
        out: &mut Vec<Delivery>,
    ) -> ControlReply {
        let Some(MsgArg::Uint32(id)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let caller = call.sender().to_string();
        let mut state = self.state.lock().unwrap();

        let membership = state.sessions.get(id).and_then(|session| {
            session
                .members
                .iter()
                .find(|(m, h)| *m == caller && host_side.map_or(true, |want| *h == want))
                .cloned()
        });
        let disposition = match membership {
            None => names::LEAVE_REPLY_NO_SESSION,
            Some((member, is_host)) => {
                self.remove_membership(
                    &mut state,
                    *id,
                    &member,
                    is_host,
                    SessionLostReason::RemoteEndLeft,
                    None,
                    out,
                );
                names::LEAVE_REPLY_SUCCESS
            }
        };
        Ok(vec![MsgArg::Uint32(disposition)])
    }

    fn remove_session_member(&self, call: &Message, out: &mut Vec<Delivery>) -> ControlReply {
        let (id, member) = match (call.args().first(), call.args().get(1)) {
            (Some(MsgArg::Uint32(id)), Some(MsgArg::String(member))) => (*id, member.clone()),
            _ => return control_error(Status::InvalidData),
        };
        let caller = call.sender();
        let mut state = self.state.lock().unwrap();
        let disposition = match state.sessions.get(&id) {
            None => names::REMOVE_MEMBER_REPLY_NO_SESSION,
            Some(session) if session.host != caller => names::REMOVE_MEMBER_REPLY_NOT_BINDER,
            Some(session) if !session.opts.multipoint => names::REMOVE_MEMBER_REPLY_NOT_MULTIPOINT,
            Some(session)
                if !session.members.iter().any(|(m, h)| *m == member && !h) =>
            {
                names::REMOVE_MEMBER_REPLY_NOT_FOUND
            }
            Some(_) => {
                self.remove_membership(
                    &mut state,
                    id,
                    &member,
                    false,
                    SessionLostReason::RemoteEndLeft,
                    Some(SessionLostReason::RemovedByBinder),
                    out,
                );
                names::REMOVE_MEMBER_REPLY_SUCCESS
            }
        };
        Ok(vec![MsgArg::Uint32(disposition)])
    }

    fn set_link_timeout(&self, call: &Message) -> ControlReply {
        let (id, timeout) = match (call.args().first(), call.args().get(1)) {
            (Some(MsgArg::Uint32(id)), Some(MsgArg::Uint32(timeout))) => (*id, *timeout),
            _ => return control_error(Status::InvalidData),
        };
        let state = self.state.lock().unwrap();
        let disposition = if state.sessions.contains_key(&id) {
            // The in-process link has no timeout concept.
            names::SET_LINK_TIMEOUT_REPLY_NO_DEST_SUPPORT
        } else {
            names::SET_LINK_TIMEOUT_REPLY_NO_SESSION
        };
        Ok(vec![MsgArg::Uint32(disposition), MsgArg::Uint32(timeout)])
    }

    fn ping(&self, call: &Message) -> ControlReply {
        let Some(MsgArg::String(name)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let state = self.state.lock().unwrap();
        let disposition = if Self::resolve(&state, name).is_some() {
            names::PING_REPLY_SUCCESS
        } else {
            names::PING_REPLY_UNKNOWN_NAME
        };
        Ok(vec![MsgArg::Uint32(disposition)])
    }

    fn find_name(
        &self,
        call: &Message,
        transports: u16,
        out: &mut Vec<Delivery>,
    ) -> ControlReply {
        let Some(MsgArg::String(prefix)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let caller = call.sender().to_string();
        let mut state = self.state.lock().unwrap();
        let already = state
            .discovering
            .iter()
            .any(|(who, p, _)| *who == caller && p == prefix);
        if already {
            return Ok(vec![MsgArg::Uint32(names::FIND_NAME_REPLY_ALREADY_DISCOVERING)]);
        }
        state
            .discovering
            .push((caller.clone(), prefix.clone(), transports));

        // Report names already being advertised.
        if let Some(endpoint) = Self::endpoint_of(&state, &caller) {
            for (name, (_, ad_transports)) in &state.advertised {
                if name.starts_with(prefix.as_str()) && ad_transports & transports != 0 {
                    out.push((
                        endpoint.clone(),
                        self.found_name_signal(name, *ad_transports, prefix, &caller, true),
                    ));
                }
            }
        }
        Ok(vec![MsgArg::Uint32(names::FIND_NAME_REPLY_SUCCESS)])
    }

    fn cancel_find(&self, call: &Message) -> ControlReply {
        let Some(MsgArg::String(prefix)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let caller = call.sender();
        let mut state = self.state.lock().unwrap();
        let before = state.discovering.len();
        state
            .discovering
            .retain(|(who, p, _)| !(who == caller && p == prefix));
        let disposition = if state.discovering.len() != before {
            names::CANCEL_FIND_NAME_REPLY_SUCCESS
        } else {
            names::CANCEL_FIND_NAME_REPLY_FAILED
        };
        Ok(vec![MsgArg::Uint32(disposition)])
    }

    fn found_name_signal(
        &self,
        name: &str,
        transports: u16,
        prefix: &str,
        target: &str,
        found: bool,
    ) -> Message {
        Message::signal(
            self.next_serial(),
            BUS_WELL_KNOWN_NAME,
            target,
            names::BUS_OBJECT_PATH,
            BUS_INTERFACE,
            if found {
                "FoundAdvertisedName"
            } else {
                "LostAdvertisedName"
            },
            vec![
                MsgArg::String(name.to_string()),
                MsgArg::Uint16(transports),
                MsgArg::String(prefix.to_string()),
            ],
            0,
            0,
        )
    }

    fn advertise_name(&self, call: &Message, out: &mut Vec<Delivery>) -> ControlReply {
        let (name, transports) = match (call.args().first(), call.args().get(1)) {
            (Some(MsgArg::String(name)), Some(MsgArg::Uint16(transports))) => {
                (name.clone(), *transports)
            }
            _ => return control_error(Status::InvalidData),
        };
        if transports == 0 {
            return Ok(vec![MsgArg::Uint32(names::ADVERTISE_REPLY_TRANSPORT_NOT_AVAILABLE)]);
        }
        let caller = call.sender().to_string();
        let mut state = self.state.lock().unwrap();
        if let Some((owner, _)) = state.advertised.get(&name) {
            if *owner == caller {
                return Ok(vec![MsgArg::Uint32(names::ADVERTISE_REPLY_ALREADY_ADVERTISING)]);
            }
        }
        state.advertised.insert(name.clone(), (caller, transports));

        for (who, prefix, find_transports) in &state.discovering {
            if name.starts_with(prefix.as_str()) && transports & find_transports != 0 {
                if let Some(endpoint) = Self::endpoint_of(&state, who) {
                    out.push((
                        endpoint,
                        self.found_name_signal(&name, transports, prefix, who, true),
                    ));
                }
            }
        }
        Ok(vec![MsgArg::Uint32(names::ADVERTISE_REPLY_SUCCESS)])
    }

    fn cancel_advertise_name(&self, call: &Message, out: &mut Vec<Delivery>) -> ControlReply {
        let Some(MsgArg::String(name)) = call.args().first() else {
            return control_error(Status::InvalidData);
        };
        let caller = call.sender();
        let mut state = self.state.lock().unwrap();
        let owned = state
            .advertised
            .get(name)
            .is_some_and(|(owner, _)| owner == caller);
        let removed = if owned {
            state.advertised.remove(name)
        } else {
            None
        };
        let disposition = match removed {
            Some((_, transports)) => {
                for (who, prefix, find_transports) in &state.discovering {
                    if name.starts_with(prefix.as_str()) && transports & find_transports != 0 {
                        if let Some(endpoint) = Self::endpoint_of(&state, who) {
                            out.push((
                                endpoint,
                                self.found_name_signal(name, transports, prefix, who, false),
                            ));
                        }
                    }
                }
                names::CANCEL_ADVERTISE_REPLY_SUCCESS
            }
            None => names::CANCEL_ADVERTISE_REPLY_FAILED,
        };
        Ok(vec![MsgArg::Uint32(disposition)])
    }
}

type ControlReply = Result<Vec<MsgArg>, (String, String)>;

fn control_error(status: Status) -> ControlReply {
    Err((status.error_name(), status.to_string()))
}

fn join_reply(disposition: u32, id: SessionId, opts: &SessionOpts) -> Vec<MsgArg> {
    vec![
        MsgArg::Uint32(disposition),
        MsgArg::Uint32(id),
        opts.to_msgarg(),
    ]
}

impl Router for BundledRouter {
    fn protocol_version(&self) -> Option<u32> {
        Some(names::PROTOCOL_VERSION)
    }

    fn generate_unique_name(&self) -> String {
        format!(
            ":{}.{}",
            self.guid.short(),
            self.next_endpoint.fetch_add(1, Ordering::Relaxed)
        )
    }

    fn register_endpoint(&self, endpoint: Arc<dyn RouterEndpoint>) {
        let unique = endpoint.unique_name();
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            state.endpoints.insert(unique.clone(), endpoint);
            self.name_owner_changed(&state, &unique, "", &unique, &mut deliveries);
        }
        self.deliver(deliveries);
    }

    fn unregister_endpoint(&self, unique_name: &str) {
        let mut deliveries = Vec::new();
        {
            let mut state = self.state.lock().unwrap();
            if state.endpoints.remove(unique_name).is_none() {
                return;
            }

            // Session teardown: drop every membership this endpoint held.
            let memberships: Vec<(SessionId, bool)> = state
                .sessions
                .iter()
                .flat_map(|(id, session)| {
                    session
                        .members
                        .iter()
                        .filter(|(m, _)| m == unique_name)
                        .map(|(_, is_host)| (*id, *is_host))
                        .collect::<Vec<_>>()
                })
                .collect();
            for (id, is_host) in memberships {
                self.remove_membership(
                    &mut state,
                    id,
                    unique_name,
                    is_host,
                    SessionLostReason::RemoteEndClosedAbruptly,
                    None,
                    &mut deliveries,
                );
            }

            // Release owned well-known names.
            let owned: Vec<String> = state
                .names
                .iter()
                .filter(|(_, entry)| entry.owner == unique_name)
                .map(|(name, _)| name.clone())
                .collect();
            for name in owned {
                let promoted = {
                    let entry = state.names.get_mut(&name).expect("name just listed");
                    match entry.queue.pop_front() {
                        Some((next, flags)) => {
                            entry.owner = next.clone();
                            entry.allow_replacement =
                                flags & names::NAME_FLAG_ALLOW_REPLACEMENT != 0;
                            Some(next)
                        }
                        None => None,
                    }
                };
                match promoted {
                    Some(next) => {
                        self.name_owner_changed(&state, &name, unique_name, &next, &mut deliveries);
                    }
                    None => {
                        state.names.remove(&name);
                        self.name_owner_changed(&state, &name, unique_name, "", &mut deliveries);
                    }
                }
            }
            // Queued requests elsewhere vanish with the endpoint.
            for entry in state.names.values_mut() {
                entry.queue.retain(|(queued, _)| queued != unique_name);
            }

            state.matches.remove(unique_name);
            state
                .ports
                .retain(|(owner, _), _| owner != unique_name);
            let lost: Vec<(String, u16)> = state
                .advertised
                .iter()
                .filter(|(_, (owner, _))| owner == unique_name)
                .map(|(name, (_, transports))| (name.clone(), *transports))
                .collect();
            for (name, transports) in lost {
                state.advertised.remove(&name);
                for (who, prefix, find_transports) in &state.discovering {
                    if name.starts_with(prefix.as_str()) && transports & find_transports != 0 {
                        if let Some(endpoint) = Self::endpoint_of(&state, who) {
                            deliveries.push((
                                endpoint,
                                self.found_name_signal(&name, transports, prefix, who, false),
                            ));
                        }
                    }
                }
            }
            state.discovering.retain(|(who, _, _)| who != unique_name);

            self.name_owner_changed(&state, unique_name, unique_name, "", &mut deliveries);
        }
        self.deliver(deliveries);
    }

    fn push_message(&self, msg: &Message) -> Result<(), Status> {
        // Controller calls are handled inline.
        if msg.msg_type() == MessageType::MethodCall
            && (msg.destination() == DBUS_WELL_KNOWN_NAME
                || msg.destination() == BUS_WELL_KNOWN_NAME)
        {
            return self.handle_control(msg);
        }

        let mut deliveries = Vec::new();
        {
            let state = self.state.lock().unwrap();
            if msg.destination().is_empty() {
                if msg.msg_type() == MessageType::Signal && msg.session_id() != 0 {
                    // Sessioncast to every other member of the session.
                    if let Some(session) = state.sessions.get(&msg.session_id()) {
                        let mut seen: Vec<&str> = Vec::new();
                        for (member, _) in &session.members {
                            if member == msg.sender() || seen.contains(&member.as_str()) {
                                continue;
                            }
                            seen.push(member.as_str());
                            if let Some(endpoint) = Self::endpoint_of(&state, member) {
                                deliveries.push((endpoint, msg.clone()));
                            }
                        }
                    }
                } else if msg.msg_type() == MessageType::Signal {
                    Self::broadcast(&state, msg, msg.sender(), &mut deliveries);
                }
            } else {
                match Self::resolve(&state, msg.destination())
                    .and_then(|unique| Self::endpoint_of(&state, &unique))
                {
                    Some(endpoint) => deliveries.push((endpoint, msg.clone())),
                    None => {
                        if msg.msg_type() == MessageType::MethodCall && !msg.no_reply_expected() {
                            let error = Message::error_reply(
                                msg,
                                self.next_serial(),
                                meshbus_core::status::ERROR_SERVICE_UNKNOWN,
                                &format!("no such destination {}", msg.destination()),
                            );
                            if let Some(endpoint) = Self::endpoint_of(&state, msg.sender()) {
                                deliveries.push((endpoint, error));
                            }
                        } else {
                            debug!(destination = msg.destination(), "dropping unroutable message");
                        }
                    }
                }
            }
        }
        self.deliver(deliveries);
        Ok(())
    }
}
