//! Session types and the host/joiner session directory.
//!
//! Hosted and joined sessions live in two independent tables keyed by
//! session id. A *self-join* session — the same attachment as host and
//! joiner — has an entry in both tables with independent listeners, which
//! is why the dual-side listener setter is rejected as ambiguous for such
//! ids.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use meshbus_core::status::Status;

use crate::args::{dict_get, dict_sv, MsgArg};
use crate::listener::{Protected, SessionListener};

/// Session identifier assigned by the router.
pub type SessionId = u32;
/// Contact port a host binds.
pub type SessionPort = u16;

/// Wildcard session port: let the router pick.
pub const SESSION_PORT_ANY: SessionPort = 0;

/// Traffic class of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TrafficType {
    /// Reliable message-based traffic.
    #[default]
    Messages,
    /// Unreliable raw socket traffic.
    RawUnreliable,
    /// Reliable raw socket traffic.
    RawReliable,
}

impl TrafficType {
    const fn code(self) -> u8 {
        match self {
            Self::Messages => 0x01,
            Self::RawUnreliable => 0x02,
            Self::RawReliable => 0x04,
        }
    }

    const fn from_code(code: u8) -> Option<Self> {
        match code {
            0x01 => Some(Self::Messages),
            0x02 => Some(Self::RawUnreliable),
            0x04 => Some(Self::RawReliable),
            _ => None,
        }
    }
}

/// Any proximity.
pub const PROXIMITY_ANY: u8 = 0xFF;
/// Any transport.
pub const TRANSPORT_ANY: u16 = 0xFFFF;
/// The local (in-process) transport bit.
pub const TRANSPORT_LOCAL: u16 = 0x0001;

/// Options negotiated when binding and joining sessions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOpts {
    /// Traffic class.
    pub traffic: TrafficType,
    /// Proximity mask.
    pub proximity: u8,
    /// Transport mask.
    pub transports: u16,
    /// Whether more than two parties may participate.
    pub multipoint: bool,
}

impl Default for SessionOpts {
    fn default() -> Self {
        Self {
            traffic: TrafficType::Messages,
            proximity: PROXIMITY_ANY,
            transports: TRANSPORT_ANY,
            multipoint: false,
        }
    }
}

impl SessionOpts {
    /// A multipoint variant of the default options.
    #[must_use]
    pub fn multipoint() -> Self {
        Self {
            multipoint: true,
            ..Self::default()
        }
    }

    /// Compatibility predicate used when a joiner meets a bound port.
    #[must_use]
    pub const fn is_compatible(&self, other: &Self) -> bool {
        self.traffic.code() == other.traffic.code()
            && (self.proximity & other.proximity) != 0
            && (self.transports & other.transports) != 0
    }

    /// Serializes to the wire `a{sv}` dictionary.
    #[must_use]
    pub fn to_msgarg(&self) -> MsgArg {
        dict_sv(vec![
            ("traf", MsgArg::Byte(self.traffic.code())),
            ("prox", MsgArg::Byte(self.proximity)),
            ("trans", MsgArg::Uint16(self.transports)),
            ("multi", MsgArg::Boolean(self.multipoint)),
        ])
    }

    /// Parses the wire `a{sv}` dictionary; absent keys keep defaults.
    ///
    /// # Errors
    ///
    /// Returns [`Status::JoinBadOpts`] on an unknown traffic code.
    pub fn from_msgarg(arg: &MsgArg) -> Result<Self, Status> {
        let mut opts = Self::default();
        if let Some(MsgArg::Byte(code)) = dict_get(arg, "traf") {
            opts.traffic = TrafficType::from_code(*code).ok_or(Status::JoinBadOpts)?;
        }
        if let Some(MsgArg::Byte(prox)) = dict_get(arg, "prox") {
            opts.proximity = *prox;
        }
        if let Some(MsgArg::Uint16(trans)) = dict_get(arg, "trans") {
            opts.transports = *trans;
        }
        if let Some(MsgArg::Boolean(multi)) = dict_get(arg, "multi") {
            opts.multipoint = *multi;
        }
        Ok(opts)
    }
}

/// Why a session ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionLostReason {
    /// Reason unknown or not mapped.
    Invalid,
    /// The remote end left the session.
    RemoteEndLeft,
    /// The remote end closed abruptly.
    RemoteEndClosedAbruptly,
    /// The host removed this member.
    RemovedByBinder,
    /// The link timed out.
    LinkTimeout,
    /// Unspecified reason.
    Other,
}

impl SessionLostReason {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::Invalid => 0,
            Self::RemoteEndLeft => 1,
            Self::RemoteEndClosedAbruptly => 2,
            Self::RemovedByBinder => 3,
            Self::LinkTimeout => 4,
            Self::Other => 5,
        }
    }

    /// Parses a wire code; unknown codes degrade to [`Self::Other`].
    #[must_use]
    pub const fn from_code(code: u32) -> Self {
        match code {
            0 => Self::Invalid,
            1 => Self::RemoteEndLeft,
            2 => Self::RemoteEndClosedAbruptly,
            3 => Self::RemovedByBinder,
            4 => Self::LinkTimeout,
            _ => Self::Other,
        }
    }
}

/// Why a multipoint membership change happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberChangeReason {
    /// This attachment added a member locally.
    LocalMemberAdded,
    /// A remote member joined.
    RemoteMemberAdded,
    /// This attachment's own membership was removed.
    LocalMemberRemoved,
    /// A remote member left.
    RemoteMemberRemoved,
}

impl MemberChangeReason {
    /// Wire code.
    #[must_use]
    pub const fn code(self) -> u32 {
        match self {
            Self::LocalMemberAdded => 0,
            Self::RemoteMemberAdded => 1,
            Self::LocalMemberRemoved => 2,
            Self::RemoteMemberRemoved => 3,
        }
    }

    /// Parses a wire code.
    #[must_use]
    pub const fn from_code(code: u32) -> Option<Self> {
        match code {
            0 => Some(Self::LocalMemberAdded),
            1 => Some(Self::RemoteMemberAdded),
            2 => Some(Self::LocalMemberRemoved),
            3 => Some(Self::RemoteMemberRemoved),
            _ => None,
        }
    }
}

/// Which side(s) of the directory an operation targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionSide {
    /// The hosted-sessions table.
    Host,
    /// The joined-sessions table.
    Joiner,
}

impl SessionSide {
    const fn index(self) -> usize {
        match self {
            Self::Host => 0,
            Self::Joiner => 1,
        }
    }

    /// Wire disposition index (hosted = 0, joined = 1).
    #[must_use]
    pub const fn disposition(self) -> u32 {
        self.index() as u32
    }

    /// Parses a wire disposition index.
    #[must_use]
    pub const fn from_disposition(value: u32) -> Option<Self> {
        match value {
            0 => Some(Self::Host),
            1 => Some(Self::Joiner),
            _ => None,
        }
    }
}

/// Bitmask of sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSideMask(u8);

impl SessionSideMask {
    /// Host side only.
    pub const HOST: Self = Self(0b01);
    /// Joiner side only.
    pub const JOINER: Self = Self(0b10);
    /// Both sides.
    pub const BOTH: Self = Self(0b11);

    /// True if the mask includes a side.
    #[must_use]
    pub const fn includes(self, side: SessionSide) -> bool {
        self.0 & (1 << side.index()) != 0
    }
}

/// One session's bookkeeping on one side.
#[derive(Clone)]
struct SessionRecord {
    multipoint: bool,
    listener: Option<Protected<dyn SessionListener>>,
    other_participants: BTreeSet<String>,
}

/// The host/joiner session directory.
#[derive(Default)]
pub struct SessionDirectory {
    tables: [Mutex<HashMap<SessionId, SessionRecord>>; 2],
}

impl SessionDirectory {
    /// Creates an empty directory.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts (or merges) a session entry on one side.
    pub fn insert(
        &self,
        side: SessionSide,
        id: SessionId,
        multipoint: bool,
        listener: Option<Arc<dyn SessionListener>>,
        participants: impl IntoIterator<Item = String>,
    ) {
        let mut table = self.tables[side.index()].lock().unwrap();
        let record = table.entry(id).or_insert_with(|| SessionRecord {
            multipoint,
            listener: None,
            other_participants: BTreeSet::new(),
        });
        record.multipoint |= multipoint;
        if let Some(listener) = listener {
            record.listener = Some(Protected::new(listener));
        }
        record.other_participants.extend(participants);
    }

    /// True if the id exists on the side.
    #[must_use]
    pub fn exists(&self, side: SessionSide, id: SessionId) -> bool {
        self.tables[side.index()].lock().unwrap().contains_key(&id)
    }

    /// True if the id exists on both sides (host and joiner are the same
    /// attachment).
    #[must_use]
    pub fn is_self_join(&self, id: SessionId) -> bool {
        self.exists(SessionSide::Host, id) && self.exists(SessionSide::Joiner, id)
    }

    /// The multipoint flag of an entry.
    #[must_use]
    pub fn is_multipoint(&self, side: SessionSide, id: SessionId) -> Option<bool> {
        self.tables[side.index()]
            .lock()
            .unwrap()
            .get(&id)
            .map(|record| record.multipoint)
    }

    /// The other-participants set of an entry.
    #[must_use]
    pub fn participants(&self, side: SessionSide, id: SessionId) -> Option<BTreeSet<String>> {
        self.tables[side.index()]
            .lock()
            .unwrap()
            .get(&id)
            .map(|record| record.other_participants.clone())
    }

    /// Sets the session listener on the masked sides.
    ///
    /// The dual-side setter is ambiguous for a self-join id and is
    /// rejected. Otherwise the relaxed rule applies: fail only when no
    /// masked side held the session.
    ///
    /// # Errors
    ///
    /// [`Status::Fail`] for the ambiguous case, [`Status::LeaveNoSession`]
    /// when no side matched.
    pub fn set_listener(
        &self,
        id: SessionId,
        mask: SessionSideMask,
        listener: Option<Arc<dyn SessionListener>>,
    ) -> Result<(), Status> {
        if mask == SessionSideMask::BOTH && self.is_self_join(id) {
            return Err(Status::Fail);
        }
        let mut matched = 0usize;
        for side in [SessionSide::Host, SessionSide::Joiner] {
            if !mask.includes(side) {
                continue;
            }
            let mut table = self.tables[side.index()].lock().unwrap();
            if let Some(record) = table.get_mut(&id) {
                record.listener = listener.clone().map(Protected::new);
                matched += 1;
            }
        }
        if matched == 0 {
            return Err(Status::LeaveNoSession);
        }
        Ok(())
    }

    /// Removes an entry, draining any in-flight listener callback.
    /// Returns true if an entry existed.
    pub fn remove(&self, side: SessionSide, id: SessionId) -> bool {
        let removed = {
            let mut table = self.tables[side.index()].lock().unwrap();
            table.remove(&id)
        };
        match removed {
            Some(record) => {
                if let Some(listener) = record.listener {
                    // Our clone is the only bookkeeping reference left.
                    listener.wait_quiescent(1);
                }
                true
            }
            None => false,
        }
    }

    /// Handles a session-lost event for one side: removes the entry and
    /// fires `session_lost` exactly once.
    pub fn handle_session_lost(&self, side: SessionSide, id: SessionId, reason: SessionLostReason) {
        let removed = {
            let mut table = self.tables[side.index()].lock().unwrap();
            table.remove(&id)
        };
        if let Some(record) = removed {
            if let Some(listener) = record.listener {
                listener.session_lost(id, reason);
            }
        }
    }

    /// Handles a multipoint membership-change event.
    ///
    /// Receiving this signal is the surest indication the session is
    /// multipoint, so the flag is set eagerly on both entries. Host-side
    /// member-added events are filtered so a self-joined host does not see
    /// members it already saw, except for the far side of the self-join
    /// (its own unique name, or a remote-member-added reason).
    pub fn handle_member_changed(
        &self,
        id: SessionId,
        member: &str,
        added: bool,
        reason: MemberChangeReason,
        local_name: &str,
    ) {
        for side in [SessionSide::Host, SessionSide::Joiner] {
            let mut table = self.tables[side.index()].lock().unwrap();
            let Some(record) = table.get_mut(&id) else {
                continue;
            };
            record.multipoint = true;

            let deliver = if added {
                match side {
                    SessionSide::Joiner => true,
                    SessionSide::Host => {
                        member == local_name || reason == MemberChangeReason::RemoteMemberAdded
                    }
                }
            } else {
                match side {
                    SessionSide::Host => reason == MemberChangeReason::RemoteMemberRemoved,
                    SessionSide::Joiner => {
                        !(reason == MemberChangeReason::LocalMemberRemoved && member == local_name)
                    }
                }
            };
            if !deliver {
                continue;
            }
            if added {
                record.other_participants.insert(member.to_string());
            } else {
                record.other_participants.remove(member);
            }
            let listener = record.listener.clone();
            drop(table);
            if let Some(listener) = listener {
                if added {
                    listener.session_member_added(id, member);
                } else {
                    listener.session_member_removed(id, member);
                }
            }
        }
    }

    /// Removes every entry on both sides.
    pub fn clear(&self) {
        for table in &self.tables {
            table.lock().unwrap().clear();
        }
    }

    /// Session ids present on a side.
    #[must_use]
    pub fn ids(&self, side: SessionSide) -> Vec<SessionId> {
        self.tables[side.index()]
            .lock()
            .unwrap()
            .keys()
            .copied()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    #[derive(Default)]
    struct Recorder {
        lost: AtomicUsize,
        added: AtomicUsize,
        removed: AtomicUsize,
    }

    impl SessionListener for Recorder {
        fn session_lost(&self, _id: SessionId, _reason: SessionLostReason) {
            self.lost.fetch_add(1, Ordering::SeqCst);
        }
        fn session_member_added(&self, _id: SessionId, _member: &str) {
            self.added.fetch_add(1, Ordering::SeqCst);
        }
        fn session_member_removed(&self, _id: SessionId, _member: &str) {
            self.removed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_opts_compatibility() {
        let host = SessionOpts::default();
        let joiner = SessionOpts {
            transports: TRANSPORT_LOCAL,
            ..SessionOpts::default()
        };
        assert!(host.is_compatible(&joiner));

        let raw = SessionOpts {
            traffic: TrafficType::RawReliable,
            ..SessionOpts::default()
        };
        assert!(!host.is_compatible(&raw));
    }

    #[test]
    fn test_opts_msgarg_round_trip() {
        let opts = SessionOpts {
            traffic: TrafficType::RawUnreliable,
            proximity: 0x02,
            transports: TRANSPORT_LOCAL,
            multipoint: true,
        };
        let parsed = SessionOpts::from_msgarg(&opts.to_msgarg()).unwrap();
        assert_eq!(parsed, opts);
    }

    #[test]
    fn test_self_join_detected_and_dual_setter_ambiguous() {
        let directory = SessionDirectory::new();
        directory.insert(SessionSide::Host, 7, true, None, [":1.1".to_string()]);
        assert!(!directory.is_self_join(7));
        directory.insert(SessionSide::Joiner, 7, true, None, [":1.1".to_string()]);
        assert!(directory.is_self_join(7));

        let listener: Arc<dyn SessionListener> = Arc::new(Recorder::default());
        assert_eq!(
            directory.set_listener(7, SessionSideMask::BOTH, Some(listener.clone())),
            Err(Status::Fail)
        );
        directory
            .set_listener(7, SessionSideMask::HOST, Some(listener.clone()))
            .unwrap();
        directory
            .set_listener(7, SessionSideMask::JOINER, Some(listener))
            .unwrap();
    }

    #[test]
    fn test_set_listener_relaxed_rule() {
        let directory = SessionDirectory::new();
        directory.insert(SessionSide::Joiner, 3, false, None, []);
        // BOTH works when only one side exists.
        directory.set_listener(3, SessionSideMask::BOTH, None).unwrap();
        assert_eq!(
            directory.set_listener(99, SessionSideMask::BOTH, None),
            Err(Status::LeaveNoSession)
        );
    }

    #[test]
    fn test_session_lost_fires_once_and_removes() {
        let directory = SessionDirectory::new();
        let recorder = Arc::new(Recorder::default());
        directory.insert(
            SessionSide::Joiner,
            5,
            false,
            Some(recorder.clone() as Arc<dyn SessionListener>),
            [],
        );

        directory.handle_session_lost(SessionSide::Joiner, 5, SessionLostReason::RemoteEndLeft);
        directory.handle_session_lost(SessionSide::Joiner, 5, SessionLostReason::RemoteEndLeft);
        assert_eq!(recorder.lost.load(Ordering::SeqCst), 1);
        assert!(!directory.exists(SessionSide::Joiner, 5));
    }

    #[test]
    fn test_member_change_sets_multipoint_eagerly() {
        let directory = SessionDirectory::new();
        directory.insert(SessionSide::Joiner, 9, false, None, []);
        directory.handle_member_changed(
            9,
            ":1.7",
            true,
            MemberChangeReason::RemoteMemberAdded,
            ":1.2",
        );
        assert_eq!(directory.is_multipoint(SessionSide::Joiner, 9), Some(true));
        assert!(directory
            .participants(SessionSide::Joiner, 9)
            .unwrap()
            .contains(":1.7"));
    }

    #[test]
    fn test_self_join_host_filter() {
        let directory = SessionDirectory::new();
        let host_listener = Arc::new(Recorder::default());
        let joiner_listener = Arc::new(Recorder::default());
        let local = ":1.1";
        directory.insert(
            SessionSide::Host,
            4,
            true,
            Some(host_listener.clone() as Arc<dyn SessionListener>),
            [],
        );
        directory.insert(
            SessionSide::Joiner,
            4,
            true,
            Some(joiner_listener.clone() as Arc<dyn SessionListener>),
            [],
        );

        // The self-join add (member == local name) reaches both sides.
        directory.handle_member_changed(4, local, true, MemberChangeReason::LocalMemberAdded, local);
        assert_eq!(host_listener.added.load(Ordering::SeqCst), 1);
        assert_eq!(joiner_listener.added.load(Ordering::SeqCst), 1);

        // A local-member-added for some other member is filtered on the
        // host side but seen by the joiner side.
        directory.handle_member_changed(
            4,
            ":1.9",
            true,
            MemberChangeReason::LocalMemberAdded,
            local,
        );
        assert_eq!(host_listener.added.load(Ordering::SeqCst), 1);
        assert_eq!(joiner_listener.added.load(Ordering::SeqCst), 2);

        // Remote-member-added reaches the host side too.
        directory.handle_member_changed(
            4,
            ":1.10",
            true,
            MemberChangeReason::RemoteMemberAdded,
            local,
        );
        assert_eq!(host_listener.added.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_member_removed_filters() {
        let directory = SessionDirectory::new();
        let joiner_listener = Arc::new(Recorder::default());
        let local = ":1.1";
        directory.insert(
            SessionSide::Joiner,
            6,
            true,
            Some(joiner_listener.clone() as Arc<dyn SessionListener>),
            [":1.5".to_string()],
        );

        // A joiner is not interested in its own local removal.
        directory.handle_member_changed(
            6,
            local,
            false,
            MemberChangeReason::LocalMemberRemoved,
            local,
        );
        assert_eq!(joiner_listener.removed.load(Ordering::SeqCst), 0);

        directory.handle_member_changed(
            6,
            ":1.5",
            false,
            MemberChangeReason::RemoteMemberRemoved,
            local,
        );
        assert_eq!(joiner_listener.removed.load(Ordering::SeqCst), 1);
        assert!(directory
            .participants(SessionSide::Joiner, 6)
            .unwrap()
            .is_empty());
    }
}
