//! Method and signal dispatch tables.
//!
//! Receivers are tagged values: a handler function plus a receiver id, not
//! an object with virtual dispatch. Method lookups return an `Arc` snapshot
//! whose lifetime survives a concurrent unregister; signal delivery copies
//! the matching entries out under the table lock and invokes them after
//! releasing it.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use meshbus_core::status::Status;

use crate::args::MsgArg;
use crate::iface::{Member, SecurityPolicy};
use crate::match_rule::MatchRule;
use crate::message::Message;

/// Identifies a callback receiver for registration bookkeeping.
pub type ReceiverId = u64;

static NEXT_RECEIVER: AtomicU64 = AtomicU64::new(1);

/// Mints a fresh receiver id.
#[must_use]
pub fn next_receiver_id() -> ReceiverId {
    NEXT_RECEIVER.fetch_add(1, Ordering::Relaxed)
}

/// Outcome a method handler reports.
#[derive(Debug, Clone)]
pub enum MethodResult {
    /// Reply with these output arguments.
    Reply(Vec<MsgArg>),
    /// Reply with a named error.
    Error {
        /// Wire error name.
        name: String,
        /// Human-readable description.
        description: String,
    },
    /// Produce no reply (for fire-and-forget members).
    NoReply,
}

/// A method handler: `(member, message) -> result`.
pub type MethodHandler = Arc<dyn Fn(&Member, &Message) -> MethodResult + Send + Sync>;

/// A signal handler: `(member, source path, message)`.
pub type SignalHandler = Arc<dyn Fn(&Member, &str, &Message) + Send + Sync>;

/// One method-table entry.
pub struct MethodEntry {
    /// Object path the member lives at.
    pub path: String,
    /// Interface name.
    pub iface_name: String,
    /// The member descriptor.
    pub member: Member,
    /// Security policy of the owning interface.
    pub policy: SecurityPolicy,
    /// Whether the owning object is secure.
    pub object_secure: bool,
    /// Receiver for active-handler bookkeeping.
    pub receiver: ReceiverId,
    /// The handler.
    pub handler: MethodHandler,
}

/// Table keyed on (path, interface, member).
#[derive(Default)]
pub struct MethodTable {
    map: RwLock<HashMap<(String, String, String), Arc<MethodEntry>>>,
}

impl MethodTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry, replacing any previous one for the same key.
    pub fn add(&self, entry: MethodEntry) {
        let key = (
            entry.path.clone(),
            entry.iface_name.clone(),
            entry.member.name.clone(),
        );
        self.map.write().unwrap().insert(key, Arc::new(entry));
    }

    /// Looks up an entry. The returned snapshot stays valid across a
    /// concurrent unregister.
    #[must_use]
    pub fn find(&self, path: &str, iface: &str, member: &str) -> Option<Arc<MethodEntry>> {
        self.map
            .read()
            .unwrap()
            .get(&(path.to_string(), iface.to_string(), member.to_string()))
            .cloned()
    }

    /// True if any entry exists at (path, interface).
    #[must_use]
    pub fn implements_interface(&self, path: &str, iface: &str) -> bool {
        self.map
            .read()
            .unwrap()
            .keys()
            .any(|(p, i, _)| p == path && i == iface)
    }

    /// Removes every entry registered at `path`.
    pub fn remove_path(&self, path: &str) {
        self.map.write().unwrap().retain(|(p, _, _), _| p != path);
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.map.read().unwrap().len()
    }

    /// True when the table holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One signal-table entry.
#[derive(Clone)]
pub struct SignalEntry {
    /// Receiver for active-handler bookkeeping and unregistration.
    pub receiver: ReceiverId,
    /// The handler.
    pub handler: SignalHandler,
    /// The member descriptor.
    pub member: Member,
    /// Security policy of the owning interface.
    pub policy: SecurityPolicy,
    /// Match rule constraining delivery.
    pub rule: MatchRule,
}

/// Multiset keyed on (interface, member).
#[derive(Default)]
pub struct SignalTable {
    map: Mutex<HashMap<(String, String), Vec<SignalEntry>>>,
}

impl SignalTable {
    /// Creates an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds an entry under (interface, member).
    pub fn add(&self, iface: &str, entry: SignalEntry) {
        let key = (iface.to_string(), entry.member.name.clone());
        self.map.lock().unwrap().entry(key).or_default().push(entry);
    }

    /// Snapshot of the entries whose rule matches `msg`, copied out under
    /// the lock so callbacks run without holding it.
    #[must_use]
    pub fn find_matching(&self, msg: &Message) -> Vec<SignalEntry> {
        let map = self.map.lock().unwrap();
        map.get(&(msg.interface().to_string(), msg.member().to_string()))
            .map(|entries| {
                entries
                    .iter()
                    .filter(|entry| entry.rule.is_match(msg))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes a specific registration.
    ///
    /// # Errors
    ///
    /// [`Status::Fail`] if no matching registration exists.
    pub fn remove(
        &self,
        receiver: ReceiverId,
        iface: &str,
        member: &str,
        rule: Option<&MatchRule>,
    ) -> Result<(), Status> {
        let mut map = self.map.lock().unwrap();
        let key = (iface.to_string(), member.to_string());
        let Some(entries) = map.get_mut(&key) else {
            return Err(Status::Fail);
        };
        let before = entries.len();
        entries.retain(|entry| {
            entry.receiver != receiver || rule.is_some_and(|r| *r != entry.rule)
        });
        let removed = before != entries.len();
        if entries.is_empty() {
            map.remove(&key);
        }
        if removed {
            Ok(())
        } else {
            Err(Status::Fail)
        }
    }

    /// Removes every registration belonging to `receiver`.
    pub fn remove_all(&self, receiver: ReceiverId) {
        let mut map = self.map.lock().unwrap();
        map.retain(|_, entries| {
            entries.retain(|entry| entry.receiver != receiver);
            !entries.is_empty()
        });
    }
}
