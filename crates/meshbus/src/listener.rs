//! Listener traits and the protected handles that guarantee unregister
//! quiescence.
//!
//! Every listener registration is wrapped in a reference-counted
//! [`Protected`] handle. Callbacks run on clones of the handle, so the
//! count stays elevated while a callback is in flight; unregister removes
//! the set entry and then waits (bounded sleeps) for the count to fall back
//! to its quiescent value. A listener is never invoked after its
//! unregister call returns.

use std::sync::Arc;
use std::time::Duration;

use crate::session::{SessionId, SessionLostReason, SessionOpts, SessionPort};

/// Sleep quantum while waiting for in-flight callbacks to drain.
const QUIESCENCE_SLEEP: Duration = Duration::from_millis(4);

/// Reference-counted protective handle around a listener.
///
/// The count tracks *handle* clones (the registration entry plus any
/// snapshot taken for an in-flight callback), not the application's own
/// references to the listener, so quiescence is observable no matter how
/// many `Arc`s the application keeps.
pub struct Protected<T: ?Sized> {
    cell: Arc<Arc<T>>,
}

impl<T: ?Sized> Protected<T> {
    /// Wraps a listener.
    #[must_use]
    pub fn new(listener: Arc<T>) -> Self {
        Self {
            cell: Arc::new(listener),
        }
    }

    /// Number of live handle clones (registration entry + snapshots).
    #[must_use]
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.cell)
    }

    /// True if this handle wraps the same listener instance.
    #[must_use]
    pub fn is(&self, other: &Arc<T>) -> bool {
        Arc::ptr_eq(&*self.cell, other)
    }

    /// Blocks until no handle clone besides `expected` remains.
    pub fn wait_quiescent(&self, expected: usize) {
        while self.ref_count() > expected {
            std::thread::sleep(QUIESCENCE_SLEEP);
        }
    }
}

impl<T: ?Sized> Clone for Protected<T> {
    fn clone(&self) -> Self {
        Self {
            cell: Arc::clone(&self.cell),
        }
    }
}

impl<T: ?Sized> std::ops::Deref for Protected<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.cell
    }
}

impl<T: ?Sized> AsRef<Arc<T>> for Protected<T> {
    fn as_ref(&self) -> &Arc<T> {
        &self.cell
    }
}

/// A set of protected listeners with quiescent unregistration.
pub struct ListenerSet<T: ?Sized> {
    entries: std::sync::Mutex<Vec<Protected<T>>>,
}

impl<T: ?Sized> Default for ListenerSet<T> {
    fn default() -> Self {
        Self {
            entries: std::sync::Mutex::new(Vec::new()),
        }
    }
}

impl<T: ?Sized> ListenerSet<T> {
    /// Adds a listener.
    pub fn register(&self, listener: Arc<T>) {
        let mut entries = self.entries.lock().unwrap();
        entries.push(Protected::new(listener));
    }

    /// Removes a listener and blocks until no callback is in flight on it.
    /// Returns false if the listener was not registered.
    pub fn unregister(&self, listener: &Arc<T>) -> bool {
        let removed = {
            let mut entries = self.entries.lock().unwrap();
            match entries.iter().position(|entry| entry.is(listener)) {
                Some(index) => Some(entries.remove(index)),
                None => None,
            }
        };
        match removed {
            Some(entry) => {
                // Only the removed handle itself remains once every
                // in-flight callback snapshot drains.
                entry.wait_quiescent(1);
                true
            }
            None => false,
        }
    }

    /// Removes every listener, draining in-flight callbacks.
    pub fn clear(&self) {
        loop {
            let entry = {
                let mut entries = self.entries.lock().unwrap();
                entries.pop()
            };
            match entry {
                Some(entry) => entry.wait_quiescent(1),
                None => break,
            }
        }
    }

    /// Snapshot of the current entries for invocation outside the lock.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Protected<T>> {
        self.entries.lock().unwrap().clone()
    }

    /// Number of registered listeners.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    /// True when no listener is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Attachment-lifecycle and discovery callbacks.
pub trait BusListener: Send + Sync {
    /// The listener was registered with an attachment.
    fn listener_registered(&self) {}
    /// The listener was unregistered.
    fn listener_unregistered(&self) {}
    /// An advertised name matching an active discovery was found.
    fn found_advertised_name(&self, _name: &str, _transport: u16, _prefix: &str) {}
    /// A previously found advertised name vanished.
    fn lost_advertised_name(&self, _name: &str, _transport: u16, _prefix: &str) {}
    /// Ownership of a bus name changed.
    fn name_owner_changed(&self, _name: &str, _previous: Option<&str>, _new: Option<&str>) {}
    /// The attachment is stopping.
    fn bus_stopping(&self) {}
    /// The attachment lost its router connection.
    fn bus_disconnected(&self) {}
}

/// Per-session callbacks.
pub trait SessionListener: Send + Sync {
    /// The session was lost.
    fn session_lost(&self, _id: SessionId, _reason: SessionLostReason) {}
    /// A member joined a multipoint session.
    fn session_member_added(&self, _id: SessionId, _member: &str) {}
    /// A member left a multipoint session.
    fn session_member_removed(&self, _id: SessionId, _member: &str) {}
}

/// Host-side session-port callbacks.
pub trait SessionPortListener: Send + Sync {
    /// Accept or reject a joiner. The default rejects, so hosts must opt in.
    fn accept_session_joiner(&self, _port: SessionPort, _joiner: &str, _opts: &SessionOpts) -> bool {
        false
    }
    /// A joiner was admitted and the session id assigned.
    fn session_joined(&self, _port: SessionPort, _id: SessionId, _joiner: &str) {}
}

/// Announcement callbacks.
pub trait AboutListener: Send + Sync {
    /// An announcement was received.
    fn announced(
        &self,
        _bus_name: &str,
        _version: u16,
        _port: SessionPort,
        _object_description: &crate::args::MsgArg,
        _about_data: &crate::args::MsgArg,
    ) {
    }
}

/// Claim-state change callbacks.
pub trait ApplicationStateListener: Send + Sync {
    /// A peer (or this application) changed claim state.
    fn state(
        &self,
        _bus_name: &str,
        _public_key: &[u8],
        _state: meshbus_core::permission::ApplicationState,
    ) {
    }
}
