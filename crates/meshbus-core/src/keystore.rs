//! Store for negotiated master secrets, keyed by (scope, peer GUID).
//!
//! The backing file, when configured, is owned exclusively by one attachment
//! at a time via an advisory file lock held for the lifetime of the store.
//! The on-disk format is an opaque stream of length-prefixed records; nothing
//! outside this module depends on it.
//!
//! Mutex poisoning indicates a panic in another thread, which is
//! unrecoverable.

#![allow(clippy::missing_panics_doc)]

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use bytes::{Buf, BufMut, BytesMut};
use fs2::FileExt;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tracing::{debug, warn};
use zeroize::Zeroizing;

use crate::cert::current_epoch_seconds;
use crate::guid::Guid128;
use crate::status::Status;

/// Errors raised by key-store operations.
#[derive(Debug, Error)]
pub enum KeyStoreError {
    /// I/O failure on the backing file.
    #[error("key store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Another attachment holds the advisory lock on the backing file.
    #[error("key store file is locked by another attachment: {path}")]
    Locked {
        /// The contested path.
        path: PathBuf,
    },

    /// The backing file does not parse as a record stream.
    #[error("key store file is corrupt")]
    Corrupt,

    /// The store was already initialized with a backing file.
    #[error("key store is already initialized")]
    AlreadyInitialized,

    /// No key is stored under the requested (scope, GUID).
    #[error("key unavailable")]
    KeyUnavailable,
}

impl From<KeyStoreError> for Status {
    fn from(err: KeyStoreError) -> Self {
        match err {
            KeyStoreError::KeyUnavailable => Status::KeyUnavailable,
            KeyStoreError::Corrupt => Status::InvalidData,
            _ => Status::Fail,
        }
    }
}

/// Whether a record describes the local attachment or a remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyScope {
    /// The attachment's own key material.
    Local,
    /// A remote peer's negotiated key material.
    Remote,
}

/// Key-store index: scope plus peer GUID.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct KeyStoreKey {
    /// Record scope.
    pub scope: KeyScope,
    /// Peer (or own) GUID.
    pub guid: Guid128,
}

impl KeyStoreKey {
    /// Index for a local record.
    #[must_use]
    pub const fn local(guid: Guid128) -> Self {
        Self {
            scope: KeyScope::Local,
            guid,
        }
    }

    /// Index for a remote peer record.
    #[must_use]
    pub const fn remote(guid: Guid128) -> Self {
        Self {
            scope: KeyScope::Remote,
            guid,
        }
    }
}

/// A stored secret with its tag and optional expiration.
#[derive(Clone)]
pub struct KeyBlob {
    secret: Zeroizing<Vec<u8>>,
    /// Application-assigned record tag.
    pub tag: u8,
    /// Expiration in epoch seconds, if any.
    pub expiration: Option<u64>,
}

impl KeyBlob {
    /// Creates a blob with no expiration.
    #[must_use]
    pub fn new(secret: &[u8], tag: u8) -> Self {
        Self {
            secret: Zeroizing::new(secret.to_vec()),
            tag,
            expiration: None,
        }
    }

    /// Sets an expiration time.
    #[must_use]
    pub const fn with_expiration(mut self, epoch: u64) -> Self {
        self.expiration = Some(epoch);
        self
    }

    /// The secret bytes.
    #[must_use]
    pub fn secret(&self) -> &[u8] {
        &self.secret
    }

    /// True if the blob expired at or before `now`.
    #[must_use]
    pub fn is_expired(&self, now: u64) -> bool {
        self.expiration.is_some_and(|exp| exp <= now)
    }
}

impl PartialEq for KeyBlob {
    fn eq(&self, other: &Self) -> bool {
        // Secrets compare in constant time.
        self.tag == other.tag
            && self.expiration == other.expiration
            && bool::from(self.secret.ct_eq(&other.secret))
    }
}

impl Eq for KeyBlob {}

impl std::fmt::Debug for KeyBlob {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyBlob")
            .field("tag", &self.tag)
            .field("expiration", &self.expiration)
            .field("len", &self.secret.len())
            .finish()
    }
}

/// Observer for key additions and deletions.
pub trait KeyEventListener: Send + Sync {
    /// A key was added or replaced.
    fn key_added(&self, _key: &KeyStoreKey) {}
    /// A key was deleted (including by expiry).
    fn key_deleted(&self, _key: &KeyStoreKey) {}
    /// The whole store was cleared.
    fn store_cleared(&self) {}
}

struct BackingFile {
    file: File,
    path: PathBuf,
}

#[derive(Default)]
struct KeyStoreState {
    keys: HashMap<KeyStoreKey, KeyBlob>,
    backing: Option<BackingFile>,
}

/// The key store.
#[derive(Default)]
pub struct KeyStore {
    state: Mutex<KeyStoreState>,
    listener: Mutex<Option<Arc<dyn KeyEventListener>>>,
}

impl KeyStore {
    /// Creates an empty in-memory store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers the key-event listener, replacing any previous one.
    pub fn set_key_event_listener(&self, listener: Arc<dyn KeyEventListener>) {
        *self.listener.lock().unwrap() = Some(listener);
    }

    /// Attaches (and loads) the backing file, taking the advisory lock.
    ///
    /// # Errors
    ///
    /// - [`KeyStoreError::AlreadyInitialized`] if a backing file is attached.
    /// - [`KeyStoreError::Locked`] if another attachment holds the lock.
    /// - [`KeyStoreError::Corrupt`] if the file does not parse.
    pub fn init(&self, path: &Path) -> Result<(), KeyStoreError> {
        let mut state = self.state.lock().unwrap();
        if state.backing.is_some() {
            return Err(KeyStoreError::AlreadyInitialized);
        }
        let file = open_store_file(path)?;
        if file.try_lock_exclusive().is_err() {
            return Err(KeyStoreError::Locked {
                path: path.to_path_buf(),
            });
        }
        let mut backing = BackingFile {
            file,
            path: path.to_path_buf(),
        };
        state.keys = load_records(&mut backing.file)?;
        debug!(path = %backing.path.display(), records = state.keys.len(), "key store loaded");
        state.backing = Some(backing);
        Ok(())
    }

    /// True once a backing file is attached.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.state.lock().unwrap().backing.is_some()
    }

    /// Re-reads the backing file, replacing in-memory records.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors or a corrupt file; a store without a backing
    /// file reloads to itself.
    pub fn reload(&self) -> Result<(), KeyStoreError> {
        let mut state = self.state.lock().unwrap();
        if let Some(backing) = state.backing.as_mut() {
            let keys = load_records(&mut backing.file)?;
            state.keys = keys;
        }
        Ok(())
    }

    /// Drops all records and detaches (unlocks) the backing file.
    ///
    /// # Errors
    ///
    /// Fails if truncating the backing file fails.
    pub fn reset(&self) -> Result<(), KeyStoreError> {
        let mut state = self.state.lock().unwrap();
        state.keys.clear();
        if let Some(backing) = state.backing.take() {
            backing.file.set_len(0)?;
            // Lock releases when the handle drops.
        }
        drop(state);
        self.notify(|l| l.store_cleared());
        Ok(())
    }

    /// Adds or replaces a key.
    ///
    /// # Errors
    ///
    /// Fails if persisting to the backing file fails.
    pub fn add_key(&self, key: KeyStoreKey, blob: KeyBlob) -> Result<(), KeyStoreError> {
        let mut state = self.state.lock().unwrap();
        state.keys.insert(key, blob);
        persist(&mut state)?;
        drop(state);
        self.notify(|l| l.key_added(&key));
        Ok(())
    }

    /// Fetches a key. Expired records are purged and reported unavailable.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::KeyUnavailable`] if absent or expired.
    pub fn get_key(&self, key: &KeyStoreKey) -> Result<KeyBlob, KeyStoreError> {
        let mut state = self.state.lock().unwrap();
        let now = current_epoch_seconds();
        if state.keys.get(key).is_some_and(|blob| blob.is_expired(now)) {
            state.keys.remove(key);
            let _ = persist(&mut state);
            drop(state);
            self.notify(|l| l.key_deleted(key));
            return Err(KeyStoreError::KeyUnavailable);
        }
        state
            .keys
            .get(key)
            .cloned()
            .ok_or(KeyStoreError::KeyUnavailable)
    }

    /// True if a live (unexpired) key exists.
    #[must_use]
    pub fn has_key(&self, key: &KeyStoreKey) -> bool {
        self.get_key(key).is_ok()
    }

    /// Deletes a key.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::KeyUnavailable`] if no such key exists.
    pub fn del_key(&self, key: &KeyStoreKey) -> Result<(), KeyStoreError> {
        let mut state = self.state.lock().unwrap();
        if state.keys.remove(key).is_none() {
            return Err(KeyStoreError::KeyUnavailable);
        }
        persist(&mut state)?;
        drop(state);
        self.notify(|l| l.key_deleted(key));
        Ok(())
    }

    /// Sets the expiration of an existing key.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::KeyUnavailable`] if no such key exists.
    pub fn set_key_expiration(&self, key: &KeyStoreKey, epoch: u64) -> Result<(), KeyStoreError> {
        let mut state = self.state.lock().unwrap();
        let blob = state
            .keys
            .get_mut(key)
            .ok_or(KeyStoreError::KeyUnavailable)?;
        blob.expiration = Some(epoch);
        persist(&mut state)
    }

    /// Reads the expiration of an existing key.
    ///
    /// # Errors
    ///
    /// [`KeyStoreError::KeyUnavailable`] if no such key exists.
    pub fn get_key_expiration(&self, key: &KeyStoreKey) -> Result<Option<u64>, KeyStoreError> {
        let state = self.state.lock().unwrap();
        state
            .keys
            .get(key)
            .map(|blob| blob.expiration)
            .ok_or(KeyStoreError::KeyUnavailable)
    }

    /// Removes every record (the backing file, if any, is truncated but
    /// stays attached).
    pub fn clear(&self) {
        let mut state = self.state.lock().unwrap();
        state.keys.clear();
        if persist(&mut state).is_err() {
            warn!("failed to persist key store clear");
        }
        drop(state);
        self.notify(|l| l.store_cleared());
    }

    /// Number of live records.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().unwrap().keys.len()
    }

    /// True when the store holds no records.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn notify(&self, f: impl FnOnce(&Arc<dyn KeyEventListener>)) {
        let listener = self.listener.lock().unwrap().clone();
        if let Some(listener) = listener {
            f(&listener);
        }
    }
}

fn open_store_file(path: &Path) -> Result<File, KeyStoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    let mut opts = OpenOptions::new();
    opts.read(true).write(true).create(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    Ok(opts.open(path)?)
}

const EXPIRATION_NONE: u64 = u64::MAX;

fn load_records(file: &mut File) -> Result<HashMap<KeyStoreKey, KeyBlob>, KeyStoreError> {
    file.seek(SeekFrom::Start(0))?;
    let mut raw = Vec::new();
    file.read_to_end(&mut raw)?;
    let mut buf = &raw[..];
    let mut keys = HashMap::new();
    while !buf.is_empty() {
        if buf.len() < 1 + 16 + 1 + 8 + 4 {
            return Err(KeyStoreError::Corrupt);
        }
        let scope = match buf.get_u8() {
            0 => KeyScope::Local,
            1 => KeyScope::Remote,
            _ => return Err(KeyStoreError::Corrupt),
        };
        let mut guid_bytes = [0u8; 16];
        buf.copy_to_slice(&mut guid_bytes);
        let tag = buf.get_u8();
        let expiration = match buf.get_u64() {
            EXPIRATION_NONE => None,
            epoch => Some(epoch),
        };
        let len = buf.get_u32() as usize;
        if buf.len() < len {
            return Err(KeyStoreError::Corrupt);
        }
        let secret = buf.copy_to_bytes(len);
        let mut blob = KeyBlob::new(&secret, tag);
        blob.expiration = expiration;
        keys.insert(
            KeyStoreKey {
                scope,
                guid: Guid128::from_bytes(guid_bytes),
            },
            blob,
        );
    }
    Ok(keys)
}

fn persist(state: &mut KeyStoreState) -> Result<(), KeyStoreError> {
    let Some(backing) = state.backing.as_mut() else {
        return Ok(());
    };
    let mut buf = BytesMut::new();
    for (key, blob) in &state.keys {
        buf.put_u8(match key.scope {
            KeyScope::Local => 0,
            KeyScope::Remote => 1,
        });
        buf.put_slice(key.guid.as_bytes());
        buf.put_u8(blob.tag);
        buf.put_u64(blob.expiration.unwrap_or(EXPIRATION_NONE));
        #[allow(clippy::cast_possible_truncation)]
        buf.put_u32(blob.secret().len() as u32);
        buf.put_slice(blob.secret());
    }
    backing.file.set_len(0)?;
    backing.file.seek(SeekFrom::Start(0))?;
    backing.file.write_all(&buf)?;
    backing.file.sync_all()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use tempfile::TempDir;

    use super::*;

    #[test]
    fn test_in_memory_add_get_del() {
        let store = KeyStore::new();
        let key = KeyStoreKey::remote(Guid128::generate());

        store.add_key(key, KeyBlob::new(b"master-secret", 7)).unwrap();
        let blob = store.get_key(&key).unwrap();
        assert_eq!(blob.secret(), b"master-secret");
        assert_eq!(blob.tag, 7);

        store.del_key(&key).unwrap();
        assert!(matches!(
            store.get_key(&key),
            Err(KeyStoreError::KeyUnavailable)
        ));
    }

    #[test]
    fn test_expired_key_is_purged() {
        let store = KeyStore::new();
        let key = KeyStoreKey::remote(Guid128::generate());
        store
            .add_key(key, KeyBlob::new(b"old", 0).with_expiration(1))
            .unwrap();

        assert!(!store.has_key(&key));
        assert!(store.is_empty());
    }

    #[test]
    fn test_expiration_round_trip() {
        let store = KeyStore::new();
        let key = KeyStoreKey::remote(Guid128::generate());
        store.add_key(key, KeyBlob::new(b"s", 0)).unwrap();

        assert_eq!(store.get_key_expiration(&key).unwrap(), None);
        let later = current_epoch_seconds() + 3600;
        store.set_key_expiration(&key, later).unwrap();
        assert_eq!(store.get_key_expiration(&key).unwrap(), Some(later));
        assert!(store.has_key(&key));
    }

    #[test]
    fn test_file_persistence_round_trip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.store");
        let guid = Guid128::generate();

        {
            let store = KeyStore::new();
            store.init(&path).unwrap();
            store
                .add_key(KeyStoreKey::remote(guid), KeyBlob::new(b"persisted", 3))
                .unwrap();
        }

        let store = KeyStore::new();
        store.init(&path).unwrap();
        let blob = store.get_key(&KeyStoreKey::remote(guid)).unwrap();
        assert_eq!(blob.secret(), b"persisted");
        assert_eq!(blob.tag, 3);
    }

    #[test]
    fn test_advisory_lock_excludes_second_store() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("keys.store");

        let first = KeyStore::new();
        first.init(&path).unwrap();

        let second = KeyStore::new();
        assert!(matches!(
            second.init(&path),
            Err(KeyStoreError::Locked { .. })
        ));

        // Resetting the first store releases the lock.
        first.reset().unwrap();
        second.init(&path).unwrap();
    }

    #[test]
    fn test_double_init_rejected() {
        let dir = TempDir::new().unwrap();
        let store = KeyStore::new();
        store.init(&dir.path().join("a.store")).unwrap();
        assert!(matches!(
            store.init(&dir.path().join("b.store")),
            Err(KeyStoreError::AlreadyInitialized)
        ));
    }

    #[test]
    fn test_key_events() {
        #[derive(Default)]
        struct Counter {
            added: AtomicUsize,
            deleted: AtomicUsize,
            cleared: AtomicUsize,
        }
        impl KeyEventListener for Counter {
            fn key_added(&self, _key: &KeyStoreKey) {
                self.added.fetch_add(1, Ordering::SeqCst);
            }
            fn key_deleted(&self, _key: &KeyStoreKey) {
                self.deleted.fetch_add(1, Ordering::SeqCst);
            }
            fn store_cleared(&self) {
                self.cleared.fetch_add(1, Ordering::SeqCst);
            }
        }

        let store = KeyStore::new();
        let counter = Arc::new(Counter::default());
        store.set_key_event_listener(counter.clone());

        let key = KeyStoreKey::local(Guid128::generate());
        store.add_key(key, KeyBlob::new(b"x", 0)).unwrap();
        store.del_key(&key).unwrap();
        store.clear();

        assert_eq!(counter.added.load(Ordering::SeqCst), 1);
        assert_eq!(counter.deleted.load(Ordering::SeqCst), 1);
        assert_eq!(counter.cleared.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_constant_time_blob_equality() {
        let a = KeyBlob::new(b"same", 1);
        let b = KeyBlob::new(b"same", 1);
        let c = KeyBlob::new(b"diff", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
