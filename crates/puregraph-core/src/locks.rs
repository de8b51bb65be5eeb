//! Key-scoped lock managers.
//!
//! [`KeyLockManager`] hands out one exclusive lock per key and
//! [`KeyReadWriteLockManager`] one reader/writer lock per key. Keys are
//! created lazily on first use and live until [`retain_active`] sweeps
//! them, so the tables only grow with the set of keys actually touched.
//!
//! Guards are owned (`Arc`-backed), so they can be held across calls and
//! stored in collections without borrowing the manager.
//!
//! [`retain_active`]: KeyLockManager::retain_active

use std::hash::Hash;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::lock_api::{ArcMutexGuard, ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{Mutex, RawMutex, RawRwLock, RwLock};

use crate::id::NodeId;

/// Owned guard for a [`KeyLockManager`] lock.
pub type KeyGuard = ArcMutexGuard<RawMutex, ()>;
/// Owned shared guard for a [`KeyReadWriteLockManager`] lock.
pub type KeyReadGuard = ArcRwLockReadGuard<RawRwLock, ()>;
/// Owned exclusive guard for a [`KeyReadWriteLockManager`] lock.
pub type KeyWriteGuard = ArcRwLockWriteGuard<RawRwLock, ()>;

/// One exclusive lock per key.
#[derive(Debug)]
pub struct KeyLockManager<K: Eq + Hash> {
    locks: DashMap<K, Arc<Mutex<()>>>,
}

impl<K: Eq + Hash + Clone> KeyLockManager<K> {
    pub fn new() -> Self {
        KeyLockManager {
            locks: DashMap::new(),
        }
    }

    /// Blocks until the lock for `key` is held.
    pub fn lock(&self, key: &K) -> KeyGuard {
        let lock = self.lock_for(key);
        if let Some(guard) = lock.try_lock_arc() {
            return guard;
        }
        tracing::trace!("waiting for key lock");
        lock.lock_arc()
    }

    /// Takes the lock for `key` only if it is free.
    pub fn try_lock(&self, key: &K) -> Option<KeyGuard> {
        self.lock_for(key).try_lock_arc()
    }

    /// Locks several keys, always in the given order. Callers that share
    /// keys must pass them in a consistent (e.g. sorted) order.
    pub fn lock_all<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Vec<KeyGuard>
    where
        K: 'a,
    {
        keys.into_iter().map(|k| self.lock(k)).collect()
    }

    pub fn is_locked(&self, key: &K) -> bool {
        self.locks
            .get(key)
            .map(|l| l.is_locked())
            .unwrap_or(false)
    }

    /// Drops lock entries nobody holds or waits on. Returns how many were removed.
    pub fn retain_active(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    /// The shard guard is dropped before the caller blocks on the lock.
    fn lock_for(&self, key: &K) -> Arc<Mutex<()>> {
        let entry = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(entry.value())
    }
}

impl<K: Eq + Hash + Clone> Default for KeyLockManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// One reader/writer lock per key.
#[derive(Debug)]
pub struct KeyReadWriteLockManager<K: Eq + Hash> {
    locks: DashMap<K, Arc<RwLock<()>>>,
}

impl<K: Eq + Hash + Clone> KeyReadWriteLockManager<K> {
    pub fn new() -> Self {
        KeyReadWriteLockManager {
            locks: DashMap::new(),
        }
    }

    pub fn read(&self, key: &K) -> KeyReadGuard {
        self.lock_for(key).read_arc()
    }

    pub fn write(&self, key: &K) -> KeyWriteGuard {
        let lock = self.lock_for(key);
        if let Some(guard) = lock.try_write_arc() {
            return guard;
        }
        tracing::trace!("waiting for key write lock");
        lock.write_arc()
    }

    pub fn try_read(&self, key: &K) -> Option<KeyReadGuard> {
        self.lock_for(key).try_read_arc()
    }

    pub fn try_write(&self, key: &K) -> Option<KeyWriteGuard> {
        self.lock_for(key).try_write_arc()
    }

    /// Write-locks several keys in the given order.
    pub fn write_all<'a>(&self, keys: impl IntoIterator<Item = &'a K>) -> Vec<KeyWriteGuard>
    where
        K: 'a,
    {
        keys.into_iter().map(|k| self.write(k)).collect()
    }

    pub fn retain_active(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }

    fn lock_for(&self, key: &K) -> Arc<RwLock<()>> {
        let entry = self
            .locks
            .entry(key.clone())
            .or_insert_with(|| Arc::new(RwLock::new(())));
        Arc::clone(entry.value())
    }
}

impl<K: Eq + Hash + Clone> Default for KeyReadWriteLockManager<K> {
    fn default() -> Self {
        Self::new()
    }
}

/// Locks owned by a [`NodeRepository`](crate::repository::NodeRepository).
#[derive(Debug, Default)]
pub struct RepositoryLocks {
    /// Per-source locks. Compilation batches write-lock the sources they
    /// touch; readers that walk a source's nodes take the read side.
    pub sources: KeyReadWriteLockManager<String>,
    /// Per-node locks for check-then-create sequences on shared containers.
    pub nodes: KeyLockManager<NodeId>,
}
