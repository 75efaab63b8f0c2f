//! Per-cache-key exclusive locks.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use dashmap::DashMap;
use rustc_hash::FxBuildHasher;

use super::CacheKey;

/// One mutex per cache key, created on first use and dropped once nobody
/// holds or waits for it.
///
/// Holders of different keys never contend; holders of the same key are
/// serialized. The table only ever contains keys that are in use, so a
/// long-running process does not accumulate one entry per key it ever saw.
#[derive(Debug, Default)]
pub struct KeyedLocks {
    slots: DashMap<CacheKey, Arc<Mutex<()>>, FxBuildHasher>,
}

/// Drops the table entry for a key when the last user lets go of it.
struct Release<'a> {
    locks: &'a KeyedLocks,
    key: &'a CacheKey,
}

impl Drop for Release<'_> {
    fn drop(&mut self) {
        // Anyone else still holding a clone is either inside or queued
        self.locks
            .slots
            .remove_if(self.key, |_, slot| Arc::strong_count(slot) == 1);
    }
}

impl KeyedLocks {
    /// Create an empty lock table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` while holding the lock for `key`.
    ///
    /// Blocks until no other caller holds the same key.
    pub fn with_lock<R>(&self, key: &CacheKey, f: impl FnOnce() -> R) -> R {
        // Drop order matters: the guard, then our clone, then the release
        let _release = Release { locks: self, key };
        let slot = self.slot(key);
        let _held = hold(&slot);
        f()
    }

    fn slot(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        Arc::clone(
            self.slots
                .entry(key.clone())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .value(),
        )
    }

    /// Number of keys currently held or waited on.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Check if no key is currently locked.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }
}

/// Block until the slot is free, then hold it until the guard drops.
///
/// The mutex guards no data, so a poisoned lock is still usable.
fn hold(slot: &Mutex<()>) -> MutexGuard<'_, ()> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}
