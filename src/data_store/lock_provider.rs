use ahash::RandomState;
use parking_lot::{Condvar, Mutex};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::data_store::element::Key;
use crate::storage::CacheLockProvider;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockType {
    Read,
    Write,
}

#[derive(Debug, Default)]
struct SyncState {
    readers: usize,
    writer: bool,
}

/// A reader/writer lock without guards.
///
/// Locks taken during XA prepare are released by a later commit or rollback,
/// possibly from another thread, so ownership is not tracked.
#[derive(Debug, Default)]
pub struct KeySync {
    state: Mutex<SyncState>,
    changed: Condvar,
}

impl KeySync {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lock(&self, lock_type: LockType) {
        let mut state = self.state.lock();
        while !Self::grantable(&state, lock_type) {
            self.changed.wait(&mut state);
        }
        Self::grant(&mut state, lock_type);
    }

    /// Waits at most `timeout` for the lock. Returns `false` on timeout.
    pub fn try_lock(&self, lock_type: LockType, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        while !Self::grantable(&state, lock_type) {
            match deadline {
                Some(deadline) => {
                    if self.changed.wait_until(&mut state, deadline).timed_out()
                        && !Self::grantable(&state, lock_type)
                    {
                        return false;
                    }
                }
                None => self.changed.wait(&mut state),
            }
        }
        Self::grant(&mut state, lock_type);
        true
    }

    pub fn unlock(&self, lock_type: LockType) {
        let mut state = self.state.lock();
        match lock_type {
            LockType::Read => state.readers = state.readers.saturating_sub(1),
            LockType::Write => state.writer = false,
        }
        drop(state);
        self.changed.notify_all();
    }

    pub fn is_held_by_writer(&self) -> bool {
        self.state.lock().writer
    }

    fn grantable(state: &SyncState, lock_type: LockType) -> bool {
        match lock_type {
            LockType::Read => !state.writer,
            LockType::Write => !state.writer && state.readers == 0,
        }
    }

    fn grant(state: &mut SyncState, lock_type: LockType) {
        match lock_type {
            LockType::Read => state.readers += 1,
            LockType::Write => state.writer = true,
        }
    }
}

/// Hands out a fixed pool of [`KeySync`]s, mapping keys to stripes by hash.
pub struct StripedLockProvider {
    stripes: Vec<Arc<KeySync>>,
    hasher: RandomState,
}

impl StripedLockProvider {
    pub fn new(stripes: usize) -> Self {
        Self {
            stripes: (0..stripes.max(1)).map(|_| Arc::new(KeySync::new())).collect(),
            hasher: RandomState::new(),
        }
    }

    fn stripe_index(&self, key: &str) -> usize {
        (self.hasher.hash_one(key) % self.stripes.len() as u64) as usize
    }

    /// Stripes for `keys`, de-duplicated, in order of first appearance.
    fn stripes_for(&self, keys: &[Key]) -> Vec<Arc<KeySync>> {
        let mut seen = vec![false; self.stripes.len()];
        let mut syncs = Vec::with_capacity(keys.len());
        for key in keys {
            let index = self.stripe_index(key);
            if !seen[index] {
                seen[index] = true;
                syncs.push(Arc::clone(&self.stripes[index]));
            }
        }
        syncs
    }
}

impl CacheLockProvider for StripedLockProvider {
    fn sync_for_key(&self, key: &str) -> Arc<KeySync> {
        Arc::clone(&self.stripes[self.stripe_index(key)])
    }

    fn write_lock_all_for_keys(&self, keys: &[Key], timeout: Duration) -> Option<Vec<Arc<KeySync>>> {
        let syncs = self.stripes_for(keys);
        for (taken, sync) in syncs.iter().enumerate() {
            if !sync.try_lock(LockType::Write, timeout) {
                for held in &syncs[..taken] {
                    held.unlock(LockType::Write);
                }
                return None;
            }
        }
        Some(syncs)
    }

    fn unlock_write_lock_for_all_keys(&self, keys: &[Key]) {
        for sync in self.stripes_for(keys) {
            sync.unlock(LockType::Write);
        }
    }
}
