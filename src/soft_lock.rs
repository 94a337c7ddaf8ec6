use ahash::AHashMap as HashMap;
use parking_lot::{Condvar, Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::data_store::element::{Element, Key};
use crate::transaction::TransactionId;

/// Lifecycle of a soft lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SoftLockState {
    /// Created but not yet published or locked.
    Created,
    /// Held by its owner; foreign writers wait for release.
    Locked,
    /// Being finalized by the owner's commit or rollback, or by a reclaimer.
    Frozen,
    /// Terminal. Waiters have been woken.
    Released,
}

/// A per-key marker placed in the underlying store by a local transaction.
///
/// It carries the committed element (`old`) and the pending one (`new`). The
/// owner sees `new`, everybody else sees `old`, until the lock is frozen and
/// replaced by the element matching the owner's decision.
pub struct SoftLock {
    owner: TransactionId,
    key: Key,
    old_element: Option<Element>,
    new_element: Mutex<Option<Element>>,
    was_pinned: bool,
    state: Mutex<SoftLockState>,
    released: Condvar,
}

impl SoftLock {
    pub fn new(
        owner: TransactionId,
        key: Key,
        new_element: Option<Element>,
        old_element: Option<Element>,
        was_pinned: bool,
    ) -> Self {
        Self {
            owner,
            key,
            old_element,
            new_element: Mutex::new(new_element),
            was_pinned,
            state: Mutex::new(SoftLockState::Created),
            released: Condvar::new(),
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn owner(&self) -> &TransactionId {
        &self.owner
    }

    /// Whether the key was pinned before this lock pinned it.
    pub fn was_pinned(&self) -> bool {
        self.was_pinned
    }

    pub fn state(&self) -> SoftLockState {
        *self.state.lock()
    }

    pub fn is_frozen(&self) -> bool {
        self.state() == SoftLockState::Frozen
    }

    /// Takes the lock on behalf of its owner.
    pub fn lock(&self) {
        let mut state = self.state.lock();
        if *state == SoftLockState::Created {
            *state = SoftLockState::Locked;
        }
    }

    /// Waits up to `timeout` for the lock to be released.
    ///
    /// Returns `true` once the lock is released, or as soon as the owner's
    /// transaction has expired, in which case the caller is expected to reclaim
    /// it. Returns `false` on timeout.
    pub fn try_lock(&self, timeout: Duration) -> bool {
        const EXPIRY_POLL: Duration = Duration::from_millis(50);

        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.state.lock();
        loop {
            match *state {
                SoftLockState::Released => return true,
                SoftLockState::Locked if self.owner.is_expired() => return true,
                _ => {}
            }
            let now = Instant::now();
            let wake = match deadline {
                Some(deadline) if deadline <= now => return false,
                Some(deadline) => deadline.min(now + EXPIRY_POLL),
                None => now + EXPIRY_POLL,
            };
            self.released.wait_until(&mut state, wake);
        }
    }

    /// Moves the lock from `Locked` to `Frozen` for its owner's finalization.
    /// Returns `false` if a reclaimer got there first.
    pub fn freeze(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SoftLockState::Locked {
            *state = SoftLockState::Frozen;
            true
        } else {
            false
        }
    }

    /// Locks and freezes an expired lock in one step. At most one caller wins.
    pub fn try_reclaim(&self) -> bool {
        let mut state = self.state.lock();
        if *state == SoftLockState::Locked && self.owner.is_expired() {
            *state = SoftLockState::Frozen;
            true
        } else {
            false
        }
    }

    pub fn unfreeze(&self) {
        let mut state = self.state.lock();
        if *state == SoftLockState::Frozen {
            *state = SoftLockState::Locked;
        }
    }

    /// Releases the lock and wakes every waiter.
    pub fn unlock(&self) {
        *self.state.lock() = SoftLockState::Released;
        self.released.notify_all();
    }

    /// Expired: still held, and the owner passed its deadline without deciding.
    pub fn is_expired(&self) -> bool {
        self.state() == SoftLockState::Locked && self.owner.is_expired()
    }

    /// The element visible to `current`: the pending one for the owner, the
    /// committed one for everybody else.
    pub fn element(&self, current: &TransactionId) -> Option<Element> {
        if &self.owner == current {
            self.new_element.lock().clone()
        } else {
            self.old_element.clone()
        }
    }

    pub fn old_element(&self) -> Option<&Element> {
        self.old_element.as_ref()
    }

    /// Swaps in a new pending element and returns the previous one.
    pub fn update_element(&self, element: Option<Element>) -> Option<Element> {
        std::mem::replace(&mut *self.new_element.lock(), element)
    }

    /// The element that replaces this lock once frozen: the pending element if
    /// the owner decided to commit, the committed one otherwise.
    pub fn frozen_element(&self) -> Option<Element> {
        debug_assert!(self.is_frozen(), "soft lock on [{}] is not frozen", self.key);
        if self.owner.is_decision_commit() {
            self.new_element.lock().clone()
        } else {
            self.old_element.clone()
        }
    }
}

impl fmt::Debug for SoftLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SoftLock")
            .field("owner", &self.owner)
            .field("key", &self.key)
            .field("state", &self.state())
            .field("was_pinned", &self.was_pinned)
            .finish()
    }
}

/// Live soft locks of one cache, keyed by the key they guard.
#[derive(Default)]
pub struct SoftLockManager {
    locks: RwLock<HashMap<Key, Arc<SoftLock>>>,
}

impl SoftLockManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, lock: &Arc<SoftLock>) {
        self.locks.write().insert(lock.key().clone(), Arc::clone(lock));
    }

    /// Forgets `lock`, unless a newer lock already took its key.
    pub fn clear(&self, lock: &Arc<SoftLock>) {
        let mut locks = self.locks.write();
        if locks.get(lock.key()).is_some_and(|current| Arc::ptr_eq(current, lock)) {
            locks.remove(lock.key());
        }
    }

    /// Keys whose soft lock hides any element from `transaction`.
    pub fn keys_invisible_in(&self, transaction: &TransactionId) -> Vec<Key> {
        self.locks
            .read()
            .values()
            .filter(|lock| lock.state() != SoftLockState::Released)
            .filter(|lock| lock.element(transaction).is_none())
            .map(|lock| lock.key().clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }
}
