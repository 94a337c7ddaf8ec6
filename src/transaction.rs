use ahash::AHashMap as HashMap;
use log::{debug, warn};
use parking_lot::Mutex;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use crate::errors::{CacheTxnError, Result};
use crate::local_store::LocalTransactionStore;
use crate::soft_lock::SoftLock;

const UNDECIDED: u8 = 0;
const COMMIT: u8 = 1;
const ROLLBACK: u8 = 2;

struct TransactionIdInner {
    id: u64,
    deadline: Option<Instant>,
    decision: AtomicU8,
}

/// Identity of a local transaction, shared with every soft lock it owns.
///
/// Besides the numeric id it carries the transaction's deadline and its
/// commit decision, which is all a foreign transaction needs to tell whether
/// a soft lock is expired and which element it stands for.
#[derive(Clone)]
pub struct TransactionId(Arc<TransactionIdInner>);

impl TransactionId {
    pub(crate) fn new(id: u64, timeout: Duration) -> Self {
        Self(Arc::new(TransactionIdInner {
            id,
            deadline: Instant::now().checked_add(timeout),
            decision: AtomicU8::new(UNDECIDED),
        }))
    }

    pub fn id(&self) -> u64 {
        self.0.id
    }

    /// Time left before the deadline, zero once it passed.
    pub fn remaining(&self) -> Duration {
        match self.0.deadline {
            Some(deadline) => deadline.saturating_duration_since(Instant::now()),
            None => Duration::MAX,
        }
    }

    pub fn is_timed_out(&self) -> bool {
        self.remaining().is_zero()
    }

    /// Timed out without having decided to commit or roll back.
    pub fn is_expired(&self) -> bool {
        self.0.decision.load(Ordering::Acquire) == UNDECIDED && self.is_timed_out()
    }

    pub(crate) fn mark_for_commit(&self) {
        self.0.decision.store(COMMIT, Ordering::Release);
    }

    pub(crate) fn mark_for_rollback(&self) {
        self.0.decision.store(ROLLBACK, Ordering::Release);
    }

    pub fn is_decision_commit(&self) -> bool {
        self.0.decision.load(Ordering::Acquire) == COMMIT
    }
}

impl PartialEq for TransactionId {
    fn eq(&self, other: &Self) -> bool {
        self.0.id == other.0.id
    }
}

impl Eq for TransactionId {}

impl Hash for TransactionId {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TransactionId({})", self.0.id)
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.id)
    }
}

/// Hooks around the end of a local transaction.
pub trait TransactionListener: Send + Sync {
    /// Runs before any soft lock is frozen. An error rolls the transaction back.
    fn before_commit(&self) -> Result<()> {
        Ok(())
    }

    fn after_commit(&self) {}

    fn after_rollback(&self) {}
}

struct Participant {
    store: Arc<LocalTransactionStore>,
    soft_locks: Vec<Arc<SoftLock>>,
}

/// State of one local transaction: its soft locks per cache, its deadline and
/// its listeners.
pub struct LocalTransactionContext {
    transaction_id: TransactionId,
    started: Instant,
    interrupted: AtomicBool,
    participants: Mutex<HashMap<String, Participant>>,
    listeners: Mutex<Vec<Arc<dyn TransactionListener>>>,
}

impl LocalTransactionContext {
    pub(crate) fn new(transaction_id: TransactionId) -> Self {
        Self {
            transaction_id,
            started: Instant::now(),
            interrupted: AtomicBool::new(false),
            participants: Mutex::new(HashMap::new()),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn id(&self) -> u64 {
        self.transaction_id.id()
    }

    pub fn transaction_id(&self) -> &TransactionId {
        &self.transaction_id
    }

    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    pub fn timed_out(&self) -> bool {
        self.transaction_id.is_timed_out()
    }

    pub fn time_before_timeout(&self) -> Duration {
        self.transaction_id.remaining()
    }

    /// Asks the transaction to stop at its next operation boundary.
    pub fn interrupt(&self) {
        self.interrupted.store(true, Ordering::Release);
    }

    /// Consumes a pending interrupt request.
    pub(crate) fn take_interrupt(&self) -> bool {
        self.interrupted.swap(false, Ordering::AcqRel)
    }

    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) {
        self.listeners.lock().push(listener);
    }

    pub(crate) fn register_soft_lock(&self, store: &Arc<LocalTransactionStore>, lock: Arc<SoftLock>) {
        let mut participants = self.participants.lock();
        participants
            .entry(store.cache_name().to_string())
            .or_insert_with(|| Participant {
                store: Arc::clone(store),
                soft_locks: Vec::new(),
            })
            .soft_locks
            .push(lock);
    }

    pub fn has_locked_anything(&self) -> bool {
        self.participants
            .lock()
            .values()
            .any(|participant| !participant.soft_locks.is_empty())
    }

    pub fn soft_locks(&self, cache_name: &str) -> Vec<Arc<SoftLock>> {
        self.participants
            .lock()
            .get(cache_name)
            .map(|participant| participant.soft_locks.clone())
            .unwrap_or_default()
    }

    /// Commits every soft lock this transaction holds.
    ///
    /// A timed out transaction is rolled back instead, unless `ignore_timeout`
    /// is set. If a reclaimer took any lock before it could be frozen, the
    /// whole transaction is rolled back and reported as timed out.
    pub(crate) fn commit(&self, ignore_timeout: bool) -> Result<()> {
        if !ignore_timeout && self.timed_out() {
            debug!("transaction [{}] timed out before commit, rolling back", self.id());
            self.rollback();
            return Err(CacheTxnError::TransactionTimedOut(self.id()));
        }

        if let Err(e) = self.fire_before_commit() {
            debug!("transaction [{}] before-commit listener failed: {}", self.id(), e);
            self.rollback();
            return Err(e);
        }

        let participants = std::mem::take(&mut *self.participants.lock());
        let mut frozen = Vec::with_capacity(participants.len());
        let mut lost_lock = false;
        for (_, participant) in participants {
            let mut locks = Vec::with_capacity(participant.soft_locks.len());
            for lock in participant.soft_locks {
                if lock.freeze() {
                    locks.push(lock);
                } else {
                    warn!(
                        "transaction [{}] lost soft lock on key [{}] to a reclaimer",
                        self.id(),
                        lock.key()
                    );
                    lost_lock = true;
                }
            }
            frozen.push((participant.store, locks));
        }

        if lost_lock {
            self.transaction_id.mark_for_rollback();
            for (store, locks) in &frozen {
                store.rollback(locks);
            }
            self.fire_after(false);
            return Err(CacheTxnError::TransactionTimedOut(self.id()));
        }

        self.transaction_id.mark_for_commit();
        for (store, locks) in &frozen {
            store.commit(locks);
        }
        debug!("transaction [{}] committed", self.id());
        self.fire_after(true);
        Ok(())
    }

    /// Rolls back every soft lock this transaction still holds.
    pub(crate) fn rollback(&self) {
        let participants = std::mem::take(&mut *self.participants.lock());
        self.transaction_id.mark_for_rollback();
        for (_, participant) in participants {
            let locks: Vec<_> = participant
                .soft_locks
                .into_iter()
                .filter(|lock| lock.freeze())
                .collect();
            participant.store.rollback(&locks);
        }
        debug!("transaction [{}] rolled back", self.id());
        self.fire_after(false);
    }

    fn listeners_snapshot(&self) -> Vec<Arc<dyn TransactionListener>> {
        self.listeners.lock().clone()
    }

    fn fire_before_commit(&self) -> Result<()> {
        for listener in self.listeners_snapshot() {
            listener.before_commit()?;
        }
        Ok(())
    }

    fn fire_after(&self, committed: bool) {
        for listener in self.listeners_snapshot() {
            if committed {
                listener.after_commit();
            } else {
                listener.after_rollback();
            }
        }
    }
}
