use ahash::AHashSet as HashSet;
use log::{debug, error};
use std::sync::{Arc, Weak};

use crate::controller::TransactionController;
use crate::data_store::element::{Element, Key};
use crate::data_store::stored_value::StoredValue;
use crate::errors::{CacheTxnError, Result};
use crate::soft_lock::{SoftLock, SoftLockManager};
use crate::storage::{CacheWriter, UnderlyingStore, ValueComparator};
use crate::transaction::{LocalTransactionContext, TransactionListener};

/// A single-key mutation attempted by the write loop.
enum WriteOp<'a> {
    Put(&'a Element),
    PutIfAbsent(&'a Element),
    Remove(&'a str),
    RemoveElement(&'a Element, &'a dyn ValueComparator),
    Replace(&'a Element),
    ReplaceElement {
        old: &'a Element,
        new: &'a Element,
        comparator: &'a dyn ValueComparator,
    },
}

impl WriteOp<'_> {
    fn key(&self) -> &str {
        match self {
            WriteOp::Put(e) | WriteOp::PutIfAbsent(e) | WriteOp::Replace(e) => e.key(),
            WriteOp::RemoveElement(e, _) => e.key(),
            WriteOp::Remove(key) => key,
            WriteOp::ReplaceElement { new, .. } => new.key(),
        }
    }

    fn name(&self) -> &'static str {
        match self {
            WriteOp::Put(_) => "put",
            WriteOp::PutIfAbsent(_) => "putIfAbsent",
            WriteOp::Remove(_) => "remove",
            WriteOp::RemoveElement(..) => "removeElement",
            WriteOp::Replace(_) => "replace",
            WriteOp::ReplaceElement { .. } => "replaceElement",
        }
    }

    /// The pending element this op leaves behind over `visible`, or `None`
    /// when the op does not apply and the key must stay untouched.
    fn apply_to(&self, visible: Option<&Element>) -> Option<Option<Element>> {
        match self {
            WriteOp::Put(e) => Some(Some((*e).clone())),
            WriteOp::PutIfAbsent(e) => visible.is_none().then(|| Some((*e).clone())),
            WriteOp::Remove(_) => Some(None),
            WriteOp::RemoveElement(e, comparator) => {
                (visible.is_some() && comparator.equals(Some(*e), visible)).then_some(None)
            }
            WriteOp::Replace(e) => visible.is_some().then(|| Some((*e).clone())),
            WriteOp::ReplaceElement {
                old,
                new,
                comparator,
            } => (visible.is_some() && comparator.equals(Some(*old), visible))
                .then(|| Some((*new).clone())),
        }
    }
}

struct WriteOutcome {
    applied: bool,
    previous: Option<Element>,
}

enum WriterListener {
    Write {
        writer: Arc<dyn CacheWriter>,
        element: Element,
    },
    Delete {
        writer: Arc<dyn CacheWriter>,
        key: Key,
        element: Option<Element>,
    },
}

impl TransactionListener for WriterListener {
    fn before_commit(&self) -> Result<()> {
        match self {
            WriterListener::Write { writer, element } => writer.write(element),
            WriterListener::Delete {
                writer,
                key,
                element,
            } => writer.delete(key, element.as_ref()),
        }
    }
}

/// Transactional facade over an [`UnderlyingStore`] using soft locks.
///
/// Every write installs a [`SoftLock`] on its key through compare-and-swap.
/// The writing transaction then reads its own pending element while other
/// transactions keep reading the committed one. Commit or rollback replaces
/// each soft lock by the element matching the decision.
///
/// Every operation needs a transaction bound to the calling thread by the
/// cache's [`TransactionController`].
pub struct LocalTransactionStore {
    cache_name: String,
    underlying: Arc<dyn UnderlyingStore>,
    controller: Arc<TransactionController>,
    soft_locks: SoftLockManager,
    comparator: Arc<dyn ValueComparator>,
    retry_budget: u32,
    me: Weak<LocalTransactionStore>,
}

impl LocalTransactionStore {
    pub fn new(
        cache_name: impl Into<String>,
        underlying: Arc<dyn UnderlyingStore>,
        controller: Arc<TransactionController>,
        comparator: Arc<dyn ValueComparator>,
        retry_budget: u32,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            cache_name: cache_name.into(),
            underlying,
            controller,
            soft_locks: SoftLockManager::new(),
            comparator,
            retry_budget,
            me: me.clone(),
        })
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn underlying(&self) -> &Arc<dyn UnderlyingStore> {
        &self.underlying
    }

    /// Soft locks currently installed in this cache.
    pub fn live_soft_locks(&self) -> usize {
        self.soft_locks.len()
    }

    pub fn get(&self, key: &str) -> Result<Option<Element>> {
        self.read(key, false)
    }

    /// Like [`get`](Self::get) without updating access statistics.
    pub fn get_quiet(&self, key: &str) -> Result<Option<Element>> {
        self.read(key, true)
    }

    /// Returns `true` if the key was not visible to this transaction before.
    pub fn put(&self, element: Element) -> Result<bool> {
        let outcome = self.write(WriteOp::Put(&element))?;
        Ok(outcome.previous.is_none())
    }

    /// Returns the visible element if there is one, `None` once `element`
    /// was put.
    pub fn put_if_absent(&self, element: Element) -> Result<Option<Element>> {
        let outcome = self.write(WriteOp::PutIfAbsent(&element))?;
        Ok(if outcome.applied { None } else { outcome.previous })
    }

    /// Removes the key and returns the element this transaction saw.
    pub fn remove(&self, key: &str) -> Result<Option<Element>> {
        Ok(self.write(WriteOp::Remove(key))?.previous)
    }

    /// Removes the key only if its visible element equals `element`.
    pub fn remove_element(
        &self,
        element: &Element,
        comparator: &dyn ValueComparator,
    ) -> Result<Option<Element>> {
        let outcome = self.write(WriteOp::RemoveElement(element, comparator))?;
        Ok(if outcome.applied { outcome.previous } else { None })
    }

    /// Replaces the element of a visible key. Returns the replaced element.
    pub fn replace(&self, element: Element) -> Result<Option<Element>> {
        let outcome = self.write(WriteOp::Replace(&element))?;
        Ok(if outcome.applied { outcome.previous } else { None })
    }

    /// Replaces `old` by `new` only if the visible element equals `old`.
    pub fn replace_element(
        &self,
        old: &Element,
        new: Element,
        comparator: &dyn ValueComparator,
    ) -> Result<bool> {
        if old.key() != new.key() {
            return Err(CacheTxnError::InvalidArgument(format!(
                "replace of [{}] with an element keyed [{}]",
                old.key(),
                new.key()
            )));
        }
        let outcome = self.write(WriteOp::ReplaceElement {
            old,
            new: &new,
            comparator,
        })?;
        Ok(outcome.applied)
    }

    /// Keys visible to the current transaction.
    pub fn get_keys(&self) -> Result<Vec<Key>> {
        let context = self.current_context()?;
        self.assert_not_timed_out(&context)?;
        let invisible: HashSet<Key> = self
            .soft_locks
            .keys_invisible_in(context.transaction_id())
            .into_iter()
            .collect();
        Ok(self
            .underlying
            .keys()
            .into_iter()
            .filter(|key| !invisible.contains(key))
            .collect())
    }

    pub fn get_size(&self) -> Result<usize> {
        let context = self.current_context()?;
        self.assert_not_timed_out(&context)?;
        let invisible = self.soft_locks.keys_invisible_in(context.transaction_id());
        Ok(self.underlying.size().saturating_sub(invisible.len()))
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get_quiet(key)?.is_some())
    }

    /// Removes every key visible to the current transaction.
    pub fn remove_all(&self) -> Result<()> {
        for key in self.get_keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }

    /// Puts `element` and hands it to `writer` right before the transaction commits.
    pub fn put_with_writer(&self, element: Element, writer: Arc<dyn CacheWriter>) -> Result<bool> {
        let context = self.current_context()?;
        let was_new = self.put(element.clone())?;
        context.add_listener(Arc::new(WriterListener::Write { writer, element }));
        Ok(was_new)
    }

    /// Removes `key` and deletes it through `writer` right before the transaction commits.
    pub fn remove_with_writer(&self, key: &str, writer: Arc<dyn CacheWriter>) -> Result<Option<Element>> {
        let context = self.current_context()?;
        let removed = self.remove(key)?;
        context.add_listener(Arc::new(WriterListener::Delete {
            writer,
            key: key.to_string(),
            element: removed.clone(),
        }));
        Ok(removed)
    }

    /// Replaces frozen soft locks of a committing transaction by their new elements.
    pub(crate) fn commit(&self, soft_locks: &[Arc<SoftLock>]) {
        for lock in soft_locks {
            self.release_soft_lock(lock, true);
        }
    }

    /// Replaces frozen soft locks of a rolling back transaction by their old elements.
    pub(crate) fn rollback(&self, soft_locks: &[Arc<SoftLock>]) {
        for lock in soft_locks {
            self.release_soft_lock(lock, false);
        }
    }

    fn current_context(&self) -> Result<Arc<LocalTransactionContext>> {
        self.controller
            .current_context()
            .ok_or(CacheTxnError::NoActiveTransaction)
    }

    fn assert_not_timed_out(&self, context: &LocalTransactionContext) -> Result<()> {
        if context.take_interrupt() {
            return Err(CacheTxnError::TransactionInterrupted(context.id()));
        }
        if context.timed_out() {
            return Err(CacheTxnError::TransactionTimedOut(context.id()));
        }
        Ok(())
    }

    fn read(&self, key: &str, quiet: bool) -> Result<Option<Element>> {
        let context = self.current_context()?;
        for _ in 0..self.retry_budget {
            self.assert_not_timed_out(&context)?;
            let stored = if quiet {
                self.underlying.get_quiet(key)
            } else {
                self.underlying.get(key)
            };
            match stored {
                None => return Ok(None),
                Some(StoredValue::Plain(element)) => return Ok(Some(element)),
                Some(StoredValue::Locked(lock)) => {
                    if self.cleanup_expired_soft_lock(&lock) {
                        continue;
                    }
                    return Ok(lock.element(context.transaction_id()));
                }
            }
        }
        Err(self.retry_budget_exhausted(key))
    }

    fn write(&self, op: WriteOp<'_>) -> Result<WriteOutcome> {
        let context = self.current_context()?;
        let key = op.key();
        let mut pinned_here = false;
        let result = self.write_loop(&context, &op, &mut pinned_here);
        // A pin is handed over to the soft lock once installed; any other exit releases it.
        if pinned_here {
            self.underlying.set_pinned(key, false);
        }
        result
    }

    fn write_loop(
        &self,
        context: &LocalTransactionContext,
        op: &WriteOp<'_>,
        pinned_here: &mut bool,
    ) -> Result<WriteOutcome> {
        let key = op.key();
        let transaction_id = context.transaction_id();
        for _ in 0..self.retry_budget {
            let was_pinned = !*pinned_here && self.underlying.is_pinned(key);
            self.assert_not_timed_out(context)?;

            match self.underlying.get_quiet(key) {
                None => {
                    let Some(new_element) = op.apply_to(None) else {
                        return Ok(WriteOutcome {
                            applied: false,
                            previous: None,
                        });
                    };
                    self.pin(key, pinned_here);
                    let lock = self.new_soft_lock(context, key, new_element, None, was_pinned);
                    if self
                        .underlying
                        .put_if_absent(StoredValue::Locked(Arc::clone(&lock)))
                        .is_none()
                    {
                        self.installed(context, lock);
                        *pinned_here = false;
                        debug!(
                            "{}: cache [{}] key [{}] was not in, soft lock inserted",
                            op.name(),
                            self.cache_name,
                            key
                        );
                        return Ok(WriteOutcome {
                            applied: true,
                            previous: None,
                        });
                    }
                    lock.unlock();
                    debug!(
                        "{}: cache [{}] key [{}] was not in, soft lock insertion failed, retrying",
                        op.name(),
                        self.cache_name,
                        key
                    );
                }
                Some(StoredValue::Plain(current)) => {
                    let Some(new_element) = op.apply_to(Some(&current)) else {
                        return Ok(WriteOutcome {
                            applied: false,
                            previous: Some(current),
                        });
                    };
                    self.pin(key, pinned_here);
                    let lock = self.new_soft_lock(
                        context,
                        key,
                        new_element,
                        Some(current.clone()),
                        was_pinned,
                    );
                    let expected = StoredValue::Plain(current.clone());
                    if self.underlying.replace_if(
                        &expected,
                        StoredValue::Locked(Arc::clone(&lock)),
                        self.comparator.as_ref(),
                    ) {
                        self.installed(context, lock);
                        *pinned_here = false;
                        debug!(
                            "{}: cache [{}] key [{}] was in, replaced with soft lock",
                            op.name(),
                            self.cache_name,
                            key
                        );
                        return Ok(WriteOutcome {
                            applied: true,
                            previous: Some(current),
                        });
                    }
                    lock.unlock();
                    debug!(
                        "{}: cache [{}] key [{}] was in, replacement by soft lock failed, retrying",
                        op.name(),
                        self.cache_name,
                        key
                    );
                }
                Some(StoredValue::Locked(lock)) => {
                    if self.cleanup_expired_soft_lock(&lock) {
                        continue;
                    }

                    if lock.owner() == transaction_id {
                        let visible = lock.element(transaction_id);
                        let Some(new_element) = op.apply_to(visible.as_ref()) else {
                            return Ok(WriteOutcome {
                                applied: false,
                                previous: visible,
                            });
                        };
                        let previous = lock.update_element(new_element);
                        let container = StoredValue::Locked(Arc::clone(&lock));
                        if !self.underlying.replace_if(
                            &container,
                            container.clone(),
                            self.comparator.as_ref(),
                        ) {
                            debug!(
                                "{}: cache [{}] key [{}] lost own soft lock, retrying",
                                op.name(),
                                self.cache_name,
                                key
                            );
                            continue;
                        }
                        debug!(
                            "{}: cache [{}] key [{}] soft locked in current transaction, updated",
                            op.name(),
                            self.cache_name,
                            key
                        );
                        return Ok(WriteOutcome {
                            applied: true,
                            previous,
                        });
                    }

                    debug!(
                        "{}: cache [{}] key [{}] soft locked in foreign transaction [{}], waiting {:?}",
                        op.name(),
                        self.cache_name,
                        key,
                        lock.owner(),
                        context.time_before_timeout()
                    );
                    if !lock.try_lock(context.time_before_timeout()) && context.has_locked_anything() {
                        return Err(CacheTxnError::DeadlockDetected {
                            cache: self.cache_name.clone(),
                            key: key.to_string(),
                            current: transaction_id.id(),
                            foreign: lock.owner().id(),
                        });
                    }
                }
            }
        }
        Err(self.retry_budget_exhausted(key))
    }

    fn pin(&self, key: &str, pinned_here: &mut bool) {
        if !self.underlying.is_pinned(key) {
            self.underlying.set_pinned(key, true);
            *pinned_here = true;
        }
    }

    fn new_soft_lock(
        &self,
        context: &LocalTransactionContext,
        key: &str,
        new_element: Option<Element>,
        old_element: Option<Element>,
        was_pinned: bool,
    ) -> Arc<SoftLock> {
        let lock = Arc::new(SoftLock::new(
            context.transaction_id().clone(),
            key.to_string(),
            new_element,
            old_element,
            was_pinned,
        ));
        lock.lock();
        lock
    }

    fn installed(&self, context: &LocalTransactionContext, lock: Arc<SoftLock>) {
        self.soft_locks.register(&lock);
        match self.me.upgrade() {
            Some(me) => context.register_soft_lock(&me, lock),
            None => error!(
                "cache [{}] is being dropped, soft lock on key [{}] of {} is not registered",
                self.cache_name,
                lock.key(),
                context.transaction_id()
            ),
        }
    }

    /// Reclaims `lock` if its owner expired. Returns `true` when the caller
    /// must re-read the key.
    fn cleanup_expired_soft_lock(&self, lock: &Arc<SoftLock>) -> bool {
        if !lock.is_expired() {
            return false;
        }
        if !lock.try_reclaim() {
            return true;
        }
        debug!(
            "cache [{}] reclaiming expired soft lock on key [{}] of transaction [{}]",
            self.cache_name,
            lock.key(),
            lock.owner()
        );
        self.release_soft_lock(lock, false);
        true
    }

    /// Replaces a frozen soft lock by its frozen element, restores the pinned
    /// state and wakes every waiter.
    fn release_soft_lock(&self, lock: &Arc<SoftLock>, committed: bool) {
        let container = StoredValue::Locked(Arc::clone(lock));
        match lock.frozen_element() {
            Some(element) => {
                let element = if committed {
                    element.with_version(lock.old_element().map_or(1, |old| old.version() + 1))
                } else {
                    element
                };
                self.underlying.replace_if(
                    &container,
                    StoredValue::Plain(element),
                    self.comparator.as_ref(),
                );
            }
            None => {
                self.underlying
                    .remove_if(&container, self.comparator.as_ref());
            }
        }
        if !lock.was_pinned() {
            self.underlying.set_pinned(lock.key(), false);
        }
        self.soft_locks.clear(lock);
        lock.unfreeze();
        lock.unlock();
    }

    fn retry_budget_exhausted(&self, key: &str) -> CacheTxnError {
        CacheTxnError::RetryBudgetExhausted {
            cache: self.cache_name.clone(),
            key: key.to_string(),
            budget: self.retry_budget,
        }
    }
}
