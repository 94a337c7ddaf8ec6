use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::errors::{CacheTxnError, Result};
use crate::transaction::{LocalTransactionContext, TransactionId};

/// Begins and ends local transactions and binds them to threads.
///
/// A thread has at most one current transaction. Suspended transactions are
/// unbound but stay alive until resumed, committed or rolled back.
pub struct TransactionController {
    default_timeout: Duration,
    transaction_counter: AtomicU64,
    bound: RwLock<HashMap<ThreadId, Arc<LocalTransactionContext>>>,
    live: RwLock<HashMap<u64, Arc<LocalTransactionContext>>>,
}

impl TransactionController {
    pub fn new(default_timeout: Duration) -> Self {
        Self {
            default_timeout,
            transaction_counter: AtomicU64::new(1),
            bound: RwLock::new(HashMap::new()),
            live: RwLock::new(HashMap::new()),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// Begins a transaction with the default timeout on the calling thread.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use txcache::prelude::*;
    ///
    /// let manager = TxCacheManager::new(ManagerConfig::default()).unwrap();
    /// let cache = manager.local_cache(CacheConfig::named("users")).unwrap();
    /// let controller = manager.transaction_controller();
    ///
    /// controller.begin().unwrap();
    /// cache.put(Element::new("user:1", "alice")).unwrap();
    /// controller.commit().unwrap();
    /// ```
    pub fn begin(&self) -> Result<TransactionId> {
        self.begin_with_timeout(self.default_timeout)
    }

    pub fn begin_with_timeout(&self, timeout: Duration) -> Result<TransactionId> {
        let thread = thread::current().id();
        let mut bound = self.bound.write();
        if bound.contains_key(&thread) {
            return Err(CacheTxnError::TransactionAlreadyStarted);
        }
        let id = self.transaction_counter.fetch_add(1, Ordering::SeqCst);
        let transaction_id = TransactionId::new(id, timeout);
        let context = Arc::new(LocalTransactionContext::new(transaction_id.clone()));
        bound.insert(thread, Arc::clone(&context));
        self.live.write().insert(id, context);
        debug!("begun transaction [{}] with timeout {:?}", id, timeout);
        Ok(transaction_id)
    }

    /// The transaction bound to the calling thread.
    pub fn current_context(&self) -> Option<Arc<LocalTransactionContext>> {
        self.bound.read().get(&thread::current().id()).cloned()
    }

    pub fn commit(&self) -> Result<()> {
        self.commit_internal(false)
    }

    /// Commits even if the transaction ran past its timeout.
    pub fn commit_ignoring_timeout(&self) -> Result<()> {
        self.commit_internal(true)
    }

    fn commit_internal(&self, ignore_timeout: bool) -> Result<()> {
        let context = self.unbind()?;
        context.commit(ignore_timeout)
    }

    pub fn rollback(&self) -> Result<()> {
        let context = self.unbind()?;
        context.rollback();
        Ok(())
    }

    /// Unbinds the current transaction from the calling thread.
    pub fn suspend(&self) -> Result<TransactionId> {
        let context = self
            .bound
            .write()
            .remove(&thread::current().id())
            .ok_or(CacheTxnError::NoActiveTransaction)?;
        debug!("suspended transaction [{}]", context.id());
        Ok(context.transaction_id().clone())
    }

    /// Binds a suspended transaction to the calling thread.
    pub fn resume(&self, transaction_id: &TransactionId) -> Result<()> {
        let context = self
            .live
            .read()
            .get(&transaction_id.id())
            .cloned()
            .ok_or_else(|| {
                CacheTxnError::InvalidArgument(format!(
                    "transaction [{}] is not alive",
                    transaction_id
                ))
            })?;
        let mut bound = self.bound.write();
        if bound.contains_key(&thread::current().id()) {
            return Err(CacheTxnError::TransactionAlreadyStarted);
        }
        if bound.values().any(|c| c.id() == transaction_id.id()) {
            return Err(CacheTxnError::InvalidArgument(format!(
                "transaction [{}] is bound to another thread",
                transaction_id
            )));
        }
        bound.insert(thread::current().id(), context);
        debug!("resumed transaction [{}]", transaction_id);
        Ok(())
    }

    /// Requests cooperative interruption of a live transaction. Returns `false`
    /// if no such transaction is alive.
    pub fn interrupt(&self, transaction_id: &TransactionId) -> bool {
        match self.live.read().get(&transaction_id.id()) {
            Some(context) => {
                context.interrupt();
                true
            }
            None => false,
        }
    }

    pub fn live_transactions(&self) -> usize {
        self.live.read().len()
    }

    fn unbind(&self) -> Result<Arc<LocalTransactionContext>> {
        let context = self
            .bound
            .write()
            .remove(&thread::current().id())
            .ok_or(CacheTxnError::NoActiveTransaction)?;
        self.live.write().remove(&context.id());
        Ok(context)
    }
}
