use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use log::{debug, error};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::thread::{self, ThreadId};
use std::time::Duration;

use crate::config::DEFAULT_XA_TRANSACTION_TIMEOUT_SECS;
use crate::conflict::detection::{validate_command, validate_commands};
use crate::data_store::element::Key;
use crate::data_store::lock_provider::LockType;
use crate::data_store::stored_value::StoredValue;
use crate::twopc::{
    XA_OK, XA_RBOTHER, XA_RBTIMEOUT, XA_RDONLY, XAER_DUPID, XAER_INVAL,
    XAER_NOTA, XAER_PROTO, XaError, XaResource, XaResult, Xid, flags,
};
use crate::xa::prepared::{PreparedCommand, PreparedContext};
use crate::xa::processor::{RequestType, XaRequest, XaRequestHandler, XaRequestProcessor};
use crate::xa::xa_store::{PreImage, XaStore};

/// The part of the resource the branch workers run.
struct XaResourceCore {
    store: Arc<XaStore>,
    transaction_timeout: AtomicI32,
    bindings: RwLock<HashMap<ThreadId, Xid>>,
    recovery_set: Mutex<HashSet<Xid>>,
}

impl XaResourceCore {
    fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.transaction_timeout.load(Ordering::Acquire).max(0) as u64)
    }

    fn unknown(&self, xid: &Xid) -> XaError {
        XaError::new(
            XAER_NOTA,
            format!("cache [{}] knows nothing about {}", self.store.cache_name(), xid),
        )
    }

    /// Drops the branch and any thread association left for it.
    fn discard(&self, xid: &Xid) {
        self.store.remove_data(xid);
        self.bindings.write().retain(|_, bound| bound != xid);
    }

    fn prepare_internal(&self, xid: &Xid) -> XaResult<i32> {
        if self.store.is_prepared(xid) {
            return Err(XaError::new(XAER_PROTO, format!("{} is already prepared", xid)));
        }
        let context = self.store.context(xid).ok_or_else(|| self.unknown(xid))?;
        let context = context.lock();

        for command in context.commands() {
            if let Err(e) = command.command().write_through() {
                drop(context);
                self.discard(xid);
                return Err(XaError::new(
                    XA_RBOTHER,
                    format!("{}: cache writer failed: {}", xid, e),
                ));
            }
        }

        let table = self.store.version_table();
        if let Err(e) = validate_commands(context.commands(), xid, table) {
            drop(context);
            self.discard(xid);
            return Err(e);
        }

        let keys = context.updated_keys();
        let underlying = self.store.underlying();
        let provider = underlying.lock_provider();
        if provider
            .write_lock_all_for_keys(&keys, self.lock_timeout())
            .is_none()
        {
            drop(context);
            self.discard(xid);
            return Err(XaError::new(
                XA_RBTIMEOUT,
                format!("{}: timed out waiting for key locks", xid),
            ));
        }

        let old_versions = self.store.old_versions();
        let mut snapshotted: Vec<Key> = Vec::with_capacity(keys.len());
        for command in context.commands() {
            let key = command.key();
            let sync = old_versions.sync_for_key(key);
            sync.lock(LockType::Write);
            if let Err(e) = validate_command(command, xid, table) {
                sync.unlock(LockType::Write);
                for key in &snapshotted {
                    old_versions.remove(key);
                }
                provider.unlock_write_lock_for_all_keys(&keys);
                drop(context);
                self.discard(xid);
                return Err(e);
            }
            if !snapshotted.contains(key) {
                let image = match underlying.get_quiet(key) {
                    Some(StoredValue::Plain(element)) => PreImage::Present(element),
                    Some(StoredValue::Locked(lock)) => match lock.old_element() {
                        Some(element) => PreImage::Present(element.clone()),
                        None => PreImage::Absent,
                    },
                    None => PreImage::Absent,
                };
                old_versions.put(key.clone(), image);
                snapshotted.push(key.clone());
            }
            sync.unlock(LockType::Write);
        }

        let mut prepared = PreparedContext::new();
        for command in context.commands() {
            let wrote = command.command().execute(underlying.as_ref());
            prepared.add_command(PreparedCommand::new(command.key().clone(), wrote));
        }
        drop(context);

        if !prepared.has_writes() {
            for key in &snapshotted {
                old_versions.remove(key);
            }
            provider.unlock_write_lock_for_all_keys(&keys);
            self.discard(xid);
            debug!("{} prepared read-only, completed", xid);
            return Ok(XA_RDONLY);
        }

        self.store.store_prepared(xid, prepared);
        debug!("{} prepared {} key(s)", xid, keys.len());
        Ok(XA_OK)
    }

    fn commit_internal(&self, xid: &Xid, one_phase: bool) -> XaResult<i32> {
        if one_phase {
            if self.store.is_prepared(xid) {
                return Err(XaError::new(
                    XAER_PROTO,
                    format!("one-phase commit of prepared {}", xid),
                ));
            }
            if self.prepare_internal(xid)? == XA_RDONLY {
                return Ok(XA_OK);
            }
        }

        let prepared = self
            .store
            .prepared_context(xid)
            .ok_or_else(|| self.unknown(xid))?;
        let outcomes = prepared.key_outcomes();
        let keys: Vec<Key> = outcomes.iter().map(|(key, _)| key.clone()).collect();
        let old_versions = self.store.old_versions();
        let guard_locks = old_versions
            .lock_provider()
            .write_lock_all_for_keys(&keys, Duration::MAX);
        for (key, wrote) in &outcomes {
            self.store.version_table().checkin(key, xid, !wrote);
            old_versions.remove(key);
        }
        self.store
            .underlying()
            .lock_provider()
            .unlock_write_lock_for_all_keys(&keys);
        if guard_locks.is_some() {
            old_versions.lock_provider().unlock_write_lock_for_all_keys(&keys);
        }

        self.discard(xid);
        debug!("{} committed", xid);
        Ok(XA_OK)
    }

    fn rollback_internal(&self, xid: &Xid) -> XaResult<i32> {
        match self.store.prepared_context(xid) {
            Some(prepared) => {
                let keys = prepared.updated_keys();
                let underlying = self.store.underlying();
                let old_versions = self.store.old_versions();
                for key in &keys {
                    let sync = old_versions.sync_for_key(key);
                    sync.lock(LockType::Write);
                    match old_versions.remove(key) {
                        Some(PreImage::Present(element)) => {
                            underlying.put(StoredValue::Plain(element));
                        }
                        Some(PreImage::Absent) => {
                            underlying.remove(key);
                        }
                        None => error!(
                            "{}: no element found in old version store for key [{}]",
                            xid, key
                        ),
                    }
                    sync.unlock(LockType::Write);
                }
                underlying.lock_provider().unlock_write_lock_for_all_keys(&keys);
            }
            None if self.store.context(xid).is_none() => return Err(self.unknown(xid)),
            None => {}
        }
        self.discard(xid);
        debug!("{} rolled back", xid);
        Ok(XA_OK)
    }

    /// Drops an unprepared branch. Prepared branches are in doubt until
    /// commit or rollback and cannot be forgotten.
    fn forget_internal(&self, xid: &Xid) -> XaResult<i32> {
        if self.store.is_prepared(xid) {
            return Err(XaError::new(
                XAER_PROTO,
                format!("cannot forget in-doubt {}", xid),
            ));
        }
        if self.store.context(xid).is_none() {
            return Err(self.unknown(xid));
        }
        self.discard(xid);
        debug!("{} forgotten", xid);
        Ok(XA_OK)
    }
}

impl XaRequestHandler for XaResourceCore {
    fn handle(&self, request: &XaRequest) -> XaResult<i32> {
        match request.kind {
            RequestType::Prepare => self.prepare_internal(&request.xid),
            RequestType::Commit { one_phase } => self.commit_internal(&request.xid, one_phase),
            RequestType::Rollback => self.rollback_internal(&request.xid),
            RequestType::Forget => self.forget_internal(&request.xid),
        }
    }
}

/// XA resource of one cache.
///
/// `start`/`end` manage which branch the calling thread works on.
/// `prepare`, `commit`, `rollback` and `forget` run on the branch's own
/// worker via an [`XaRequestProcessor`]. `recover` and the timeout accessors
/// run inline.
pub struct CacheXaResource {
    core: Arc<XaResourceCore>,
    processor: XaRequestProcessor,
}

impl CacheXaResource {
    pub fn new(store: Arc<XaStore>, transaction_timeout_secs: i32) -> Self {
        let timeout = if transaction_timeout_secs > 0 {
            transaction_timeout_secs
        } else {
            DEFAULT_XA_TRANSACTION_TIMEOUT_SECS
        };
        let core = Arc::new(XaResourceCore {
            store,
            transaction_timeout: AtomicI32::new(timeout),
            bindings: RwLock::new(HashMap::new()),
            recovery_set: Mutex::new(HashSet::new()),
        });
        let processor = XaRequestProcessor::new(Arc::clone(&core) as Arc<dyn XaRequestHandler>);
        Self { core, processor }
    }

    pub fn store(&self) -> &Arc<XaStore> {
        &self.core.store
    }

    /// The branch the calling thread is associated with.
    pub fn current_xid(&self) -> Option<Xid> {
        self.core.bindings.read().get(&thread::current().id()).cloned()
    }

    /// Live branch workers.
    pub fn active_workers(&self) -> usize {
        self.processor.active_workers()
    }

    fn process(&self, kind: RequestType, xid: &Xid) -> XaResult<i32> {
        self.processor.process(XaRequest::new(kind, xid.clone()))
    }
}

impl XaResource for CacheXaResource {
    fn resource_name(&self) -> &str {
        self.core.store.cache_name()
    }

    fn start(&self, xid: &Xid, flags: i32) -> XaResult<()> {
        debug!("start {} [{}]", xid, flags::pretty_print(flags));
        let thread = thread::current().id();
        let mut bindings = self.core.bindings.write();

        if flags & flags::TMRESUME == flags::TMRESUME {
            if !self.core.store.resume(xid) {
                return Err(XaError::new(XAER_PROTO, format!("{} is not suspended", xid)));
            }
        } else if flags & flags::TMJOIN != flags::TMJOIN {
            if let Some(bound) = bindings.get(&thread) {
                if bound != xid {
                    return Err(XaError::new(
                        XAER_DUPID,
                        format!("thread already works on {}, cannot start {}", bound, xid),
                    ));
                }
            }
            if bindings
                .iter()
                .any(|(other, bound)| *other != thread && bound == xid)
            {
                return Err(XaError::new(
                    XAER_DUPID,
                    format!("{} is already associated with another thread", xid),
                ));
            }
            if self.core.store.is_prepared(xid) {
                return Err(XaError::new(XAER_DUPID, format!("{} is already prepared", xid)));
            }
        }

        bindings.insert(thread, xid.clone());
        self.core.store.get_or_create_context(xid);
        Ok(())
    }

    fn end(&self, xid: &Xid, flags: i32) -> XaResult<()> {
        debug!("end {} [{}]", xid, flags::pretty_print(flags));
        let thread = thread::current().id();
        {
            let mut bindings = self.core.bindings.write();
            match bindings.get(&thread) {
                Some(bound) if bound == xid => {
                    bindings.remove(&thread);
                }
                _ => {
                    return Err(XaError::new(
                        XAER_PROTO,
                        format!("thread is not associated with {}", xid),
                    ));
                }
            }
        }

        if flags & flags::TMSUSPEND == flags::TMSUSPEND {
            self.core.store.suspend(xid);
        } else if flags & flags::TMFAIL == flags::TMFAIL && !self.core.store.is_prepared(xid) {
            self.core.store.remove_data(xid);
        }
        Ok(())
    }

    fn prepare(&self, xid: &Xid) -> XaResult<i32> {
        self.process(RequestType::Prepare, xid)
    }

    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()> {
        self.process(RequestType::Commit { one_phase }, xid).map(|_| ())
    }

    fn rollback(&self, xid: &Xid) -> XaResult<()> {
        self.process(RequestType::Rollback, xid).map(|_| ())
    }

    fn forget(&self, xid: &Xid) -> XaResult<()> {
        self.process(RequestType::Forget, xid).map(|_| ())
    }

    fn recover(&self, flags: i32) -> XaResult<Vec<Xid>> {
        let scan_flags = flags::TMSTARTRSCAN | flags::TMENDRSCAN;
        if flags & !scan_flags != 0 {
            return Err(XaError::new(
                XAER_INVAL,
                format!("invalid recover flags [{}]", flags::pretty_print(flags)),
            ));
        }
        let mut recovery_set = self.core.recovery_set.lock();
        if flags & flags::TMSTARTRSCAN == flags::TMSTARTRSCAN {
            recovery_set.clear();
        }
        let xids: Vec<Xid> = self
            .core
            .store
            .in_doubt_xids()
            .into_iter()
            .filter(|xid| recovery_set.insert(xid.clone()))
            .collect();
        if flags & flags::TMENDRSCAN == flags::TMENDRSCAN {
            recovery_set.clear();
        }
        debug!("recover [{}] returned {} xid(s)", flags::pretty_print(flags), xids.len());
        Ok(xids)
    }

    fn transaction_timeout(&self) -> i32 {
        self.core.transaction_timeout.load(Ordering::Acquire)
    }

    fn set_transaction_timeout(&self, seconds: i32) -> XaResult<bool> {
        if seconds < 0 {
            return Err(XaError::new(
                XAER_INVAL,
                format!("transaction timeout must be >= 0, was {}", seconds),
            ));
        }
        let seconds = if seconds == 0 {
            DEFAULT_XA_TRANSACTION_TIMEOUT_SECS
        } else {
            seconds
        };
        self.core.transaction_timeout.store(seconds, Ordering::Release);
        Ok(true)
    }
}
