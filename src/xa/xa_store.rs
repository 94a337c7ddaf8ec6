use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;

use crate::conflict::version_table::VersionTable;
use crate::data_store::element::{Element, Key};
use crate::data_store::lock_provider::{KeySync, StripedLockProvider};
use crate::data_store::stored_value::StoredValue;
use crate::storage::{CacheLockProvider, UnderlyingStore};
use crate::twopc::Xid;
use crate::xa::context::XaTransactionContext;
use crate::xa::prepared::PreparedContext;

/// What a key held in the real store before a prepared branch changed it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PreImage {
    Present(Element),
    Absent,
}

impl PreImage {
    pub fn element(&self) -> Option<&Element> {
        match self {
            PreImage::Present(element) => Some(element),
            PreImage::Absent => None,
        }
    }
}

/// Pre-images of keys changed by prepared, not yet completed, branches.
pub struct OldVersionStore {
    images: RwLock<HashMap<Key, PreImage>>,
    lock_provider: StripedLockProvider,
}

impl OldVersionStore {
    pub fn new(lock_stripes: usize) -> Self {
        Self {
            images: RwLock::new(HashMap::new()),
            lock_provider: StripedLockProvider::new(lock_stripes),
        }
    }

    pub fn get(&self, key: &str) -> Option<PreImage> {
        self.images.read().get(key).cloned()
    }

    pub fn put(&self, key: Key, image: PreImage) {
        self.images.write().insert(key, image);
    }

    pub fn remove(&self, key: &str) -> Option<PreImage> {
        self.images.write().remove(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.images.read().contains_key(key)
    }

    pub fn sync_for_key(&self, key: &str) -> Arc<KeySync> {
        self.lock_provider.sync_for_key(key)
    }

    pub fn lock_provider(&self) -> &dyn CacheLockProvider {
        &self.lock_provider
    }

    pub fn len(&self) -> usize {
        self.images.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.read().is_empty()
    }
}

/// Shared XA state of one cache: branch contexts, prepared branches, the
/// version table and the old-version guard store.
///
/// Branch data for an [`Xid`] lives here from the branch's first operation
/// until [`remove_data`](Self::remove_data), which drops every trace of it
/// and releases its version checkouts.
pub struct XaStore {
    cache_name: String,
    underlying: Arc<dyn UnderlyingStore>,
    old_versions: OldVersionStore,
    version_table: Arc<VersionTable>,
    contexts: RwLock<HashMap<Xid, Arc<Mutex<XaTransactionContext>>>>,
    prepared: RwLock<HashMap<Xid, Arc<PreparedContext>>>,
    suspended: RwLock<HashSet<Xid>>,
}

impl XaStore {
    pub fn new(cache_name: impl Into<String>, underlying: Arc<dyn UnderlyingStore>, lock_stripes: usize) -> Self {
        Self {
            cache_name: cache_name.into(),
            underlying,
            old_versions: OldVersionStore::new(lock_stripes),
            version_table: Arc::new(VersionTable::new()),
            contexts: RwLock::new(HashMap::new()),
            prepared: RwLock::new(HashMap::new()),
            suspended: RwLock::new(HashSet::new()),
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn underlying(&self) -> &Arc<dyn UnderlyingStore> {
        &self.underlying
    }

    pub fn old_versions(&self) -> &OldVersionStore {
        &self.old_versions
    }

    pub fn version_table(&self) -> &Arc<VersionTable> {
        &self.version_table
    }

    pub fn context(&self, xid: &Xid) -> Option<Arc<Mutex<XaTransactionContext>>> {
        self.contexts.read().get(xid).cloned()
    }

    pub fn get_or_create_context(&self, xid: &Xid) -> Arc<Mutex<XaTransactionContext>> {
        if let Some(context) = self.context(xid) {
            return context;
        }
        Arc::clone(self.contexts.write().entry(xid.clone()).or_insert_with(|| {
            Arc::new(Mutex::new(XaTransactionContext::new(
                xid.clone(),
                Arc::clone(&self.version_table),
            )))
        }))
    }

    pub fn store_prepared(&self, xid: &Xid, prepared: PreparedContext) -> Arc<PreparedContext> {
        let prepared = Arc::new(prepared);
        self.prepared.write().insert(xid.clone(), Arc::clone(&prepared));
        prepared
    }

    pub fn prepared_context(&self, xid: &Xid) -> Option<Arc<PreparedContext>> {
        self.prepared.read().get(xid).cloned()
    }

    pub fn is_prepared(&self, xid: &Xid) -> bool {
        self.prepared.read().contains_key(xid)
    }

    /// Prepared branches awaiting commit or rollback.
    pub fn in_doubt_xids(&self) -> Vec<Xid> {
        self.prepared.read().keys().cloned().collect()
    }

    /// Marks a branch as suspended. Returns `false` if the branch is unknown.
    pub fn suspend(&self, xid: &Xid) -> bool {
        if !self.contexts.read().contains_key(xid) {
            return false;
        }
        self.suspended.write().insert(xid.clone());
        true
    }

    /// Returns `false` if the branch was not suspended.
    pub fn resume(&self, xid: &Xid) -> bool {
        self.suspended.write().remove(xid)
    }

    pub fn is_suspended(&self, xid: &Xid) -> bool {
        self.suspended.read().contains(xid)
    }

    /// Drops everything known about `xid` and releases its version checkouts.
    pub fn remove_data(&self, xid: &Xid) {
        if let Some(context) = self.contexts.write().remove(xid) {
            context.lock().release_versions();
        }
        self.prepared.write().remove(xid);
        self.suspended.write().remove(xid);
    }

    /// Branches with data still registered, prepared or not.
    pub fn active_branches(&self) -> usize {
        self.contexts.read().len()
    }

    /// Committed view of `key`: the pre-image while a prepared branch holds
    /// the key, the real store's element otherwise.
    pub fn read_committed(&self, key: &str, quiet: bool) -> Option<Element> {
        if let Some(image) = self.old_versions.get(key) {
            return image.element().cloned();
        }
        let stored = if quiet {
            self.underlying.get_quiet(key)
        } else {
            self.underlying.get(key)
        };
        match stored? {
            StoredValue::Plain(element) => Some(element),
            StoredValue::Locked(lock) => lock.old_element().cloned(),
        }
    }
}
