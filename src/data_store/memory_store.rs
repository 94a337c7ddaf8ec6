use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::data_store::element::Key;
use crate::data_store::lock_provider::StripedLockProvider;
use crate::data_store::stored_value::StoredValue;
use crate::storage::{CacheLockProvider, UnderlyingStore, ValueComparator};

/// In-memory [`UnderlyingStore`] backed by a single `RwLock`ed hash map.
pub struct MemoryStore {
    data: RwLock<HashMap<Key, StoredValue>>,
    pinned: RwLock<HashSet<Key>>,
    hits: AtomicU64,
    lock_provider: StripedLockProvider,
}

impl MemoryStore {
    /// Creates an empty store whose lock provider hands out `lock_stripes` locks.
    pub fn new(lock_stripes: usize) -> Self {
        Self {
            data: RwLock::new(HashMap::new()),
            pinned: RwLock::new(HashSet::new()),
            hits: AtomicU64::new(0),
            lock_provider: StripedLockProvider::new(lock_stripes),
        }
    }

    /// Number of counted (non-quiet) reads served so far.
    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn pinned_count(&self) -> usize {
        self.pinned.read().len()
    }
}

impl UnderlyingStore for MemoryStore {
    fn get(&self, key: &str) -> Option<StoredValue> {
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.data.read().get(key).cloned()
    }

    fn get_quiet(&self, key: &str) -> Option<StoredValue> {
        self.data.read().get(key).cloned()
    }

    fn put(&self, value: StoredValue) -> bool {
        let key = value.key().clone();
        self.data.write().insert(key, value).is_none()
    }

    fn put_if_absent(&self, value: StoredValue) -> Option<StoredValue> {
        let mut data = self.data.write();
        if let Some(present) = data.get(value.key()) {
            return Some(present.clone());
        }
        data.insert(value.key().clone(), value);
        None
    }

    fn replace_if(&self, old: &StoredValue, new: StoredValue, comparator: &dyn ValueComparator) -> bool {
        let mut data = self.data.write();
        match data.get_mut(old.key()) {
            Some(current) if current.matches(old, comparator) => {
                *current = new;
                true
            }
            _ => false,
        }
    }

    fn replace(&self, value: StoredValue) -> Option<StoredValue> {
        let mut data = self.data.write();
        let current = data.get_mut(value.key())?;
        Some(std::mem::replace(current, value))
    }

    fn remove(&self, key: &str) -> Option<StoredValue> {
        self.data.write().remove(key)
    }

    fn remove_if(&self, value: &StoredValue, comparator: &dyn ValueComparator) -> bool {
        let mut data = self.data.write();
        let matched = data
            .get(value.key())
            .is_some_and(|current| current.matches(value, comparator));
        if matched {
            data.remove(value.key());
        }
        matched
    }

    fn is_pinned(&self, key: &str) -> bool {
        self.pinned.read().contains(key)
    }

    fn set_pinned(&self, key: &str, pinned: bool) {
        let mut set = self.pinned.write();
        if pinned {
            set.insert(key.to_string());
        } else {
            set.remove(key);
        }
    }

    fn keys(&self) -> Vec<Key> {
        self.data.read().keys().cloned().collect()
    }

    fn size(&self) -> usize {
        self.data.read().len()
    }

    fn lock_provider(&self) -> &dyn CacheLockProvider {
        &self.lock_provider
    }
}
