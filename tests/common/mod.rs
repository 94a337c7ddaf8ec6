//! Common utilities for txcache integration tests.
#![allow(dead_code)]

use parking_lot::Mutex;
use std::sync::Arc;
use txcache::{
    CacheConfig, CacheWriter, DefaultValueComparator, Element, LocalTransactionStore, ManagerConfig,
    MemoryStore, TxCacheManager, XaTransactionalStore, Xid,
};

// --- RecordingWriter ---

/// A `CacheWriter` remembering what it was asked to write and delete.
#[derive(Default)]
pub struct RecordingWriter {
    writes: Mutex<Vec<(String, String)>>,
    deletes: Mutex<Vec<String>>,
    fail: bool,
}

impl RecordingWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// A writer whose every call fails.
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    pub fn writes(&self) -> Vec<(String, String)> {
        self.writes.lock().clone()
    }

    pub fn deletes(&self) -> Vec<String> {
        self.deletes.lock().clone()
    }
}

impl CacheWriter for RecordingWriter {
    fn write(&self, element: &Element) -> txcache::Result<()> {
        if self.fail {
            return Err(txcache::CacheTxnError::Writer(format!(
                "refusing to write {}",
                element.key()
            )));
        }
        self.writes
            .lock()
            .push((element.key().clone(), text(element)));
        Ok(())
    }

    fn delete(&self, key: &str, _element: Option<&Element>) -> txcache::Result<()> {
        if self.fail {
            return Err(txcache::CacheTxnError::Writer(format!(
                "refusing to delete {}",
                key
            )));
        }
        self.deletes.lock().push(key.to_string());
        Ok(())
    }
}

// --- Helper Functions ---

/// Manager whose transactions time out after `timeout_ms` by default.
pub fn setup_manager(timeout_ms: u64) -> Arc<TxCacheManager> {
    Arc::new(
        TxCacheManager::new(ManagerConfig {
            default_transaction_timeout_ms: timeout_ms,
        })
        .unwrap(),
    )
}

/// A local cache over a `MemoryStore` the test can inspect directly.
pub fn setup_local_cache(
    name: &str,
) -> (Arc<TxCacheManager>, Arc<LocalTransactionStore>, Arc<MemoryStore>) {
    let manager = setup_manager(10_000);
    let underlying = Arc::new(MemoryStore::new(16));
    let cache = manager
        .local_cache_over(
            CacheConfig::named(name),
            underlying.clone(),
            Arc::new(DefaultValueComparator),
        )
        .unwrap();
    (manager, cache, underlying)
}

pub fn setup_xa_cache(name: &str) -> (Arc<TxCacheManager>, Arc<XaTransactionalStore>) {
    let manager = setup_manager(10_000);
    let cache = manager.xa_cache(CacheConfig::named(name)).unwrap();
    (manager, cache)
}

pub fn element(key: &str, value: &str) -> Element {
    Element::new(key, value)
}

pub fn text(element: &Element) -> String {
    String::from_utf8_lossy(element.value()).into_owned()
}

/// The payload of an optional element as text.
pub fn value_of(element: &Option<Element>) -> Option<String> {
    element.as_ref().map(text)
}

pub fn xid(global: u8, branch: u8) -> Xid {
    Xid::new(0x1234, vec![global], vec![branch])
}

/// Commits `pairs` in a transaction of its own on the calling thread.
pub fn seed(manager: &TxCacheManager, cache: &LocalTransactionStore, pairs: &[(&str, &str)]) {
    let controller = manager.transaction_controller();
    controller.begin().unwrap();
    for (key, value) in pairs {
        cache.put(element(key, value)).unwrap();
    }
    controller.commit().unwrap();
}
