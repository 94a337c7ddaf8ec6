use ahash::AHashMap as HashMap;
use log::debug;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::config::{CacheConfig, ManagerConfig};
use crate::controller::TransactionController;
use crate::data_store::memory_store::MemoryStore;
use crate::errors::{CacheTxnError, Result};
use crate::local_store::LocalTransactionStore;
use crate::storage::{DefaultValueComparator, UnderlyingStore, ValueComparator};
use crate::xa::resource::CacheXaResource;
use crate::xa::transactional_store::XaTransactionalStore;
use crate::xa::xa_store::XaStore;

/// txcache Prelude
pub mod prelude {
    pub use crate::cache_manager::*;
    pub use crate::config::*;
    pub use crate::controller::*;
    pub use crate::data_store::element::*;
    pub use crate::data_store::memory_store::*;
    pub use crate::data_store::stored_value::*;
    pub use crate::errors::*;
    pub use crate::local_store::*;
    pub use crate::storage::*;
    pub use crate::transaction::*;
    pub use crate::twopc::*;
    pub use crate::xa::resource::*;
    pub use crate::xa::transactional_store::*;
}

/// The main entry point: owns the transaction controller and the named caches.
pub struct TxCacheManager {
    config: ManagerConfig,
    controller: Arc<TransactionController>,
    local_caches: RwLock<HashMap<String, Arc<LocalTransactionStore>>>,
    xa_caches: RwLock<HashMap<String, Arc<XaTransactionalStore>>>,
}

impl TxCacheManager {
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            controller: Arc::new(TransactionController::new(
                config.default_transaction_timeout(),
            )),
            config,
            local_caches: RwLock::new(HashMap::new()),
            xa_caches: RwLock::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// The controller driving every local cache of this manager.
    pub fn transaction_controller(&self) -> &Arc<TransactionController> {
        &self.controller
    }

    /// Returns the local cache named by `config`, creating it over a fresh
    /// [`MemoryStore`] on first use.
    pub fn local_cache(&self, config: CacheConfig) -> Result<Arc<LocalTransactionStore>> {
        if let Some(cache) = self.local_caches.read().get(&config.name) {
            return Ok(Arc::clone(cache));
        }
        let underlying = Arc::new(MemoryStore::new(config.lock_stripes));
        self.local_cache_over(config, underlying, Arc::new(DefaultValueComparator))
    }

    /// Registers a local cache over a caller-provided store and comparator.
    pub fn local_cache_over(
        &self,
        config: CacheConfig,
        underlying: Arc<dyn UnderlyingStore>,
        comparator: Arc<dyn ValueComparator>,
    ) -> Result<Arc<LocalTransactionStore>> {
        config.validate()?;
        self.ensure_not_xa(&config.name)?;
        let mut caches = self.local_caches.write();
        let cache = caches.entry(config.name.clone()).or_insert_with(|| {
            debug!("creating local cache [{}]", config.name);
            LocalTransactionStore::new(
                config.name.clone(),
                underlying,
                Arc::clone(&self.controller),
                comparator,
                config.retry_budget,
            )
        });
        Ok(Arc::clone(cache))
    }

    /// Returns the XA cache named by `config`, creating it over a fresh
    /// [`MemoryStore`] on first use. Its resource is reachable through
    /// [`XaTransactionalStore::resource`].
    pub fn xa_cache(&self, config: CacheConfig) -> Result<Arc<XaTransactionalStore>> {
        if let Some(cache) = self.xa_caches.read().get(&config.name) {
            return Ok(Arc::clone(cache));
        }
        let underlying = Arc::new(MemoryStore::new(config.lock_stripes));
        self.xa_cache_over(config, underlying)
    }

    pub fn xa_cache_over(
        &self,
        config: CacheConfig,
        underlying: Arc<dyn UnderlyingStore>,
    ) -> Result<Arc<XaTransactionalStore>> {
        config.validate()?;
        if self.local_caches.read().contains_key(&config.name) {
            return Err(CacheTxnError::InvalidArgument(format!(
                "cache [{}] is already a local transactional cache",
                config.name
            )));
        }
        let mut caches = self.xa_caches.write();
        let cache = caches.entry(config.name.clone()).or_insert_with(|| {
            debug!("creating XA cache [{}]", config.name);
            let store = Arc::new(XaStore::new(
                config.name.clone(),
                underlying,
                config.lock_stripes,
            ));
            let resource = Arc::new(CacheXaResource::new(
                store,
                config.xa_transaction_timeout_secs,
            ));
            Arc::new(XaTransactionalStore::new(resource))
        });
        Ok(Arc::clone(cache))
    }

    pub fn cache_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.local_caches.read().keys().cloned().collect();
        names.extend(self.xa_caches.read().keys().cloned());
        names.sort();
        names
    }

    fn ensure_not_xa(&self, name: &str) -> Result<()> {
        if self.xa_caches.read().contains_key(name) {
            return Err(CacheTxnError::InvalidArgument(format!(
                "cache [{}] is already an XA cache",
                name
            )));
        }
        Ok(())
    }
}
