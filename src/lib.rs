pub mod cache_manager;
pub mod config;
pub mod conflict;
pub mod controller;
pub mod data_store;
pub mod errors;
pub mod local_store;
pub mod soft_lock;
pub mod storage;
pub mod transaction;
pub mod twopc;
pub mod xa;

// Re-export key types and structs for easier access
pub use cache_manager::{TxCacheManager, prelude};
pub use config::{CacheConfig, ManagerConfig};
pub use controller::TransactionController;
pub use data_store::element::{Element, Key};
pub use data_store::memory_store::MemoryStore;
pub use data_store::stored_value::StoredValue;
pub use errors::{CacheTxnError, Result};
pub use local_store::LocalTransactionStore;
pub use soft_lock::SoftLock;
pub use storage::{CacheWriter, DefaultValueComparator, UnderlyingStore, ValueComparator};
pub use transaction::{LocalTransactionContext, TransactionId, TransactionListener};
pub use twopc::{XaError, XaResource, Xid};
pub use xa::resource::CacheXaResource;
pub use xa::transactional_store::XaTransactionalStore;
