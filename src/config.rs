use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::errors::{CacheTxnError, Result};

/// Default XA transaction timeout, in seconds.
pub const DEFAULT_XA_TRANSACTION_TIMEOUT_SECS: i32 = 60;

/// Settings shared by every cache created from one [`TxCacheManager`](crate::TxCacheManager).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Timeout applied by `TransactionController::begin`, in milliseconds.
    pub default_transaction_timeout_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            default_transaction_timeout_ms: 15_000,
        }
    }
}

impl ManagerConfig {
    pub fn default_transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.default_transaction_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.default_transaction_timeout_ms == 0 {
            return Err(CacheTxnError::InvalidArgument(
                "default transaction timeout must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Per-cache settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Cache name. XA resources compare equal by this name.
    pub name: String,
    /// Upper bound on optimistic retries of a single store operation.
    pub retry_budget: u32,
    /// Number of lock stripes handed out by the store's lock provider.
    pub lock_stripes: usize,
    /// XA transaction timeout in seconds; `0` selects the default.
    pub xa_transaction_timeout_secs: i32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            retry_budget: 100_000,
            lock_stripes: 128,
            xa_transaction_timeout_secs: DEFAULT_XA_TRANSACTION_TIMEOUT_SECS,
        }
    }
}

impl CacheConfig {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(CacheTxnError::InvalidArgument(
                "cache name must not be empty".to_string(),
            ));
        }
        if self.lock_stripes == 0 {
            return Err(CacheTxnError::InvalidArgument(format!(
                "cache [{}]: lock stripes must be positive",
                self.name
            )));
        }
        if self.retry_budget == 0 {
            return Err(CacheTxnError::InvalidArgument(format!(
                "cache [{}]: retry budget must be positive",
                self.name
            )));
        }
        if self.xa_transaction_timeout_secs < 0 {
            return Err(CacheTxnError::InvalidArgument(format!(
                "cache [{}]: XA transaction timeout must be >= 0",
                self.name
            )));
        }
        Ok(())
    }
}
