use thiserror::Error;

use crate::twopc::XaError;

#[derive(Error, Debug)]
pub enum CacheTxnError {
    #[error("No transaction is bound to the current thread")]
    NoActiveTransaction,

    #[error("A transaction is already bound to the current thread")]
    TransactionAlreadyStarted,

    #[error("Transaction [{0}] timed out")]
    TransactionTimedOut(u64),

    #[error("Transaction [{0}] interrupted")]
    TransactionInterrupted(u64),

    #[error(
        "Deadlock detected in cache [{cache}] on key [{key}]: transaction [{current}] waits for [{foreign}]"
    )]
    DeadlockDetected {
        cache: String,
        key: String,
        current: u64,
        foreign: u64,
    },

    #[error("Cache [{cache}]: gave up on key [{key}] after {budget} optimistic attempts")]
    RetryBudgetExhausted {
        cache: String,
        key: String,
        budget: u32,
    },

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Cache writer error: {0}")]
    Writer(String),

    #[error("XA error: {0}")]
    Xa(#[from] XaError),
}

impl CacheTxnError {
    /// `true` when the error is an XA integrity rollback (stale version at prepare).
    pub fn is_integrity_rollback(&self) -> bool {
        matches!(self, CacheTxnError::Xa(e) if e.is_integrity_rollback())
    }
}

pub type Result<T> = std::result::Result<T, CacheTxnError>;
