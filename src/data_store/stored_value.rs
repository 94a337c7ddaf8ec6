use std::sync::Arc;

use crate::data_store::element::{Element, Key};
use crate::soft_lock::SoftLock;
use crate::storage::ValueComparator;

/// What the underlying store actually holds for a key.
///
/// A key is either a plain committed element, or a soft lock installed by a
/// local transaction that carries both the committed and the pending element.
#[derive(Debug, Clone)]
pub enum StoredValue {
    Plain(Element),
    Locked(Arc<SoftLock>),
}

impl StoredValue {
    pub fn key(&self) -> &Key {
        match self {
            StoredValue::Plain(element) => element.key(),
            StoredValue::Locked(lock) => lock.key(),
        }
    }

    pub fn as_plain(&self) -> Option<&Element> {
        match self {
            StoredValue::Plain(element) => Some(element),
            StoredValue::Locked(_) => None,
        }
    }

    pub fn as_soft_lock(&self) -> Option<&Arc<SoftLock>> {
        match self {
            StoredValue::Plain(_) => None,
            StoredValue::Locked(lock) => Some(lock),
        }
    }

    /// Compare-and-swap equality: plain elements go through `comparator`,
    /// soft locks match only the very same lock instance.
    pub fn matches(&self, other: &StoredValue, comparator: &dyn ValueComparator) -> bool {
        match (self, other) {
            (StoredValue::Plain(a), StoredValue::Plain(b)) => comparator.equals(Some(a), Some(b)),
            (StoredValue::Locked(a), StoredValue::Locked(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}
