use std::sync::Arc;
use std::time::Duration;

use crate::data_store::element::{Element, Key};
use crate::data_store::lock_provider::KeySync;
use crate::data_store::stored_value::StoredValue;
use crate::errors::Result;

/// Decides whether two elements are equal for compare-and-swap purposes.
pub trait ValueComparator: Send + Sync {
    /// `None` stands for "no element". Two `None`s are equal.
    fn equals(&self, e1: Option<&Element>, e2: Option<&Element>) -> bool;
}

/// Compares keys and payload bytes. Versions are ignored.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultValueComparator;

impl ValueComparator for DefaultValueComparator {
    fn equals(&self, e1: Option<&Element>, e2: Option<&Element>) -> bool {
        match (e1, e2) {
            (None, None) => true,
            (Some(a), Some(b)) => a.key() == b.key() && a.value() == b.value(),
            _ => false,
        }
    }
}

/// Per-key locks exposed by an [`UnderlyingStore`].
pub trait CacheLockProvider: Send + Sync {
    /// The lock guarding `key`. Several keys may share one lock.
    fn sync_for_key(&self, key: &str) -> Arc<KeySync>;

    /// Write-locks every lock guarding `keys`, each at most once, in order of
    /// first appearance. Returns `None`, holding nothing, if any lock could not
    /// be taken within `timeout`.
    fn write_lock_all_for_keys(&self, keys: &[Key], timeout: Duration) -> Option<Vec<Arc<KeySync>>>;

    /// Releases what a successful `write_lock_all_for_keys(keys, ..)` took.
    fn unlock_write_lock_for_all_keys(&self, keys: &[Key]);
}

/// The concurrent map the transactional stores are layered over.
///
/// Implementations must make every single-key operation atomic. The
/// transactional layers build their protocols out of `put_if_absent`,
/// `replace_if` and `remove_if`, so those three must behave as true
/// compare-and-swap operations.
///
/// Implementations must be `Send` and `Sync`; they are shared by every
/// transaction running against the cache.
pub trait UnderlyingStore: Send + Sync {
    /// Reads a value, counting the access.
    fn get(&self, key: &str) -> Option<StoredValue>;

    /// Reads a value without touching access statistics.
    fn get_quiet(&self, key: &str) -> Option<StoredValue>;

    /// Stores `value`. Returns `true` if the key was not present before.
    fn put(&self, value: StoredValue) -> bool;

    /// Stores `value` only if its key is absent. Returns the present value otherwise.
    fn put_if_absent(&self, value: StoredValue) -> Option<StoredValue>;

    /// Replaces the value of `old`'s key with `new` only if it still matches `old`.
    fn replace_if(&self, old: &StoredValue, new: StoredValue, comparator: &dyn ValueComparator) -> bool;

    /// Replaces the value of an existing key. Returns the previous value.
    fn replace(&self, value: StoredValue) -> Option<StoredValue>;

    fn remove(&self, key: &str) -> Option<StoredValue>;

    /// Removes the key of `value` only if its current value matches `value`.
    fn remove_if(&self, value: &StoredValue, comparator: &dyn ValueComparator) -> bool;

    fn is_pinned(&self, key: &str) -> bool;

    fn set_pinned(&self, key: &str, pinned: bool);

    fn keys(&self) -> Vec<Key>;

    fn size(&self) -> usize;

    fn lock_provider(&self) -> &dyn CacheLockProvider;
}

/// Write-through target notified before a transaction commits.
///
/// # Examples
///
/// ```no_run
/// use txcache::prelude::*;
///
/// struct Audit;
///
/// impl CacheWriter for Audit {
///     fn write(&self, element: &Element) -> txcache::Result<()> {
///         println!("write {}", element.key());
///         Ok(())
///     }
///
///     fn delete(&self, key: &str, _element: Option<&Element>) -> txcache::Result<()> {
///         println!("delete {}", key);
///         Ok(())
///     }
/// }
/// ```
pub trait CacheWriter: Send + Sync {
    fn write(&self, element: &Element) -> Result<()>;

    fn delete(&self, key: &str, element: Option<&Element>) -> Result<()>;
}
