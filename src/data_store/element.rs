use std::sync::Arc;

/// The key type for cache entries.
pub type Key = String;

/// A cache entry: key, opaque payload and the version it was committed at.
///
/// Payloads are shared through an `Arc` so snapshots taken by soft locks and
/// prepared XA branches stay cheap to clone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    key: Key,
    value: Arc<[u8]>,
    version: u64,
    eternal: bool,
}

impl Element {
    /// Creates a new element at version `0`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use txcache::prelude::*;
    ///
    /// let element = Element::new("user:1", "alice");
    /// assert_eq!(element.value(), b"alice");
    /// assert_eq!(element.version(), 0);
    /// ```
    pub fn new(key: impl Into<Key>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            key: key.into(),
            value: Arc::from(value.into()),
            version: 0,
            eternal: false,
        }
    }

    pub fn key(&self) -> &Key {
        &self.key
    }

    pub fn value(&self) -> &[u8] {
        &self.value
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// Returns a copy of this element carrying `version`.
    pub fn with_version(&self, version: u64) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }

    pub fn is_eternal(&self) -> bool {
        self.eternal
    }

    pub fn set_eternal(&mut self, eternal: bool) {
        self.eternal = eternal;
    }
}
