use ahash::AHashSet as HashSet;
use log::debug;
use parking_lot::Mutex;
use std::sync::Arc;

use crate::data_store::element::{Element, Key};
use crate::errors::{CacheTxnError, Result};
use crate::storage::{CacheWriter, ValueComparator};
use crate::twopc::{XAER_PROTO, XaError};
use crate::xa::command::StoreCommand;
use crate::xa::context::XaTransactionContext;
use crate::xa::resource::CacheXaResource;
use crate::xa::xa_store::XaStore;

/// Transactional facade of an XA cache.
///
/// Operations run on behalf of the branch the calling thread joined with
/// `XaResource::start`. Writes are only recorded as commands; the real store
/// changes when the branch prepares.
pub struct XaTransactionalStore {
    resource: Arc<CacheXaResource>,
    store: Arc<XaStore>,
}

impl XaTransactionalStore {
    pub fn new(resource: Arc<CacheXaResource>) -> Self {
        let store = Arc::clone(resource.store());
        Self { resource, store }
    }

    pub fn cache_name(&self) -> &str {
        self.store.cache_name()
    }

    pub fn resource(&self) -> &Arc<CacheXaResource> {
        &self.resource
    }

    pub fn get(&self, key: &str) -> Result<Option<Element>> {
        let context = self.current_context()?;
        let context = context.lock();
        Ok(self.visible(&context, key, false))
    }

    pub fn get_quiet(&self, key: &str) -> Result<Option<Element>> {
        let context = self.current_context()?;
        let context = context.lock();
        Ok(self.visible(&context, key, true))
    }

    /// Returns `true` if the key was not visible to the branch before.
    pub fn put(&self, element: Element) -> Result<bool> {
        self.record_put(element, None)
    }

    pub fn put_with_writer(&self, element: Element, writer: Arc<dyn CacheWriter>) -> Result<bool> {
        self.record_put(element, Some(writer))
    }

    pub fn put_if_absent(&self, element: Element) -> Result<Option<Element>> {
        let context = self.current_context()?;
        let mut context = context.lock();
        let current = self.visible(&context, element.key(), true);
        if current.is_some() {
            return Ok(current);
        }
        context.add_command(StoreCommand::PutIfAbsent(element), false);
        Ok(None)
    }

    pub fn remove(&self, key: &str) -> Result<Option<Element>> {
        self.record_remove(key, None)
    }

    pub fn remove_with_writer(&self, key: &str, writer: Arc<dyn CacheWriter>) -> Result<Option<Element>> {
        self.record_remove(key, Some(writer))
    }

    /// Removes the key only if its visible element equals `element`.
    pub fn remove_element(
        &self,
        element: Element,
        comparator: Arc<dyn ValueComparator>,
    ) -> Result<Option<Element>> {
        let context = self.current_context()?;
        let mut context = context.lock();
        let current = self.visible(&context, element.key(), true);
        if current.is_none() || !comparator.equals(Some(&element), current.as_ref()) {
            return Ok(None);
        }
        context.add_command(
            StoreCommand::RemoveElement {
                element,
                comparator,
            },
            true,
        );
        Ok(current)
    }

    pub fn replace(&self, element: Element) -> Result<Option<Element>> {
        let context = self.current_context()?;
        let mut context = context.lock();
        let current = self.visible(&context, element.key(), true);
        if current.is_none() {
            return Ok(None);
        }
        context.add_command(StoreCommand::Replace(element), true);
        Ok(current)
    }

    pub fn replace_element(
        &self,
        old: Element,
        new: Element,
        comparator: Arc<dyn ValueComparator>,
    ) -> Result<bool> {
        if old.key() != new.key() {
            return Err(CacheTxnError::InvalidArgument(format!(
                "replace of [{}] with an element keyed [{}]",
                old.key(),
                new.key()
            )));
        }
        let context = self.current_context()?;
        let mut context = context.lock();
        let current = self.visible(&context, old.key(), true);
        if current.is_none() || !comparator.equals(Some(&old), current.as_ref()) {
            return Ok(false);
        }
        context.add_command(
            StoreCommand::ReplaceElement {
                old,
                new,
                comparator,
            },
            true,
        );
        Ok(true)
    }

    /// Committed keys plus the branch's additions, minus its removals.
    pub fn get_keys(&self) -> Result<Vec<Key>> {
        let context = self.current_context()?;
        let context = context.lock();
        let mut keys: HashSet<Key> = self.store.underlying().keys().into_iter().collect();
        keys.extend(context.added_keys().iter().cloned());
        keys.retain(|key| !context.removed_keys().contains(key));
        Ok(keys.into_iter().collect())
    }

    pub fn get_size(&self) -> Result<usize> {
        let context = self.current_context()?;
        let context = context.lock();
        let size = self.store.underlying().size() as i64 + context.size_modifier();
        Ok(size.max(0) as usize)
    }

    pub fn contains_key(&self, key: &str) -> Result<bool> {
        Ok(self.get_quiet(key)?.is_some())
    }

    pub fn remove_all(&self) -> Result<()> {
        for key in self.get_keys()? {
            self.remove(&key)?;
        }
        Ok(())
    }

    fn record_put(&self, element: Element, writer: Option<Arc<dyn CacheWriter>>) -> Result<bool> {
        let context = self.current_context()?;
        let mut context = context.lock();
        let current = self.visible(&context, element.key(), true);
        debug!(
            "put: cache [{}] {} records key [{}]",
            self.cache_name(),
            context.xid(),
            element.key()
        );
        context.add_command(StoreCommand::Put { element, writer }, current.is_some());
        Ok(current.is_none())
    }

    fn record_remove(&self, key: &str, writer: Option<Arc<dyn CacheWriter>>) -> Result<Option<Element>> {
        let context = self.current_context()?;
        let mut context = context.lock();
        let current = self.visible(&context, key, true);
        debug!(
            "remove: cache [{}] {} records key [{}]",
            self.cache_name(),
            context.xid(),
            key
        );
        context.add_command(
            StoreCommand::Remove {
                key: key.to_string(),
                element: current.clone(),
                writer,
            },
            current.is_some(),
        );
        Ok(current)
    }

    fn current_context(&self) -> Result<Arc<Mutex<XaTransactionContext>>> {
        let xid = self
            .resource
            .current_xid()
            .ok_or(CacheTxnError::NoActiveTransaction)?;
        if self.store.is_prepared(&xid) {
            return Err(XaError::new(XAER_PROTO, format!("{} is already prepared", xid)).into());
        }
        Ok(self.store.get_or_create_context(&xid))
    }

    fn visible(&self, context: &XaTransactionContext, key: &str, quiet: bool) -> Option<Element> {
        match context.get(key) {
            Some(pending) => pending,
            None => self.store.read_committed(key, quiet),
        }
    }
}
