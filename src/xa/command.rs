use std::fmt;
use std::sync::Arc;

use crate::data_store::element::{Element, Key};
use crate::data_store::stored_value::StoredValue;
use crate::errors::Result;
use crate::storage::{CacheWriter, UnderlyingStore, ValueComparator};

/// A mutation recorded by an XA branch and replayed on the real store at prepare.
#[derive(Clone)]
pub enum StoreCommand {
    Put {
        element: Element,
        writer: Option<Arc<dyn CacheWriter>>,
    },
    PutIfAbsent(Element),
    Remove {
        key: Key,
        element: Option<Element>,
        writer: Option<Arc<dyn CacheWriter>>,
    },
    RemoveElement {
        element: Element,
        comparator: Arc<dyn ValueComparator>,
    },
    Replace(Element),
    ReplaceElement {
        old: Element,
        new: Element,
        comparator: Arc<dyn ValueComparator>,
    },
}

impl StoreCommand {
    pub fn key(&self) -> &Key {
        match self {
            StoreCommand::Put { element, .. }
            | StoreCommand::PutIfAbsent(element)
            | StoreCommand::RemoveElement { element, .. }
            | StoreCommand::Replace(element) => element.key(),
            StoreCommand::Remove { key, .. } => key,
            StoreCommand::ReplaceElement { new, .. } => new.key(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StoreCommand::Put { .. } => "put",
            StoreCommand::PutIfAbsent(_) => "putIfAbsent",
            StoreCommand::Remove { .. } => "remove",
            StoreCommand::RemoveElement { .. } => "removeElement",
            StoreCommand::Replace(_) => "replace",
            StoreCommand::ReplaceElement { .. } => "replaceElement",
        }
    }

    /// The element the key holds after this command, `None` for removals.
    pub fn resulting_element(&self) -> Option<&Element> {
        match self {
            StoreCommand::Put { element, .. }
            | StoreCommand::PutIfAbsent(element)
            | StoreCommand::Replace(element) => Some(element),
            StoreCommand::ReplaceElement { new, .. } => Some(new),
            StoreCommand::Remove { .. } | StoreCommand::RemoveElement { .. } => None,
        }
    }

    /// Applies the command to `store`. Returns whether the store changed.
    pub fn execute(&self, store: &dyn UnderlyingStore) -> bool {
        match self {
            StoreCommand::Put { element, .. } => {
                store.put(StoredValue::Plain(element.clone()));
                true
            }
            StoreCommand::PutIfAbsent(element) => store
                .put_if_absent(StoredValue::Plain(element.clone()))
                .is_none(),
            StoreCommand::Remove { key, .. } => store.remove(key).is_some(),
            StoreCommand::RemoveElement {
                element,
                comparator,
            } => store.remove_if(&StoredValue::Plain(element.clone()), comparator.as_ref()),
            StoreCommand::Replace(element) => {
                store.replace(StoredValue::Plain(element.clone())).is_some()
            }
            StoreCommand::ReplaceElement {
                old,
                new,
                comparator,
            } => store.replace_if(
                &StoredValue::Plain(old.clone()),
                StoredValue::Plain(new.clone()),
                comparator.as_ref(),
            ),
        }
    }

    /// Forwards the command to its writer, if it was recorded with one.
    pub fn write_through(&self) -> Result<()> {
        match self {
            StoreCommand::Put {
                element,
                writer: Some(writer),
            } => writer.write(element),
            StoreCommand::Remove {
                key,
                element,
                writer: Some(writer),
            } => writer.delete(key, element.as_ref()),
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for StoreCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.name(), self.key())
    }
}

/// A [`StoreCommand`] tagged with the key version its branch checked out.
#[derive(Debug, Clone)]
pub struct VersionAwareCommand {
    command: StoreCommand,
    version: u64,
}

impl VersionAwareCommand {
    pub fn new(command: StoreCommand, version: u64) -> Self {
        Self { command, version }
    }

    pub fn command(&self) -> &StoreCommand {
        &self.command
    }

    pub fn key(&self) -> &Key {
        self.command.key()
    }

    pub fn version(&self) -> u64 {
        self.version
    }
}
