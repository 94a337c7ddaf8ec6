use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use std::sync::Arc;

use crate::conflict::version_table::VersionTable;
use crate::data_store::element::{Element, Key};
use crate::twopc::Xid;
use crate::xa::command::{StoreCommand, VersionAwareCommand};

/// Work of one XA branch before it prepares.
///
/// Records commands in order, checks out each touched key's version on first
/// use, and maintains the branch's own view of the keys it changed so reads
/// inside the branch see its writes.
pub struct XaTransactionContext {
    xid: Xid,
    version_table: Arc<VersionTable>,
    commands: Vec<VersionAwareCommand>,
    checked_out: HashMap<Key, u64>,
    pending: HashMap<Key, Option<Element>>,
    added_keys: HashSet<Key>,
    removed_keys: HashSet<Key>,
    size_modifier: i64,
}

impl XaTransactionContext {
    pub fn new(xid: Xid, version_table: Arc<VersionTable>) -> Self {
        Self {
            xid,
            version_table,
            commands: Vec::new(),
            checked_out: HashMap::new(),
            pending: HashMap::new(),
            added_keys: HashSet::new(),
            removed_keys: HashSet::new(),
            size_modifier: 0,
        }
    }

    pub fn xid(&self) -> &Xid {
        &self.xid
    }

    /// Records `command`. `previously_visible` tells whether the branch saw an
    /// element for the key right before, which drives size accounting.
    pub fn add_command(&mut self, command: StoreCommand, previously_visible: bool) {
        let key = command.key().clone();
        let version = match self.checked_out.get(&key) {
            Some(version) => *version,
            None => {
                let version = self.version_table.checkout(&key, &self.xid);
                self.checked_out.insert(key.clone(), version);
                version
            }
        };

        match command.resulting_element() {
            Some(element) => {
                if !previously_visible {
                    self.size_modifier += 1;
                    self.added_keys.insert(key.clone());
                }
                self.removed_keys.remove(&key);
                self.pending.insert(key, Some(element.clone()));
            }
            None => {
                if previously_visible {
                    self.size_modifier -= 1;
                    self.removed_keys.insert(key.clone());
                }
                self.added_keys.remove(&key);
                self.pending.insert(key, None);
            }
        }

        self.commands.push(VersionAwareCommand::new(command, version));
    }

    /// The branch's view of `key`: `None` if untouched, `Some(None)` if removed.
    pub fn get(&self, key: &str) -> Option<Option<Element>> {
        self.pending.get(key).cloned()
    }

    pub fn is_removed(&self, key: &str) -> bool {
        matches!(self.pending.get(key), Some(None))
    }

    pub fn commands(&self) -> &[VersionAwareCommand] {
        &self.commands
    }

    /// Keys touched by the branch, in order of first command.
    pub fn updated_keys(&self) -> Vec<Key> {
        let mut seen = HashSet::new();
        self.commands
            .iter()
            .filter(|command| seen.insert(command.key().clone()))
            .map(|command| command.key().clone())
            .collect()
    }

    pub fn added_keys(&self) -> &HashSet<Key> {
        &self.added_keys
    }

    pub fn removed_keys(&self) -> &HashSet<Key> {
        &self.removed_keys
    }

    pub fn size_modifier(&self) -> i64 {
        self.size_modifier
    }

    /// Checks in, read-only, every version this branch still holds.
    pub fn release_versions(&mut self) {
        for (key, _) in self.checked_out.drain() {
            self.version_table.checkin(&key, &self.xid, true);
        }
    }
}
