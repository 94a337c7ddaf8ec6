use ahash::AHashMap as HashMap;
use parking_lot::Mutex;

use crate::data_store::element::Key;
use crate::twopc::Xid;

/// Version record of one key: the live version and the version each
/// transaction checked out.
#[derive(Debug, Default)]
pub struct Version {
    version: u64,
    checked_out: HashMap<Xid, u64>,
}

impl Version {
    pub fn version(&self) -> u64 {
        self.version
    }

    fn checkout(&mut self, xid: &Xid) -> u64 {
        self.checked_out.insert(xid.clone(), self.version);
        self.version
    }

    /// Drops `xid`'s checkout, bumping the live version for a write.
    /// Returns whether no transaction tracks the key anymore.
    fn checkin(&mut self, xid: &Xid, read_only: bool) -> bool {
        if !read_only {
            self.version += 1;
        }
        self.checked_out.remove(xid);
        self.checked_out.is_empty()
    }

    fn valid(&self, xid: &Xid, version: u64) -> bool {
        self.checked_out.get(xid) == Some(&version) && self.version == version
    }
}

/// Versioned key registry used by XA branches to detect concurrent updates.
///
/// A branch checks out the current version of each key it touches. At
/// prepare, a command is valid only if the branch's checkout still equals the
/// live version; any write checked in meanwhile by another branch bumps the
/// live version and makes it stale. Records exist only while at least one
/// branch tracks the key.
#[derive(Debug, Default)]
pub struct VersionTable {
    versions: Mutex<HashMap<Key, Version>>,
}

impl VersionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records that `xid` observed the current version of `key` and returns it.
    pub fn checkout(&self, key: &str, xid: &Xid) -> u64 {
        self.versions
            .lock()
            .entry(key.to_string())
            .or_default()
            .checkout(xid)
    }

    /// Releases `xid`'s checkout of `key`; a write (`read_only == false`)
    /// bumps the live version first. Untracked keys are ignored.
    pub fn checkin(&self, key: &str, xid: &Xid, read_only: bool) {
        let mut versions = self.versions.lock();
        let now_empty = match versions.get_mut(key) {
            Some(version) => version.checkin(xid, read_only),
            None => return,
        };
        if now_empty {
            versions.remove(key);
        }
    }

    /// `true` iff `xid` checked out `version` of `key` and it is still the live one.
    pub fn valid(&self, key: &str, xid: &Xid, version: u64) -> bool {
        self.versions
            .lock()
            .get(key)
            .is_some_and(|record| record.valid(xid, version))
    }

    pub fn current_version(&self, key: &str) -> Option<u64> {
        self.versions.lock().get(key).map(Version::version)
    }

    /// Number of keys tracked by at least one branch.
    pub fn tracked_keys(&self) -> usize {
        self.versions.lock().len()
    }
}
