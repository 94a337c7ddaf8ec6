use serde::{Deserialize, Serialize};
use std::fmt;

/// XA flags accepted by [`XaResource`] verbs.
pub mod flags {
    pub const TMNOFLAGS: i32 = 0x0000_0000;
    pub const TMJOIN: i32 = 0x0020_0000;
    pub const TMENDRSCAN: i32 = 0x0080_0000;
    pub const TMSTARTRSCAN: i32 = 0x0100_0000;
    pub const TMSUSPEND: i32 = 0x0200_0000;
    pub const TMSUCCESS: i32 = 0x0400_0000;
    pub const TMRESUME: i32 = 0x0800_0000;
    pub const TMFAIL: i32 = 0x2000_0000;
    pub const TMONEPHASE: i32 = 0x4000_0000;

    /// Human readable rendering of a flag set, for logs.
    pub fn pretty_print(flags: i32) -> String {
        const NAMES: [(i32, &str); 9] = [
            (TMJOIN, "TMJOIN"),
            (TMENDRSCAN, "TMENDRSCAN"),
            (TMSTARTRSCAN, "TMSTARTRSCAN"),
            (TMSUSPEND, "TMSUSPEND"),
            (TMSUCCESS, "TMSUCCESS"),
            (TMRESUME, "TMRESUME"),
            (TMFAIL, "TMFAIL"),
            (TMONEPHASE, "TMONEPHASE"),
            (TMNOFLAGS, "TMNOFLAGS"),
        ];
        if flags == TMNOFLAGS {
            return "TMNOFLAGS".to_string();
        }
        NAMES
            .iter()
            .filter(|(flag, _)| *flag != TMNOFLAGS && flags & flag == *flag)
            .map(|(_, name)| *name)
            .collect::<Vec<_>>()
            .join("|")
    }
}

/// Successful outcome of `prepare`.
pub const XA_OK: i32 = 0;
/// `prepare` outcome of a branch that changed nothing.
pub const XA_RDONLY: i32 = 3;

/// Heuristic rollback already happened.
pub const XA_HEURRB: i32 = 6;
/// Heuristic commit already happened.
pub const XA_HEURCOM: i32 = 7;
/// Rolled back for an unspecified reason.
pub const XA_RBOTHER: i32 = 102;
/// Rolled back: a concurrent update invalidated the branch.
pub const XA_RBINTEGRITY: i32 = 103;
/// Rolled back: a lock could not be taken in time.
pub const XA_RBTIMEOUT: i32 = 106;
/// Unknown branch.
pub const XAER_NOTA: i32 = -4;
/// Invalid arguments.
pub const XAER_INVAL: i32 = -5;
/// Verb called in the wrong state.
pub const XAER_PROTO: i32 = -6;
/// Resource manager failure.
pub const XAER_RMFAIL: i32 = -7;
/// The branch id is already in use.
pub const XAER_DUPID: i32 = -8;
/// Generic failure.
pub const XAER_GENERIC: i32 = -1;

/// Global transaction branch identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Xid {
    format_id: i32,
    global_transaction_id: Vec<u8>,
    branch_qualifier: Vec<u8>,
}

impl Xid {
    pub fn new(
        format_id: i32,
        global_transaction_id: impl Into<Vec<u8>>,
        branch_qualifier: impl Into<Vec<u8>>,
    ) -> Self {
        Self {
            format_id,
            global_transaction_id: global_transaction_id.into(),
            branch_qualifier: branch_qualifier.into(),
        }
    }

    pub fn format_id(&self) -> i32 {
        self.format_id
    }

    pub fn global_transaction_id(&self) -> &[u8] {
        &self.global_transaction_id
    }

    pub fn branch_qualifier(&self) -> &[u8] {
        &self.branch_qualifier
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Xid[{}:", self.format_id)?;
        for byte in &self.global_transaction_id {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ":")?;
        for byte in &self.branch_qualifier {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, "]")
    }
}

/// Error returned by XA verbs, carrying an XA error code.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message} (XA code {code})")]
pub struct XaError {
    pub code: i32,
    pub message: String,
}

impl XaError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(XAER_GENERIC, message)
    }

    pub fn is_integrity_rollback(&self) -> bool {
        self.code == XA_RBINTEGRITY
    }

    pub fn is_duplicate_xid(&self) -> bool {
        self.code == XAER_DUPID
    }
}

pub type XaResult<T> = std::result::Result<T, XaError>;

/// A resource manager taking part in XA two-phase commit.
///
/// A transaction manager drives each branch, identified by its [`Xid`],
/// through `start`/`end` association, then `prepare` and `commit` or
/// `rollback`. After a crash of the transaction manager, `recover` lists the
/// branches left prepared.
pub trait XaResource: Send + Sync {
    /// Name of the resource manager. Resources with equal names are the same RM.
    fn resource_name(&self) -> &str;

    /// Associates the calling thread with `xid`.
    fn start(&self, xid: &Xid, flags: i32) -> XaResult<()>;

    /// Dissociates the calling thread from `xid`.
    fn end(&self, xid: &Xid, flags: i32) -> XaResult<()>;

    /// Phase 1. Returns [`XA_OK`] or [`XA_RDONLY`].
    fn prepare(&self, xid: &Xid) -> XaResult<i32>;

    /// Phase 2. With `one_phase` the branch is prepared and committed in one go.
    fn commit(&self, xid: &Xid, one_phase: bool) -> XaResult<()>;

    fn rollback(&self, xid: &Xid) -> XaResult<()>;

    /// Discards knowledge of a heuristically completed branch.
    fn forget(&self, xid: &Xid) -> XaResult<()>;

    /// Prepared branches, honouring `TMSTARTRSCAN`/`TMENDRSCAN`.
    fn recover(&self, flags: i32) -> XaResult<Vec<Xid>>;

    fn is_same_rm(&self, other: &dyn XaResource) -> bool {
        self.resource_name() == other.resource_name()
    }

    /// Transaction timeout in seconds.
    fn transaction_timeout(&self) -> i32;

    /// Sets the timeout in seconds; `0` restores the default. Negative values
    /// fail with `XAER_INVAL`.
    fn set_transaction_timeout(&self, seconds: i32) -> XaResult<bool>;
}
