use log::debug;

use crate::conflict::version_table::VersionTable;
use crate::twopc::{XA_RBINTEGRITY, XaError, XaResult, Xid};
use crate::xa::command::VersionAwareCommand;

/// Checks that the version `command` was recorded against is still live.
pub fn validate_command(command: &VersionAwareCommand, xid: &Xid, table: &VersionTable) -> XaResult<()> {
    if table.valid(command.key(), xid, command.version()) {
        return Ok(());
    }
    debug!(
        "{}: stale version {} for key [{}] (live: {:?})",
        xid,
        command.version(),
        command.key(),
        table.current_version(command.key())
    );
    Err(XaError::new(
        XA_RBINTEGRITY,
        format!("invalid version for element: {}", command.key()),
    ))
}

/// Validates every command of a branch, failing on the first stale one.
pub fn validate_commands(commands: &[VersionAwareCommand], xid: &Xid, table: &VersionTable) -> XaResult<()> {
    commands
        .iter()
        .try_for_each(|command| validate_command(command, xid, table))
}
