mod common;

use common::xid;
use txcache::conflict::version_table::VersionTable;

#[test]
fn test_checkout_reports_live_version() {
    let table = VersionTable::new();
    let a = xid(1, 1);
    assert_eq!(table.checkout("k", &a), 0);
    assert!(table.valid("k", &a, 0));
    assert!(!table.valid("k", &a, 1));
    assert!(!table.valid("k", &xid(2, 1), 0), "only the checking-out branch is valid");
    assert!(!table.valid("other", &a, 0));
}

#[test]
fn test_write_checkin_invalidates_other_checkouts() {
    let table = VersionTable::new();
    let (a, b) = (xid(1, 1), xid(2, 1));
    table.checkout("k", &a);
    table.checkout("k", &b);

    table.checkin("k", &b, false);
    assert_eq!(table.current_version("k"), Some(1));
    assert!(!table.valid("k", &a, 0));

    // A fresh checkout sees the bumped version.
    let c = xid(3, 1);
    assert_eq!(table.checkout("k", &c), 1);
    assert!(table.valid("k", &c, 1));
}

#[test]
fn test_read_only_checkin_keeps_version() {
    let table = VersionTable::new();
    let (a, b) = (xid(1, 1), xid(2, 1));
    table.checkout("k", &a);
    table.checkout("k", &b);
    table.checkin("k", &b, true);
    assert_eq!(table.current_version("k"), Some(0));
    assert!(table.valid("k", &a, 0));
}

#[test]
fn test_records_dropped_once_untracked() {
    let table = VersionTable::new();
    let (a, b) = (xid(1, 1), xid(2, 1));
    table.checkout("x", &a);
    table.checkout("y", &a);
    table.checkout("x", &b);
    assert_eq!(table.tracked_keys(), 2);

    table.checkin("y", &a, false);
    assert_eq!(table.tracked_keys(), 1);
    assert_eq!(table.current_version("y"), None);

    table.checkin("x", &a, true);
    table.checkin("x", &b, false);
    assert_eq!(table.tracked_keys(), 0);

    // Checking in an untracked key is a no-op.
    table.checkin("x", &a, false);
    assert_eq!(table.tracked_keys(), 0);
}
