mod common;

use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use common::{RecordingWriter, element, setup_xa_cache, value_of, xid};
use txcache::twopc::{
    XA_OK, XA_RBINTEGRITY, XA_RBOTHER, XA_RDONLY, XAER_DUPID, XAER_INVAL, XAER_NOTA, XAER_PROTO,
    flags,
};
use txcache::{CacheConfig, CacheTxnError, XaResource, XaTransactionalStore, Xid};

/// Runs `pairs` as puts in a branch of its own and commits it in one phase.
fn commit_branch(cache: &XaTransactionalStore, id: &Xid, pairs: &[(&str, &str)]) {
    let resource = cache.resource();
    resource.start(id, flags::TMNOFLAGS).unwrap();
    for (key, value) in pairs {
        cache.put(element(key, value)).unwrap();
    }
    resource.end(id, flags::TMSUCCESS).unwrap();
    resource.commit(id, true).unwrap();
}

/// Reads `key` from a short-lived read-only branch.
fn read_in_branch(cache: &XaTransactionalStore, id: &Xid, key: &str) -> Option<String> {
    let resource = cache.resource();
    resource.start(id, flags::TMNOFLAGS).unwrap();
    let seen = value_of(&cache.get(key).unwrap());
    resource.end(id, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(id).unwrap(), XA_RDONLY);
    seen
}

#[test]
fn test_two_phase_commit() {
    let (_manager, cache) = setup_xa_cache("xa-2pc");
    let resource = cache.resource();
    commit_branch(&cache, &xid(1, 1), &[("x", "old")]);

    let branch = xid(2, 1);
    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    assert!(!cache.put(element("x", "new")).unwrap());
    assert_eq!(value_of(&cache.get("x").unwrap()).as_deref(), Some("new"));
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&branch).unwrap(), XA_OK);

    // While the branch is in doubt, other branches keep reading the pre-image.
    assert_eq!(read_in_branch(&cache, &xid(3, 1), "x").as_deref(), Some("old"));
    assert_eq!(resource.store().old_versions().len(), 1);

    resource.commit(&branch, false).unwrap();
    assert!(resource.store().old_versions().is_empty());
    assert_eq!(resource.store().version_table().tracked_keys(), 0);
    assert_eq!(resource.active_workers(), 0);
    assert_eq!(read_in_branch(&cache, &xid(4, 1), "x").as_deref(), Some("new"));
}

#[test]
fn test_one_phase_commit() {
    let (_manager, cache) = setup_xa_cache("xa-1pc");
    let resource = cache.resource();
    commit_branch(&cache, &xid(1, 1), &[("a", "1"), ("b", "2")]);

    let branch = xid(2, 1);
    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    cache.remove("a").unwrap();
    cache.put(element("c", "3")).unwrap();
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    resource.commit(&branch, true).unwrap();

    assert_eq!(read_in_branch(&cache, &xid(3, 1), "a"), None);
    assert_eq!(read_in_branch(&cache, &xid(3, 2), "c").as_deref(), Some("3"));
    assert_eq!(resource.store().active_branches(), 0);
    assert_eq!(resource.active_workers(), 0);
}

#[test]
fn test_rollback_after_prepare_restores_pre_images() {
    let (_manager, cache) = setup_xa_cache("xa-rollback");
    let resource = cache.resource();
    commit_branch(&cache, &xid(1, 1), &[("x", "old")]);

    let branch = xid(2, 1);
    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    cache.put(element("x", "new")).unwrap();
    cache.put(element("fresh", "new")).unwrap();
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&branch).unwrap(), XA_OK);

    // A key created by an in-doubt branch does not exist for anyone else yet.
    assert_eq!(read_in_branch(&cache, &xid(3, 1), "fresh"), None);

    resource.rollback(&branch).unwrap();
    assert_eq!(read_in_branch(&cache, &xid(4, 1), "x").as_deref(), Some("old"));
    assert_eq!(read_in_branch(&cache, &xid(4, 2), "fresh"), None);
    assert_eq!(resource.store().underlying().size(), 1);
    assert!(resource.store().old_versions().is_empty());
    assert_eq!(resource.store().version_table().tracked_keys(), 0);
}

#[test]
fn test_concurrent_update_fails_prepare_with_integrity_error() {
    let (_manager, cache) = setup_xa_cache("xa-stale");
    let resource = cache.resource();
    commit_branch(&cache, &xid(1, 1), &[("x", "0")]);

    let stale = xid(2, 1);
    resource.start(&stale, flags::TMNOFLAGS).unwrap();
    cache.put(element("x", "stale")).unwrap();
    resource.end(&stale, flags::TMSUCCESS).unwrap();

    let winner_cache = Arc::clone(&cache);
    thread::spawn(move || {
        commit_branch(&winner_cache, &xid(3, 1), &[("x", "winner")]);
        println!("Winner committed x.");
    })
    .join()
    .unwrap();

    let err = resource.prepare(&stale).unwrap_err();
    println!("Stale branch failed prepare: {}", err);
    assert_eq!(err.code, XA_RBINTEGRITY);
    assert!(err.is_integrity_rollback());
    // The failed branch is discarded along with its worker.
    assert!(resource.store().context(&stale).is_none());
    assert_eq!(resource.active_workers(), 0);
    assert_eq!(read_in_branch(&cache, &xid(4, 1), "x").as_deref(), Some("winner"));
}

#[test]
fn test_read_only_branch_prepares_rdonly() {
    let (_manager, cache) = setup_xa_cache("xa-rdonly");
    let resource = cache.resource();

    let branch = xid(1, 1);
    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    assert_eq!(cache.remove("missing").unwrap(), None);
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&branch).unwrap(), XA_RDONLY);

    assert!(!resource.store().is_prepared(&branch));
    assert_eq!(resource.store().active_branches(), 0);
    assert_eq!(resource.active_workers(), 0);
    assert_eq!(resource.commit(&branch, false).unwrap_err().code, XAER_NOTA);
}

#[test]
fn test_recover_scans_in_doubt_branches() {
    let (_manager, cache) = setup_xa_cache("xa-recover");
    let resource = cache.resource();
    let branch = xid(1, 1);
    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    cache.put(element("a", "v")).unwrap();
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&branch).unwrap(), XA_OK);

    assert_eq!(resource.recover(flags::TMSTARTRSCAN).unwrap(), vec![branch.clone()]);
    // Within one scan every branch is reported once.
    assert!(resource.recover(flags::TMNOFLAGS).unwrap().is_empty());
    assert!(resource.recover(flags::TMENDRSCAN).unwrap().is_empty());
    assert_eq!(
        resource
            .recover(flags::TMSTARTRSCAN | flags::TMENDRSCAN)
            .unwrap(),
        vec![branch.clone()]
    );
    assert_eq!(resource.recover(flags::TMJOIN).unwrap_err().code, XAER_INVAL);

    assert_eq!(resource.forget(&branch).unwrap_err().code, XAER_PROTO);
    resource.commit(&branch, false).unwrap();
    assert!(resource
        .recover(flags::TMSTARTRSCAN | flags::TMENDRSCAN)
        .unwrap()
        .is_empty());
    assert_eq!(resource.forget(&branch).unwrap_err().code, XAER_NOTA);
}

#[test]
fn test_start_rejects_duplicate_association() {
    let (_manager, cache) = setup_xa_cache("xa-dupid");
    let resource = Arc::clone(cache.resource());
    let first = xid(1, 1);
    resource.start(&first, flags::TMNOFLAGS).unwrap();

    let err = resource.start(&xid(2, 1), flags::TMNOFLAGS).unwrap_err();
    assert!(err.is_duplicate_xid());

    let barrier = Arc::new(Barrier::new(2));
    let other = Arc::clone(&resource);
    let other_barrier = Arc::clone(&barrier);
    let branch = first.clone();
    let joiner = thread::spawn(move || {
        let err = other.start(&branch, flags::TMNOFLAGS).unwrap_err();
        assert_eq!(err.code, XAER_DUPID);
        // Joining an active branch from another thread is allowed.
        other.start(&branch, flags::TMJOIN).unwrap();
        other_barrier.wait();
        other.end(&branch, flags::TMSUCCESS).unwrap();
    });
    barrier.wait();
    joiner.join().unwrap();

    resource.end(&first, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.end(&first, flags::TMSUCCESS).unwrap_err().code, XAER_PROTO);
    resource.rollback(&first).unwrap();
}

#[test]
fn test_suspend_resume_and_fail() {
    let (_manager, cache) = setup_xa_cache("xa-suspend");
    let resource = cache.resource();
    let branch = xid(1, 1);

    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    cache.put(element("k", "pending")).unwrap();
    resource.end(&branch, flags::TMSUSPEND).unwrap();
    assert!(resource.store().is_suspended(&branch));
    assert!(matches!(cache.get("k"), Err(CacheTxnError::NoActiveTransaction)));

    resource.start(&branch, flags::TMRESUME).unwrap();
    assert_eq!(value_of(&cache.get("k").unwrap()).as_deref(), Some("pending"));
    resource.end(&branch, flags::TMFAIL).unwrap();

    // A failed branch is dropped before it could prepare.
    assert!(resource.store().context(&branch).is_none());
    assert_eq!(resource.prepare(&branch).unwrap_err().code, XAER_NOTA);
    assert_eq!(resource.start(&branch, flags::TMRESUME).unwrap_err().code, XAER_PROTO);
    assert_eq!(resource.store().version_table().tracked_keys(), 0);
}

#[test]
fn test_prepared_branch_rejects_operations() {
    let (_manager, cache) = setup_xa_cache("xa-prepared");
    let resource = cache.resource();
    let branch = xid(1, 1);

    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    cache.put(element("k", "v")).unwrap();
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&branch).unwrap(), XA_OK);

    assert!(resource.start(&branch, flags::TMNOFLAGS).unwrap_err().is_duplicate_xid());
    resource.start(&branch, flags::TMJOIN).unwrap();
    match cache.get("k") {
        Err(CacheTxnError::Xa(e)) => assert_eq!(e.code, XAER_PROTO),
        other => panic!("expected a protocol error, got {:?}", other),
    }
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&branch).unwrap_err().code, XAER_PROTO);
    resource.commit(&branch, false).unwrap();
}

#[test]
fn test_operations_require_an_associated_branch() {
    let (_manager, cache) = setup_xa_cache("xa-unbound");
    assert!(matches!(cache.get("k"), Err(CacheTxnError::NoActiveTransaction)));
    assert!(matches!(
        cache.put(element("k", "v")),
        Err(CacheTxnError::NoActiveTransaction)
    ));
    assert_eq!(cache.resource().forget(&xid(9, 9)).unwrap_err().code, XAER_NOTA);
}

#[test]
fn test_branch_view_of_keys_and_size() {
    let (_manager, cache) = setup_xa_cache("xa-view");
    let resource = cache.resource();
    commit_branch(&cache, &xid(1, 1), &[("a", "1"), ("b", "2")]);

    let branch = xid(2, 1);
    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    cache.put(element("c", "3")).unwrap();
    cache.remove("a").unwrap();
    assert!(!cache.contains_key("a").unwrap());
    assert_eq!(value_of(&cache.put_if_absent(element("b", "x")).unwrap()).as_deref(), Some("2"));
    let mut keys = cache.get_keys().unwrap();
    keys.sort();
    assert_eq!(keys, vec!["b".to_string(), "c".to_string()]);
    assert_eq!(cache.get_size().unwrap(), 2);
    resource.end(&branch, flags::TMSUCCESS).unwrap();

    // Another branch sees only committed state.
    let observer = xid(3, 1);
    resource.start(&observer, flags::TMNOFLAGS).unwrap();
    assert_eq!(cache.get_size().unwrap(), 2);
    assert!(cache.contains_key("a").unwrap());
    resource.end(&observer, flags::TMSUCCESS).unwrap();
    resource.rollback(&observer).unwrap();

    resource.commit(&branch, true).unwrap();
    assert_eq!(resource.store().underlying().size(), 2);
}

#[test]
fn test_writer_runs_at_prepare() {
    let (_manager, cache) = setup_xa_cache("xa-writer");
    let resource = cache.resource();
    let writer = Arc::new(RecordingWriter::new());

    let branch = xid(1, 1);
    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    cache.put_with_writer(element("w", "1"), writer.clone()).unwrap();
    cache.remove_with_writer("w", writer.clone()).unwrap();
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    assert!(writer.writes().is_empty());

    resource.prepare(&branch).unwrap();
    assert_eq!(writer.writes(), vec![("w".to_string(), "1".to_string())]);
    assert_eq!(writer.deletes(), vec!["w".to_string()]);
    resource.commit(&branch, false).unwrap();

    let failing = Arc::new(RecordingWriter::failing());
    let doomed = xid(2, 1);
    resource.start(&doomed, flags::TMNOFLAGS).unwrap();
    cache.put_with_writer(element("z", "1"), failing).unwrap();
    resource.end(&doomed, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&doomed).unwrap_err().code, XA_RBOTHER);
    assert_eq!(resource.store().underlying().size(), 0);
    assert_eq!(resource.store().active_branches(), 0);
}

#[test]
fn test_transaction_timeout_and_same_rm() {
    let (manager, cache) = setup_xa_cache("xa-timeout");
    let resource = cache.resource();
    assert_eq!(resource.transaction_timeout(), 60);
    assert!(resource.set_transaction_timeout(5).unwrap());
    assert_eq!(resource.transaction_timeout(), 5);
    assert!(resource.set_transaction_timeout(0).unwrap());
    assert_eq!(resource.transaction_timeout(), 60);
    assert_eq!(
        resource.set_transaction_timeout(-1).unwrap_err().code,
        XAER_INVAL
    );

    let other = manager.xa_cache(CacheConfig::named("xa-other")).unwrap();
    let same = manager.xa_cache(CacheConfig::named("xa-timeout")).unwrap();
    assert!(resource.is_same_rm(same.resource().as_ref()));
    assert!(!resource.is_same_rm(other.resource().as_ref()));
    assert!(manager.local_cache(CacheConfig::named("xa-other")).is_err());
}

#[test]
fn test_completed_and_unknown_branches_report_nota() {
    let (_manager, cache) = setup_xa_cache("xa-completed");
    let resource = cache.resource();

    let branch = xid(1, 1);
    resource.start(&branch, flags::TMNOFLAGS).unwrap();
    cache.put(element("x", "1")).unwrap();
    resource.end(&branch, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&branch).unwrap(), XA_OK);
    resource.commit(&branch, false).unwrap();

    // A completed branch is gone: a late rollback cannot undo the commit.
    assert_eq!(resource.rollback(&branch).unwrap_err().code, XAER_NOTA);
    assert_eq!(resource.commit(&branch, false).unwrap_err().code, XAER_NOTA);
    assert_eq!(read_in_branch(&cache, &xid(2, 1), "x").as_deref(), Some("1"));

    assert_eq!(resource.rollback(&xid(9, 9)).unwrap_err().code, XAER_NOTA);
    assert_eq!(resource.forget(&xid(9, 9)).unwrap_err().code, XAER_NOTA);

    // An unprepared branch can be forgotten, which drops its recorded writes.
    let idle = xid(3, 1);
    resource.start(&idle, flags::TMNOFLAGS).unwrap();
    cache.put(element("y", "1")).unwrap();
    resource.end(&idle, flags::TMSUCCESS).unwrap();
    resource.forget(&idle).unwrap();
    assert!(resource.store().context(&idle).is_none());
    assert_eq!(resource.prepare(&idle).unwrap_err().code, XAER_NOTA);
    assert_eq!(read_in_branch(&cache, &xid(4, 1), "y"), None);
    assert_eq!(resource.store().version_table().tracked_keys(), 0);
    assert_eq!(resource.active_workers(), 0);
}

#[test]
fn test_prepare_blocked_behind_prepared_branch_revalidates() {
    let (_manager, cache) = setup_xa_cache("xa-revalidate");
    let resource = Arc::clone(cache.resource());

    let first = xid(1, 1);
    resource.start(&first, flags::TMNOFLAGS).unwrap();
    cache.put(element("x", "a")).unwrap();
    resource.end(&first, flags::TMSUCCESS).unwrap();
    assert_eq!(resource.prepare(&first).unwrap(), XA_OK);

    // The second branch read x at the same version, so it passes the first
    // validation and then waits for the key locks held by the first branch.
    let second = xid(2, 1);
    resource.start(&second, flags::TMNOFLAGS).unwrap();
    cache.put(element("y", "b")).unwrap();
    cache.put(element("x", "b")).unwrap();
    resource.end(&second, flags::TMSUCCESS).unwrap();

    let blocked = Arc::clone(&resource);
    let branch = second.clone();
    let preparer = thread::spawn(move || blocked.prepare(&branch));

    thread::sleep(Duration::from_millis(200));
    resource.commit(&first, false).unwrap();
    println!("First branch committed x.");

    let err = preparer.join().unwrap().unwrap_err();
    println!("Blocked branch failed prepare: {}", err);
    assert_eq!(err.code, XA_RBINTEGRITY);
    assert!(resource.store().context(&second).is_none());
    assert!(resource.store().old_versions().is_empty());
    assert_eq!(resource.store().version_table().tracked_keys(), 0);
    assert_eq!(read_in_branch(&cache, &xid(3, 1), "x").as_deref(), Some("a"));
    assert_eq!(read_in_branch(&cache, &xid(3, 2), "y"), None);
    assert_eq!(resource.active_workers(), 0);
}
