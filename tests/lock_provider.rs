use std::sync::Arc;
use std::thread;
use std::time::Duration;

use txcache::data_store::lock_provider::{LockType, StripedLockProvider};
use txcache::storage::CacheLockProvider;

#[test]
fn test_same_key_maps_to_same_stripe() {
    let provider = StripedLockProvider::new(16);
    let first = provider.sync_for_key("k");
    let second = provider.sync_for_key("k");
    assert!(Arc::ptr_eq(&first, &second));

    // With a single stripe every key shares it.
    let single = StripedLockProvider::new(1);
    assert!(Arc::ptr_eq(&single.sync_for_key("a"), &single.sync_for_key("b")));
}

#[test]
fn test_write_lock_all_times_out_holding_nothing() {
    let provider = Arc::new(StripedLockProvider::new(1));
    let keys = vec!["a".to_string(), "b".to_string()];
    let held = provider
        .write_lock_all_for_keys(&keys, Duration::from_millis(50))
        .unwrap();
    assert_eq!(held.len(), 1, "keys sharing a stripe lock it once");

    let contender = Arc::clone(&provider);
    let other = keys.clone();
    let timed_out = thread::spawn(move || {
        contender
            .write_lock_all_for_keys(&other, Duration::from_millis(50))
            .is_none()
    })
    .join()
    .unwrap();
    assert!(timed_out);

    provider.unlock_write_lock_for_all_keys(&keys);
    let sync = provider.sync_for_key("a");
    assert!(!sync.is_held_by_writer());
    assert!(sync.try_lock(LockType::Read, Duration::from_millis(10)));
    sync.unlock(LockType::Read);
}
