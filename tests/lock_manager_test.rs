use std::sync::Arc;
use std::thread;
use std::time::Duration;

use siltdb::common::types::Rid;
use siltdb::transaction::{
    IsolationLevel, LockManager, TransactionAbortError, TransactionManager, TransactionState,
};

fn setup() -> (Arc<TransactionManager>, LockManager) {
    let registry = Arc::new(TransactionManager::new());
    let lock_manager = LockManager::new(registry.clone());
    (registry, lock_manager)
}

#[test]
fn test_shared_lock_basic() {
    let (registry, lock_manager) = setup();
    let txn = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_shared(&txn, rid), Ok(true));
    assert!(txn.is_shared_locked(rid));
    assert_eq!(txn.state(), TransactionState::Growing);

    // Re-requesting a held mode succeeds without a second queue entry.
    assert_eq!(lock_manager.lock_shared(&txn, rid), Ok(true));

    assert!(lock_manager.unlock(&txn, rid));
    assert!(!txn.is_shared_locked(rid));
}

#[test]
fn test_shared_locks_are_compatible() {
    let (registry, lock_manager) = setup();
    let t0 = registry.begin(IsolationLevel::RepeatableRead);
    let t1 = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_shared(&t0, rid), Ok(true));
    assert_eq!(lock_manager.lock_shared(&t1, rid), Ok(true));
    assert!(t0.is_shared_locked(rid));
    assert!(t1.is_shared_locked(rid));
}

#[test]
fn test_exclusive_lock_covers_shared_request() {
    let (registry, lock_manager) = setup();
    let txn = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_exclusive(&txn, rid), Ok(true));
    // Holding the stronger mode satisfies a shared request.
    assert_eq!(lock_manager.lock_shared(&txn, rid), Ok(true));
    assert_eq!(lock_manager.lock_exclusive(&txn, rid), Ok(true));
}

#[test]
fn test_read_uncommitted_shared_lock_aborts() {
    let (registry, lock_manager) = setup();
    let txn = registry.begin(IsolationLevel::ReadUncommitted);
    let rid = Rid::new(1, 0);

    assert_eq!(
        lock_manager.lock_shared(&txn, rid),
        Err(TransactionAbortError::SharedLockOnReadUncommitted(txn.id()))
    );
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_aborted_transaction_cannot_lock() {
    let (registry, lock_manager) = setup();
    let txn = registry.begin(IsolationLevel::RepeatableRead);
    txn.set_state(TransactionState::Aborted);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_shared(&txn, rid), Ok(false));
    assert_eq!(lock_manager.lock_exclusive(&txn, rid), Ok(false));
    assert_eq!(lock_manager.lock_upgrade(&txn, rid), Ok(false));
}

#[test]
fn test_strict_two_phase_locking_shrink_point() {
    let (registry, lock_manager) = setup();
    let txn = registry.begin(IsolationLevel::RepeatableRead);
    let r0 = Rid::new(1, 0);
    let r1 = Rid::new(1, 1);

    assert_eq!(lock_manager.lock_shared(&txn, r0), Ok(true));
    assert_eq!(txn.state(), TransactionState::Growing);

    // First release under REPEATABLE READ is the shrink point.
    assert!(lock_manager.unlock(&txn, r0));
    assert_eq!(txn.state(), TransactionState::Shrinking);

    // Acquiring after the shrink point aborts the transaction.
    assert_eq!(
        lock_manager.lock_shared(&txn, r1),
        Err(TransactionAbortError::LockOnShrinking(txn.id()))
    );
    assert_eq!(txn.state(), TransactionState::Aborted);
}

#[test]
fn test_read_committed_unlock_keeps_growing() {
    let (registry, lock_manager) = setup();
    let txn = registry.begin(IsolationLevel::ReadCommitted);
    let r0 = Rid::new(1, 0);
    let r1 = Rid::new(1, 1);

    assert_eq!(lock_manager.lock_shared(&txn, r0), Ok(true));
    assert!(lock_manager.unlock(&txn, r0));
    // Early release is allowed without entering the shrink phase.
    assert_eq!(txn.state(), TransactionState::Growing);
    assert_eq!(lock_manager.lock_shared(&txn, r1), Ok(true));
}

#[test]
fn test_upgrade_moves_shared_to_exclusive() {
    let (registry, lock_manager) = setup();
    let txn = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_shared(&txn, rid), Ok(true));
    assert_eq!(lock_manager.lock_upgrade(&txn, rid), Ok(true));

    assert!(txn.is_exclusive_locked(rid));
    assert!(!txn.is_shared_locked(rid));
}

#[test]
fn test_exclusive_request_over_shared_upgrades() {
    let (registry, lock_manager) = setup();
    let txn = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_shared(&txn, rid), Ok(true));
    assert_eq!(lock_manager.lock_exclusive(&txn, rid), Ok(true));

    assert!(txn.is_exclusive_locked(rid));
    assert!(!txn.is_shared_locked(rid));
}

#[test]
fn test_older_transaction_wounds_younger_holder() {
    let (registry, lock_manager) = setup();
    let older = registry.begin(IsolationLevel::RepeatableRead);
    let younger = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_exclusive(&younger, rid), Ok(true));

    // The older transaction does not wait behind a younger holder.
    assert_eq!(lock_manager.lock_shared(&older, rid), Ok(true));

    assert_eq!(younger.state(), TransactionState::Aborted);
    assert!(!younger.is_exclusive_locked(rid));
    assert!(older.is_shared_locked(rid));
}

#[test]
fn test_wound_wait_kills_younger_waiters_and_holders() {
    let (registry, lock_manager) = setup();
    let lock_manager = Arc::new(lock_manager);
    let oldest = registry.begin(IsolationLevel::RepeatableRead);
    let holder = registry.begin(IsolationLevel::RepeatableRead);
    let waiter = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_exclusive(&holder, rid), Ok(true));

    // The youngest transaction queues behind the holder.
    let waiter_thread = {
        let lock_manager = lock_manager.clone();
        let waiter = waiter.clone();
        thread::spawn(move || lock_manager.lock_exclusive(&waiter, rid))
    };

    // Give the waiter time to enqueue and block.
    thread::sleep(Duration::from_millis(100));

    // The oldest transaction wounds both younger transactions and wins.
    assert_eq!(lock_manager.lock_exclusive(&oldest, rid), Ok(true));
    assert!(oldest.is_exclusive_locked(rid));

    assert_eq!(
        waiter_thread.join().unwrap(),
        Err(TransactionAbortError::Deadlock(waiter.id()))
    );

    assert_eq!(holder.state(), TransactionState::Aborted);
    assert_eq!(waiter.state(), TransactionState::Aborted);
    assert!(!holder.is_exclusive_locked(rid));
    assert!(!waiter.is_exclusive_locked(rid));
}

#[test]
fn test_younger_waits_for_older_holder() {
    let (registry, lock_manager) = setup();
    let lock_manager = Arc::new(lock_manager);
    let older = registry.begin(IsolationLevel::RepeatableRead);
    let younger = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_exclusive(&older, rid), Ok(true));

    let younger_thread = {
        let lock_manager = lock_manager.clone();
        let younger = younger.clone();
        thread::spawn(move || lock_manager.lock_exclusive(&younger, rid))
    };

    thread::sleep(Duration::from_millis(100));
    // Still blocked: the younger request waits instead of wounding.
    assert_eq!(younger.state(), TransactionState::Growing);
    assert!(!younger.is_exclusive_locked(rid));

    // Releasing the older lock hands the rid to the waiter.
    assert!(lock_manager.unlock(&older, rid));

    assert_eq!(younger_thread.join().unwrap(), Ok(true));
    assert!(younger.is_exclusive_locked(rid));
}

#[test]
fn test_upgrade_conflict_aborts_second_upgrader() {
    let (registry, lock_manager) = setup();
    let lock_manager = Arc::new(lock_manager);
    let older = registry.begin(IsolationLevel::RepeatableRead);
    let younger = registry.begin(IsolationLevel::RepeatableRead);
    let rid = Rid::new(1, 0);

    assert_eq!(lock_manager.lock_shared(&older, rid), Ok(true));
    assert_eq!(lock_manager.lock_shared(&younger, rid), Ok(true));

    // The younger upgrader claims the queue's upgrade slot and blocks
    // behind the older shared holder.
    let younger_thread = {
        let lock_manager = lock_manager.clone();
        let younger = younger.clone();
        thread::spawn(move || lock_manager.lock_upgrade(&younger, rid))
    };

    thread::sleep(Duration::from_millis(100));

    // A second upgrader finds the slot taken and aborts itself.
    assert_eq!(lock_manager.lock_upgrade(&older, rid), Ok(false));
    assert_eq!(older.state(), TransactionState::Aborted);

    // Once the older shared lock goes away, the upgrade completes.
    assert!(lock_manager.unlock(&older, rid));
    assert_eq!(younger_thread.join().unwrap(), Ok(true));
    assert!(younger.is_exclusive_locked(rid));
    assert!(!younger.is_shared_locked(rid));
}
