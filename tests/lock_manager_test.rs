// Lock manager integration tests: blocking grants, wound-wait kills,
// upgrades across threads, and a contention swarm proving progress and
// mutual exclusion.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ferrodb::transaction::{IsolationLevel, TransactionManager, TransactionState};
use ferrodb::Rid;

#[test]
fn younger_writer_waits_for_older_writer() {
    let manager = Arc::new(TransactionManager::new());
    let rid = Rid::new(1, 1);

    let t1 = manager.begin(IsolationLevel::RepeatableRead);
    let t2 = manager.begin(IsolationLevel::RepeatableRead);
    assert!(t1.id() < t2.id());

    assert!(manager.lock_manager().lock_exclusive(&t1, rid));

    let acquired = Arc::new(AtomicBool::new(false));
    let handle = {
        let manager = Arc::clone(&manager);
        let t2 = Arc::clone(&t2);
        let acquired = Arc::clone(&acquired);
        std::thread::spawn(move || {
            let granted = manager.lock_manager().lock_exclusive(&t2, rid);
            acquired.store(true, Ordering::SeqCst);
            granted
        })
    };

    // the younger transaction must wait, not abort
    std::thread::sleep(Duration::from_millis(100));
    assert!(!acquired.load(Ordering::SeqCst), "t2 should be blocked");
    assert_eq!(t2.state(), TransactionState::Growing);

    assert!(manager.lock_manager().unlock(&t1, rid));
    assert!(handle.join().unwrap(), "t2 obtains the lock after t1 unlocks");
    assert!(t2.is_exclusive_locked(&rid));
}

#[test]
fn older_writer_wounds_younger_holder() {
    let manager = TransactionManager::new();
    let lm = manager.lock_manager();
    let rid = Rid::new(2, 7);

    let t1 = manager.begin(IsolationLevel::RepeatableRead);
    let t2 = manager.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_exclusive(&t2, rid));

    // the older transaction kills the younger holder and takes the lock
    assert!(lm.lock_exclusive(&t1, rid));
    assert_eq!(t2.state(), TransactionState::Aborted);
    assert!(t1.is_exclusive_locked(&rid));

    // the victim no longer holds anything on the rid
    assert!(!lm.unlock(&t2, rid), "wounded txn unlock reports not locked");
}

#[test]
fn waiting_transaction_killed_by_older_requester() {
    let manager = Arc::new(TransactionManager::new());
    let rid = Rid::new(3, 3);

    let t1 = manager.begin(IsolationLevel::RepeatableRead);
    let t2 = manager.begin(IsolationLevel::RepeatableRead);
    let t3 = manager.begin(IsolationLevel::RepeatableRead);

    // t2 (middle age) holds the lock; t3 (youngest) waits behind it
    assert!(manager.lock_manager().lock_exclusive(&t2, rid));
    let waiter = {
        let manager = Arc::clone(&manager);
        let t3 = Arc::clone(&t3);
        std::thread::spawn(move || manager.lock_manager().lock_exclusive(&t3, rid))
    };
    std::thread::sleep(Duration::from_millis(100));

    // the oldest arrives and wounds both younger transactions
    assert!(manager.lock_manager().lock_exclusive(&t1, rid));
    assert_eq!(t2.state(), TransactionState::Aborted);
    assert_eq!(t3.state(), TransactionState::Aborted);

    assert!(manager.lock_manager().unlock(&t1, rid));
    assert!(!waiter.join().unwrap(), "woken waiter observes its abort");
}

#[test]
fn shared_waiters_all_wake_on_unlock() {
    let manager = Arc::new(TransactionManager::new());
    let rid = Rid::new(4, 0);

    let t1 = manager.begin(IsolationLevel::RepeatableRead);
    assert!(manager.lock_manager().lock_exclusive(&t1, rid));

    let mut readers = Vec::new();
    for _ in 0..3 {
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let manager = Arc::clone(&manager);
        readers.push(std::thread::spawn(move || {
            manager.lock_manager().lock_shared(&txn, rid)
        }));
    }

    std::thread::sleep(Duration::from_millis(100));
    assert!(manager.lock_manager().unlock(&t1, rid));

    for reader in readers {
        assert!(reader.join().unwrap(), "every shared waiter proceeds");
    }
}

#[test]
fn upgrade_waits_for_older_reader() {
    let manager = Arc::new(TransactionManager::new());
    let rid = Rid::new(5, 5);

    let t1 = manager.begin(IsolationLevel::RepeatableRead);
    let t2 = manager.begin(IsolationLevel::RepeatableRead);

    assert!(manager.lock_manager().lock_shared(&t1, rid));
    assert!(manager.lock_manager().lock_shared(&t2, rid));

    // the younger reader upgrades: it must wait until the older reader
    // releases its shared lock
    let upgrader = {
        let manager = Arc::clone(&manager);
        let t2 = Arc::clone(&t2);
        std::thread::spawn(move || manager.lock_manager().lock_upgrade(&t2, rid))
    };
    std::thread::sleep(Duration::from_millis(100));
    assert!(!t2.is_exclusive_locked(&rid));

    assert!(manager.lock_manager().unlock(&t1, rid));
    assert!(upgrader.join().unwrap());
    assert!(t2.is_exclusive_locked(&rid));
    assert!(!t2.is_shared_locked(&rid));
}

#[test]
fn second_concurrent_upgrade_aborts() {
    let manager = Arc::new(TransactionManager::new());
    let rid = Rid::new(7, 1);

    let t1 = manager.begin(IsolationLevel::RepeatableRead);
    let t2 = manager.begin(IsolationLevel::RepeatableRead);
    let t3 = manager.begin(IsolationLevel::RepeatableRead);
    assert!(manager.lock_manager().lock_shared(&t1, rid));
    assert!(manager.lock_manager().lock_shared(&t2, rid));
    assert!(manager.lock_manager().lock_shared(&t3, rid));

    // the youngest reader starts an upgrade and blocks behind the others
    let upgrader = {
        let manager = Arc::clone(&manager);
        let t3 = Arc::clone(&t3);
        std::thread::spawn(move || manager.lock_manager().lock_upgrade(&t3, rid))
    };
    std::thread::sleep(Duration::from_millis(100));

    // a second upgrade on the same record aborts instead of deadlocking
    assert!(!manager.lock_manager().lock_upgrade(&t2, rid));
    assert_eq!(t2.state(), TransactionState::Aborted);
    manager.abort(&t2);

    assert!(manager.lock_manager().unlock(&t1, rid));
    assert!(upgrader.join().unwrap());
    assert!(t3.is_exclusive_locked(&rid));
}

#[test]
fn upgrade_by_older_wounds_younger_reader() {
    let manager = TransactionManager::new();
    let lm = manager.lock_manager();
    let rid = Rid::new(6, 6);

    let t1 = manager.begin(IsolationLevel::RepeatableRead);
    let t2 = manager.begin(IsolationLevel::RepeatableRead);

    assert!(lm.lock_shared(&t1, rid));
    assert!(lm.lock_shared(&t2, rid));

    assert!(lm.lock_upgrade(&t1, rid));
    assert_eq!(t2.state(), TransactionState::Aborted);
    assert!(t1.is_exclusive_locked(&rid));
}

#[test]
fn contention_swarm_makes_progress() {
    // Wound-wait guarantees an acyclic wait-for graph, so a swarm of
    // writers hammering one record must always terminate: every iteration
    // ends in a commit or a wound-induced abort. A wounded holder loses
    // its lock immediately, so the test checks progress, not exclusion.
    let manager = Arc::new(TransactionManager::new());
    let commits = Arc::new(AtomicU64::new(0));
    let aborts = Arc::new(AtomicU64::new(0));
    let rid = Rid::new(9, 0);

    std::thread::scope(|scope| {
        for _ in 0..8 {
            let manager = Arc::clone(&manager);
            let commits = Arc::clone(&commits);
            let aborts = Arc::clone(&aborts);
            scope.spawn(move || {
                for _ in 0..50 {
                    let txn = manager.begin(IsolationLevel::RepeatableRead);
                    if manager.lock_manager().lock_exclusive(&txn, rid) {
                        std::thread::yield_now();
                        // the holder can still be wounded before it commits
                        if manager.commit(&txn) {
                            commits.fetch_add(1, Ordering::Relaxed);
                        } else {
                            manager.abort(&txn);
                            aborts.fetch_add(1, Ordering::Relaxed);
                        }
                    } else {
                        assert_eq!(txn.state(), TransactionState::Aborted);
                        manager.abort(&txn);
                        aborts.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        }
    });

    assert_eq!(
        commits.load(Ordering::Relaxed) + aborts.load(Ordering::Relaxed),
        8 * 50
    );
    assert!(commits.load(Ordering::Relaxed) > 0, "some work succeeded");
}
