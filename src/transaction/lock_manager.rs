// # Lock Manager - Record-Level Two-Phase Locking
//
// Grants shared and exclusive locks on record ids with wound-wait deadlock
// prevention: an older transaction (smaller id) aborts younger conflicting
// transactions instead of waiting on them; a younger transaction waits on
// older holders. Edges in the wait-for graph therefore only run from older
// to younger and no cycle can form.
//
// Locking protocol, per rid:
// - the manager-wide table latch guards the rid -> queue map
// - the per-queue mutex guards queue contents and pairs with the queue's
//   condition variable; it is acquired before the table latch is released
//   so map rehashing cannot invalidate the queue reference
// - a woken waiter re-checks its own state (it may have been wounded) and
//   re-runs the full conflict scan; waking never implies ownership

use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use tracing::debug;

use crate::common::{Rid, TransactionId};
use crate::transaction::manager::TransactionRegistry;
use crate::transaction::types::{IsolationLevel, LockMode, Transaction, TransactionState};

/// One request in a record's FIFO queue.
#[derive(Debug, Clone, Copy)]
struct LockRequest {
    txn_id: TransactionId,
    mode: LockMode,
    granted: bool,
}

#[derive(Debug, Default)]
struct QueueInner {
    requests: VecDeque<LockRequest>,
    upgrading: bool,
}

/// Per-record wait queue: FIFO requests plus the condition variable waiters
/// block on.
#[derive(Debug, Default)]
struct LockRequestQueue {
    inner: Mutex<QueueInner>,
    cv: Condvar,
}

/// Record-level lock manager.
///
/// Independent of the buffer pool; failures set the requesting (or wounded)
/// transaction to `Aborted` and surface as `false` returns.
pub struct LockManager {
    registry: Arc<TransactionRegistry>,
    lock_table: Mutex<HashMap<Rid, Arc<LockRequestQueue>>>,
}

impl LockManager {
    /// Create a lock manager resolving wound-wait victims through
    /// `registry`.
    pub fn new(registry: Arc<TransactionRegistry>) -> Self {
        Self {
            registry,
            lock_table: Mutex::new(HashMap::new()),
        }
    }

    /// Look up (or create) the queue for `rid`.
    ///
    /// The returned `Arc` keeps the queue alive across map growth; callers
    /// acquire the queue mutex while the table latch is still held (see the
    /// call sites) so the queue cannot move underneath them.
    fn queue_for(&self, rid: Rid) -> Arc<LockRequestQueue> {
        let mut table = self.lock_table.lock();
        Arc::clone(table.entry(rid).or_default())
    }

    /// Isolation preconditions for a shared request. Aborts the transaction
    /// on violation.
    fn shared_precheck(&self, txn: &Transaction) -> bool {
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if txn.state() == TransactionState::Shrinking
            && txn.isolation_level() == IsolationLevel::RepeatableRead
        {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        true
    }

    /// Wound every conflicting younger transaction in the queue.
    ///
    /// A victim's state flips to `Aborted`, its entries leave the queue, and
    /// its lock set forgets `rid`; its own thread observes the abort on its
    /// next wake or lock-manager call. Returns true when anyone was killed.
    fn wound_younger(
        &self,
        inner: &mut QueueInner,
        rid: Rid,
        self_id: TransactionId,
        conflict: impl Fn(&LockRequest) -> bool,
    ) -> bool {
        let mut victims: Vec<TransactionId> = Vec::new();
        for request in inner.requests.iter() {
            if request.txn_id > self_id && conflict(request) && !victims.contains(&request.txn_id)
            {
                victims.push(request.txn_id);
            }
        }
        if victims.is_empty() {
            return false;
        }

        for &victim_id in &victims {
            if let Some(victim) = self.registry.get(victim_id) {
                victim.set_state(TransactionState::Aborted);
                victim.remove_shared(&rid);
                victim.remove_exclusive(&rid);
                debug!(victim = victim_id, by = self_id, %rid, "wound-wait abort");
            }
        }
        inner
            .requests
            .retain(|request| !victims.contains(&request.txn_id));
        true
    }

    /// Remove every request by `txn_id` from the queue.
    fn remove_requests(inner: &mut QueueInner, txn_id: TransactionId) {
        inner.requests.retain(|request| request.txn_id != txn_id);
    }

    /// Mark the transaction's pending request granted, appending one if the
    /// transaction has none queued.
    fn grant(inner: &mut QueueInner, txn_id: TransactionId, mode: LockMode) {
        for request in inner.requests.iter_mut() {
            if request.txn_id == txn_id && request.mode == mode {
                request.granted = true;
                return;
            }
        }
        inner.requests.push_back(LockRequest {
            txn_id,
            mode,
            granted: true,
        });
    }

    /// Queue a waiting request unless one is already present.
    fn enqueue_waiter(inner: &mut QueueInner, txn_id: TransactionId, mode: LockMode) {
        let present = inner
            .requests
            .iter()
            .any(|request| request.txn_id == txn_id && request.mode == mode);
        if !present {
            inner.requests.push_back(LockRequest {
                txn_id,
                mode,
                granted: false,
            });
        }
    }

    /// Acquire a shared lock on `rid`.
    ///
    /// Returns false after aborting the transaction when the isolation level
    /// forbids shared locks, on a 2PL violation, or when the transaction is
    /// wounded while waiting.
    pub fn lock_shared(&self, txn: &Transaction, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if !self.shared_precheck(txn) {
            return false;
        }
        if txn.is_shared_locked(&rid) || txn.is_exclusive_locked(&rid) {
            return true;
        }

        let queue;
        let mut inner;
        {
            let mut table = self.lock_table.lock();
            queue = Arc::clone(table.entry(rid).or_default());
            inner = queue.inner.lock();
        }

        loop {
            // Exclusive requests from younger transactions die; from older
            // ones we wait.
            if self.wound_younger(&mut inner, rid, txn.id(), |r| r.mode == LockMode::Exclusive) {
                queue.cv.notify_all();
            }

            let older_writer = inner
                .requests
                .iter()
                .any(|r| r.mode == LockMode::Exclusive && r.txn_id < txn.id());
            if !older_writer {
                break;
            }

            Self::enqueue_waiter(&mut inner, txn.id(), LockMode::Shared);
            queue.cv.wait(&mut inner);

            if txn.state() == TransactionState::Aborted {
                Self::remove_requests(&mut inner, txn.id());
                return false;
            }
            if !self.shared_precheck(txn) {
                Self::remove_requests(&mut inner, txn.id());
                return false;
            }
            if txn.is_shared_locked(&rid) || txn.is_exclusive_locked(&rid) {
                Self::remove_requests(&mut inner, txn.id());
                return true;
            }
        }

        Self::grant(&mut inner, txn.id(), LockMode::Shared);
        txn.add_shared(rid);
        txn.set_state(TransactionState::Growing);
        true
    }

    /// Acquire an exclusive lock on `rid`.
    ///
    /// Conflicts with every other request regardless of mode. Acquisition in
    /// the shrinking phase is a 2PL violation at every isolation level.
    pub fn lock_exclusive(&self, txn: &Transaction, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if txn.is_exclusive_locked(&rid) {
            return true;
        }

        let queue;
        let mut inner;
        {
            let mut table = self.lock_table.lock();
            queue = Arc::clone(table.entry(rid).or_default());
            inner = queue.inner.lock();
        }

        loop {
            if self.wound_younger(&mut inner, rid, txn.id(), |_| true) {
                queue.cv.notify_all();
            }

            let older = inner.requests.iter().any(|r| r.txn_id < txn.id());
            if !older {
                break;
            }

            Self::enqueue_waiter(&mut inner, txn.id(), LockMode::Exclusive);
            queue.cv.wait(&mut inner);

            if txn.state() == TransactionState::Aborted {
                Self::remove_requests(&mut inner, txn.id());
                return false;
            }
            if txn.state() == TransactionState::Shrinking {
                txn.set_state(TransactionState::Aborted);
                Self::remove_requests(&mut inner, txn.id());
                return false;
            }
            if txn.is_exclusive_locked(&rid) {
                Self::remove_requests(&mut inner, txn.id());
                return true;
            }
        }

        Self::grant(&mut inner, txn.id(), LockMode::Exclusive);
        txn.add_exclusive(rid);
        txn.set_state(TransactionState::Growing);
        true
    }

    /// Upgrade a held shared lock to exclusive.
    ///
    /// Atomic from the caller's perspective: on success the shared request
    /// is gone and a granted exclusive request has replaced it.
    pub fn lock_upgrade(&self, txn: &Transaction, rid: Rid) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        if !self.upgrade_precheck(txn, &rid) {
            return false;
        }
        if txn.is_exclusive_locked(&rid) {
            return true;
        }

        let queue;
        let mut inner;
        {
            let mut table = self.lock_table.lock();
            queue = Arc::clone(table.entry(rid).or_default());
            inner = queue.inner.lock();
        }

        // Only one upgrade may be in flight per record; a second upgrader
        // aborts rather than deadlocking against the first.
        if inner.upgrading {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        inner.upgrading = true;

        loop {
            if self.wound_younger(&mut inner, rid, txn.id(), |_| true) {
                queue.cv.notify_all();
            }

            let older = inner.requests.iter().any(|r| r.txn_id < txn.id());
            if !older {
                break;
            }

            Self::enqueue_waiter(&mut inner, txn.id(), LockMode::Exclusive);
            queue.cv.wait(&mut inner);

            if txn.state() == TransactionState::Aborted {
                Self::remove_requests(&mut inner, txn.id());
                inner.upgrading = false;
                return false;
            }
            if !self.upgrade_precheck(txn, &rid) {
                Self::remove_requests(&mut inner, txn.id());
                inner.upgrading = false;
                return false;
            }
            if txn.is_exclusive_locked(&rid) {
                Self::remove_requests(&mut inner, txn.id());
                inner.upgrading = false;
                return true;
            }
        }

        // Swap the shared request for a granted exclusive one.
        Self::remove_requests(&mut inner, txn.id());
        inner.requests.push_back(LockRequest {
            txn_id: txn.id(),
            mode: LockMode::Exclusive,
            granted: true,
        });
        inner.upgrading = false;
        txn.remove_shared(&rid);
        txn.add_exclusive(rid);
        true
    }

    /// Upgrade preconditions: still growing and actually shared-locked.
    fn upgrade_precheck(&self, txn: &Transaction, rid: &Rid) -> bool {
        if txn.state() != TransactionState::Growing {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        if !txn.is_shared_locked(rid) {
            txn.set_state(TransactionState::Aborted);
            return false;
        }
        true
    }

    /// Release this transaction's lock on `rid`.
    ///
    /// Under two-phase locking the first release moves a growing
    /// transaction to `Shrinking`; `ReadCommitted` transactions stay
    /// growing so they may reacquire shared locks. Unlocking a record the
    /// transaction does not hold aborts it and returns false.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        if txn.state() == TransactionState::Growing
            && txn.isolation_level() != IsolationLevel::ReadCommitted
        {
            txn.set_state(TransactionState::Shrinking);
        }

        if !txn.is_shared_locked(&rid) && !txn.is_exclusive_locked(&rid) {
            txn.set_state(TransactionState::Aborted);
            return false;
        }

        let queue = self.queue_for(rid);
        let mut inner = queue.inner.lock();
        Self::remove_requests(&mut inner, txn.id());
        txn.remove_shared(&rid);
        txn.remove_exclusive(&rid);
        queue.cv.notify_all();
        true
    }

    /// Release every lock the transaction holds, without 2PL transitions.
    ///
    /// Used by commit and abort.
    pub fn release_all(&self, txn: &Transaction) {
        let mut rids: Vec<Rid> = txn.shared_lock_set().into_iter().collect();
        rids.extend(txn.exclusive_lock_set());

        for rid in rids {
            let queue = self.queue_for(rid);
            let mut inner = queue.inner.lock();
            Self::remove_requests(&mut inner, txn.id());
            txn.remove_shared(&rid);
            txn.remove_exclusive(&rid);
            queue.cv.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transaction::manager::TransactionManager;

    #[test]
    fn test_shared_then_shared_coexist() {
        let manager = TransactionManager::new();
        let lm = manager.lock_manager();
        let t1 = manager.begin(IsolationLevel::RepeatableRead);
        let t2 = manager.begin(IsolationLevel::RepeatableRead);
        let rid = Rid::new(1, 1);

        assert!(lm.lock_shared(&t1, rid));
        assert!(lm.lock_shared(&t2, rid));
        assert!(t1.is_shared_locked(&rid));
        assert!(t2.is_shared_locked(&rid));
    }

    #[test]
    fn test_read_uncommitted_shared_aborts() {
        let manager = TransactionManager::new();
        let lm = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::ReadUncommitted);
        let rid = Rid::new(1, 1);

        assert!(!lm.lock_shared(&txn, rid));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_reacquire_is_idempotent() {
        let manager = TransactionManager::new();
        let lm = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let rid = Rid::new(2, 0);

        assert!(lm.lock_exclusive(&txn, rid));
        assert!(lm.lock_exclusive(&txn, rid));
        assert!(lm.lock_shared(&txn, rid), "shared satisfied by exclusive");
    }

    #[test]
    fn test_unlock_not_held_aborts() {
        let manager = TransactionManager::new();
        let lm = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);

        assert!(!lm.unlock(&txn, Rid::new(9, 9)));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_2pl_transition_on_unlock() {
        let manager = TransactionManager::new();
        let lm = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let a = Rid::new(1, 0);
        let b = Rid::new(1, 1);

        assert!(lm.lock_shared(&txn, a));
        assert!(lm.unlock(&txn, a));
        assert_eq!(txn.state(), TransactionState::Shrinking);

        // acquisition after release is a 2PL violation
        assert!(!lm.lock_shared(&txn, b));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }

    #[test]
    fn test_read_committed_may_reacquire() {
        let manager = TransactionManager::new();
        let lm = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::ReadCommitted);
        let rid = Rid::new(1, 0);

        assert!(lm.lock_shared(&txn, rid));
        assert!(lm.unlock(&txn, rid));
        assert_eq!(txn.state(), TransactionState::Growing);
        assert!(lm.lock_shared(&txn, rid));
    }

    #[test]
    fn test_upgrade_swaps_lock_sets() {
        let manager = TransactionManager::new();
        let lm = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);
        let rid = Rid::new(4, 2);

        assert!(lm.lock_shared(&txn, rid));
        assert!(lm.lock_upgrade(&txn, rid));
        assert!(!txn.is_shared_locked(&rid));
        assert!(txn.is_exclusive_locked(&rid));
    }

    #[test]
    fn test_upgrade_without_shared_aborts() {
        let manager = TransactionManager::new();
        let lm = manager.lock_manager();
        let txn = manager.begin(IsolationLevel::RepeatableRead);

        assert!(!lm.lock_upgrade(&txn, Rid::new(0, 0)));
        assert_eq!(txn.state(), TransactionState::Aborted);
    }
}
