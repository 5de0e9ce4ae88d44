// # Transaction Manager
//
// Hands out transaction ids from a process-wide monotonically increasing
// counter (smaller id = older transaction, the ordering wound-wait relies
// on) and tracks every live transaction in a registry the lock manager
// uses to abort wound-wait victims.

use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tracing::debug;

use crate::common::TransactionId;
use crate::transaction::lock_manager::LockManager;
use crate::transaction::types::{IsolationLevel, Transaction, TransactionState};

/// Concurrent id -> transaction map shared by the transaction manager and
/// the lock manager.
#[derive(Default)]
pub struct TransactionRegistry {
    txns: DashMap<TransactionId, Arc<Transaction>>,
}

impl TransactionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, txn: Arc<Transaction>) {
        self.txns.insert(txn.id(), txn);
    }

    pub fn get(&self, id: TransactionId) -> Option<Arc<Transaction>> {
        self.txns.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    pub fn remove(&self, id: TransactionId) {
        self.txns.remove(&id);
    }

    pub fn len(&self) -> usize {
        self.txns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txns.is_empty()
    }
}

/// Creates, commits, and aborts transactions.
pub struct TransactionManager {
    registry: Arc<TransactionRegistry>,
    lock_manager: Arc<LockManager>,
    next_txn_id: AtomicU64,
}

impl TransactionManager {
    /// Create a manager together with its lock manager and registry.
    pub fn new() -> Self {
        let registry = Arc::new(TransactionRegistry::new());
        let lock_manager = Arc::new(LockManager::new(Arc::clone(&registry)));
        Self {
            registry,
            lock_manager,
            next_txn_id: AtomicU64::new(0),
        }
    }

    pub fn lock_manager(&self) -> &Arc<LockManager> {
        &self.lock_manager
    }

    pub fn registry(&self) -> &Arc<TransactionRegistry> {
        &self.registry
    }

    /// Start a transaction at the given isolation level.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let id = self.next_txn_id.fetch_add(1, Ordering::Relaxed);
        let txn = Arc::new(Transaction::new(id, isolation_level));
        self.registry.insert(Arc::clone(&txn));
        debug!(txn = id, %isolation_level, "begin");
        txn
    }

    /// Commit a transaction and release its locks.
    ///
    /// Returns false when the transaction was already aborted (for example
    /// by a wound-wait kill); the caller must abort instead.
    pub fn commit(&self, txn: &Arc<Transaction>) -> bool {
        if txn.state() == TransactionState::Aborted {
            return false;
        }
        txn.set_state(TransactionState::Committed);
        self.lock_manager.release_all(txn);
        debug!(txn = txn.id(), "commit");
        true
    }

    /// Abort a transaction and release its locks.
    ///
    /// Undoing the transaction's writes (the index write log) is the
    /// executors' responsibility before they call this.
    pub fn abort(&self, txn: &Arc<Transaction>) {
        txn.set_state(TransactionState::Aborted);
        self.lock_manager.release_all(txn);
        debug!(txn = txn.id(), "abort");
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
