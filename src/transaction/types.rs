// Core transaction types and domain models.
//
// Defines the transaction lifecycle, isolation levels, lock modes, and the
// shared `Transaction` object handed to the lock manager and executors.

use std::collections::HashSet;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::common::{Rid, TransactionId};

/// Isolation level for transactions.
///
/// Decides which locks a transaction takes and for how long it holds them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IsolationLevel {
    /// No shared locks at all; only writes are locked.
    ReadUncommitted,
    /// Shared locks are released early and may be reacquired.
    ReadCommitted,
    /// Strict two-phase locking for both lock modes.
    RepeatableRead,
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::RepeatableRead
    }
}

impl fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IsolationLevel::ReadUncommitted => write!(f, "READ UNCOMMITTED"),
            IsolationLevel::ReadCommitted => write!(f, "READ COMMITTED"),
            IsolationLevel::RepeatableRead => write!(f, "REPEATABLE READ"),
        }
    }
}

/// Transaction lifecycle state.
///
/// ```text
/// Growing -> Shrinking -> Committed
///         \            \> Aborted
///          \> Committed | Aborted
/// ```
///
/// A transaction is born `Growing`; the first unlock moves it to
/// `Shrinking` (except under `ReadCommitted`), and it ends in one of the
/// two terminal states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Two-phase locking: acquiring locks.
    Growing,
    /// Two-phase locking: releasing locks; no further acquisition.
    Shrinking,
    /// Transaction committed.
    Committed,
    /// Transaction aborted, possibly by a wound-wait kill.
    Aborted,
}

impl TransactionState {
    /// Returns true for the terminal states.
    #[inline]
    pub fn is_terminal(&self) -> bool {
        matches!(self, TransactionState::Committed | TransactionState::Aborted)
    }
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransactionState::Growing => write!(f, "GROWING"),
            TransactionState::Shrinking => write!(f, "SHRINKING"),
            TransactionState::Committed => write!(f, "COMMITTED"),
            TransactionState::Aborted => write!(f, "ABORTED"),
        }
    }
}

/// Record-level lock mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LockMode {
    /// Shared lock (S), held by readers.
    Shared,
    /// Exclusive lock (X), held by writers.
    Exclusive,
}

impl LockMode {
    /// Shared locks coexist; everything else conflicts.
    #[inline]
    pub fn is_compatible(&self, other: &LockMode) -> bool {
        matches!((self, other), (LockMode::Shared, LockMode::Shared))
    }
}

impl fmt::Display for LockMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockMode::Shared => write!(f, "S"),
            LockMode::Exclusive => write!(f, "X"),
        }
    }
}

/// Kind of index modification recorded for rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexWriteOp {
    Insert,
    Delete,
}

/// One index modification made on behalf of a transaction.
///
/// Executors append these while mutating secondary indexes so an abort can
/// undo them in reverse order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexWriteRecord {
    pub op: IndexWriteOp,
    pub rid: Rid,
}

/// A database transaction.
///
/// Shared between the issuing thread and the lock manager (which may abort
/// it from another thread under wound-wait), so all mutable state sits
/// behind internal locks.
pub struct Transaction {
    id: TransactionId,
    isolation_level: IsolationLevel,
    state: Mutex<TransactionState>,
    shared_lock_set: Mutex<HashSet<Rid>>,
    exclusive_lock_set: Mutex<HashSet<Rid>>,
    index_write_set: Mutex<Vec<IndexWriteRecord>>,
}

impl Transaction {
    /// Creates a transaction in the `Growing` state.
    pub fn new(id: TransactionId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: Mutex::new(TransactionState::Growing),
            shared_lock_set: Mutex::new(HashSet::new()),
            exclusive_lock_set: Mutex::new(HashSet::new()),
            index_write_set: Mutex::new(Vec::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> TransactionId {
        self.id
    }

    #[inline]
    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    #[inline]
    pub fn state(&self) -> TransactionState {
        *self.state.lock()
    }

    #[inline]
    pub fn set_state(&self, state: TransactionState) {
        *self.state.lock() = state;
    }

    /// True when this transaction holds a shared lock on `rid`.
    pub fn is_shared_locked(&self, rid: &Rid) -> bool {
        self.shared_lock_set.lock().contains(rid)
    }

    /// True when this transaction holds an exclusive lock on `rid`.
    pub fn is_exclusive_locked(&self, rid: &Rid) -> bool {
        self.exclusive_lock_set.lock().contains(rid)
    }

    /// Snapshot of the shared lock set.
    pub fn shared_lock_set(&self) -> HashSet<Rid> {
        self.shared_lock_set.lock().clone()
    }

    /// Snapshot of the exclusive lock set.
    pub fn exclusive_lock_set(&self) -> HashSet<Rid> {
        self.exclusive_lock_set.lock().clone()
    }

    /// Append an index write for rollback.
    pub fn append_index_write(&self, record: IndexWriteRecord) {
        self.index_write_set.lock().push(record);
    }

    /// Snapshot of the index write log.
    pub fn index_write_set(&self) -> Vec<IndexWriteRecord> {
        self.index_write_set.lock().clone()
    }

    pub(crate) fn add_shared(&self, rid: Rid) {
        self.shared_lock_set.lock().insert(rid);
    }

    pub(crate) fn add_exclusive(&self, rid: Rid) {
        self.exclusive_lock_set.lock().insert(rid);
    }

    pub(crate) fn remove_shared(&self, rid: &Rid) {
        self.shared_lock_set.lock().remove(rid);
    }

    pub(crate) fn remove_exclusive(&self, rid: &Rid) {
        self.exclusive_lock_set.lock().remove(rid);
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("id", &self.id)
            .field("isolation_level", &self.isolation_level)
            .field("state", &self.state())
            .finish()
    }
}
