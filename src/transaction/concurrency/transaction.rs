use std::collections::{HashMap, HashSet};
use std::fmt;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use thiserror::Error;

use crate::common::types::{Rid, TableId, TxnId};

/// Transaction isolation levels
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
}

/// Two-phase locking states. A transaction acquires locks while growing and
/// enters shrinking on the first release that its isolation level counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Growing,
    Shrinking,
    Committed,
    Aborted,
}

/// Why a transaction was forced into the aborted state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    LockSharedOnReadUncommitted,
    LockOnShrinking,
    TableUnlockedBeforeUnlockingRows,
    AttemptedUnlockButNoLockHeld,
    AttemptedIntentionLockOnRow,
    TableLockNotPresent,
    UpgradeConflict,
    IncompatibleUpgrade,
    Aborted,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let msg = match self {
            AbortReason::LockSharedOnReadUncommitted => {
                "shared locks are not permitted under read-uncommitted"
            }
            AbortReason::LockOnShrinking => "lock requested while shrinking",
            AbortReason::TableUnlockedBeforeUnlockingRows => {
                "table unlocked before its row locks were released"
            }
            AbortReason::AttemptedUnlockButNoLockHeld => "unlock without a held lock",
            AbortReason::AttemptedIntentionLockOnRow => "intention lock requested on a row",
            AbortReason::TableLockNotPresent => "row lock requires a table lock",
            AbortReason::UpgradeConflict => "another transaction is already upgrading",
            AbortReason::IncompatibleUpgrade => "requested upgrade is not permitted",
            AbortReason::Aborted => "transaction was aborted",
        };
        write!(f, "{}", msg)
    }
}

/// Errors surfaced by the lock manager and transaction manager.
#[derive(Error, Debug)]
pub enum TransactionError {
    #[error("transaction {txn_id} aborted: {reason}")]
    Abort { txn_id: TxnId, reason: AbortReason },

    #[error("transaction {0} not found")]
    NotFound(TxnId),

    #[error("transaction {0} is already committed or aborted")]
    InvalidState(TxnId),
}

/// Result type for transaction operations
pub type Result<T> = std::result::Result<T, TransactionError>;

/// Kind of a logged modification, used to invert it during rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOpType {
    Insert,
    Delete,
}

/// Rollback hook for a table heap: aborting inverts inserts by marking the
/// tuple deleted and inverts deletes by clearing the mark. The heap itself
/// is an external collaborator.
pub trait TableWriteUndo: Send + Sync {
    fn mark_deleted(&self, rid: Rid) -> anyhow::Result<()>;
    fn clear_deleted(&self, rid: Rid) -> anyhow::Result<()>;
}

/// Rollback hook for an index. Keys travel as their bincode encoding so the
/// record type stays object-safe across differently-keyed indexes.
pub trait IndexWriteUndo: Send + Sync {
    fn undo_insert(&self, key: &[u8]) -> anyhow::Result<()>;
    fn undo_delete(&self, key: &[u8], rid: Rid) -> anyhow::Result<()>;
}

pub struct TableWriteRecord {
    pub table_id: TableId,
    pub rid: Rid,
    pub op: WriteOpType,
    pub table: Arc<dyn TableWriteUndo>,
}

pub struct IndexWriteRecord {
    pub table_id: TableId,
    pub rid: Rid,
    pub op: WriteOpType,
    pub key: Vec<u8>,
    pub index: Arc<dyn IndexWriteUndo>,
}

/// Every lock a transaction currently holds, split by mode the way the lock
/// manager grants them.
#[derive(Default)]
pub struct LockSets {
    pub shared_tables: HashSet<TableId>,
    pub exclusive_tables: HashSet<TableId>,
    pub intention_shared_tables: HashSet<TableId>,
    pub intention_exclusive_tables: HashSet<TableId>,
    pub shared_intention_exclusive_tables: HashSet<TableId>,
    pub shared_rows: HashMap<TableId, HashSet<Rid>>,
    pub exclusive_rows: HashMap<TableId, HashSet<Rid>>,
}

impl LockSets {
    /// Does the transaction hold any lock at all on this table?
    pub fn holds_any_table_lock(&self, table_id: TableId) -> bool {
        self.shared_tables.contains(&table_id)
            || self.exclusive_tables.contains(&table_id)
            || self.intention_shared_tables.contains(&table_id)
            || self.intention_exclusive_tables.contains(&table_id)
            || self.shared_intention_exclusive_tables.contains(&table_id)
    }

    /// Does the transaction hold a table lock strong enough to take a row
    /// X lock (X, IX or SIX)?
    pub fn holds_exclusive_capable_table_lock(&self, table_id: TableId) -> bool {
        self.exclusive_tables.contains(&table_id)
            || self.intention_exclusive_tables.contains(&table_id)
            || self.shared_intention_exclusive_tables.contains(&table_id)
    }

    /// Any row locks still held under this table?
    pub fn holds_row_locks(&self, table_id: TableId) -> bool {
        self.shared_rows
            .get(&table_id)
            .map(|s| !s.is_empty())
            .unwrap_or(false)
            || self
                .exclusive_rows
                .get(&table_id)
                .map(|s| !s.is_empty())
                .unwrap_or(false)
    }
}

/// WriteSets: rollback logs, replayed in reverse on abort.
#[derive(Default)]
pub struct WriteSets {
    pub table_records: Vec<TableWriteRecord>,
    pub index_records: Vec<IndexWriteRecord>,
}

/// Transaction - identity, isolation level, 2PL state, held locks, and the
/// undo logs used by abort.
pub struct Transaction {
    id: TxnId,
    isolation_level: IsolationLevel,
    state: RwLock<TransactionState>,
    locks: Mutex<LockSets>,
    writes: Mutex<WriteSets>,
}

impl Transaction {
    pub fn new(id: TxnId, isolation_level: IsolationLevel) -> Self {
        Self {
            id,
            isolation_level,
            state: RwLock::new(TransactionState::Growing),
            locks: Mutex::new(LockSets::default()),
            writes: Mutex::new(WriteSets::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn state(&self) -> TransactionState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: TransactionState) {
        *self.state.write() = state;
    }

    pub(crate) fn locks(&self) -> MutexGuard<'_, LockSets> {
        self.locks.lock()
    }

    pub(crate) fn writes(&self) -> MutexGuard<'_, WriteSets> {
        self.writes.lock()
    }

    /// Log a table-heap modification for rollback.
    pub fn append_table_write_record(&self, record: TableWriteRecord) {
        self.writes.lock().table_records.push(record);
    }

    /// Log an index modification for rollback.
    pub fn append_index_write_record(&self, record: IndexWriteRecord) {
        self.writes.lock().index_records.push(record);
    }
}

/// Shared id-to-transaction map. The transaction manager registers new
/// transactions here and the deadlock detector resolves victims through it.
#[derive(Default)]
pub struct TransactionRegistry {
    txns: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionRegistry {
    pub fn insert(&self, txn: Arc<Transaction>) {
        self.txns.lock().insert(txn.id(), txn);
    }

    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.txns.lock().get(&txn_id).cloned()
    }

    pub fn remove(&self, txn_id: TxnId) {
        self.txns.lock().remove(&txn_id);
    }

    pub fn active_ids(&self) -> Vec<TxnId> {
        self.txns.lock().keys().copied().collect()
    }
}
