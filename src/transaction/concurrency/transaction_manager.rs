use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use log::{debug, warn};

use crate::common::config::EngineConfig;
use crate::transaction::concurrency::lock_manager::LockManager;
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Result, Transaction, TransactionError, TransactionRegistry, TransactionState,
    WriteOpType,
};

/// Creates transactions and drives them to a terminal state. Commit releases
/// locks; abort first unwinds the transaction's write logs in reverse.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    registry: Arc<TransactionRegistry>,
    lock_manager: Arc<LockManager>,
    default_isolation: IsolationLevel,
}

impl TransactionManager {
    pub fn new(
        lock_manager: Arc<LockManager>,
        registry: Arc<TransactionRegistry>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            next_txn_id: AtomicU32::new(1),
            registry,
            lock_manager,
            default_isolation: config.isolation_level,
        }
    }

    /// Begin a transaction at the engine's default isolation level.
    pub fn begin(&self) -> Arc<Transaction> {
        self.begin_with_isolation(self.default_isolation)
    }

    pub fn begin_with_isolation(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.registry.insert(Arc::clone(&txn));
        debug!("begin txn {} ({:?})", txn_id, isolation_level);
        txn
    }

    /// Commit: release every lock and finish. A transaction that was marked
    /// aborted can no longer commit.
    pub fn commit(&self, txn: &Arc<Transaction>) -> Result<()> {
        match txn.state() {
            TransactionState::Committed | TransactionState::Aborted => {
                return Err(TransactionError::InvalidState(txn.id()));
            }
            TransactionState::Growing | TransactionState::Shrinking => {}
        }

        self.lock_manager.unlock_all(txn);
        txn.set_state(TransactionState::Committed);
        self.registry.remove(txn.id());
        debug!("commit txn {}", txn.id());
        Ok(())
    }

    /// Abort: undo the write logs newest-first, then release every lock.
    /// Also the required follow-up once a transaction has been chosen as a
    /// deadlock victim.
    pub fn abort(&self, txn: &Arc<Transaction>) -> Result<()> {
        if txn.state() == TransactionState::Committed {
            return Err(TransactionError::InvalidState(txn.id()));
        }

        {
            let mut writes = txn.writes();

            for record in writes.table_records.drain(..).rev() {
                let result = match record.op {
                    WriteOpType::Insert => record.table.mark_deleted(record.rid),
                    WriteOpType::Delete => record.table.clear_deleted(record.rid),
                };
                if let Err(e) = result {
                    warn!(
                        "txn {}: table rollback failed for {:?}: {}",
                        txn.id(),
                        record.rid,
                        e
                    );
                }
            }

            for record in writes.index_records.drain(..).rev() {
                let result = match record.op {
                    WriteOpType::Insert => record.index.undo_insert(&record.key),
                    WriteOpType::Delete => record.index.undo_delete(&record.key, record.rid),
                };
                if let Err(e) = result {
                    warn!(
                        "txn {}: index rollback failed for {:?}: {}",
                        txn.id(),
                        record.rid,
                        e
                    );
                }
            }
        }

        self.lock_manager.unlock_all(txn);
        txn.set_state(TransactionState::Aborted);
        self.registry.remove(txn.id());
        debug!("abort txn {}", txn.id());
        Ok(())
    }
}
