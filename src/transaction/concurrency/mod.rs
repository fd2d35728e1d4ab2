mod deadlock;
pub mod lock_manager;
pub mod transaction;
pub mod transaction_manager;

pub use lock_manager::{LockManager, LockMode, LockRequest};
pub use transaction::{
    AbortReason, IndexWriteRecord, IndexWriteUndo, IsolationLevel, TableWriteRecord,
    TableWriteUndo, Transaction, TransactionError, TransactionRegistry, TransactionState,
    WriteOpType,
};
pub use transaction_manager::TransactionManager;
