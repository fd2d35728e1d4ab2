pub mod concurrency;

pub use concurrency::{
    AbortReason, IndexWriteRecord, IndexWriteUndo, IsolationLevel, LockManager, LockMode,
    TableWriteRecord, TableWriteUndo, Transaction, TransactionError, TransactionManager,
    TransactionRegistry, TransactionState, WriteOpType,
};
