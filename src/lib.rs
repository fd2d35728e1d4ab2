pub mod common;
pub mod index;
pub mod storage;
pub mod transaction;

// Re-export key items for convenient access
pub use common::config::EngineConfig;
pub use index::btree::{BTreeError, BTreeIndex, BTreeIterator};
pub use storage::buffer::replacer::LruKReplacer;
pub use storage::buffer::{BufferPoolError, BufferPoolManager};
pub use storage::disk::DiskManager;
pub use storage::page::{PageGuard, ReadPageGuard, WritePageGuard};
pub use transaction::{
    AbortReason, IsolationLevel, LockManager, LockMode, Transaction, TransactionError,
    TransactionManager, TransactionRegistry, TransactionState,
};
