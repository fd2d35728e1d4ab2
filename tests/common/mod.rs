use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tempfile::NamedTempFile;

use rookdb::common::EngineConfig;
use rookdb::{
    BTreeIndex, BufferPoolManager, LockManager, TransactionManager, TransactionRegistry,
};

// Route log output through the test harness; safe to call repeatedly.
#[allow(dead_code)]
pub fn init_test_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager with a temporary database
#[allow(dead_code)]
pub fn create_test_buffer_pool(pool_size: usize) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, 2, path)?);
    Ok((buffer_pool, file))
}

// Create a B+Tree over i64 keys with the given fanout limits
#[allow(dead_code)]
pub fn create_test_tree(
    pool_size: usize,
    leaf_max: usize,
    internal_max: usize,
) -> Result<(BTreeIndex<i64>, Arc<BufferPoolManager>, NamedTempFile)> {
    let (buffer_pool, file) = create_test_buffer_pool(pool_size)?;
    let config = EngineConfig {
        pool_size,
        leaf_max_size: leaf_max,
        internal_max_size: internal_max,
        ..EngineConfig::default()
    };
    let tree = BTreeIndex::create(Arc::clone(&buffer_pool), &config)?;
    Ok((tree, buffer_pool, file))
}

// Lock manager plus transaction manager wired to a shared registry.
// A long detection interval keeps the detector out of tests that do not
// exercise deadlocks.
#[allow(dead_code)]
pub fn create_txn_stack(
    detection_interval: Duration,
) -> (Arc<LockManager>, TransactionManager, Arc<TransactionRegistry>) {
    let registry = Arc::new(TransactionRegistry::default());
    let lock_manager = LockManager::new(Arc::clone(&registry), detection_interval);
    let config = EngineConfig::default();
    let txn_manager = TransactionManager::new(Arc::clone(&lock_manager), Arc::clone(&registry), &config);
    (lock_manager, txn_manager, registry)
}
