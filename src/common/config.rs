use std::time::Duration;

use crate::transaction::IsolationLevel;

/// Engine-wide tuning knobs. Every component constructor accepts either the
/// individual values or a reference to this struct.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Number of frames in the buffer pool
    pub pool_size: usize,
    /// K for the LRU-K replacement policy
    pub replacer_k: usize,
    /// Maximum number of keys in a B+Tree leaf page
    pub leaf_max_size: usize,
    /// Maximum number of children in a B+Tree internal page
    pub internal_max_size: usize,
    /// How often the background deadlock detector wakes up
    pub deadlock_detection_interval: Duration,
    /// Isolation level assigned by `TransactionManager::begin`
    pub isolation_level: IsolationLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_size: 64,
            replacer_k: 2,
            leaf_max_size: 64,
            internal_max_size: 64,
            deadlock_detection_interval: Duration::from_millis(50),
            isolation_level: IsolationLevel::RepeatableRead,
        }
    }
}
