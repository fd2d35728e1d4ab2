use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, trace};
use parking_lot::{Condvar, Mutex};

use crate::common::types::{Rid, TableId, TxnId};
use crate::transaction::concurrency::deadlock::WaitForGraph;
use crate::transaction::concurrency::transaction::{
    AbortReason, IsolationLevel, LockSets, Transaction, TransactionError, TransactionRegistry,
    TransactionState,
};

/// Hierarchical lock modes. Intention modes apply to tables only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockMode {
    IntentionShared,
    IntentionExclusive,
    Shared,
    SharedIntentionExclusive,
    Exclusive,
}

impl LockMode {
    /// The classic multigranularity compatibility matrix.
    pub fn compatible_with(self, other: LockMode) -> bool {
        use LockMode::*;
        match (self, other) {
            (IntentionShared, Exclusive) | (Exclusive, IntentionShared) => false,
            (IntentionShared, _) | (_, IntentionShared) => true,
            (IntentionExclusive, IntentionExclusive) => true,
            (Shared, Shared) => true,
            _ => false,
        }
    }

    /// Permitted upgrades: IS -> {S, X, IX, SIX}, S -> {X, SIX},
    /// IX -> {X, SIX}, SIX -> {X}.
    pub fn can_upgrade_to(self, requested: LockMode) -> bool {
        use LockMode::*;
        match self {
            IntentionShared => matches!(
                requested,
                Shared | Exclusive | IntentionExclusive | SharedIntentionExclusive
            ),
            Shared | IntentionExclusive => {
                matches!(requested, Exclusive | SharedIntentionExclusive)
            }
            SharedIntentionExclusive => requested == Exclusive,
            Exclusive => false,
        }
    }

    pub fn is_intention(self) -> bool {
        matches!(
            self,
            LockMode::IntentionShared | LockMode::IntentionExclusive
                | LockMode::SharedIntentionExclusive
        )
    }
}

/// One lock request, granted or waiting.
#[derive(Debug, Clone)]
pub struct LockRequest {
    pub txn_id: TxnId,
    pub mode: LockMode,
    pub table_id: TableId,
    pub rid: Option<Rid>,
    pub granted: bool,
}

#[derive(Default)]
pub(crate) struct QueueState {
    pub queue: VecDeque<LockRequest>,
    pub upgrading: Option<TxnId>,
}

/// Per-resource request queue. Grants are FIFO except that a pending
/// upgrade jumps the line once it is compatible with the granted set.
pub(crate) struct LockRequestQueue {
    pub state: Mutex<QueueState>,
    pub cv: Condvar,
}

impl LockRequestQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            cv: Condvar::new(),
        }
    }
}

/// Hierarchical two-phase lock manager with a background deadlock detector.
pub struct LockManager {
    table_locks: Mutex<HashMap<TableId, Arc<LockRequestQueue>>>,
    row_locks: Mutex<HashMap<(TableId, Rid), Arc<LockRequestQueue>>>,
    registry: Arc<TransactionRegistry>,
    shutdown: Arc<AtomicBool>,
    detector_handle: Mutex<Option<JoinHandle<()>>>,
}

impl LockManager {
    /// Build the lock manager and start its deadlock detection thread.
    pub fn new(registry: Arc<TransactionRegistry>, detection_interval: Duration) -> Arc<Self> {
        let shutdown = Arc::new(AtomicBool::new(false));
        let lm = Arc::new(Self {
            table_locks: Mutex::new(HashMap::new()),
            row_locks: Mutex::new(HashMap::new()),
            registry,
            shutdown: Arc::clone(&shutdown),
            detector_handle: Mutex::new(None),
        });

        let weak = Arc::downgrade(&lm);
        let handle = std::thread::spawn(move || {
            // Sleep in short ticks so shutdown is prompt even under a long
            // detection interval.
            let tick = Duration::from_millis(10);
            let mut elapsed = Duration::ZERO;
            loop {
                std::thread::sleep(tick.min(detection_interval));
                if shutdown.load(Ordering::SeqCst) {
                    return;
                }
                elapsed += tick;
                if elapsed >= detection_interval {
                    elapsed = Duration::ZERO;
                    match weak.upgrade() {
                        Some(lm) => lm.run_cycle_detection(),
                        None => return,
                    }
                }
            }
        });
        *lm.detector_handle.lock() = Some(handle);
        lm
    }

    /// Acquire (or upgrade to) `mode` on a table, blocking until granted or
    /// the transaction is aborted.
    pub fn lock_table(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table_id: TableId,
    ) -> Result<(), TransactionError> {
        self.check_lockable(txn, mode)?;

        let queue = {
            let mut map = self.table_locks.lock();
            Arc::clone(
                map.entry(table_id)
                    .or_insert_with(|| Arc::new(LockRequestQueue::new())),
            )
        };

        let request = LockRequest {
            txn_id: txn.id(),
            mode,
            table_id,
            rid: None,
            granted: false,
        };
        self.acquire(txn, &queue, request, |locks, held| {
            Self::remove_table_lock(locks, held, table_id)
        })?;

        let mut locks = txn.locks();
        Self::insert_table_lock(&mut locks, mode, table_id);
        trace!("txn {} locked table {} {:?}", txn.id(), table_id, mode);
        Ok(())
    }

    /// Release a table lock. Fails if row locks under the table are still
    /// held or if no lock is held at all.
    pub fn unlock_table(
        &self,
        txn: &Arc<Transaction>,
        table_id: TableId,
    ) -> Result<(), TransactionError> {
        if txn.locks().holds_row_locks(table_id) {
            return Err(self.abort_with(txn, AbortReason::TableUnlockedBeforeUnlockingRows));
        }

        let queue = {
            let map = self.table_locks.lock();
            map.get(&table_id).cloned()
        };
        let queue = match queue {
            Some(q) => q,
            None => return Err(self.abort_with(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        let mode = {
            let mut state = queue.state.lock();
            let idx = state
                .queue
                .iter()
                .position(|r| r.txn_id == txn.id() && r.granted);
            let idx = match idx {
                Some(i) => i,
                None => {
                    drop(state);
                    return Err(
                        self.abort_with(txn, AbortReason::AttemptedUnlockButNoLockHeld)
                    );
                }
            };
            let mode = state.queue[idx].mode;
            state.queue.remove(idx);
            queue.cv.notify_all();
            mode
        };

        self.maybe_shrink(txn, mode);

        let mut locks = txn.locks();
        Self::remove_table_lock(&mut locks, mode, table_id);
        trace!("txn {} unlocked table {} {:?}", txn.id(), table_id, mode);
        Ok(())
    }

    /// Acquire (or upgrade to) `mode` on a row. Intention modes are not
    /// permitted and the matching table lock must already be held.
    pub fn lock_row(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
        table_id: TableId,
        rid: Rid,
    ) -> Result<(), TransactionError> {
        if mode.is_intention() {
            return Err(self.abort_with(txn, AbortReason::AttemptedIntentionLockOnRow));
        }
        self.check_lockable(txn, mode)?;

        {
            let locks = txn.locks();
            let table_ok = match mode {
                LockMode::Exclusive => locks.holds_exclusive_capable_table_lock(table_id),
                _ => locks.holds_any_table_lock(table_id),
            };
            if !table_ok {
                drop(locks);
                return Err(self.abort_with(txn, AbortReason::TableLockNotPresent));
            }
        }

        let queue = {
            let mut map = self.row_locks.lock();
            Arc::clone(
                map.entry((table_id, rid))
                    .or_insert_with(|| Arc::new(LockRequestQueue::new())),
            )
        };

        let request = LockRequest {
            txn_id: txn.id(),
            mode,
            table_id,
            rid: Some(rid),
            granted: false,
        };
        self.acquire(txn, &queue, request, |locks, held| {
            Self::remove_row_lock(locks, held, table_id, rid)
        })?;

        let mut locks = txn.locks();
        Self::insert_row_lock(&mut locks, mode, table_id, rid);
        trace!(
            "txn {} locked row {:?} of table {} {:?}",
            txn.id(),
            rid,
            table_id,
            mode
        );
        Ok(())
    }

    /// Release a row lock. With `force` the 2PL state transition is skipped,
    /// which rollback uses to release locks from any state.
    pub fn unlock_row(
        &self,
        txn: &Arc<Transaction>,
        table_id: TableId,
        rid: Rid,
        force: bool,
    ) -> Result<(), TransactionError> {
        let queue = {
            let map = self.row_locks.lock();
            map.get(&(table_id, rid)).cloned()
        };
        let queue = match queue {
            Some(q) => q,
            None => return Err(self.abort_with(txn, AbortReason::AttemptedUnlockButNoLockHeld)),
        };

        let mode = {
            let mut state = queue.state.lock();
            let idx = state
                .queue
                .iter()
                .position(|r| r.txn_id == txn.id() && r.granted);
            let idx = match idx {
                Some(i) => i,
                None => {
                    drop(state);
                    return Err(
                        self.abort_with(txn, AbortReason::AttemptedUnlockButNoLockHeld)
                    );
                }
            };
            let mode = state.queue[idx].mode;
            state.queue.remove(idx);
            queue.cv.notify_all();
            mode
        };

        if !force {
            self.maybe_shrink(txn, mode);
        }

        let mut locks = txn.locks();
        Self::remove_row_lock(&mut locks, mode, table_id, rid);
        Ok(())
    }

    /// Release every lock the transaction still holds, rows before tables.
    /// No state transitions happen; commit and abort call this on their way
    /// to a terminal state.
    pub fn unlock_all(&self, txn: &Arc<Transaction>) {
        let (rows, tables) = {
            let locks = txn.locks();
            let mut rows: Vec<(TableId, Rid)> = Vec::new();
            for (&table_id, rids) in locks
                .shared_rows
                .iter()
                .chain(locks.exclusive_rows.iter())
            {
                for &rid in rids {
                    rows.push((table_id, rid));
                }
            }
            let mut tables: Vec<TableId> = Vec::new();
            tables.extend(&locks.shared_tables);
            tables.extend(&locks.exclusive_tables);
            tables.extend(&locks.intention_shared_tables);
            tables.extend(&locks.intention_exclusive_tables);
            tables.extend(&locks.shared_intention_exclusive_tables);
            (rows, tables)
        };

        for (table_id, rid) in rows {
            let queue = self.row_locks.lock().get(&(table_id, rid)).cloned();
            if let Some(queue) = queue {
                Self::expunge(&queue, txn.id());
            }
        }
        for table_id in tables {
            let queue = self.table_locks.lock().get(&table_id).cloned();
            if let Some(queue) = queue {
                Self::expunge(&queue, txn.id());
            }
        }

        let mut locks = txn.locks();
        *locks = LockSets::default();
    }

    /// Common blocking acquisition path: handles repeat requests, upgrades,
    /// FIFO-with-upgrade-priority granting, and abort wakeups.
    fn acquire(
        &self,
        txn: &Arc<Transaction>,
        queue: &Arc<LockRequestQueue>,
        request: LockRequest,
        remove_held: impl Fn(&mut LockSets, LockMode),
    ) -> Result<(), TransactionError> {
        let mut state = queue.state.lock();

        // A transaction re-requesting a mode it already holds is a no-op;
        // any other mode starts an upgrade.
        if let Some(idx) = state
            .queue
            .iter()
            .position(|r| r.txn_id == request.txn_id)
        {
            if state.queue[idx].mode == request.mode {
                return Ok(());
            }
            if state.upgrading.is_some() {
                drop(state);
                return Err(self.abort_with(txn, AbortReason::UpgradeConflict));
            }
            if !state.queue[idx].mode.can_upgrade_to(request.mode) {
                drop(state);
                return Err(self.abort_with(txn, AbortReason::IncompatibleUpgrade));
            }
            let held = state.queue[idx].mode;
            state.upgrading = Some(request.txn_id);
            state.queue.remove(idx);
            let mut locks = txn.locks();
            remove_held(&mut locks, held);
            debug!(
                "txn {} upgrading {:?} -> {:?}",
                request.txn_id, held, request.mode
            );
        }

        state.queue.push_back(request.clone());

        while !Self::try_grant(&mut state, request.txn_id) {
            queue.cv.wait(&mut state);

            if txn.state() == TransactionState::Aborted {
                if state.upgrading == Some(request.txn_id) {
                    state.upgrading = None;
                }
                state.queue.retain(|r| r.txn_id != request.txn_id);
                queue.cv.notify_all();
                return Err(TransactionError::Abort {
                    txn_id: request.txn_id,
                    reason: AbortReason::Aborted,
                });
            }
        }
        Ok(())
    }

    /// Can the transaction's request be granted right now? Grants it if so.
    fn try_grant(state: &mut QueueState, txn_id: TxnId) -> bool {
        let my_idx = match state.queue.iter().position(|r| r.txn_id == txn_id) {
            Some(i) => i,
            None => return false,
        };
        let my_mode = state.queue[my_idx].mode;

        // Must be compatible with everything already granted.
        for r in state.queue.iter() {
            if r.granted && !my_mode.compatible_with(r.mode) {
                return false;
            }
        }

        // A pending upgrade has absolute priority.
        if let Some(upgrading) = state.upgrading {
            if upgrading == txn_id {
                state.upgrading = None;
                state.queue[my_idx].granted = true;
                return true;
            }
            return false;
        }

        // FIFO otherwise: an earlier waiter with an incompatible mode keeps
        // us queued; compatible waiters may be overtaken.
        for (i, r) in state.queue.iter().enumerate() {
            if i == my_idx {
                break;
            }
            if !r.granted && !my_mode.compatible_with(r.mode) {
                return false;
            }
        }
        state.queue[my_idx].granted = true;
        true
    }

    /// Centralized isolation-level gate consulted by every lock call.
    fn check_lockable(
        &self,
        txn: &Arc<Transaction>,
        mode: LockMode,
    ) -> Result<(), TransactionError> {
        use LockMode::*;
        let state = txn.state();
        // A transaction already marked aborted (by the deadlock detector or
        // a prior violation) may not acquire anything further.
        if state == TransactionState::Aborted {
            return Err(TransactionError::Abort {
                txn_id: txn.id(),
                reason: AbortReason::Aborted,
            });
        }
        match txn.isolation_level() {
            IsolationLevel::ReadUncommitted => {
                if matches!(mode, Shared | IntentionShared | SharedIntentionExclusive) {
                    return Err(self.abort_with(txn, AbortReason::LockSharedOnReadUncommitted));
                }
                if state == TransactionState::Shrinking
                    && matches!(mode, Exclusive | IntentionExclusive)
                {
                    return Err(self.abort_with(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::ReadCommitted => {
                if state == TransactionState::Shrinking
                    && !matches!(mode, Shared | IntentionShared)
                {
                    return Err(self.abort_with(txn, AbortReason::LockOnShrinking));
                }
            }
            IsolationLevel::RepeatableRead => {
                if state == TransactionState::Shrinking {
                    return Err(self.abort_with(txn, AbortReason::LockOnShrinking));
                }
            }
        }
        Ok(())
    }

    /// Releasing certain modes flips a growing transaction into shrinking;
    /// which modes count depends on the isolation level.
    fn maybe_shrink(&self, txn: &Arc<Transaction>, released: LockMode) {
        if txn.state() != TransactionState::Growing {
            return;
        }
        let shrinks = match txn.isolation_level() {
            IsolationLevel::RepeatableRead => {
                matches!(released, LockMode::Shared | LockMode::Exclusive)
            }
            IsolationLevel::ReadCommitted | IsolationLevel::ReadUncommitted => {
                released == LockMode::Exclusive
            }
        };
        if shrinks {
            txn.set_state(TransactionState::Shrinking);
        }
    }

    fn abort_with(&self, txn: &Arc<Transaction>, reason: AbortReason) -> TransactionError {
        txn.set_state(TransactionState::Aborted);
        debug!("txn {} aborted: {}", txn.id(), reason);
        TransactionError::Abort {
            txn_id: txn.id(),
            reason,
        }
    }

    /// Drop every request of `txn_id` from a queue and wake the waiters.
    fn expunge(queue: &Arc<LockRequestQueue>, txn_id: TxnId) {
        let mut state = queue.state.lock();
        if state.upgrading == Some(txn_id) {
            state.upgrading = None;
        }
        state.queue.retain(|r| r.txn_id != txn_id);
        queue.cv.notify_all();
    }

    fn insert_table_lock(locks: &mut LockSets, mode: LockMode, table_id: TableId) {
        match mode {
            LockMode::Shared => locks.shared_tables.insert(table_id),
            LockMode::Exclusive => locks.exclusive_tables.insert(table_id),
            LockMode::IntentionShared => locks.intention_shared_tables.insert(table_id),
            LockMode::IntentionExclusive => locks.intention_exclusive_tables.insert(table_id),
            LockMode::SharedIntentionExclusive => {
                locks.shared_intention_exclusive_tables.insert(table_id)
            }
        };
    }

    fn remove_table_lock(locks: &mut LockSets, mode: LockMode, table_id: TableId) {
        match mode {
            LockMode::Shared => locks.shared_tables.remove(&table_id),
            LockMode::Exclusive => locks.exclusive_tables.remove(&table_id),
            LockMode::IntentionShared => locks.intention_shared_tables.remove(&table_id),
            LockMode::IntentionExclusive => locks.intention_exclusive_tables.remove(&table_id),
            LockMode::SharedIntentionExclusive => {
                locks.shared_intention_exclusive_tables.remove(&table_id)
            }
        };
    }

    fn insert_row_lock(locks: &mut LockSets, mode: LockMode, table_id: TableId, rid: Rid) {
        match mode {
            LockMode::Shared => locks.shared_rows.entry(table_id).or_default().insert(rid),
            LockMode::Exclusive => locks
                .exclusive_rows
                .entry(table_id)
                .or_default()
                .insert(rid),
            _ => false,
        };
    }

    fn remove_row_lock(locks: &mut LockSets, mode: LockMode, table_id: TableId, rid: Rid) {
        match mode {
            LockMode::Shared => {
                if let Some(set) = locks.shared_rows.get_mut(&table_id) {
                    set.remove(&rid);
                }
            }
            LockMode::Exclusive => {
                if let Some(set) = locks.exclusive_rows.get_mut(&table_id) {
                    set.remove(&rid);
                }
            }
            _ => {}
        }
    }

    /// Rebuild the wait-for graph from every queue: each waiter points at
    /// each holder blocking it. Also returns, per waiter, the queues it is
    /// parked in so a victim can be woken.
    fn build_wait_for_graph(&self) -> (WaitForGraph, HashMap<TxnId, Vec<Arc<LockRequestQueue>>>) {
        let queues: Vec<Arc<LockRequestQueue>> = {
            let tables = self.table_locks.lock();
            let rows = self.row_locks.lock();
            tables
                .values()
                .cloned()
                .chain(rows.values().cloned())
                .collect()
        };

        let mut graph = WaitForGraph::new();
        let mut waiter_queues: HashMap<TxnId, Vec<Arc<LockRequestQueue>>> = HashMap::new();

        for queue in &queues {
            let state = queue.state.lock();
            let holders: Vec<TxnId> = state
                .queue
                .iter()
                .filter(|r| r.granted)
                .map(|r| r.txn_id)
                .collect();
            for waiter in state.queue.iter().filter(|r| !r.granted) {
                waiter_queues
                    .entry(waiter.txn_id)
                    .or_default()
                    .push(Arc::clone(queue));
                for &holder in &holders {
                    if holder != waiter.txn_id {
                        graph.add_edge(waiter.txn_id, holder);
                    }
                }
            }
        }

        (graph, waiter_queues)
    }

    /// Current wait-for edges as (waiter, holder) pairs, in id order.
    pub fn wait_for_edges(&self) -> Vec<(TxnId, TxnId)> {
        self.build_wait_for_graph().0.edge_list()
    }

    /// One pass of deadlock detection: rebuild the wait-for graph from every
    /// queue, then abort the youngest transaction of each cycle and wake the
    /// queues it was waiting in.
    pub fn run_cycle_detection(&self) {
        let (mut graph, waiter_queues) = self.build_wait_for_graph();

        while let Some(victim) = graph.find_cycle_victim() {
            debug!("deadlock detected, aborting txn {}", victim);
            if let Some(txn) = self.registry.get(victim) {
                txn.set_state(TransactionState::Aborted);
            }
            graph.remove_txn(victim);
            if let Some(queues) = waiter_queues.get(&victim) {
                for queue in queues {
                    queue.cv.notify_all();
                }
            }
        }
    }

    /// Test-support inspection: granted (txn, mode) pairs on a table.
    pub fn granted_table_locks(&self, table_id: TableId) -> Vec<(TxnId, LockMode)> {
        let queue = self.table_locks.lock().get(&table_id).cloned();
        match queue {
            Some(queue) => {
                let state = queue.state.lock();
                state
                    .queue
                    .iter()
                    .filter(|r| r.granted)
                    .map(|r| (r.txn_id, r.mode))
                    .collect()
            }
            None => Vec::new(),
        }
    }
}

impl Drop for LockManager {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.detector_handle.get_mut().take() {
            if handle.thread().id() != std::thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let modes = [
            IntentionShared,
            IntentionExclusive,
            Shared,
            SharedIntentionExclusive,
            Exclusive,
        ];
        // Row-major truth table in the order above.
        let expected = [
            [true, true, true, true, false],
            [true, true, false, false, false],
            [true, false, true, false, false],
            [true, false, false, false, false],
            [false, false, false, false, false],
        ];
        for (i, &a) in modes.iter().enumerate() {
            for (j, &b) in modes.iter().enumerate() {
                assert_eq!(
                    a.compatible_with(b),
                    expected[i][j],
                    "{:?} vs {:?}",
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_upgrade_rules() {
        use LockMode::*;
        assert!(IntentionShared.can_upgrade_to(Shared));
        assert!(IntentionShared.can_upgrade_to(Exclusive));
        assert!(IntentionShared.can_upgrade_to(IntentionExclusive));
        assert!(IntentionShared.can_upgrade_to(SharedIntentionExclusive));
        assert!(Shared.can_upgrade_to(Exclusive));
        assert!(Shared.can_upgrade_to(SharedIntentionExclusive));
        assert!(IntentionExclusive.can_upgrade_to(Exclusive));
        assert!(SharedIntentionExclusive.can_upgrade_to(Exclusive));

        assert!(!Shared.can_upgrade_to(IntentionShared));
        assert!(!Exclusive.can_upgrade_to(Shared));
        assert!(!SharedIntentionExclusive.can_upgrade_to(Shared));
    }
}
