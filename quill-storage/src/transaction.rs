use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// Logical timestamps drawn from a per-manager monotonic clock. Start and
/// finish timestamps share one counter, so every timestamp in the system is
/// unique and doubles as a transaction id.
pub type Timestamp = u64;

pub const INITIAL_TIMESTAMP: Timestamp = 1;
/// Stamp of a version whose writer has not committed yet.
pub const TS_PENDING: Timestamp = u64::MAX;
/// Stamp of a version whose writer aborted; never visible to anyone.
pub const TS_ABORTED: Timestamp = u64::MAX - 1;

/// A deferred action runs at commit or abort and receives the finish
/// timestamp the manager assigned to the transaction.
pub type DeferredAction = Box<dyn FnOnce(Timestamp) + Send>;

/// Per-transaction state: the MVCC snapshot timestamp, the must-abort flag
/// set by any error inside the transaction, and the two ordered lists of
/// deferred actions that storage, indexes and the catalog register.
pub struct TransactionContext {
    start_ts: Timestamp,
    finish_ts: AtomicU64,
    must_abort: AtomicBool,
    commit_actions: Mutex<Vec<DeferredAction>>,
    abort_actions: Mutex<Vec<DeferredAction>>,
}

impl TransactionContext {
    fn new(start_ts: Timestamp) -> Self {
        TransactionContext {
            start_ts,
            finish_ts: AtomicU64::new(0),
            must_abort: AtomicBool::new(false),
            commit_actions: Mutex::new(Vec::new()),
            abort_actions: Mutex::new(Vec::new()),
        }
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    /// Finish timestamp, 0 while the transaction is still running.
    pub fn finish_ts(&self) -> Timestamp {
        self.finish_ts.load(Ordering::Acquire)
    }

    pub fn must_abort(&self) -> bool {
        self.must_abort.load(Ordering::Acquire)
    }

    pub fn set_must_abort(&self) {
        self.must_abort.store(true, Ordering::Release);
    }

    /// Queue an action to run when the transaction commits. Actions run in
    /// registration order.
    pub fn register_commit_action(&self, action: impl FnOnce(Timestamp) + Send + 'static) {
        self.commit_actions.lock().unwrap().push(Box::new(action));
    }

    /// Queue an action to run when the transaction aborts. Actions run in
    /// registration order.
    pub fn register_abort_action(&self, action: impl FnOnce(Timestamp) + Send + 'static) {
        self.abort_actions.lock().unwrap().push(Box::new(action));
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("start_ts", &self.start_ts)
            .field("finish_ts", &self.finish_ts())
            .field("must_abort", &self.must_abort())
            .finish()
    }
}

/// Owns the logical clock and drives transaction begin/commit/abort.
#[derive(Debug)]
pub struct TransactionManager {
    clock: AtomicU64,
}

impl TransactionManager {
    pub fn new() -> Self {
        TransactionManager {
            clock: AtomicU64::new(INITIAL_TIMESTAMP),
        }
    }

    /// Current value of the clock, for snapshot-only readers.
    pub fn now(&self) -> Timestamp {
        self.clock.load(Ordering::Acquire)
    }

    pub fn begin(&self) -> Arc<TransactionContext> {
        let start = self.clock.fetch_add(1, Ordering::AcqRel);
        Arc::new(TransactionContext::new(start))
    }

    /// Commit: assign the finish timestamp, publish it, and run the commit
    /// actions in registration order. The caller is responsible for routing
    /// must-abort transactions to [`TransactionManager::abort`] instead.
    pub fn commit(&self, txn: &Arc<TransactionContext>) -> Timestamp {
        let finish = self.clock.fetch_add(1, Ordering::AcqRel);
        txn.finish_ts.store(finish, Ordering::Release);
        let actions = std::mem::take(&mut *txn.commit_actions.lock().unwrap());
        for action in actions {
            action(finish);
        }
        txn.abort_actions.lock().unwrap().clear();
        finish
    }

    /// Abort: run the abort actions in registration order.
    pub fn abort(&self, txn: &Arc<TransactionContext>) -> Timestamp {
        let finish = self.clock.fetch_add(1, Ordering::AcqRel);
        txn.finish_ts.store(finish, Ordering::Release);
        let actions = std::mem::take(&mut *txn.abort_actions.lock().unwrap());
        for action in actions {
            action(finish);
        }
        txn.commit_actions.lock().unwrap().clear();
        finish
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn timestamps_are_monotonic_and_unique() {
        let mgr = TransactionManager::new();
        let t1 = mgr.begin();
        let t2 = mgr.begin();
        assert!(t2.start_ts() > t1.start_ts());
        let f1 = mgr.commit(&t1);
        assert!(f1 > t2.start_ts());
    }

    #[test]
    fn commit_actions_run_in_order_abort_actions_dropped() {
        let mgr = TransactionManager::new();
        let txn = mgr.begin();
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..3 {
            let order = order.clone();
            txn.register_commit_action(move |_| order.lock().unwrap().push(i));
        }
        let fired = Arc::new(AtomicUsize::new(0));
        {
            let fired = fired.clone();
            txn.register_abort_action(move |_| {
                fired.fetch_add(1, Ordering::SeqCst);
            });
        }
        mgr.commit(&txn);
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn abort_runs_abort_actions_with_finish_ts() {
        let mgr = TransactionManager::new();
        let txn = mgr.begin();
        let seen = Arc::new(AtomicU64::new(0));
        {
            let seen = seen.clone();
            txn.register_abort_action(move |ts| seen.store(ts, Ordering::SeqCst));
        }
        let finish = mgr.abort(&txn);
        assert_eq!(seen.load(Ordering::SeqCst), finish);
    }
}
