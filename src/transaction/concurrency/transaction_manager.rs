use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use parking_lot::Mutex;

use crate::common::types::TxnId;
use crate::transaction::concurrency::transaction::{IsolationLevel, Transaction, TransactionState};

/// Registry of active transactions: hands out monotonically increasing ids
/// and resolves a transaction id back to the live transaction, which the
/// lock manager needs when an older requester wounds a younger holder.
pub struct TransactionManager {
    next_txn_id: AtomicU32,
    active_transactions: Mutex<HashMap<TxnId, Arc<Transaction>>>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self {
            next_txn_id: AtomicU32::new(0),
            active_transactions: Mutex::new(HashMap::new()),
        }
    }

    /// Begin a new transaction. Lower ids are older and win wound-wait
    /// conflicts.
    pub fn begin(&self, isolation_level: IsolationLevel) -> Arc<Transaction> {
        let txn_id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let txn = Arc::new(Transaction::new(txn_id, isolation_level));
        self.active_transactions.lock().insert(txn_id, txn.clone());
        txn
    }

    /// Look up a live transaction by id.
    pub fn get(&self, txn_id: TxnId) -> Option<Arc<Transaction>> {
        self.active_transactions.lock().get(&txn_id).cloned()
    }

    /// Commit: transition the state and deregister.
    pub fn commit(&self, txn_id: TxnId) {
        if let Some(txn) = self.active_transactions.lock().remove(&txn_id) {
            txn.set_state(TransactionState::Committed);
        }
    }

    /// Abort: transition the state and deregister.
    pub fn abort(&self, txn_id: TxnId) {
        if let Some(txn) = self.active_transactions.lock().remove(&txn_id) {
            txn.set_state(TransactionState::Aborted);
        }
    }

    pub fn active_transaction_ids(&self) -> Vec<TxnId> {
        self.active_transactions.lock().keys().copied().collect()
    }
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}
