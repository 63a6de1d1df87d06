use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use log::debug;
use parking_lot::{Condvar, Mutex, MutexGuard};

use crate::common::types::{Rid, TxnId, INVALID_TXN_ID};
use crate::transaction::concurrency::transaction::{
    IsolationLevel, Transaction, TransactionAbortError, TransactionState,
};
use crate::transaction::concurrency::transaction_manager::TransactionManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

#[derive(Debug)]
struct LockRequest {
    txn_id: TxnId,
    mode: LockMode,
    granted: bool,
}

impl LockRequest {
    fn new(txn_id: TxnId, mode: LockMode) -> Self {
        Self {
            txn_id,
            mode,
            granted: false,
        }
    }
}

struct LockQueue {
    queue: VecDeque<LockRequest>,
    /// The single transaction currently performing an S→X upgrade on this
    /// rid, or `INVALID_TXN_ID`.
    upgrading: TxnId,
    cv: Arc<Condvar>,
}

impl LockQueue {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            upgrading: INVALID_TXN_ID,
            cv: Arc::new(Condvar::new()),
        }
    }
}

type LockTable = HashMap<Rid, LockQueue>;

/// Row-level lock manager: strict two-phase locking with wound-wait
/// deadlock prevention. An older requester (smaller txn id) aborts every
/// younger conflicting holder instead of waiting behind it; a younger
/// requester sleeps on the queue's condvar until the older holders leave.
///
/// One mutex serializes the whole lock table; condvar waits release it
/// while sleeping. The registry resolves txn ids when wounding.
pub struct LockManager {
    registry: Arc<TransactionManager>,
    lock_table: Mutex<LockTable>,
}

impl LockManager {
    pub fn new(registry: Arc<TransactionManager>) -> Self {
        Self {
            registry,
            lock_table: Mutex::new(HashMap::new()),
        }
    }

    /// Acquire a shared lock on `rid`.
    pub fn lock_shared(
        &self,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        let mut table = self.lock_table.lock();

        if txn.state() == TransactionState::Aborted {
            return Ok(false);
        }
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionAbortError::LockOnShrinking(txn.id()));
        }
        if txn.isolation_level() == IsolationLevel::ReadUncommitted {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionAbortError::SharedLockOnReadUncommitted(txn.id()));
        }
        if txn.is_shared_locked(rid) || txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        txn.set_state(TransactionState::Growing);
        let txn_id = txn.id();
        let cv = {
            let queue = table.entry(rid).or_insert_with(LockQueue::new);
            queue.queue.push_back(LockRequest::new(txn_id, LockMode::Shared));
            queue.cv.clone()
        };

        loop {
            if Self::try_grant_shared(&mut table, &self.registry, rid, txn_id) {
                break;
            }
            if txn.state() == TransactionState::Aborted {
                break;
            }
            cv.wait(&mut table);
        }

        if txn.state() == TransactionState::Aborted {
            return Err(TransactionAbortError::Deadlock(txn_id));
        }

        txn.add_shared_lock(rid);
        Ok(true)
    }

    /// Acquire an exclusive lock on `rid`. A request over an existing
    /// shared lock routes through the upgrade path.
    pub fn lock_exclusive(
        &self,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        let table = self.lock_table.lock();

        if txn.state() == TransactionState::Aborted {
            return Ok(false);
        }
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionAbortError::LockOnShrinking(txn.id()));
        }
        if txn.is_shared_locked(rid) {
            return self.upgrade_internal(table, txn, rid);
        }
        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        txn.set_state(TransactionState::Growing);
        self.acquire_exclusive(table, txn, rid)
    }

    /// Upgrade an already-held shared lock to exclusive.
    pub fn lock_upgrade(
        &self,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        let table = self.lock_table.lock();

        if txn.state() == TransactionState::Aborted {
            return Ok(false);
        }
        if txn.state() == TransactionState::Shrinking {
            txn.set_state(TransactionState::Aborted);
            return Err(TransactionAbortError::LockOnShrinking(txn.id()));
        }

        self.upgrade_internal(table, txn, rid)
    }

    /// Release the lock held on `rid`. Under REPEATABLE READ the first
    /// release moves a growing transaction to its shrink phase; the weaker
    /// levels release early without a state transition.
    pub fn unlock(&self, txn: &Transaction, rid: Rid) -> bool {
        let mut table = self.lock_table.lock();

        if txn.state() == TransactionState::Growing
            && txn.isolation_level() == IsolationLevel::RepeatableRead
        {
            txn.set_state(TransactionState::Shrinking);
        }

        if let Some(queue) = table.get_mut(&rid) {
            if let Some(pos) = queue.queue.iter().position(|r| r.txn_id == txn.id()) {
                queue.queue.remove(pos);
            }
            queue.cv.notify_all();
        }

        txn.remove_shared_lock(rid);
        txn.remove_exclusive_lock(rid);
        true
    }

    /// Enqueue an exclusive request and run the wound-wait loop.
    /// Called with the table mutex held; consumes the guard across waits.
    fn acquire_exclusive(
        &self,
        mut table: MutexGuard<'_, LockTable>,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        let txn_id = txn.id();
        let cv = {
            let queue = table.entry(rid).or_insert_with(LockQueue::new);
            queue
                .queue
                .push_back(LockRequest::new(txn_id, LockMode::Exclusive));
            queue.cv.clone()
        };

        loop {
            if Self::try_grant_exclusive(&mut table, &self.registry, rid, txn_id) {
                break;
            }
            if txn.state() == TransactionState::Aborted {
                break;
            }
            cv.wait(&mut table);
        }

        if txn.state() == TransactionState::Aborted {
            return Err(TransactionAbortError::Deadlock(txn_id));
        }

        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// S→X upgrade with the table mutex held: claim the queue's single
    /// upgrade slot, drop the shared entry, and re-enter as an exclusive
    /// requester.
    fn upgrade_internal(
        &self,
        mut table: MutexGuard<'_, LockTable>,
        txn: &Transaction,
        rid: Rid,
    ) -> Result<bool, TransactionAbortError> {
        if txn.is_exclusive_locked(rid) {
            return Ok(true);
        }

        let txn_id = txn.id();
        let cv = {
            let queue = table.entry(rid).or_insert_with(LockQueue::new);
            if queue.upgrading != INVALID_TXN_ID {
                txn.set_state(TransactionState::Aborted);
                return Ok(false);
            }
            queue.upgrading = txn_id;

            if let Some(pos) = queue.queue.iter().position(|r| r.txn_id == txn_id) {
                queue.queue.remove(pos);
            }
            txn.remove_shared_lock(rid);
            queue.cv.notify_all();

            queue
                .queue
                .push_back(LockRequest::new(txn_id, LockMode::Exclusive));
            queue.cv.clone()
        };

        loop {
            if Self::try_grant_exclusive(&mut table, &self.registry, rid, txn_id) {
                break;
            }
            if txn.state() == TransactionState::Aborted {
                break;
            }
            cv.wait(&mut table);
        }

        let queue = table.get_mut(&rid).expect("lock queue exists");
        queue.upgrading = INVALID_TXN_ID;

        if txn.state() == TransactionState::Aborted {
            return Err(TransactionAbortError::Deadlock(txn_id));
        }

        txn.add_exclusive_lock(rid);
        Ok(true)
    }

    /// Walk the queue for a shared requester. Compatible with granted
    /// shared holders ahead of it; a younger exclusive holder is wounded,
    /// an older one forces a wait.
    fn try_grant_shared(
        table: &mut LockTable,
        registry: &TransactionManager,
        rid: Rid,
        txn_id: TxnId,
    ) -> bool {
        let queue = table.get_mut(&rid).expect("lock queue exists");
        let mut grantable = true;
        let mut idx = 0;
        while idx < queue.queue.len() {
            let entry_txn = queue.queue[idx].txn_id;
            if entry_txn == txn_id {
                queue.queue[idx].granted = grantable;
                return grantable;
            }
            if queue.queue[idx].mode == LockMode::Exclusive {
                if entry_txn > txn_id {
                    Self::wound(queue, registry, rid, txn_id, entry_txn, idx);
                } else {
                    grantable = false;
                    idx += 1;
                }
            } else {
                idx += 1;
            }
        }
        // Our entry is gone: we were wounded while waiting. The caller's
        // aborted-state check turns this into a deadlock abort.
        true
    }

    /// Walk the queue for an exclusive requester. Every preceding entry
    /// conflicts: younger ones are wounded, an older one forces a wait.
    fn try_grant_exclusive(
        table: &mut LockTable,
        registry: &TransactionManager,
        rid: Rid,
        txn_id: TxnId,
    ) -> bool {
        let queue = table.get_mut(&rid).expect("lock queue exists");
        let mut idx = 0;
        while idx < queue.queue.len() {
            let entry_txn = queue.queue[idx].txn_id;
            if entry_txn == txn_id {
                queue.queue[idx].granted = true;
                return true;
            }
            if entry_txn > txn_id {
                Self::wound(queue, registry, rid, txn_id, entry_txn, idx);
            } else {
                return false;
            }
        }
        true
    }

    /// Abort a younger conflicting transaction: flip its state, clear the
    /// rid from its lock sets, drop its queue entry, and wake the queue.
    /// The erased entry is never touched again.
    fn wound(
        queue: &mut LockQueue,
        registry: &TransactionManager,
        rid: Rid,
        winner: TxnId,
        victim_id: TxnId,
        idx: usize,
    ) {
        debug!(
            "txn {} wounds txn {} on {:?}",
            winner, victim_id, rid
        );
        if let Some(victim) = registry.get(victim_id) {
            victim.set_state(TransactionState::Aborted);
            victim.remove_exclusive_lock(rid);
            victim.remove_shared_lock(rid);
        }
        queue.queue.remove(idx);
        queue.cv.notify_all();
    }
}
