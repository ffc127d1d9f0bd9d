//! Transaction lifecycle management.
//!
//! The manager owns the lock manager and the log stream. Mutex order, where
//! more than one is held: transaction state, then the lock table, then the
//! log. No component calls back into the manager.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use crate::error::{Error, Result};
use crate::lock_manager::{LockManager, LockMode};
use crate::wal::{WalManager, WalRecord};
use crate::{PageId, TransactionId};

/// States a transaction moves through. `Committed` and `Aborted` are
/// terminal; there are no transitions out of them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Active,
    Committed,
    Aborted,
}

/// Bookkeeping for one transaction.
#[derive(Debug)]
pub struct Transaction {
    pub id: TransactionId,
    pub state: TransactionState,
    pub locked_pages: HashSet<PageId>,
}

struct TxInner {
    transactions: HashMap<TransactionId, Transaction>,
    next_tx_id: TransactionId,
}

pub struct TransactionManager {
    inner: Mutex<TxInner>,
    lock_manager: LockManager,
    wal: Mutex<WalManager>,
}

impl TransactionManager {
    /// `next_tx_id` resumes above the highest id recovery saw in the log.
    pub fn new(wal: WalManager, next_tx_id: TransactionId) -> Self {
        Self {
            inner: Mutex::new(TxInner {
                transactions: HashMap::new(),
                next_tx_id: next_tx_id.max(1),
            }),
            lock_manager: LockManager::new(),
            wal: Mutex::new(wal),
        }
    }

    fn unknown(tx_id: TransactionId) -> Error {
        Error::TransactionState {
            tx_id,
            reason: "unknown transaction".to_string(),
        }
    }

    /// Start a transaction: allocate an id, record it ACTIVE, log `Begin`.
    pub fn begin(&self) -> Result<TransactionId> {
        let mut inner = self.inner.lock().unwrap();
        let tx_id = inner.next_tx_id;
        inner.next_tx_id += 1;
        inner.transactions.insert(
            tx_id,
            Transaction {
                id: tx_id,
                state: TransactionState::Active,
                locked_pages: HashSet::new(),
            },
        );
        self.wal.lock().unwrap().append(&WalRecord::Begin { tx_id })?;
        crate::basalt_debug_log!("[TransactionManager::begin] Started tx {tx_id}");
        Ok(tx_id)
    }

    fn finish(
        &self,
        tx_id: TransactionId,
        terminal: TransactionState,
        record: WalRecord,
    ) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        let tx = inner
            .transactions
            .get_mut(&tx_id)
            .ok_or_else(|| Self::unknown(tx_id))?;
        if tx.state != TransactionState::Active {
            return Err(Error::TransactionState {
                tx_id,
                reason: format!("cannot finish from {:?}", tx.state),
            });
        }
        tx.state = terminal;
        tx.locked_pages.clear();
        self.lock_manager.release_all_locks(tx_id);
        self.wal.lock().unwrap().append(&record)?;
        crate::basalt_debug_log!("[TransactionManager] tx {tx_id} -> {terminal:?}");
        Ok(())
    }

    /// Commit an ACTIVE transaction: release its locks, mark it COMMITTED,
    /// log `Commit`. Anything else fails without side effects.
    pub fn commit(&self, tx_id: TransactionId) -> Result<()> {
        self.finish(tx_id, TransactionState::Committed, WalRecord::Commit { tx_id })
    }

    /// Abort an ACTIVE transaction. Locks are released and the abort is
    /// logged; pages already modified are not restored here. Recovery
    /// reverses them from the logged before-images.
    pub fn abort(&self, tx_id: TransactionId) -> Result<()> {
        self.finish(tx_id, TransactionState::Aborted, WalRecord::Abort { tx_id })
    }

    /// Take a page lock on behalf of an ACTIVE transaction. `Ok(false)`
    /// means the lock is held by someone else; nothing is queued.
    pub fn acquire_lock(
        &self,
        tx_id: TransactionId,
        page_id: PageId,
        mode: LockMode,
    ) -> Result<bool> {
        let mut inner = self.inner.lock().unwrap();
        let tx = inner
            .transactions
            .get_mut(&tx_id)
            .ok_or_else(|| Self::unknown(tx_id))?;
        if tx.state != TransactionState::Active {
            return Err(Error::TransactionState {
                tx_id,
                reason: "lock request on a finished transaction".to_string(),
            });
        }
        if self.lock_manager.acquire_lock(page_id, mode, tx_id) {
            tx.locked_pages.insert(page_id);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    pub fn release_lock(&self, tx_id: TransactionId, page_id: PageId) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(tx) = inner.transactions.get_mut(&tx_id) {
            tx.locked_pages.remove(&page_id);
        }
        self.lock_manager.release_lock(page_id, tx_id);
    }

    /// Append a `PageWrite` with before/after images for an ACTIVE
    /// transaction. Callers do this as part of the mutation, while the
    /// frame is still pinned, so the record is durable before any eviction.
    pub fn log_page_write(
        &self,
        tx_id: TransactionId,
        table: &str,
        page_id: PageId,
        before: &[u8],
        after: &[u8],
    ) -> Result<()> {
        let inner = self.inner.lock().unwrap();
        let tx = inner
            .transactions
            .get(&tx_id)
            .ok_or_else(|| Self::unknown(tx_id))?;
        if tx.state != TransactionState::Active {
            return Err(Error::TransactionState {
                tx_id,
                reason: "page write on a finished transaction".to_string(),
            });
        }
        self.wal.lock().unwrap().append(&WalRecord::PageWrite {
            tx_id,
            table: table.to_string(),
            page_id,
            before: before.to_vec(),
            after: after.to_vec(),
        })
    }

    /// Log a checkpoint and truncate the stream. Callers flush every dirty
    /// page first; truncation is only safe once those pages are durable.
    pub fn checkpoint(&self) -> Result<()> {
        let mut wal = self.wal.lock().unwrap();
        wal.append(&WalRecord::Checkpoint)?;
        wal.truncate()
    }

    pub fn is_active(&self, tx_id: TransactionId) -> bool {
        self.state(tx_id) == Some(TransactionState::Active)
    }

    pub fn state(&self, tx_id: TransactionId) -> Option<TransactionState> {
        let inner = self.inner.lock().unwrap();
        inner.transactions.get(&tx_id).map(|tx| tx.state)
    }

    pub fn locked_pages(&self, tx_id: TransactionId) -> Vec<PageId> {
        self.lock_manager.locked_pages(tx_id)
    }

    pub fn active_count(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .transactions
            .values()
            .filter(|tx| tx.state == TransactionState::Active)
            .count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn manager(dir: &tempfile::TempDir) -> TransactionManager {
        let wal = WalManager::open(dir.path().join("test.log")).unwrap();
        TransactionManager::new(wal, 1)
    }

    #[test]
    fn ids_are_monotonic_and_states_track_lifecycle() {
        let dir = tempdir().unwrap();
        let tm = manager(&dir);

        let tx1 = tm.begin().unwrap();
        let tx2 = tm.begin().unwrap();
        assert_eq!(tx2, tx1 + 1);
        assert_eq!(tm.active_count(), 2);

        tm.commit(tx1).unwrap();
        tm.abort(tx2).unwrap();
        assert_eq!(tm.state(tx1), Some(TransactionState::Committed));
        assert_eq!(tm.state(tx2), Some(TransactionState::Aborted));
        assert_eq!(tm.active_count(), 0);
    }

    #[test]
    fn terminal_states_reject_further_transitions() {
        let dir = tempdir().unwrap();
        let tm = manager(&dir);

        let tx = tm.begin().unwrap();
        tm.commit(tx).unwrap();
        assert!(matches!(
            tm.commit(tx),
            Err(Error::TransactionState { .. })
        ));
        assert!(matches!(tm.abort(tx), Err(Error::TransactionState { .. })));
        assert_eq!(tm.state(tx), Some(TransactionState::Committed));
    }

    #[test]
    fn unknown_transaction_is_rejected() {
        let dir = tempdir().unwrap();
        let tm = manager(&dir);
        assert!(matches!(
            tm.commit(42),
            Err(Error::TransactionState { .. })
        ));
        assert!(matches!(
            tm.acquire_lock(42, 1, LockMode::Shared),
            Err(Error::TransactionState { .. })
        ));
    }

    #[test]
    fn commit_releases_all_locks() {
        let dir = tempdir().unwrap();
        let tm = manager(&dir);

        let tx1 = tm.begin().unwrap();
        let tx2 = tm.begin().unwrap();
        assert!(tm.acquire_lock(tx1, 3, LockMode::Exclusive).unwrap());
        assert!(!tm.acquire_lock(tx2, 3, LockMode::Exclusive).unwrap());
        assert_eq!(tm.locked_pages(tx1), vec![3]);

        tm.commit(tx1).unwrap();
        assert!(tm.locked_pages(tx1).is_empty());
        assert!(tm.acquire_lock(tx2, 3, LockMode::Exclusive).unwrap());
    }

    #[test]
    fn locks_on_finished_transactions_are_errors() {
        let dir = tempdir().unwrap();
        let tm = manager(&dir);

        let tx = tm.begin().unwrap();
        tm.abort(tx).unwrap();
        assert!(matches!(
            tm.acquire_lock(tx, 1, LockMode::Shared),
            Err(Error::TransactionState { .. })
        ));
        assert!(matches!(
            tm.log_page_write(tx, "t", 1, &[], &[]),
            Err(Error::TransactionState { .. })
        ));
    }
}
