//! Page-level lock table with shared/exclusive modes.
//!
//! Acquisition is a pure try-lock: a conflicting request returns `false`
//! and leaves nothing queued, so callers retry or give up. There is no
//! wait path and therefore nothing to deadlock on.

use std::collections::HashMap;
use std::sync::Mutex;

use crate::{PageId, TransactionId};

/// Shared locks are mutually compatible; exclusive conflicts with everything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// One granted lock on a page.
#[derive(Debug, Clone)]
struct LockRequest {
    mode: LockMode,
    tx_id: TransactionId,
}

#[derive(Debug, Default)]
pub struct LockManager {
    lock_table: Mutex<HashMap<PageId, Vec<LockRequest>>>,
}

impl LockManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Try to lock `page_id` for `tx_id` in `mode`.
    ///
    /// A transaction that already holds a lock on the page gets `true`
    /// immediately, upgrading shared to exclusive when no other transaction
    /// holds a lock. A new request is granted only when compatible with
    /// every holder.
    pub fn acquire_lock(&self, page_id: PageId, mode: LockMode, tx_id: TransactionId) -> bool {
        let mut table = self.lock_table.lock().unwrap();
        let requests = table.entry(page_id).or_default();

        if let Some(pos) = requests.iter().position(|r| r.tx_id == tx_id) {
            if requests[pos].mode == LockMode::Shared && mode == LockMode::Exclusive {
                let alone = requests.iter().all(|r| r.tx_id == tx_id);
                if alone {
                    requests[pos].mode = LockMode::Exclusive;
                    return true;
                }
                return false;
            }
            return true;
        }

        let compatible = requests.is_empty()
            || (mode == LockMode::Shared && requests.iter().all(|r| r.mode == LockMode::Shared));
        if compatible {
            requests.push(LockRequest { mode, tx_id });
            true
        } else {
            false
        }
    }

    /// Drop `tx_id`'s lock on one page, removing the table entry when it
    /// empties.
    pub fn release_lock(&self, page_id: PageId, tx_id: TransactionId) {
        let mut table = self.lock_table.lock().unwrap();
        if let Some(requests) = table.get_mut(&page_id) {
            requests.retain(|r| r.tx_id != tx_id);
            if requests.is_empty() {
                table.remove(&page_id);
            }
        }
    }

    /// Drop every lock held by `tx_id`. Called on commit and abort.
    pub fn release_all_locks(&self, tx_id: TransactionId) {
        let mut table = self.lock_table.lock().unwrap();
        table.retain(|_, requests| {
            requests.retain(|r| r.tx_id != tx_id);
            !requests.is_empty()
        });
    }

    pub fn has_lock(&self, page_id: PageId, tx_id: TransactionId) -> bool {
        let table = self.lock_table.lock().unwrap();
        table
            .get(&page_id)
            .is_some_and(|requests| requests.iter().any(|r| r.tx_id == tx_id))
    }

    pub fn locked_pages(&self, tx_id: TransactionId) -> Vec<PageId> {
        let table = self.lock_table.lock().unwrap();
        let mut pages: Vec<PageId> = table
            .iter()
            .filter(|(_, requests)| requests.iter().any(|r| r.tx_id == tx_id))
            .map(|(&page_id, _)| page_id)
            .collect();
        pages.sort_unstable();
        pages
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_locks_coexist_and_exclusive_waits_for_release() {
        let lm = LockManager::new();
        let p = 4;

        assert!(lm.acquire_lock(p, LockMode::Shared, 1));
        assert!(lm.acquire_lock(p, LockMode::Shared, 2));
        assert!(!lm.acquire_lock(p, LockMode::Exclusive, 3));

        lm.release_all_locks(1);
        lm.release_all_locks(2);
        assert!(lm.acquire_lock(p, LockMode::Exclusive, 3));
    }

    #[test]
    fn exclusive_blocks_shared() {
        let lm = LockManager::new();
        assert!(lm.acquire_lock(9, LockMode::Exclusive, 1));
        assert!(!lm.acquire_lock(9, LockMode::Shared, 2));
        assert!(!lm.acquire_lock(9, LockMode::Exclusive, 2));
    }

    #[test]
    fn reacquire_by_holder_succeeds() {
        let lm = LockManager::new();
        assert!(lm.acquire_lock(1, LockMode::Exclusive, 7));
        assert!(lm.acquire_lock(1, LockMode::Exclusive, 7));
        assert!(lm.acquire_lock(1, LockMode::Shared, 7));
    }

    #[test]
    fn upgrade_succeeds_only_for_a_sole_holder() {
        let lm = LockManager::new();
        assert!(lm.acquire_lock(2, LockMode::Shared, 1));
        assert!(lm.acquire_lock(2, LockMode::Shared, 2));
        assert!(!lm.acquire_lock(2, LockMode::Exclusive, 1));

        lm.release_lock(2, 2);
        assert!(lm.acquire_lock(2, LockMode::Exclusive, 1));
        assert!(!lm.acquire_lock(2, LockMode::Shared, 2));
    }

    #[test]
    fn denied_requests_leave_nothing_behind() {
        let lm = LockManager::new();
        assert!(lm.acquire_lock(3, LockMode::Exclusive, 1));
        assert!(!lm.acquire_lock(3, LockMode::Shared, 2));

        // tx 2 never held the lock, so releasing tx 1 frees the page fully
        lm.release_all_locks(1);
        assert!(!lm.has_lock(3, 2));
        assert!(lm.acquire_lock(3, LockMode::Exclusive, 3));
    }

    #[test]
    fn release_all_sweeps_every_page() {
        let lm = LockManager::new();
        for p in [1, 2, 3] {
            assert!(lm.acquire_lock(p, LockMode::Shared, 5));
        }
        assert_eq!(lm.locked_pages(5), vec![1, 2, 3]);

        lm.release_all_locks(5);
        assert!(lm.locked_pages(5).is_empty());
        for p in [1, 2, 3] {
            assert!(!lm.has_lock(p, 5));
        }
    }
}
