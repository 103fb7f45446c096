//! Priority-ordered async mutual exclusion for reservation mutations.
//!
//! Every mutation of the reservation list goes through one
//! [`ExecutionSerializer`]. Waiters are queued by priority (higher first,
//! arrival order among equals) and resumed exactly once when the lock is
//! handed to them; nobody polls.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use log::{trace, warn};
use tokio::sync::oneshot;

/// Priorities used by the reservation store.
pub mod priority {
    /// Periodic full resync.
    pub const UPDATE_ALL: i32 = 0;
    /// Removal of finished reservations.
    pub const CLEAN: i32 = 1;
    /// Resync of a single rule.
    pub const UPDATE_RULE: i32 = 1;
    /// User-driven add/edit/cancel.
    pub const USER: i32 = 2;
}

/// Token identifying one acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExecutionId(u64);

struct Waiter {
    id: ExecutionId,
    priority: i32,
    grant: oneshot::Sender<()>,
}

#[derive(Default)]
struct SerializerState {
    holder: Option<ExecutionId>,
    waiters: VecDeque<Waiter>,
}

impl SerializerState {
    /// Hand the lock to the first waiter still listening.
    fn grant_next(&mut self) {
        self.holder = None;
        while let Some(waiter) = self.waiters.pop_front() {
            self.holder = Some(waiter.id);
            if waiter.grant.send(()).is_ok() {
                trace!("ExecutionSerializer: granted {:?}", waiter.id);
                return;
            }
            // Receiver went away between queueing and grant.
            self.holder = None;
        }
    }
}

/// Priority mutex guarding reservation store mutations.
#[derive(Default)]
pub struct ExecutionSerializer {
    state: Mutex<SerializerState>,
    next_id: AtomicU64,
}

impl ExecutionSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, SerializerState> {
        // A poisoned lock only means a panic elsewhere; the queue itself is
        // always left consistent.
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Wait until the lock is granted at the given priority.
    ///
    /// The returned token must be passed to [`release`](Self::release).
    /// Dropping the future before it completes withdraws the request (or
    /// passes the lock on if it had already been granted).
    pub async fn acquire(&self, priority: i32) -> ExecutionId {
        let id = ExecutionId(self.next_id.fetch_add(1, Ordering::SeqCst));

        let granted = {
            let mut state = self.state();
            if state.holder.is_none() {
                state.holder = Some(id);
                return id;
            }

            let (tx, rx) = oneshot::channel();
            let position = state
                .waiters
                .iter()
                .position(|w| w.priority < priority)
                .unwrap_or(state.waiters.len());
            state.waiters.insert(
                position,
                Waiter {
                    id,
                    priority,
                    grant: tx,
                },
            );
            rx
        };

        let mut pending = PendingAcquire {
            serializer: self,
            id,
            completed: false,
        };
        // The sender is only consumed by a grant; it cannot be dropped while
        // the waiter is queued because `self` outlives this future.
        let _ = granted.await;
        pending.completed = true;
        id
    }

    /// Release the lock held by `id` and wake the next waiter.
    ///
    /// Returns false if `id` is not the current holder.
    pub fn release(&self, id: ExecutionId) -> bool {
        let mut state = self.state();
        if state.holder != Some(id) {
            warn!("ExecutionSerializer: release by non-holder {:?}", id);
            return false;
        }
        state.grant_next();
        true
    }

    /// Acquire and get a guard that releases on drop.
    pub async fn lock(&self, priority: i32) -> ExecutionGuard<'_> {
        let id = self.acquire(priority).await;
        ExecutionGuard {
            serializer: self,
            id,
        }
    }

    /// Whether the lock is currently held.
    pub fn is_locked(&self) -> bool {
        self.state().holder.is_some()
    }

    /// Number of queued waiters.
    pub fn waiting(&self) -> usize {
        self.state().waiters.len()
    }
}

struct PendingAcquire<'a> {
    serializer: &'a ExecutionSerializer,
    id: ExecutionId,
    completed: bool,
}

impl Drop for PendingAcquire<'_> {
    fn drop(&mut self) {
        if self.completed {
            return;
        }
        let mut state = self.serializer.state();
        if state.holder == Some(self.id) {
            state.grant_next();
        } else {
            state.waiters.retain(|w| w.id != self.id);
        }
    }
}

/// RAII guard for the serializer lock.
pub struct ExecutionGuard<'a> {
    serializer: &'a ExecutionSerializer,
    id: ExecutionId,
}

impl ExecutionGuard<'_> {
    pub fn id(&self) -> ExecutionId {
        self.id
    }
}

impl Drop for ExecutionGuard<'_> {
    fn drop(&mut self) {
        self.serializer.release(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    /// Yield until `count` waiters are queued.
    async fn until_waiting(serializer: &ExecutionSerializer, count: usize) {
        while serializer.waiting() != count {
            tokio::task::yield_now().await;
        }
    }

    async fn record_grants(priorities: &[i32]) -> Vec<usize> {
        let serializer = Arc::new(ExecutionSerializer::new());
        let order = Arc::new(Mutex::new(Vec::new()));

        let first = serializer.acquire(100).await;

        let mut handles = Vec::new();
        for (index, &p) in priorities.iter().enumerate() {
            let task_serializer = Arc::clone(&serializer);
            let order = Arc::clone(&order);
            handles.push(tokio::spawn(async move {
                let id = task_serializer.acquire(p).await;
                order.lock().unwrap().push(index);
                task_serializer.release(id);
            }));
            // Queue each task before the next arrives.
            until_waiting(&serializer, index + 1).await;
            assert_eq!(serializer.waiting(), index + 1);
        }

        assert_eq!(serializer.waiting(), priorities.len());
        assert!(serializer.release(first));

        for handle in handles {
            handle.await.unwrap();
        }
        let result = order.lock().unwrap().clone();
        result
    }

    #[tokio::test]
    async fn test_immediate_grant_when_free() {
        let serializer = ExecutionSerializer::new();
        assert!(!serializer.is_locked());
        let id = serializer.acquire(0).await;
        assert!(serializer.is_locked());
        assert!(serializer.release(id));
        assert!(!serializer.is_locked());
    }

    #[tokio::test]
    async fn test_higher_priority_served_first() {
        let order = record_grants(&[1, 5, 3, 9]).await;
        assert_eq!(order, vec![3, 1, 2, 0]);
    }

    #[tokio::test]
    async fn test_equal_priority_is_fifo() {
        let order = record_grants(&[2, 2, 2, 2]).await;
        assert_eq!(order, vec![0, 1, 2, 3]);
    }

    #[tokio::test]
    async fn test_mixed_priority_ties_by_arrival() {
        let order = record_grants(&[1, 2, 1, 2]).await;
        assert_eq!(order, vec![1, 3, 0, 2]);
    }

    #[tokio::test]
    async fn test_release_by_non_holder_is_ignored() {
        let serializer = ExecutionSerializer::new();
        let id = serializer.acquire(0).await;
        assert!(!serializer.release(ExecutionId(9999)));
        assert!(serializer.is_locked());
        assert!(serializer.release(id));
    }

    #[tokio::test]
    async fn test_cancelled_waiter_is_skipped() {
        let serializer = Arc::new(ExecutionSerializer::new());
        let first = serializer.acquire(0).await;

        let cancelled = {
            let serializer = Arc::clone(&serializer);
            tokio::spawn(async move {
                let _ = serializer.acquire(5).await;
            })
        };
        until_waiting(&serializer, 1).await;
        cancelled.abort();
        let _ = cancelled.await;
        assert_eq!(serializer.waiting(), 0);

        let waiter = {
            let serializer = Arc::clone(&serializer);
            tokio::spawn(async move { serializer.lock(1).await.id() })
        };
        until_waiting(&serializer, 1).await;

        serializer.release(first);
        waiter.await.unwrap();
        assert!(!serializer.is_locked());
        assert_eq!(serializer.waiting(), 0);
    }

    #[tokio::test]
    async fn test_guard_releases_on_drop() {
        let serializer = ExecutionSerializer::new();
        {
            let _guard = serializer.lock(priority::USER).await;
            assert!(serializer.is_locked());
        }
        assert!(!serializer.is_locked());
    }
}
