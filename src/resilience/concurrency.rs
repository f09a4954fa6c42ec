//! Bounded concurrency for outbound calls.
//!
//! At most `max_concurrent` permits are out at any time. Callers beyond that
//! wait in a FIFO queue of one-shot channels; whenever a permit is dropped the
//! queue is drained under the same mutex, so two completions racing each other
//! can never hand out more permits than there is capacity for.

use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::oneshot;

use crate::error::ApiError;

/// Configuration for the request queue.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConcurrencyConfig {
    /// Maximum number of upstream calls in flight at once.
    pub max_concurrent: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self { max_concurrent: 6 }
    }
}

impl ConcurrencyConfig {
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }
}

/// Snapshot of the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ConcurrencyStats {
    pub active: usize,
    pub queued: usize,
    pub max: usize,
}

#[derive(Debug, Default)]
struct QueueState {
    active: usize,
    waiters: VecDeque<oneshot::Sender<ConcurrencyPermit>>,
}

#[derive(Debug)]
struct Shared {
    max: usize,
    state: Mutex<QueueState>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn release(self: &Arc<Self>) {
        let mut state = self.lock();
        state.active = state.active.saturating_sub(1);
        self.drain(&mut state);
    }

    /// Hand freed capacity to queued callers, oldest first.
    fn drain(self: &Arc<Self>, state: &mut QueueState) {
        while state.active < self.max {
            let Some(waiter) = state.waiters.pop_front() else {
                break;
            };
            state.active += 1;
            let permit = ConcurrencyPermit {
                shared: Some(Arc::clone(self)),
            };
            if let Err(mut unclaimed) = waiter.send(permit) {
                // The caller gave up while queued.
                unclaimed.shared = None;
                state.active -= 1;
            }
        }
    }
}

/// Slot for one in-flight call. Dropping it frees the slot and starts the
/// next queued call, whatever the outcome of the call was.
#[derive(Debug)]
pub struct ConcurrencyPermit {
    shared: Option<Arc<Shared>>,
}

impl Drop for ConcurrencyPermit {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.release();
        }
    }
}

/// Request queue bounding simultaneous upstream calls.
#[derive(Debug, Clone)]
pub struct ConcurrencyLimiter {
    shared: Arc<Shared>,
}

impl ConcurrencyLimiter {
    pub fn new(config: ConcurrencyConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                max: config.max_concurrent.max(1),
                state: Mutex::new(QueueState::default()),
            }),
        }
    }

    /// Wait for a slot. Resolves immediately while capacity is free, otherwise
    /// joins the back of the queue.
    ///
    /// Fails with [`ApiError::QueueReset`] if [`reset`](Self::reset) runs
    /// while the caller is still queued.
    pub async fn admit(&self) -> Result<ConcurrencyPermit, ApiError> {
        let waiter = {
            let mut state = self.shared.lock();
            if state.active < self.shared.max && state.waiters.is_empty() {
                state.active += 1;
                return Ok(ConcurrencyPermit {
                    shared: Some(Arc::clone(&self.shared)),
                });
            }

            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            tracing::debug!(
                active = state.active,
                queued = state.waiters.len(),
                max = self.shared.max,
                "concurrency limit reached, request queued"
            );
            rx
        };

        waiter.await.map_err(|_| ApiError::QueueReset)
    }

    /// Run `task` once a slot is free, releasing the slot when it finishes.
    pub async fn run<T, F, Fut>(&self, task: F) -> Result<T, ApiError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, ApiError>>,
    {
        let _permit = self.admit().await?;
        task().await
    }

    pub fn stats(&self) -> ConcurrencyStats {
        let state = self.shared.lock();
        ConcurrencyStats {
            active: state.active,
            queued: state.waiters.iter().filter(|tx| !tx.is_closed()).count(),
            max: self.shared.max,
        }
    }

    /// Drop every queued caller. In-flight calls keep their permits.
    pub fn reset(&self) {
        let dropped = {
            let mut state = self.shared.lock();
            std::mem::take(&mut state.waiters)
        };
        if !dropped.is_empty() {
            tracing::info!(dropped = dropped.len(), "request queue reset");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn limiter(max: usize) -> ConcurrencyLimiter {
        ConcurrencyLimiter::new(ConcurrencyConfig::default().with_max_concurrent(max))
    }

    #[tokio::test]
    async fn admits_up_to_capacity() {
        let limiter = limiter(2);
        let a = limiter.admit().await.unwrap();
        let _b = limiter.admit().await.unwrap();
        assert_eq!(
            limiter.stats(),
            ConcurrencyStats {
                active: 2,
                queued: 0,
                max: 2
            }
        );

        drop(a);
        assert_eq!(limiter.stats().active, 1);
    }

    #[tokio::test]
    async fn queued_callers_are_served_in_order() {
        let limiter = limiter(1);
        let first = limiter.admit().await.unwrap();

        let (order_tx, mut order_rx) = tokio::sync::mpsc::unbounded_channel();
        let mut handles = Vec::new();
        for id in 0..3 {
            let task_limiter = limiter.clone();
            let order_tx = order_tx.clone();
            handles.push(tokio::spawn(async move {
                let _permit = task_limiter.admit().await.unwrap();
                order_tx.send(id).unwrap();
            }));
            // Let the task reach the queue before spawning the next one.
            while limiter.stats().queued < id + 1 {
                tokio::task::yield_now().await;
            }
        }

        assert_eq!(limiter.stats().queued, 3);
        drop(first);
        for handle in handles {
            handle.await.unwrap();
        }

        let mut order = Vec::new();
        while let Ok(id) = order_rx.try_recv() {
            order.push(id);
        }
        assert_eq!(order, vec![0, 1, 2]);
        assert_eq!(limiter.stats().active, 0);
    }

    #[tokio::test]
    async fn abandoned_waiter_does_not_leak_capacity() {
        let limiter = limiter(1);
        let held = limiter.admit().await.unwrap();

        let abandoned =
            tokio::time::timeout(Duration::from_millis(10), limiter.admit()).await;
        assert!(abandoned.is_err());

        drop(held);
        assert_eq!(limiter.stats().active, 0);
        let _again = limiter.admit().await.unwrap();
        assert_eq!(limiter.stats().active, 1);
    }

    #[tokio::test]
    async fn reset_fails_queued_callers() {
        let limiter = limiter(1);
        let _held = limiter.admit().await.unwrap();

        let waiting = {
            let limiter = limiter.clone();
            tokio::spawn(async move { limiter.admit().await.map(|_| ()) })
        };
        while limiter.stats().queued == 0 {
            tokio::task::yield_now().await;
        }

        limiter.reset();
        let result = waiting.await.unwrap();
        assert!(matches!(result, Err(ApiError::QueueReset)));
        assert_eq!(limiter.stats().queued, 0);
    }

    #[tokio::test]
    async fn run_releases_slot_on_error() {
        let limiter = limiter(1);
        let result: Result<(), ApiError> = limiter
            .run(|| async { Err(ApiError::Validation("nope".into())) })
            .await;
        assert!(result.is_err());
        assert_eq!(limiter.stats().active, 0);
    }
}
