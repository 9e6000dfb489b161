//! Per-watch work queue.
//!
//! Requests are deduplicated while they wait, and a request is never handed out while an equal
//! one is still being processed: a change that arrives mid-reconcile is held and released when
//! the running invocation finishes. Failed requests come back after a Fibonacci backoff that
//! resets on success.

use crate::backoff::FibonacciBackoff;
use crate::engine::ReconcileRequest;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

#[derive(Debug, Default)]
struct QueueState {
    /// Waiting to be processed
    queued: HashSet<ReconcileRequest>,
    /// Being processed
    active: HashSet<ReconcileRequest>,
    /// Consecutive failures per request
    failures: HashMap<ReconcileRequest, u32>,
}

/// Work queue feeding one watch loop.
#[derive(Debug)]
pub struct WorkQueue {
    tx: mpsc::UnboundedSender<ReconcileRequest>,
    state: Mutex<QueueState>,
    backoff: FibonacciBackoff,
}

impl WorkQueue {
    /// Creates a queue and the receiver its ready requests are delivered on.
    pub fn new(backoff: FibonacciBackoff) -> (Arc<Self>, mpsc::UnboundedReceiver<ReconcileRequest>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let queue = Self {
            tx,
            state: Mutex::new(QueueState::default()),
            backoff,
        };
        (Arc::new(queue), rx)
    }

    /// Enqueues `request` unless an equal request is already waiting.
    pub fn add(&self, request: ReconcileRequest) {
        let mut state = self.state.lock();
        if state.queued.contains(&request) {
            return;
        }
        state.queued.insert(request.clone());
        if !state.active.contains(&request) {
            // Only fails once the receiver is gone, i.e. the loop has stopped
            let _ = self.tx.send(request);
        }
    }

    /// Marks a request taken from the receiver as being processed.
    pub fn start(&self, request: &ReconcileRequest) {
        let mut state = self.state.lock();
        state.queued.remove(request);
        state.active.insert(request.clone());
    }

    /// Marks processing of `request` as finished, releasing an equal request held meanwhile.
    pub fn done(&self, request: &ReconcileRequest) {
        let mut state = self.state.lock();
        state.active.remove(request);
        if state.queued.contains(request) {
            let _ = self.tx.send(request.clone());
        }
    }

    /// Clears the failure history of `request`.
    pub fn forget(&self, request: &ReconcileRequest) {
        self.state.lock().failures.remove(request);
    }

    /// Consecutive failures recorded for `request`.
    pub fn failures(&self, request: &ReconcileRequest) -> u32 {
        self.state.lock().failures.get(request).copied().unwrap_or(0)
    }

    /// Records a failure and re-adds `request` once its backoff elapses. Returns the delay.
    pub fn requeue_after_failure(self: &Arc<Self>, request: &ReconcileRequest) -> Duration {
        let delay = {
            let mut state = self.state.lock();
            let failures = state.failures.entry(request.clone()).or_insert(0);
            *failures = failures.saturating_add(1);
            self.backoff.delay(*failures)
        };

        let queue = Arc::clone(self);
        let request = request.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(request);
        });
        delay
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(name: &str) -> ReconcileRequest {
        ReconcileRequest::new("default", name)
    }

    #[tokio::test]
    async fn test_waiting_requests_are_coalesced() {
        let (queue, mut rx) = WorkQueue::new(FibonacciBackoff::default());

        queue.add(request("job-1"));
        queue.add(request("job-1"));
        queue.add(request("job-2"));

        assert_eq!(rx.recv().await, Some(request("job-1")));
        assert_eq!(rx.recv().await, Some(request("job-2")));
        assert!(rx.try_recv().is_err(), "the duplicate was coalesced");
    }

    #[tokio::test]
    async fn test_active_request_is_held_until_done() {
        let (queue, mut rx) = WorkQueue::new(FibonacciBackoff::default());

        queue.add(request("job-1"));
        let taken = rx.recv().await.expect("request");
        queue.start(&taken);

        // A change arriving mid-reconcile waits for the running invocation
        queue.add(request("job-1"));
        queue.add(request("job-1"));
        assert!(rx.try_recv().is_err());

        queue.done(&taken);
        assert_eq!(rx.recv().await, Some(request("job-1")));
        assert!(rx.try_recv().is_err(), "released exactly once");
    }

    #[tokio::test]
    async fn test_done_without_new_changes_releases_nothing() {
        let (queue, mut rx) = WorkQueue::new(FibonacciBackoff::default());

        queue.add(request("job-1"));
        let taken = rx.recv().await.expect("request");
        queue.start(&taken);
        queue.done(&taken);

        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_failed_request_comes_back() {
        let (queue, mut rx) = WorkQueue::new(FibonacciBackoff::new(0, 0));

        queue.add(request("job-1"));
        let taken = rx.recv().await.expect("request");
        queue.start(&taken);
        let delay = queue.requeue_after_failure(&taken);
        queue.done(&taken);

        assert_eq!(delay, Duration::ZERO);
        let retried = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("request should be requeued");
        assert_eq!(retried, Some(request("job-1")));
        assert_eq!(queue.failures(&taken), 1);
    }

    #[tokio::test]
    async fn test_backoff_grows_and_resets_on_success() {
        let (queue, _rx) = WorkQueue::new(FibonacciBackoff::new(1, 300));
        let job = request("job-1");

        assert_eq!(queue.requeue_after_failure(&job), Duration::from_secs(1));
        assert_eq!(queue.requeue_after_failure(&job), Duration::from_secs(2));
        assert_eq!(queue.requeue_after_failure(&job), Duration::from_secs(3));
        assert_eq!(queue.requeue_after_failure(&job), Duration::from_secs(5));
        assert_eq!(queue.failures(&job), 4);

        queue.forget(&job);
        assert_eq!(queue.failures(&job), 0);
        assert_eq!(queue.requeue_after_failure(&job), Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_failures_are_tracked_per_request() {
        let (queue, _rx) = WorkQueue::new(FibonacciBackoff::new(1, 300));

        queue.requeue_after_failure(&request("job-1"));
        queue.requeue_after_failure(&request("job-1"));

        assert_eq!(queue.failures(&request("job-1")), 2);
        assert_eq!(queue.failures(&request("job-2")), 0);
        assert_eq!(queue.requeue_after_failure(&request("job-2")), Duration::from_secs(1));
    }
}
