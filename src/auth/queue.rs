//! Serial operation queue.
//!
//! Every mutating coordinator operation goes through one of these so that
//! operation N+1 only begins after operation N has settled, in submission
//! order. A single consumer task drains an unbounded channel; a failed
//! operation reports its error to its own submitter and the consumer keeps
//! draining, so one failure never breaks the chain for later operations.

use crate::error::AuthError;
use std::future::Future;
use std::pin::Pin;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

type Op = Pin<Box<dyn Future<Output = Result<(), AuthError>> + Send>>;

struct QueuedOp {
    op: Op,
    done: oneshot::Sender<Result<(), AuthError>>,
}

/// FIFO executor for mutating operations.
pub(crate) struct OperationQueue {
    tx: mpsc::UnboundedSender<QueuedOp>,
}

impl OperationQueue {
    /// Create the queue and spawn its consumer task. The task exits when
    /// the queue is dropped.
    pub(crate) fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedOp>();
        tokio::spawn(async move {
            while let Some(queued) = rx.recv().await {
                let result = queued.op.await;
                if let Err(err) = &result {
                    debug!(%err, "queued operation failed");
                }
                // Submitter may have gone away; the chain continues.
                let _ = queued.done.send(result);
            }
        });
        Self { tx }
    }

    /// Append an operation without waiting for it. The send itself is
    /// synchronous, so two `submit` calls from the same task are ordered.
    pub(crate) fn submit<F>(&self, op: F) -> oneshot::Receiver<Result<(), AuthError>>
    where
        F: Future<Output = Result<(), AuthError>> + Send + 'static,
    {
        let (done, done_rx) = oneshot::channel();
        if self
            .tx
            .send(QueuedOp {
                op: Box::pin(op),
                done,
            })
            .is_err()
        {
            debug!("operation queue closed, dropping operation");
        }
        done_rx
    }

    /// Submit an operation and wait for its own result. Never call this
    /// from inside a queued operation; the consumer is single-threaded and
    /// would deadlock.
    pub(crate) async fn enqueue<F>(&self, op: F) -> Result<(), AuthError>
    where
        F: Future<Output = Result<(), AuthError>> + Send + 'static,
    {
        self.submit(op)
            .await
            .map_err(|_| AuthError::internal("queued operation dropped"))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_operations_run_in_submission_order() {
        let queue = OperationQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut receivers = Vec::new();
        for i in 0..32usize {
            let log = Arc::clone(&log);
            receivers.push(queue.submit(async move {
                // Yield to give later operations a chance to overtake if
                // ordering were broken.
                tokio::task::yield_now().await;
                log.lock().unwrap().push(i);
                Ok(())
            }));
        }
        for rx in receivers {
            rx.await.unwrap().unwrap();
        }

        let log = log.lock().unwrap();
        assert_eq!(*log, (0..32).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_failure_does_not_break_the_chain() {
        let queue = OperationQueue::new();
        let ran_after_failure = Arc::new(AtomicUsize::new(0));

        let result = queue
            .enqueue(async { Err(AuthError::internal("boom")) })
            .await;
        assert!(result.is_err());

        let counter = Arc::clone(&ran_after_failure);
        queue
            .enqueue(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(ran_after_failure.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_error_reported_to_submitter_only() {
        let queue = OperationQueue::new();
        let first = queue.enqueue(async { Err(AuthError::UserDisabled) }).await;
        let second = queue.enqueue(async { Ok(()) }).await;
        assert!(matches!(first, Err(AuthError::UserDisabled)));
        assert!(second.is_ok());
    }
}
