//! In-process execution queue.
//!
//! The query surface enqueues [`ExecutionRequest`]s; one consumer task runs
//! them through the [`Executor`]. A full queue pushes back on the caller
//! instead of buffering without bound. Requests lost on shutdown are picked
//! up by the executor's polling pass.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use feegate_core::collaborators::{ExecutionQueue, ExecutionRequest, QueueError};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, info, warn};

use crate::executor::{ExecutionOutcome, Executor};
use crate::state::ShutdownSignal;

/// Creates a bounded queue and its consumer end.
#[must_use]
pub fn channel(capacity: usize) -> (ChannelExecutionQueue, mpsc::Receiver<ExecutionRequest>) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelExecutionQueue { tx }, rx)
}

/// [`ExecutionQueue`] over a tokio `mpsc` channel.
#[derive(Debug, Clone)]
pub struct ChannelExecutionQueue {
    tx: mpsc::Sender<ExecutionRequest>,
}

#[async_trait]
impl ExecutionQueue for ChannelExecutionQueue {
    async fn enqueue(&self, request: ExecutionRequest) -> Result<(), QueueError> {
        self.tx.try_send(request).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

/// Runs queued execution requests one at a time.
pub struct ExecutionConsumer {
    rx: mpsc::Receiver<ExecutionRequest>,
    executor: Arc<Executor>,
    execution_timeout: Duration,
}

impl ExecutionConsumer {
    /// Creates a consumer; each execution is bounded by the executor's
    /// `execution_timeout`.
    #[must_use]
    pub fn new(rx: mpsc::Receiver<ExecutionRequest>, executor: Arc<Executor>) -> Self {
        let execution_timeout = executor.settings().execution_timeout;
        Self {
            rx,
            executor,
            execution_timeout,
        }
    }

    /// Consumes requests until shutdown or until every sender is dropped.
    pub async fn run(mut self, mut shutdown: ShutdownSignal) {
        info!("execution consumer starting");
        loop {
            let request = tokio::select! {
                biased;
                () = shutdown.requested() => break,
                request = self.rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
            };
            self.handle(request).await;
        }
        info!("execution consumer stopped");
    }

    async fn handle(&self, request: ExecutionRequest) {
        let fee_id = request.fee_id;
        debug!(
            fee_id = %fee_id,
            requested_at = %request.requested_at,
            "execution request received"
        );

        match tokio::time::timeout(self.execution_timeout, self.executor.execute(fee_id)).await {
            Ok(Ok(ExecutionOutcome::Submitted { tx_reference })) => {
                info!(fee_id = %fee_id, tx_reference = %tx_reference, "queued execution submitted");
            },
            Ok(Ok(ExecutionOutcome::Adopted { tx_reference })) => {
                info!(fee_id = %fee_id, tx_reference = %tx_reference, "queued execution adopted");
            },
            Ok(Ok(ExecutionOutcome::Failed { reason })) => {
                warn!(fee_id = %fee_id, reason = %reason, "queued execution failed");
            },
            // Duplicate delivery of a request that already ran.
            Ok(Err(err)) if err.is_conflict() => {
                debug!(fee_id = %fee_id, error = %err, "queued execution skipped");
            },
            Ok(Err(err)) => {
                warn!(
                    fee_id = %fee_id,
                    error = %err,
                    retryable = err.is_retryable(),
                    "queued execution did not complete"
                );
            },
            Err(_) => {
                warn!(fee_id = %fee_id, "queued execution timed out");
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use feegate_core::FeeId;

    use super::*;

    fn request() -> ExecutionRequest {
        ExecutionRequest {
            fee_id: FeeId::new(),
            requested_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_enqueue_applies_backpressure() {
        let (queue, mut rx) = channel(1);
        let first = request();
        queue.enqueue(first.clone()).await.unwrap();
        assert_eq!(queue.enqueue(request()).await, Err(QueueError::Full));

        assert_eq!(rx.recv().await, Some(first));
        queue.enqueue(request()).await.unwrap();
    }

    #[tokio::test]
    async fn test_enqueue_after_consumer_dropped() {
        let (queue, rx) = channel(4);
        drop(rx);
        assert_eq!(queue.enqueue(request()).await, Err(QueueError::Closed));
    }
}
