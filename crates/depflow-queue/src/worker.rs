use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::processor::{ProcessOutcome, QueueProcessor};

/// Background consumer of the queue.
///
/// Wakes on every append and at least once per poll interval. Entries run on
/// the blocking pool since propagation is synchronous.
pub struct QueueWorker {
    id: Uuid,
    processor: Arc<QueueProcessor>,
    notify: Arc<Notify>,
    poll_interval: Duration,
    batch_size: usize,
    cancel: CancellationToken,
}

impl QueueWorker {
    pub fn new(processor: Arc<QueueProcessor>) -> Self {
        let config = processor.config();
        Self {
            id: Uuid::new_v4(),
            notify: processor.log().notifier(),
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            batch_size: config.batch_size.max(1),
            cancel: CancellationToken::new(),
            processor,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Cancelling the token stops the worker after the entry in flight.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        info!(worker = %self.id, "Queue worker started");
        while !self.cancel.is_cancelled() {
            self.run_batch().await;
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }
        info!(worker = %self.id, "Queue worker stopped");
    }

    async fn run_batch(&self) {
        for _ in 0..self.batch_size {
            if self.cancel.is_cancelled() {
                return;
            }
            let processor = self.processor.clone();
            match tokio::task::spawn_blocking(move || processor.process_next()).await {
                Ok(Ok(ProcessOutcome::Idle)) => return,
                Ok(Ok(ProcessOutcome::Blocked(id))) => {
                    debug!(worker = %self.id, blocker = id, "Waiting for blocker release");
                    return;
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(worker = %self.id, error = %e.chain(), "Queue access failed");
                    return;
                }
                Err(e) => {
                    error!(worker = %self.id, error = %e, "Queue entry task panicked");
                    return;
                }
            }
        }
    }
}
