//! Batched consumption of change feeds and dispatch streams.
//!
//! A [`BatchTrigger`] groups records by a time window and a size cap, hands
//! each batch to a [`BatchHandler`] and redelivers the whole batch when the
//! handler fails with a transient error.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tokio_stream::StreamExt;
use tokio_util::sync::CancellationToken;

use crate::config::TimingConfig;
use crate::error::Result;
use crate::retry::RetryPolicy;

#[async_trait]
pub trait BatchHandler<T: Send + Sync>: Send + Sync {
    async fn handle(&self, batch: &[T]) -> Result<()>;
}

#[derive(Debug, Clone)]
pub struct BatchTrigger {
    name: String,
    window: Duration,
    max_records: usize,
    retry: RetryPolicy,
}

impl BatchTrigger {
    pub fn new(name: impl Into<String>, window: Duration, max_records: usize, retry: RetryPolicy) -> Self {
        Self {
            name: name.into(),
            window,
            max_records: max_records.max(1),
            retry,
        }
    }

    pub fn from_timing(name: impl Into<String>, timing: &TimingConfig, retry: RetryPolicy) -> Self {
        Self::new(name, timing.batch_window(), timing.batch_max_records, retry)
    }

    /// Consume `rx` until it closes or `shutdown` fires. Returns the number
    /// of batches that were given up on.
    pub async fn run<T, H>(&self, rx: mpsc::UnboundedReceiver<T>, handler: &H, shutdown: CancellationToken) -> usize
    where
        T: Send + Sync + 'static,
        H: BatchHandler<T> + ?Sized,
    {
        let batches = UnboundedReceiverStream::new(rx).chunks_timeout(self.max_records, self.window);
        tokio::pin!(batches);
        let mut abandoned = 0;

        loop {
            let batch = tokio::select! {
                _ = shutdown.cancelled() => break,
                batch = batches.next() => match batch {
                    Some(batch) => batch,
                    None => break,
                },
            };

            let records = batch.as_slice();
            let result = self
                .retry
                .run(&self.name, move || handler.handle(records))
                .await;
            if let Err(e) = result {
                abandoned += 1;
                tracing::error!(
                    trigger = %self.name,
                    records = records.len(),
                    error = %e,
                    "Batch abandoned"
                );
            }
        }

        tracing::info!(trigger = %self.name, "Trigger stopped");
        abandoned
    }
}
