use std::collections::{HashMap, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use uuid::Uuid;

use super::{QueueAddress, QueueMessage, WorkQueue};
use crate::error::Result;

#[derive(Debug)]
struct Entry {
    message_id: String,
    body: String,
    invisible_until: Option<Instant>,
    receipt_handle: Option<String>,
    receive_count: u32,
}

impl Entry {
    fn is_visible(&self, now: Instant) -> bool {
        self.invisible_until.map_or(true, |until| until <= now)
    }
}

/// In-memory [`WorkQueue`].
///
/// Delivery is at-least-once: a message that is received but not deleted
/// before its visibility timeout runs out is handed out again with a new
/// receipt handle.
#[derive(Debug, Default)]
pub struct MemoryWorkQueue {
    queues: Mutex<HashMap<QueueAddress, VecDeque<Entry>>>,
    arrivals: Notify,
}

impl MemoryWorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    async fn try_receive(
        &self,
        address: &QueueAddress,
        visibility: Duration,
    ) -> Option<QueueMessage> {
        let mut queues = self.queues.lock().await;
        let queue = queues.get_mut(address)?;
        let now = Instant::now();
        let entry = queue.iter_mut().find(|e| e.is_visible(now))?;

        let receipt = Uuid::new_v4().to_string();
        entry.invisible_until = Some(now + visibility);
        entry.receipt_handle = Some(receipt.clone());
        entry.receive_count += 1;

        Some(QueueMessage {
            message_id: entry.message_id.clone(),
            receipt_handle: receipt,
            body: entry.body.clone(),
            receive_count: entry.receive_count,
        })
    }
}

#[async_trait]
impl WorkQueue for MemoryWorkQueue {
    async fn send(&self, address: &QueueAddress, body: String) -> Result<String> {
        let message_id = Uuid::new_v4().to_string();
        self.queues
            .lock()
            .await
            .entry(address.clone())
            .or_default()
            .push_back(Entry {
                message_id: message_id.clone(),
                body,
                invisible_until: None,
                receipt_handle: None,
                receive_count: 0,
            });
        self.arrivals.notify_waiters();
        tracing::debug!(queue = %address, message_id = %message_id, "Message enqueued");
        Ok(message_id)
    }

    async fn receive(
        &self,
        address: &QueueAddress,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<QueueMessage>> {
        let deadline = Instant::now() + wait;
        loop {
            let arrival = self.arrivals.notified();
            if let Some(message) = self.try_receive(address, visibility).await {
                return Ok(Some(message));
            }
            if Instant::now() >= deadline {
                return Ok(None);
            }
            // Wake on new messages, or periodically so expiring visibility
            // timeouts are noticed.
            let nap = deadline
                .saturating_duration_since(Instant::now())
                .min(Duration::from_millis(50));
            let _ = tokio::time::timeout(nap, arrival).await;
        }
    }

    async fn delete(&self, address: &QueueAddress, receipt_handle: &str) -> Result<bool> {
        let mut queues = self.queues.lock().await;
        let Some(queue) = queues.get_mut(address) else {
            return Ok(false);
        };
        let before = queue.len();
        queue.retain(|e| e.receipt_handle.as_deref() != Some(receipt_handle));
        let deleted = queue.len() < before;
        if !deleted {
            tracing::warn!(queue = %address, "Delete with stale receipt handle ignored");
        }
        Ok(deleted)
    }

    async fn approximate_len(&self, address: &QueueAddress) -> Result<usize> {
        Ok(self
            .queues
            .lock()
            .await
            .get(address)
            .map_or(0, VecDeque::len))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr() -> QueueAddress {
        QueueAddress::new("us-east-1", "render")
    }

    #[tokio::test(start_paused = true)]
    async fn received_message_is_hidden_until_timeout() {
        let queue = MemoryWorkQueue::new();
        queue.send(&addr(), "{}".into()).await.unwrap();

        let first = queue
            .receive(&addr(), Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(first.receive_count, 1);
        let hidden = queue
            .receive(&addr(), Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap();
        assert!(hidden.is_none());

        tokio::time::advance(Duration::from_secs(6)).await;
        let again = queue
            .receive(&addr(), Duration::from_secs(5), Duration::ZERO)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(again.message_id, first.message_id);
        assert_eq!(again.receive_count, 2);

        // the first receipt went stale with the redelivery
        assert!(!queue.delete(&addr(), &first.receipt_handle).await.unwrap());
        assert!(queue.delete(&addr(), &again.receipt_handle).await.unwrap());
        assert_eq!(queue.approximate_len(&addr()).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn receive_waits_for_arrival() {
        let queue = std::sync::Arc::new(MemoryWorkQueue::new());
        let sender = queue.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            sender.send(&addr(), "late".into()).await.unwrap();
        });

        let msg = queue
            .receive(&addr(), Duration::from_secs(5), Duration::from_secs(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(msg.body, "late");
    }

    #[tokio::test]
    async fn queues_are_keyed_by_region_and_definition() {
        let queue = MemoryWorkQueue::new();
        queue.send(&addr(), "x".into()).await.unwrap();
        let other = QueueAddress::new("eu-west-1", "render");
        assert!(queue
            .receive(&other, Duration::from_secs(1), Duration::ZERO)
            .await
            .unwrap()
            .is_none());
    }
}
