//! Work Queue and Dispatch Event Stream collaborators.
//!
//! - [`WorkQueue`]: at-least-once per-(region, definition) message queue with
//!   visibility timeouts and delete-by-receipt
//! - [`DispatchStream`]: per-region ordered stream of dispatch events feeding
//!   the fleet sizers
//!
//! In-memory implementations live in [`memory`] and [`stream`].

pub mod memory;
pub mod stream;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

pub use memory::MemoryWorkQueue;
pub use stream::{DispatchEvent, DispatchStream, MemoryDispatchStream};

/// A regional queue serving one job definition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct QueueAddress {
    pub region: String,
    pub definition: String,
}

impl QueueAddress {
    pub fn new(region: impl Into<String>, definition: impl Into<String>) -> Self {
        Self {
            region: region.into(),
            definition: definition.into(),
        }
    }
}

impl std::fmt::Display for QueueAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.region, self.definition)
    }
}

/// A received message. The receipt handle is only valid until the
/// visibility timeout lapses and the message is handed out again.
#[derive(Debug, Clone)]
pub struct QueueMessage {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// How many times this message has been received, this time included.
    pub receive_count: u32,
}

#[async_trait]
pub trait WorkQueue: Send + Sync {
    /// Enqueue a message body; returns the message id.
    async fn send(&self, address: &QueueAddress, body: String) -> Result<String>;

    /// Receive at most one visible message, hiding it for `visibility`.
    /// Waits up to `wait` for a message to appear.
    async fn receive(
        &self,
        address: &QueueAddress,
        visibility: Duration,
        wait: Duration,
    ) -> Result<Option<QueueMessage>>;

    /// Delete a received message. A stale receipt deletes nothing.
    async fn delete(&self, address: &QueueAddress, receipt_handle: &str) -> Result<bool>;

    /// Messages currently stored, visible or in flight.
    async fn approximate_len(&self, address: &QueueAddress) -> Result<usize>;
}
