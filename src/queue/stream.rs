use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{CycloneError, Result};
use crate::scheduler::job::JobPayload;

/// A routed job, published to the stream of the region it was routed to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchEvent {
    pub region: String,
    pub job: JobPayload,
}

impl DispatchEvent {
    /// Events are partitioned by job definition within a region.
    pub fn partition_key(&self) -> &str {
        &self.job.job_definition
    }
}

/// Per-region ordered stream of dispatch events.
#[async_trait]
pub trait DispatchStream: Send + Sync {
    async fn publish(&self, event: DispatchEvent) -> Result<()>;

    /// Take the consumer end of a region's stream. Each region has exactly one
    /// consumer (its fleet sizer).
    fn subscribe(&self, region: &str) -> Result<mpsc::UnboundedReceiver<DispatchEvent>>;
}

struct RegionStream {
    tx: mpsc::UnboundedSender<DispatchEvent>,
    rx: Option<mpsc::UnboundedReceiver<DispatchEvent>>,
}

/// In-memory [`DispatchStream`] with one channel per configured region.
pub struct MemoryDispatchStream {
    regions: Mutex<HashMap<String, RegionStream>>,
}

impl MemoryDispatchStream {
    pub fn new<I, S>(regions: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let regions = regions
            .into_iter()
            .map(|region| {
                let (tx, rx) = mpsc::unbounded_channel();
                (region.into(), RegionStream { tx, rx: Some(rx) })
            })
            .collect();
        Self {
            regions: Mutex::new(regions),
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, RegionStream>>> {
        self.regions
            .lock()
            .map_err(|_| CycloneError::StreamUnavailable("dispatch stream lock poisoned".into()))
    }
}

#[async_trait]
impl DispatchStream for MemoryDispatchStream {
    async fn publish(&self, event: DispatchEvent) -> Result<()> {
        let regions = self.lock()?;
        let stream = regions
            .get(&event.region)
            .ok_or_else(|| CycloneError::UnknownRegion(event.region.clone()))?;
        let region = event.region.clone();
        stream
            .tx
            .send(event)
            .map_err(|_| CycloneError::StreamUnavailable(format!("no consumer left in {region}")))
    }

    fn subscribe(&self, region: &str) -> Result<mpsc::UnboundedReceiver<DispatchEvent>> {
        let mut regions = self.lock()?;
        let stream = regions
            .get_mut(region)
            .ok_or_else(|| CycloneError::UnknownRegion(region.to_string()))?;
        stream.rx.take().ok_or_else(|| {
            CycloneError::StreamUnavailable(format!("stream of {region} already has a consumer"))
        })
    }
}
