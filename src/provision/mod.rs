//! Compute Provisioner collaborator.
//!
//! The fleet sizer asks for N identical worker instances under a logical
//! name `<jobDefinition>__H__<jobQueue>`; failures of those instances come
//! back as [`WorkerFailure`] signals carrying the same name.

pub mod local;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::Result;

pub use local::LocalProvisioner;

const NAME_SEPARATOR: &str = "__H__";

pub fn logical_name(definition: &str, queue: &str) -> String {
    format!("{definition}{NAME_SEPARATOR}{queue}")
}

/// Split a logical worker name into `(definition, queue)`.
pub fn parse_logical_name(name: &str) -> Option<(String, String)> {
    let (definition, queue) = name.split_once(NAME_SEPARATOR)?;
    if definition.is_empty() || queue.is_empty() {
        return None;
    }
    Some((definition.to_string(), queue.to_string()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerCount {
    Single,
    /// One array request of this many instances.
    Array(u32),
}

impl WorkerCount {
    pub fn for_workers(workers: u32) -> Option<Self> {
        match workers {
            0 => None,
            1 => Some(WorkerCount::Single),
            n => Some(WorkerCount::Array(n)),
        }
    }

    pub fn instances(&self) -> u32 {
        match self {
            WorkerCount::Single => 1,
            WorkerCount::Array(n) => *n,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProvisionRequest {
    pub job_name: String,
    pub region: String,
    pub job_definition: String,
    pub job_queue: String,
    pub count: WorkerCount,
}

/// A worker instance died outside the dispatch protocol.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerFailure {
    pub job_name: String,
    pub region: String,
    pub reason: String,
}

#[async_trait]
pub trait Provisioner: Send + Sync {
    /// Start the requested instances; returns their ids.
    async fn submit(&self, request: ProvisionRequest) -> Result<Vec<Uuid>>;

    /// Stop one instance. False if it was not running.
    async fn terminate(&self, instance: Uuid) -> Result<bool>;
}
