//! Mailbox Store: one durable row per live worker instance.
//!
//! The control loop writes a job onto the slot, the worker agent writes
//! progress and results back, and the reconciler follows the slot change
//! feed to relay job status into the Job Store.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CycloneError, Result};
use crate::scheduler::job::JobPayload;
use crate::store::{ChangeFeed, MemoryTable, Versioned, WriteConflict};
use crate::workflow::token::TaskToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SlotStatus {
    Starting,
    Running,
    Successful,
    Failed,
}

impl SlotStatus {
    /// The slot's job has finished, one way or the other.
    pub fn is_finished(&self) -> bool {
        matches!(self, SlotStatus::Successful | SlotStatus::Failed)
    }
}

impl std::fmt::Display for SlotStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SlotStatus::Starting => write!(f, "starting"),
            SlotStatus::Running => write!(f, "running"),
            SlotStatus::Successful => write!(f, "successful"),
            SlotStatus::Failed => write!(f, "failed"),
        }
    }
}

/// Static facts about the instance behind a slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InstanceInfo {
    pub hostname: String,
    pub cpu_count: usize,
    pub mem_total_mb: u64,
    pub region: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerSlot {
    pub uuid: Uuid,
    /// Script of the job currently handed to the worker; `None` while idle.
    pub command: Option<String>,
    pub job_id: Option<String>,
    pub job_queue: Option<String>,
    pub job_definition: Option<String>,
    /// `false` tells the worker to shut down.
    pub leave_running: bool,
    pub callback: Option<TaskToken>,
    pub status: Option<SlotStatus>,
    pub output: String,
    pub current_time: Option<DateTime<Utc>>,
    pub instance: InstanceInfo,
    #[serde(default)]
    pub version: u64,
}

impl Versioned for WorkerSlot {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl WorkerSlot {
    pub fn new(uuid: Uuid, instance: InstanceInfo) -> Self {
        Self {
            uuid,
            command: None,
            job_id: None,
            job_queue: None,
            job_definition: None,
            leave_running: true,
            callback: None,
            status: None,
            output: String::new(),
            current_time: Some(Utc::now()),
            instance,
            version: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.command.is_none()
    }

    /// A job was handed over and has not finished yet.
    pub fn has_job_in_flight(&self) -> bool {
        self.job_id.is_some() && matches!(self.status, Some(SlotStatus::Starting | SlotStatus::Running))
    }

    /// Hand a job to the slot under a fresh continuation token.
    pub fn assign(&mut self, job: &JobPayload, callback: TaskToken, at: DateTime<Utc>) {
        self.command = Some(job.commands.clone());
        self.job_id = Some(job.id.clone());
        self.job_queue = Some(job.job_queue.clone());
        self.job_definition = Some(job.job_definition.clone());
        self.callback = Some(callback);
        self.status = Some(SlotStatus::Starting);
        self.leave_running = true;
        self.output.clear();
        self.current_time = Some(at);
    }

    pub fn record(&mut self, status: SlotStatus, output: impl Into<String>, at: DateTime<Utc>) {
        self.status = Some(status);
        self.output = output.into();
        self.current_time = Some(at);
    }
}

#[async_trait]
pub trait MailboxStore: Send + Sync {
    async fn create(&self, slot: WorkerSlot) -> Result<WorkerSlot>;
    async fn get(&self, uuid: Uuid) -> Result<Option<WorkerSlot>>;
    async fn put(&self, slot: WorkerSlot) -> Result<WorkerSlot>;
    /// Write only if the stored slot still has `slot.version`.
    async fn put_if(&self, slot: WorkerSlot) -> Result<WorkerSlot>;
    async fn delete(&self, uuid: Uuid) -> Result<Option<WorkerSlot>>;
    async fn list(&self) -> Result<Vec<WorkerSlot>>;
    fn subscribe(&self) -> ChangeFeed<WorkerSlot>;
}

/// Switch `leave_running` off on every live slot, or on the slots serving
/// `definition`. Returns how many slots were switched.
pub async fn drain_slots(mailbox: &dyn MailboxStore, definition: Option<&str>) -> Result<usize> {
    let mut drained = 0;
    for mut slot in mailbox.list().await? {
        if !slot.leave_running {
            continue;
        }
        if definition.is_some_and(|d| slot.job_definition.as_deref() != Some(d)) {
            continue;
        }
        slot.leave_running = false;
        match mailbox.put_if(slot).await {
            Ok(slot) => {
                tracing::info!(slot = %slot.uuid, "Worker drain requested");
                drained += 1;
            }
            // Slot changed or vanished underneath
            Err(CycloneError::ConditionFailed(_) | CycloneError::SlotNotFound(_)) => {}
            Err(e) => return Err(e),
        }
    }
    Ok(drained)
}

#[derive(Default)]
pub struct MemoryMailbox {
    table: MemoryTable<Uuid, WorkerSlot>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn conflict(uuid: Uuid, conflict: WriteConflict) -> CycloneError {
        match conflict {
            WriteConflict::Missing => CycloneError::SlotNotFound(uuid),
            WriteConflict::Stale => CycloneError::ConditionFailed(format!("worker slot {uuid}")),
            WriteConflict::Exists => {
                CycloneError::Internal(format!("worker slot {uuid} already exists"))
            }
        }
    }
}

#[async_trait]
impl MailboxStore for MemoryMailbox {
    async fn create(&self, slot: WorkerSlot) -> Result<WorkerSlot> {
        let uuid = slot.uuid;
        self.table
            .insert(uuid, slot)
            .map_err(|c| Self::conflict(uuid, c))
    }

    async fn get(&self, uuid: Uuid) -> Result<Option<WorkerSlot>> {
        Ok(self.table.get(&uuid))
    }

    async fn put(&self, slot: WorkerSlot) -> Result<WorkerSlot> {
        Ok(self.table.put(slot.uuid, slot))
    }

    async fn put_if(&self, slot: WorkerSlot) -> Result<WorkerSlot> {
        let uuid = slot.uuid;
        self.table
            .put_if(uuid, slot)
            .map_err(|c| Self::conflict(uuid, c))
    }

    async fn delete(&self, uuid: Uuid) -> Result<Option<WorkerSlot>> {
        Ok(self.table.remove(&uuid))
    }

    async fn list(&self) -> Result<Vec<WorkerSlot>> {
        Ok(self
            .table
            .scan(.., |_, _| true)
            .into_iter()
            .map(|(_, slot)| slot)
            .collect())
    }

    fn subscribe(&self) -> ChangeFeed<WorkerSlot> {
        self.table.subscribe()
    }
}
