//! Log/metrics sink for job output, worker telemetry and job status history.
//!
//! Shipping is fire-and-forget: callers use [`ship_or_warn`] and never fail
//! because the sink did.

use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::scheduler::job::{JobRecord, JobStatus};
use crate::store::Change;
use crate::trigger::BatchHandler;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum LogType {
    Stdout,
    Metrics,
    System,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub time_stamp: DateTime<Utc>,
    pub log_type: LogType,
    pub id: String,
    pub job_definition: String,
    pub job_queue: String,
    pub data: serde_json::Value,
}

/// The job (or worker) a record belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LogScope {
    pub id: String,
    pub job_definition: String,
    pub job_queue: String,
}

impl LogScope {
    pub fn new(
        id: impl Into<String>,
        job_definition: impl Into<String>,
        job_queue: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            job_definition: job_definition.into(),
            job_queue: job_queue.into(),
        }
    }

    pub fn record(&self, log_type: LogType, data: serde_json::Value) -> LogRecord {
        LogRecord {
            time_stamp: Utc::now(),
            log_type,
            id: self.id.clone(),
            job_definition: self.job_definition.clone(),
            job_queue: self.job_queue.clone(),
            data,
        }
    }
}

#[async_trait]
pub trait LogSink: Send + Sync {
    async fn ship(&self, records: Vec<LogRecord>) -> Result<()>;
}

pub async fn ship_or_warn<S: LogSink + ?Sized>(sink: &S, records: Vec<LogRecord>) {
    if records.is_empty() {
        return;
    }
    let count = records.len();
    if let Err(e) = sink.ship(records).await {
        tracing::warn!(error = %e, records = count, "Log sink rejected records");
    }
}

/// Writes every record as a structured event under the `cyclone::jobs` target.
#[derive(Debug, Default)]
pub struct TracingLogSink;

#[async_trait]
impl LogSink for TracingLogSink {
    async fn ship(&self, records: Vec<LogRecord>) -> Result<()> {
        for record in records {
            let data = serde_json::to_string(&record.data)?;
            tracing::info!(
                target: "cyclone::jobs",
                log_type = ?record.log_type,
                id = %record.id,
                job_definition = %record.job_definition,
                job_queue = %record.job_queue,
                time_stamp = %record.time_stamp,
                data = %data,
                "Job log record"
            );
        }
        Ok(())
    }
}

/// Keeps records in memory; used by the CLI runner and tests.
#[derive(Debug, Default)]
pub struct MemoryLogSink {
    records: Mutex<Vec<LogRecord>>,
}

impl MemoryLogSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<LogRecord> {
        self.records
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn of_type(&self, log_type: LogType) -> Vec<LogRecord> {
        self.records()
            .into_iter()
            .filter(|r| r.log_type == log_type)
            .collect()
    }
}

#[async_trait]
impl LogSink for MemoryLogSink {
    async fn ship(&self, records: Vec<LogRecord>) -> Result<()> {
        if let Ok(mut stored) = self.records.lock() {
            stored.extend(records);
        }
        Ok(())
    }
}

/// Ships Job Store changes as SYSTEM records, stamped with the time of the
/// transition that produced them.
pub struct StatusLogShipper<S: ?Sized> {
    sink: std::sync::Arc<S>,
}

impl<S: LogSink + ?Sized> StatusLogShipper<S> {
    pub fn new(sink: std::sync::Arc<S>) -> Self {
        Self { sink }
    }
}

/// SYSTEM record for a job image, without its script and output.
pub fn status_record(job: &JobRecord) -> LogRecord {
    let t = &job.timestamps;
    let stamped = match job.status {
        JobStatus::Waiting => t.retried.or(t.created),
        JobStatus::Running => t.running,
        JobStatus::Successful => t.successful,
        JobStatus::Failed => t.failed,
        JobStatus::Error => t.errored,
    };
    LogRecord {
        time_stamp: stamped.unwrap_or_else(Utc::now),
        log_type: LogType::System,
        id: job.id.clone(),
        job_definition: job.job_definition.clone(),
        job_queue: job.job_queue.clone(),
        data: serde_json::json!({
            "jobName": job.job_name,
            "status": job.status,
            "retriesAvailable": job.retries_available,
            "error": job.error,
            "groupId": job.group_id,
        }),
    }
}

#[async_trait]
impl<S: LogSink + ?Sized> BatchHandler<Change<JobRecord>> for StatusLogShipper<S> {
    async fn handle(&self, batch: &[Change<JobRecord>]) -> Result<()> {
        let records = batch
            .iter()
            .filter_map(|change| change.new.as_ref())
            .map(status_record)
            .collect();
        ship_or_warn(self.sink.as_ref(), records).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobSpec;

    #[test]
    fn status_record_hides_script_and_output() {
        let mut job = JobRecord::new(JobSpec::new("q", "d", "echo secret"));
        job.output = "secret".into();
        let record = status_record(&job);
        assert_eq!(record.log_type, LogType::System);
        assert_eq!(Some(record.time_stamp), job.timestamps.created);
        let text = record.data.to_string();
        assert!(!text.contains("secret"));
        assert_eq!(record.data["status"], "Waiting");
    }

    #[tokio::test]
    async fn shipper_forwards_new_images_only() {
        let sink = std::sync::Arc::new(MemoryLogSink::new());
        let shipper = StatusLogShipper::new(sink.clone());
        let job = JobRecord::new(JobSpec::new("q", "d", "true"));
        shipper
            .handle(&[Change::insert(job.clone()), Change::remove(job)])
            .await
            .unwrap();
        assert_eq!(sink.of_type(LogType::System).len(), 1);
    }

    #[tokio::test]
    async fn shipper_accepts_trait_object_sink() {
        let memory = std::sync::Arc::new(MemoryLogSink::new());
        let sink: std::sync::Arc<dyn LogSink> = memory.clone();
        let shipper = StatusLogShipper::new(sink);
        let job = JobRecord::new(JobSpec::new("q", "d", "true"));
        shipper.handle(&[Change::insert(job)]).await.unwrap();
        assert_eq!(memory.of_type(LogType::System).len(), 1);
    }

    #[test]
    fn log_type_serializes_uppercase() {
        let json = serde_json::to_value(LogType::Metrics).unwrap();
        assert_eq!(json, "METRICS");
    }
}
