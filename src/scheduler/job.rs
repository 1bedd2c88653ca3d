use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::store::Versioned;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Waiting,
    Running,
    Successful,
    Failed,
    Error,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Waiting => write!(f, "waiting"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Successful => write!(f, "successful"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Error => write!(f, "error"),
        }
    }
}

impl std::str::FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(JobStatus::Waiting),
            "running" => Ok(JobStatus::Running),
            "successful" => Ok(JobStatus::Successful),
            "failed" => Ok(JobStatus::Failed),
            "error" => Ok(JobStatus::Error),
            other => Err(format!("unknown job status: {other}")),
        }
    }
}

/// Per-transition timestamps of a job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobTimestamps {
    pub created: Option<DateTime<Utc>>,
    pub running: Option<DateTime<Utc>>,
    pub successful: Option<DateTime<Utc>>,
    pub failed: Option<DateTime<Utc>>,
    pub retried: Option<DateTime<Utc>>,
    pub errored: Option<DateTime<Utc>>,
}

/// A submitted job as held in the Job Store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRecord {
    pub id: String,
    pub job_name: String,
    pub job_queue: String,
    pub job_definition: String,
    pub commands: String,
    pub status: JobStatus,
    pub retries_available: u32,
    /// Tail of the job output, at most the configured number of lines.
    pub output: String,
    /// Annotation left by the router, sizer or reconciler; does not by itself
    /// change `status`.
    pub error: Option<String>,
    /// Shared by every member of an array submission.
    pub group_id: Option<String>,
    pub timestamps: JobTimestamps,
    #[serde(default)]
    pub version: u64,
}

impl Versioned for JobRecord {
    fn version(&self) -> u64 {
        self.version
    }

    fn set_version(&mut self, version: u64) {
        self.version = version;
    }
}

impl JobRecord {
    /// A freshly submitted job: `Waiting`, stamped now, named after its id
    /// when no name was given.
    pub fn new(spec: JobSpec) -> Self {
        Self::with_id(Uuid::new_v4().to_string(), spec, Utc::now())
    }

    pub fn with_id(id: String, spec: JobSpec, created_at: DateTime<Utc>) -> Self {
        Self {
            job_name: spec.job_name.unwrap_or_else(|| id.clone()),
            id,
            job_queue: spec.job_queue,
            job_definition: spec.job_definition,
            commands: spec.commands,
            status: JobStatus::Waiting,
            retries_available: spec.retries,
            output: String::new(),
            error: None,
            group_id: None,
            timestamps: JobTimestamps {
                created: Some(created_at),
                ..JobTimestamps::default()
            },
            version: 0,
        }
    }

    /// No further status change is accepted from the relay.
    pub fn is_terminal(&self) -> bool {
        match self.status {
            JobStatus::Successful => true,
            JobStatus::Failed => self.retries_available == 0,
            _ => false,
        }
    }

    /// Mark the record Error with the raw failure text, keeping the bounded
    /// output field as the carrier of the raw error.
    pub fn mark_error(&mut self, description: &str, raw: &str, at: DateTime<Utc>) {
        self.status = JobStatus::Error;
        self.error = Some(description.to_string());
        self.output = raw.to_string();
        self.timestamps.errored = Some(at);
    }

    pub fn payload(&self) -> JobPayload {
        JobPayload {
            id: self.id.clone(),
            job_name: self.job_name.clone(),
            job_queue: self.job_queue.clone(),
            job_definition: self.job_definition.clone(),
            commands: self.commands.clone(),
            retries_available: self.retries_available,
        }
    }
}

/// What a client submits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default)]
    pub job_name: Option<String>,
    pub job_queue: String,
    pub job_definition: String,
    pub commands: String,
    #[serde(default)]
    pub retries: u32,
}

impl JobSpec {
    pub fn new(
        job_queue: impl Into<String>,
        job_definition: impl Into<String>,
        commands: impl Into<String>,
    ) -> Self {
        Self {
            job_name: None,
            job_queue: job_queue.into(),
            job_definition: job_definition.into(),
            commands: commands.into(),
            retries: 0,
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.job_name = Some(name.into());
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }
}

/// The part of a job that travels through the work queue and the dispatch
/// stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub id: String,
    pub job_name: String,
    pub job_queue: String,
    pub job_definition: String,
    pub commands: String,
    pub retries_available: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_job_is_waiting_and_named_after_id() {
        let job = JobRecord::new(JobSpec::new("q", "d", "echo hi"));
        assert_eq!(job.status, JobStatus::Waiting);
        assert_eq!(job.job_name, job.id);
        assert!(job.timestamps.created.is_some());
        assert!(job.output.is_empty());
    }

    #[test]
    fn explicit_name_is_kept() {
        let job = JobRecord::new(JobSpec::new("q", "d", "true").with_name("nightly"));
        assert_eq!(job.job_name, "nightly");
    }

    #[test]
    fn failed_is_terminal_only_without_retries() {
        let mut job = JobRecord::new(JobSpec::new("q", "d", "false").with_retries(1));
        job.status = JobStatus::Failed;
        assert!(!job.is_terminal());
        job.retries_available = 0;
        assert!(job.is_terminal());
    }

    #[test]
    fn status_round_trips_through_text() {
        for status in [
            JobStatus::Waiting,
            JobStatus::Running,
            JobStatus::Successful,
            JobStatus::Failed,
            JobStatus::Error,
        ] {
            assert_eq!(status.to_string().parse::<JobStatus>().unwrap(), status);
        }
    }

    #[test]
    fn record_serializes_camel_case() {
        let job = JobRecord::new(JobSpec::new("q", "d", "true"));
        let json = serde_json::to_value(&job).unwrap();
        assert_eq!(json["status"], "Waiting");
        assert_eq!(json["jobDefinition"], "d");
        assert_eq!(json["retriesAvailable"], 0);
    }
}
