use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::{CycloneError, Result};
use crate::mailbox::{SlotStatus, WorkerSlot};
use crate::provision::{parse_logical_name, WorkerFailure};
use crate::retry::RetryPolicy;
use crate::scheduler::job::{JobRecord, JobStatus};
use crate::scheduler::store::JobStore;
use crate::store::{Change, ChangeKind, PageRequest};
use crate::trigger::BatchHandler;

/// What relaying a slot status did to its job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Applied(JobStatus),
    /// Same status and timestamp already recorded.
    Duplicate,
    /// The job already reached Successful or terminal Failed.
    Absorbed,
    /// The job no longer exists.
    Missing,
    /// The change carries nothing to relay.
    Ignored,
}

/// Status, output and time reported by a worker for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotReport {
    pub status: SlotStatus,
    pub output: String,
    pub at: DateTime<Utc>,
}

/// Apply a worker report to a job record. `Err` says why nothing changes.
pub fn relay_transition(job: &JobRecord, report: &SlotReport) -> std::result::Result<JobRecord, RelayOutcome> {
    if job.is_terminal() {
        return Err(RelayOutcome::Absorbed);
    }
    let t = &job.timestamps;
    let at = Some(report.at);
    // Reports no later than the last recorded attempt boundary are replays.
    let settled = t.retried.max(t.failed);
    let mut next = job.clone();
    match report.status {
        SlotStatus::Starting => return Err(RelayOutcome::Ignored),
        SlotStatus::Running => {
            if at <= t.running.max(settled) {
                return Err(RelayOutcome::Duplicate);
            }
            next.status = JobStatus::Running;
            next.timestamps.running = at;
        }
        SlotStatus::Successful => {
            next.status = JobStatus::Successful;
            next.timestamps.successful = at;
        }
        SlotStatus::Failed => {
            if at <= settled {
                return Err(RelayOutcome::Duplicate);
            }
            if job.retries_available > 0 {
                next.retries_available -= 1;
                next.status = JobStatus::Waiting;
                next.timestamps.retried = at;
            } else {
                next.status = JobStatus::Failed;
                next.timestamps.failed = at;
            }
        }
    }
    next.output = report.output.clone();
    Ok(next)
}

pub const WORKER_FAILURE_NOTE: &str = "One or more workers failed, job may still complete elsewhere";

/// Relays worker progress into the Job Store and reacts to worker failures.
pub struct FailureReconciler {
    jobs: Arc<dyn JobStore>,
    retry: RetryPolicy,
}

impl FailureReconciler {
    pub fn new(jobs: Arc<dyn JobStore>, retry: RetryPolicy) -> Self {
        Self { jobs, retry }
    }

    /// Relay the status of a slot image to the job it carries.
    pub async fn relay(&self, slot: &WorkerSlot) -> Result<RelayOutcome> {
        let (Some(job_id), Some(queue), Some(status)) = (&slot.job_id, &slot.job_queue, slot.status) else {
            return Ok(RelayOutcome::Ignored);
        };
        if status == SlotStatus::Starting {
            return Ok(RelayOutcome::Ignored);
        }
        let report = SlotReport {
            status,
            output: slot.output.clone(),
            at: slot.current_time.unwrap_or_else(Utc::now),
        };

        let jobs: &dyn JobStore = self.jobs.as_ref();
        let report = &report;
        let outcome = self
            .retry
            .run("relay job status", move || async move {
                let Some(job) = jobs.get(queue, job_id).await? else {
                    return Ok(RelayOutcome::Missing);
                };
                match relay_transition(&job, report) {
                    Ok(next) => {
                        let status = next.status;
                        jobs.put_if(next).await?;
                        Ok(RelayOutcome::Applied(status))
                    }
                    Err(outcome) => Ok(outcome),
                }
            })
            .await;

        match &outcome {
            Ok(RelayOutcome::Applied(status)) => {
                tracing::info!(job_id = %job_id, queue = %queue, slot = %slot.uuid, status = %status, "Job status relayed")
            }
            Ok(RelayOutcome::Missing) => {
                tracing::warn!(job_id = %job_id, queue = %queue, "Job vanished before its status could be relayed")
            }
            Ok(other) => tracing::debug!(job_id = %job_id, outcome = ?other, "Slot change not relayed"),
            Err(e) => tracing::error!(job_id = %job_id, error = %e, "Status relay failed"),
        }
        outcome
    }

    /// Annotate the still-waiting jobs served by a failed worker. Returns how
    /// many were annotated.
    pub async fn on_worker_failure(&self, failure: &WorkerFailure) -> Result<usize> {
        let (definition, queue) = parse_logical_name(&failure.job_name).ok_or_else(|| {
            CycloneError::InvalidSubmission(format!("unrecognised worker name {}", failure.job_name))
        })?;
        tracing::warn!(
            definition = %definition,
            queue = %queue,
            region = %failure.region,
            reason = %failure.reason,
            "Worker failed"
        );

        let note = format!("{WORKER_FAILURE_NOTE}: {}", failure.reason);
        let mut annotated = 0;
        let mut page = PageRequest::default();
        loop {
            let result = self.jobs.query_by_definition(&queue, &definition, page.clone()).await?;
            for job in result.items.iter().filter(|job| job.status == JobStatus::Waiting) {
                if self.annotate(job, &note).await? {
                    annotated += 1;
                }
            }
            match result.next {
                Some(next) => page.start_after = Some(next),
                None => break,
            }
        }
        Ok(annotated)
    }

    async fn annotate(&self, job: &JobRecord, note: &str) -> Result<bool> {
        let jobs: &dyn JobStore = self.jobs.as_ref();
        let (queue, id) = (job.job_queue.as_str(), job.id.as_str());
        self.retry
            .run("annotate waiting job", move || async move {
                let Some(mut current) = jobs.get(queue, id).await? else {
                    return Ok(false);
                };
                if current.status != JobStatus::Waiting {
                    return Ok(false);
                }
                current.error = Some(note.to_string());
                current.timestamps.errored = Some(Utc::now());
                jobs.put_if(current).await?;
                Ok(true)
            })
            .await
    }
}

#[async_trait]
impl BatchHandler<Change<WorkerSlot>> for FailureReconciler {
    async fn handle(&self, batch: &[Change<WorkerSlot>]) -> Result<()> {
        let mut first_error = None;
        for change in batch {
            if change.kind == ChangeKind::Remove {
                continue;
            }
            let Some(slot) = change.new.as_ref() else {
                continue;
            };
            if let Err(e) = self.relay(slot).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BatchHandler<WorkerFailure> for FailureReconciler {
    async fn handle(&self, batch: &[WorkerFailure]) -> Result<()> {
        for failure in batch {
            match self.on_worker_failure(failure).await {
                Ok(annotated) => {
                    tracing::info!(worker = %failure.job_name, annotated, "Waiting jobs annotated after worker failure")
                }
                Err(e) if e.is_transient() => return Err(e),
                Err(e) => tracing::error!(worker = %failure.job_name, error = %e, "Worker failure not reconciled"),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobSpec;

    fn report(status: SlotStatus, at: DateTime<Utc>) -> SlotReport {
        SlotReport {
            status,
            output: "out".into(),
            at,
        }
    }

    #[test]
    fn running_then_duplicate_running() {
        let job = JobRecord::new(JobSpec::new("q", "d", "true"));
        let at = Utc::now();
        let running = relay_transition(&job, &report(SlotStatus::Running, at)).unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.timestamps.running, Some(at));
        assert_eq!(
            relay_transition(&running, &report(SlotStatus::Running, at)),
            Err(RelayOutcome::Duplicate)
        );
    }

    #[test]
    fn failure_spends_retry_budget() {
        let job = JobRecord::new(JobSpec::new("q", "d", "false").with_retries(1));
        let first = relay_transition(&job, &report(SlotStatus::Failed, Utc::now())).unwrap();
        assert_eq!(first.status, JobStatus::Waiting);
        assert_eq!(first.retries_available, 0);
        assert!(first.timestamps.retried.is_some());

        let later = Utc::now() + chrono::Duration::seconds(1);
        let second = relay_transition(&first, &report(SlotStatus::Failed, later)).unwrap();
        assert_eq!(second.status, JobStatus::Failed);
        assert_eq!(second.timestamps.failed, Some(later));
        assert!(second.is_terminal());
    }

    #[test]
    fn replayed_attempt_after_retry_is_dropped() {
        let job = JobRecord::new(JobSpec::new("q", "d", "false").with_retries(2));
        let t1 = Utc::now();
        let t2 = t1 + chrono::Duration::seconds(1);
        let running = relay_transition(&job, &report(SlotStatus::Running, t1)).unwrap();
        let retried = relay_transition(&running, &report(SlotStatus::Failed, t2)).unwrap();
        assert_eq!(retried.status, JobStatus::Waiting);

        // The same pair delivered again leaves the job waiting for its retry
        assert_eq!(
            relay_transition(&retried, &report(SlotStatus::Running, t1)),
            Err(RelayOutcome::Duplicate)
        );
        assert_eq!(
            relay_transition(&retried, &report(SlotStatus::Failed, t2)),
            Err(RelayOutcome::Duplicate)
        );

        // The next attempt is relayed as usual
        let t3 = t2 + chrono::Duration::seconds(1);
        let rerun = relay_transition(&retried, &report(SlotStatus::Running, t3)).unwrap();
        assert_eq!(rerun.status, JobStatus::Running);
        assert_eq!(rerun.retries_available, 1);
    }

    #[test]
    fn terminal_states_absorb() {
        let mut job = JobRecord::new(JobSpec::new("q", "d", "true"));
        job.status = JobStatus::Successful;
        assert_eq!(
            relay_transition(&job, &report(SlotStatus::Failed, Utc::now())),
            Err(RelayOutcome::Absorbed)
        );
    }
}
