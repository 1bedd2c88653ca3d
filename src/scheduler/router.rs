use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::error::{CycloneError, Result};
use crate::queue::{DispatchEvent, DispatchStream, QueueAddress, WorkQueue};
use crate::scheduler::job::{JobRecord, JobStatus};
use crate::scheduler::rotation::RegionRotation;
use crate::scheduler::store::JobStore;
use crate::store::Change;
use crate::trigger::BatchHandler;

/// The job image a change asks to be routed, if any.
///
/// A job is routed when it enters `Waiting`, or when it is `Failed` with
/// retries left and was not `Failed` before.
pub fn routable(change: &Change<JobRecord>) -> Option<&JobRecord> {
    let new = change.new.as_ref()?;
    let old_status = change.old.as_ref().map(|old| old.status);
    let qualifies = match new.status {
        JobStatus::Waiting => old_status != Some(JobStatus::Waiting),
        JobStatus::Failed => new.retries_available > 0 && old_status != Some(JobStatus::Failed),
        _ => false,
    };
    qualifies.then_some(new)
}

/// Assigns a region to every newly waiting job and pushes it onto that
/// region's work queue and dispatch stream.
pub struct RegionRouter {
    jobs: Arc<dyn JobStore>,
    queue: Arc<dyn WorkQueue>,
    stream: Arc<dyn DispatchStream>,
    rotation: Arc<RegionRotation>,
}

impl RegionRouter {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        queue: Arc<dyn WorkQueue>,
        stream: Arc<dyn DispatchStream>,
        rotation: Arc<RegionRotation>,
    ) -> Self {
        Self {
            jobs,
            queue,
            stream,
            rotation,
        }
    }

    /// Route one job; returns the region it went to.
    pub async fn route(&self, job: &JobRecord) -> Result<String> {
        let region = match self.rotation.next_region(&job.job_queue).await {
            Ok(region) => region,
            Err(e) => {
                self.mark_error(job, "Region selection failed", &e).await;
                return Err(e);
            }
        };

        let address = QueueAddress::new(region.clone(), job.job_definition.clone());
        let payload = job.payload();
        let sent = match serde_json::to_string(&payload) {
            Ok(body) => self.queue.send(&address, body).await,
            Err(e) => Err(CycloneError::from(e)),
        };
        if let Err(e) = sent {
            self.mark_error(job, "Failed to enqueue job", &e).await;
            return Err(e);
        }

        let event = DispatchEvent {
            region: region.clone(),
            job: payload,
        };
        if let Err(e) = self.stream.publish(event).await {
            self.mark_error(job, "Failed to publish dispatch event", &e).await;
            return Err(e);
        }

        tracing::info!(job_id = %job.id, queue = %job.job_queue, region = %region, "Job routed");
        Ok(region)
    }

    /// Record a routing failure on the job: status Error, raw error in the
    /// output, description in the error annotation.
    async fn mark_error(&self, job: &JobRecord, description: &str, error: &CycloneError) {
        tracing::error!(job_id = %job.id, queue = %job.job_queue, error = %error, "{description}");
        let current = match self.jobs.get(&job.job_queue, &job.id).await {
            Ok(Some(current)) => current,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Could not read job to record routing error");
                return;
            }
        };
        let mut updated = current;
        updated.mark_error(description, &error.to_string(), Utc::now());
        if let Err(e) = self.jobs.put(updated).await {
            tracing::error!(job_id = %job.id, error = %e, "Could not record routing error");
        }
    }
}

#[async_trait]
impl BatchHandler<Change<JobRecord>> for RegionRouter {
    async fn handle(&self, batch: &[Change<JobRecord>]) -> Result<()> {
        // Capacity scores are read once per batch
        self.rotation.refresh();
        let mut first_error = None;
        for job in batch.iter().filter_map(routable) {
            if let Err(e) = self.route(job).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
