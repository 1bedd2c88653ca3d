use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;

use crate::config::ClusterConfig;
use crate::error::{CycloneError, Result};
use crate::provision::{logical_name, ProvisionRequest, Provisioner, WorkerCount};
use crate::queue::DispatchEvent;
use crate::scheduler::job::JobPayload;
use crate::scheduler::store::JobStore;
use crate::trigger::BatchHandler;

/// Worker instances needed for `count` pending jobs at `ratio` jobs each.
pub fn workers_needed(count: u32, ratio: u32) -> u32 {
    count.div_ceil(ratio.max(1))
}

/// Turns a region's dispatch events into provisioning requests.
pub struct FleetSizer {
    region: String,
    config: Arc<ClusterConfig>,
    provisioner: Arc<dyn Provisioner>,
    jobs: Arc<dyn JobStore>,
}

impl FleetSizer {
    pub fn new(
        region: impl Into<String>,
        config: Arc<ClusterConfig>,
        provisioner: Arc<dyn Provisioner>,
        jobs: Arc<dyn JobStore>,
    ) -> Self {
        Self {
            region: region.into(),
            config,
            provisioner,
            jobs,
        }
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Group a batch by partition (the job definition), then by job queue.
    pub fn group(batch: &[DispatchEvent]) -> BTreeMap<(String, String), Vec<&JobPayload>> {
        let mut groups: BTreeMap<(String, String), Vec<&JobPayload>> = BTreeMap::new();
        for event in batch {
            groups
                .entry((event.partition_key().to_string(), event.job.job_queue.clone()))
                .or_default()
                .push(&event.job);
        }
        groups
    }

    /// Build the provisioning request for one group.
    pub fn plan(&self, definition: &str, queue: &str, count: u32) -> Result<Option<ProvisionRequest>> {
        let ratio = self.config.ratio_for(definition)?;
        let workers = workers_needed(count, ratio);
        Ok(WorkerCount::for_workers(workers).map(|count| ProvisionRequest {
            job_name: logical_name(definition, queue),
            region: self.region.clone(),
            job_definition: definition.to_string(),
            job_queue: queue.to_string(),
            count,
        }))
    }

    async fn size_group(&self, definition: &str, queue: &str, jobs: &[&JobPayload]) -> Result<()> {
        let request = match self.plan(definition, queue, jobs.len() as u32) {
            Ok(Some(request)) => request,
            Ok(None) => return Ok(()),
            Err(e) => {
                self.mark_jobs_error(jobs, "Worker sizing failed", &e).await;
                return Err(e);
            }
        };

        tracing::info!(
            region = %self.region,
            definition,
            queue,
            jobs = jobs.len(),
            workers = request.count.instances(),
            "Requesting workers"
        );
        if let Err(e) = self.provisioner.submit(request).await {
            self.mark_jobs_error(jobs, "Worker provisioning failed", &e).await;
            return Err(e);
        }
        Ok(())
    }

    async fn mark_jobs_error(&self, jobs: &[&JobPayload], description: &str, error: &CycloneError) {
        tracing::error!(region = %self.region, jobs = jobs.len(), error = %error, "{description}");
        let now = Utc::now();
        for payload in jobs {
            match self.jobs.get(&payload.job_queue, &payload.id).await {
                Ok(Some(mut job)) => {
                    job.mark_error(description, &error.to_string(), now);
                    if let Err(e) = self.jobs.put(job).await {
                        tracing::error!(job_id = %payload.id, error = %e, "Could not record sizing error");
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::error!(job_id = %payload.id, error = %e, "Could not read job to record sizing error")
                }
            }
        }
    }
}

#[async_trait]
impl BatchHandler<DispatchEvent> for FleetSizer {
    async fn handle(&self, batch: &[DispatchEvent]) -> Result<()> {
        let mut first_error = None;
        for ((definition, queue), jobs) in Self::group(batch) {
            if let Err(e) = self.size_group(&definition, &queue, &jobs).await {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
