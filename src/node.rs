use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::api::{run_api, ApiState};
use crate::config::ClusterConfig;
use crate::error::{CycloneError, Result};
use crate::logsink::{LogSink, StatusLogShipper};
use crate::mailbox::{MailboxStore, MemoryMailbox};
use crate::provision::{LocalProvisioner, Provisioner, WorkerFailure};
use crate::queue::{DispatchStream, MemoryDispatchStream, MemoryWorkQueue, WorkQueue};
use crate::scheduler::job::{JobRecord, JobStatus};
use crate::scheduler::reconciler::FailureReconciler;
use crate::scheduler::rotation::{CapacityScorer, MemoryCursorStore, RegionRotation};
use crate::scheduler::router::RegionRouter;
use crate::scheduler::sizer::FleetSizer;
use crate::scheduler::store::{JobStore, MemoryJobStore};
use crate::scheduler::submit::JobSubmitter;
use crate::trigger::BatchTrigger;
use crate::worker::{AgentDeps, JobExecutor};
use crate::workflow::{ControlPlane, LoopContext, TaskTokenRegistry, Workflows};

/// One process hosting the whole dispatch pipeline on in-memory
/// collaborators: job store, work queues, dispatch streams, mailbox, control
/// loops and locally provisioned workers.
pub struct Node {
    pub config: Arc<ClusterConfig>,
    pub jobs: Arc<MemoryJobStore>,
    pub mailbox: Arc<MemoryMailbox>,
    pub queue: Arc<MemoryWorkQueue>,
    pub stream: Arc<MemoryDispatchStream>,
    pub rotation: Arc<RegionRotation>,
    pub workflows: Arc<Workflows>,
    pub provisioner: Arc<LocalProvisioner>,
    pub sink: Arc<dyn LogSink>,
    pub submitter: JobSubmitter,
    shutdown: CancellationToken,
    failures: Option<mpsc::UnboundedReceiver<WorkerFailure>>,
    released: Option<mpsc::UnboundedReceiver<Uuid>>,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    pub fn new(config: ClusterConfig, sink: Arc<dyn LogSink>, shutdown: CancellationToken) -> Result<Self> {
        Self::with_scorer(config, sink, shutdown, None)
    }

    pub fn with_scorer(
        config: ClusterConfig,
        sink: Arc<dyn LogSink>,
        shutdown: CancellationToken,
        scorer: Option<Arc<dyn CapacityScorer>>,
    ) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);

        let jobs = Arc::new(MemoryJobStore::new());
        let mailbox = Arc::new(MemoryMailbox::new());
        let queue = Arc::new(MemoryWorkQueue::new());
        let stream = Arc::new(MemoryDispatchStream::new(config.regions.iter().cloned()));

        let tables = config
            .queues
            .iter()
            .map(|(name, q)| (name.clone(), q.regions.clone()))
            .collect();
        let mut rotation = RegionRotation::new(tables, Arc::new(MemoryCursorStore::new()));
        if let Some(scorer) = scorer {
            rotation = rotation.with_scorer(scorer);
        }

        let (released_tx, released) = mpsc::unbounded_channel();
        let workflows = Arc::new(Workflows::new(LoopContext {
            mailbox: mailbox.clone(),
            queue: queue.clone(),
            tokens: TaskTokenRegistry::new(),
            timing: config.timing.clone(),
            retry: config.retry,
            shutdown: shutdown.clone(),
            released: Some(released_tx),
        }));

        let executor = JobExecutor::new(sink.clone(), &config.timing).with_sandbox(config.sandbox.clone());
        let deps = AgentDeps {
            mailbox: mailbox.clone(),
            control: workflows.clone(),
            sink: sink.clone(),
            executor,
            timing: config.timing.clone(),
            retry: config.retry,
        };
        let (provisioner, failures) =
            LocalProvisioner::new(deps, config.provisioner.max_instances, shutdown.clone());

        Ok(Self {
            submitter: JobSubmitter::new(jobs.clone()),
            config,
            jobs,
            mailbox,
            queue,
            stream,
            rotation: Arc::new(rotation),
            workflows,
            provisioner: Arc::new(provisioner),
            sink,
            shutdown,
            failures: Some(failures),
            released: Some(released),
            tasks: Vec::new(),
        })
    }

    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    pub fn api_state(&self) -> ApiState {
        ApiState {
            submitter: self.submitter.clone(),
            jobs: self.jobs.clone(),
            mailbox: self.mailbox.clone(),
        }
    }

    fn trigger(&self, name: &str) -> BatchTrigger {
        BatchTrigger::from_timing(name, &self.config.timing, self.config.retry)
    }

    /// Start the background pipeline:
    /// 1. Region router on the Job Store change feed
    /// 2. Status log shipper on the same feed
    /// 3. One fleet sizer per region on its dispatch stream
    /// 4. Failure reconciler on the mailbox feed and the worker-failure signals
    /// 5. Release of the instances whose control loops drained
    pub fn start(&mut self) -> Result<()> {
        let (Some(failures), Some(released)) = (self.failures.take(), self.released.take()) else {
            return Err(CycloneError::Internal("node already started".into()));
        };

        let router = Arc::new(RegionRouter::new(
            self.jobs.clone() as Arc<dyn JobStore>,
            self.queue.clone() as Arc<dyn WorkQueue>,
            self.stream.clone() as Arc<dyn DispatchStream>,
            self.rotation.clone(),
        ));
        self.spawn_trigger("region-router", self.jobs.subscribe(), router);

        let shipper = Arc::new(StatusLogShipper::new(self.sink.clone()));
        self.spawn_trigger("status-log", self.jobs.subscribe(), shipper);

        for region in self.config.regions.clone() {
            let sizer = Arc::new(FleetSizer::new(
                region.clone(),
                self.config.clone(),
                self.provisioner.clone() as Arc<dyn Provisioner>,
                self.jobs.clone() as Arc<dyn JobStore>,
            ));
            let events = self.stream.subscribe(&region)?;
            self.spawn_trigger(&format!("fleet-sizer-{region}"), events, sizer);
        }

        let reconciler = Arc::new(FailureReconciler::new(
            self.jobs.clone() as Arc<dyn JobStore>,
            self.config.retry,
        ));
        self.spawn_trigger("mailbox-relay", self.mailbox.subscribe(), reconciler.clone());
        self.spawn_trigger("worker-failures", failures, reconciler);

        let provisioner = self.provisioner.clone() as Arc<dyn Provisioner>;
        self.tasks
            .push(tokio::spawn(release_workers(released, provisioner, self.shutdown.clone())));

        tracing::info!(
            regions = ?self.config.regions,
            queues = self.config.queues.len(),
            "Node started"
        );
        Ok(())
    }

    fn spawn_trigger<T, H>(&mut self, name: &str, rx: mpsc::UnboundedReceiver<T>, handler: Arc<H>)
    where
        T: Send + Sync + 'static,
        H: crate::trigger::BatchHandler<T> + 'static,
    {
        let trigger = self.trigger(name);
        let shutdown = self.shutdown.clone();
        self.tasks.push(tokio::spawn(async move {
            trigger.run(rx, handler.as_ref(), shutdown).await;
        }));
    }

    /// Start the pipeline, serve the REST API until shutdown, then wait for
    /// the background tasks to stop.
    pub async fn run(mut self) -> Result<()> {
        self.start()?;
        run_api(self.config.api.listen_addr, self.api_state(), self.shutdown.clone()).await;
        self.stop().await;
        Ok(())
    }

    /// Poll a job until it settles: Successful, terminal Failed, or Error.
    pub async fn wait_for_job(&self, queue: &str, id: &str, timeout: Duration) -> Result<JobRecord> {
        let poll = self.config.timing.poll_interval().min(Duration::from_millis(200));
        let wait = async {
            loop {
                match self.jobs.get(queue, id).await? {
                    Some(job) if job.is_terminal() || job.status == JobStatus::Error => return Ok(job),
                    Some(_) => {}
                    None => {
                        return Err(CycloneError::JobNotFound {
                            queue: queue.to_string(),
                            id: id.to_string(),
                        })
                    }
                }
                tokio::time::sleep(poll).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| CycloneError::Internal(format!("timed out waiting for job {queue}/{id}")))?
    }

    /// Cancel every background task and wait for them.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
        tracing::info!(
            workers = self.provisioner.running(),
            loops = self.workflows.active(),
            "Node stopped"
        );
    }
}

/// Terminate the instance behind every slot whose control loop drained.
async fn release_workers(
    mut released: mpsc::UnboundedReceiver<Uuid>,
    provisioner: Arc<dyn Provisioner>,
    shutdown: CancellationToken,
) {
    loop {
        let slot = tokio::select! {
            _ = shutdown.cancelled() => break,
            slot = released.recv() => match slot {
                Some(slot) => slot,
                None => break,
            },
        };
        match provisioner.terminate(slot).await {
            Ok(was_running) => tracing::debug!(slot = %slot, was_running, "Worker instance released"),
            Err(e) => tracing::warn!(slot = %slot, error = %e, "Could not release worker instance"),
        }
    }
}

impl Node {
    /// Control plane used by the node's workers.
    pub fn control_plane(&self) -> Arc<dyn ControlPlane> {
        self.workflows.clone()
    }

    pub fn mailbox_store(&self) -> Arc<dyn MailboxStore> {
        self.mailbox.clone()
    }
}
