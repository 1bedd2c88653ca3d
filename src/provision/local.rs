use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::{ProvisionRequest, Provisioner, WorkerFailure};
use crate::error::{CycloneError, Result};
use crate::queue::QueueAddress;
use crate::worker::heartbeat::detect_instance;
use crate::worker::{AgentDeps, WorkerAgent};

type Instances = Arc<Mutex<HashMap<Uuid, JoinHandle<()>>>>;

/// Runs worker agents as tasks of this process, up to a capacity ceiling.
///
/// An agent that ends with an error is reported on the failure channel.
pub struct LocalProvisioner {
    deps: AgentDeps,
    max_instances: usize,
    instances: Instances,
    failures: mpsc::UnboundedSender<WorkerFailure>,
    shutdown: CancellationToken,
}

impl LocalProvisioner {
    pub fn new(
        deps: AgentDeps,
        max_instances: usize,
        shutdown: CancellationToken,
    ) -> (Self, mpsc::UnboundedReceiver<WorkerFailure>) {
        let (failures, rx) = mpsc::unbounded_channel();
        let provisioner = Self {
            deps,
            max_instances,
            instances: Arc::new(Mutex::new(HashMap::new())),
            failures,
            shutdown,
        };
        (provisioner, rx)
    }

    pub fn running(&self) -> usize {
        self.instances.lock().map(|i| i.len()).unwrap_or(0)
    }

    fn launch(&self, instances: &mut HashMap<Uuid, JoinHandle<()>>, request: &ProvisionRequest) -> Uuid {
        let slot = Uuid::new_v4();
        let agent = WorkerAgent::new(
            slot,
            QueueAddress::new(request.region.clone(), request.job_definition.clone()),
            request.job_queue.clone(),
            detect_instance(&request.region),
            self.deps.clone(),
        );
        let failure_tx = self.failures.clone();
        let registry = self.instances.clone();
        let shutdown = self.shutdown.child_token();
        let (job_name, region) = (request.job_name.clone(), request.region.clone());

        let handle = tokio::spawn(async move {
            if let Err(e) = agent.run(shutdown).await {
                tracing::error!(slot = %slot, worker = %job_name, error = %e, "Worker failed");
                let _ = failure_tx.send(WorkerFailure {
                    job_name,
                    region,
                    reason: e.to_string(),
                });
            }
            if let Ok(mut instances) = registry.lock() {
                instances.remove(&slot);
            }
        });
        instances.insert(slot, handle);
        slot
    }
}

#[async_trait]
impl Provisioner for LocalProvisioner {
    async fn submit(&self, request: ProvisionRequest) -> Result<Vec<Uuid>> {
        let mut instances = self
            .instances
            .lock()
            .map_err(|_| CycloneError::Provisioning("instance table lock poisoned".into()))?;
        let free = self.max_instances.saturating_sub(instances.len());
        if free == 0 {
            return Err(CycloneError::Provisioning(format!(
                "capacity of {} instances exhausted",
                self.max_instances
            )));
        }
        let wanted = request.count.instances() as usize;
        if wanted > free {
            tracing::warn!(worker = %request.job_name, wanted, free, "Clamping request to free capacity");
        }

        let launched: Vec<Uuid> = (0..wanted.min(free))
            .map(|_| self.launch(&mut instances, &request))
            .collect();
        tracing::info!(
            worker = %request.job_name,
            region = %request.region,
            instances = launched.len(),
            "Workers launched"
        );
        Ok(launched)
    }

    async fn terminate(&self, instance: Uuid) -> Result<bool> {
        let handle = self
            .instances
            .lock()
            .map_err(|_| CycloneError::Provisioning("instance table lock poisoned".into()))?
            .remove(&instance);
        match handle {
            Some(handle) => {
                handle.abort();
                tracing::info!(slot = %instance, "Worker terminated");
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
