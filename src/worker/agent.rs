use std::sync::Arc;

use chrono::Utc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::executor::JobExecutor;
use super::heartbeat::HeartbeatSender;
use super::poll::IdlePoller;
use crate::config::TimingConfig;
use crate::error::Result;
use crate::logsink::{LogScope, LogSink};
use crate::mailbox::{InstanceInfo, MailboxStore, SlotStatus, WorkerSlot};
use crate::queue::QueueAddress;
use crate::retry::RetryPolicy;
use crate::workflow::{ControlPlane, TaskToken, WorkerReport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentExitReason {
    /// No new job for the whole idle budget.
    Idle,
    /// `leave_running` was switched off.
    Drained,
    /// The control loop tore the slot down.
    SlotRemoved,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentExit {
    pub slot: Uuid,
    pub jobs_run: u32,
    pub reason: AgentExitReason,
}

/// Outcome of an idle switch-off attempt.
enum SwitchOff {
    /// The slot no longer wants work; carries the token its loop is parked on.
    Stopped(Option<TaskToken>),
    /// A job was handed over before the switch-off landed.
    Assigned(WorkerSlot),
}

/// Every hand-off comes with a fresh token, so a new token on a Starting slot
/// is a new job even when the job id repeats.
fn is_new_job(slot: &WorkerSlot, last_token: Option<TaskToken>) -> bool {
    slot.callback.is_some() && slot.callback != last_token && slot.status == Some(SlotStatus::Starting)
}

/// Collaborators shared by every agent of a node.
#[derive(Clone)]
pub struct AgentDeps {
    pub mailbox: Arc<dyn MailboxStore>,
    pub control: Arc<dyn ControlPlane>,
    pub sink: Arc<dyn LogSink>,
    pub executor: JobExecutor,
    pub timing: TimingConfig,
    pub retry: RetryPolicy,
}

/// The process side of a worker instance: owns one slot, runs the jobs the
/// control loop writes onto it.
pub struct WorkerAgent {
    slot: Uuid,
    address: QueueAddress,
    job_queue: String,
    instance: InstanceInfo,
    deps: AgentDeps,
}

impl WorkerAgent {
    pub fn new(
        slot: Uuid,
        address: QueueAddress,
        job_queue: impl Into<String>,
        instance: InstanceInfo,
        deps: AgentDeps,
    ) -> Self {
        Self {
            slot,
            address,
            job_queue: job_queue.into(),
            instance,
            deps,
        }
    }

    pub fn slot(&self) -> Uuid {
        self.slot
    }

    pub async fn run(self, shutdown: CancellationToken) -> Result<AgentExit> {
        let deps = &self.deps;
        let mut slot = WorkerSlot::new(self.slot, self.instance.clone());
        slot.job_definition = Some(self.address.definition.clone());
        slot.job_queue = Some(self.job_queue.clone());
        deps.mailbox.create(slot).await?;
        tracing::info!(slot = %self.slot, queue = %self.address, host = %self.instance.hostname, "Worker started");

        let (token_tx, token_rx) = watch::channel(None);
        let heartbeat_stop = shutdown.child_token();
        // Stops the heartbeat even when the provisioner aborts this task
        let _heartbeat_guard = heartbeat_stop.clone().drop_guard();
        let heartbeat = HeartbeatSender::new(
            deps.timing.agent_heartbeat_interval(),
            deps.control.clone(),
            deps.sink.clone(),
            LogScope::new(self.slot.to_string(), &self.address.definition, &self.job_queue),
        );
        let heartbeat_task = tokio::spawn(heartbeat.run(token_rx, heartbeat_stop.clone()));

        let result = self.poll_loop(&token_tx, &shutdown).await;

        heartbeat_stop.cancel();
        let _ = heartbeat_task.await;
        if let Ok(exit) = &result {
            tracing::info!(slot = %self.slot, jobs_run = exit.jobs_run, reason = ?exit.reason, "Worker stopped");
        }
        result
    }

    async fn poll_loop(
        &self,
        token_tx: &watch::Sender<Option<TaskToken>>,
        shutdown: &CancellationToken,
    ) -> Result<AgentExit> {
        let deps = &self.deps;
        deps.control
            .start_execution(self.slot, self.address.clone())
            .await?;

        let mut poller = IdlePoller::new(deps.timing.poll_interval(), deps.timing.max_idle_polls);
        let mut last_token: Option<TaskToken> = None;
        let mut jobs_run = 0;

        let reason = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break AgentExitReason::Shutdown,
                _ = poller.tick() => {}
            }

            let Some(mut slot) = deps.mailbox.get(self.slot).await? else {
                break AgentExitReason::SlotRemoved;
            };
            token_tx.send_replace(slot.callback);

            if !slot.leave_running {
                self.request_stop(slot.callback).await;
                break AgentExitReason::Drained;
            }

            if !is_new_job(&slot, last_token) {
                if !poller.record_idle() {
                    continue;
                }
                tracing::info!(slot = %self.slot, idle_polls = poller.idle_polls(), "No new work, shutting down");
                match self.switch_off(last_token).await? {
                    SwitchOff::Stopped(callback) => {
                        self.request_stop(callback).await;
                        break AgentExitReason::Idle;
                    }
                    SwitchOff::Assigned(fresh) => {
                        tracing::info!(slot = %self.slot, job_id = ?fresh.job_id, "Job arrived while winding down");
                        token_tx.send_replace(fresh.callback);
                        slot = fresh;
                    }
                }
            }

            poller.reset();
            last_token = slot.callback;
            jobs_run += 1;
            if !self.run_job(slot).await? {
                break AgentExitReason::Drained;
            }
        };

        Ok(AgentExit {
            slot: self.slot,
            jobs_run,
            reason,
        })
    }

    /// Run the job on `slot`, write the result back and ask for the next job.
    /// Returns false when the worker was told to stop meanwhile.
    async fn run_job(&self, slot: WorkerSlot) -> Result<bool> {
        let (Some(token), Some(command)) = (slot.callback, slot.command.clone()) else {
            return Ok(true);
        };
        let scope = LogScope::new(
            slot.job_id.clone().unwrap_or_default(),
            slot.job_definition.clone().unwrap_or_default(),
            slot.job_queue.clone().unwrap_or_default(),
        );

        self.update_slot(token, SlotStatus::Running, String::new()).await?;
        let result = self.deps.executor.execute(&scope, &command).await;
        let leave_running = self.update_slot(token, result.status, result.output).await?;

        let report = WorkerReport {
            leave_running,
            status: Some(result.status),
            job_id: slot.job_id,
        };
        if let Err(e) = self.deps.control.send_success(token, report).await {
            tracing::warn!(slot = %self.slot, token = %token, error = %e, "Control loop did not take the result");
        }
        Ok(leave_running)
    }

    /// Record progress on the slot if it still carries `token`. Returns the
    /// slot's current `leave_running`.
    async fn update_slot(&self, token: TaskToken, status: SlotStatus, output: String) -> Result<bool> {
        let mailbox: &dyn MailboxStore = self.deps.mailbox.as_ref();
        let (slot_id, output) = (self.slot, &output);
        self.deps
            .retry
            .run("update worker slot", move || async move {
                let Some(mut slot) = mailbox.get(slot_id).await? else {
                    return Ok(false);
                };
                if slot.callback != Some(token) {
                    return Ok(slot.leave_running);
                }
                slot.record(status, output.clone(), Utc::now());
                Ok(mailbox.put_if(slot).await?.leave_running)
            })
            .await
    }

    /// Set `leave_running = false` on our own slot, unless the control loop
    /// handed over a job we have not seen yet.
    async fn switch_off(&self, last_token: Option<TaskToken>) -> Result<SwitchOff> {
        let mailbox: &dyn MailboxStore = self.deps.mailbox.as_ref();
        let slot_id = self.slot;
        self.deps
            .retry
            .run("switch off worker slot", move || async move {
                let Some(mut slot) = mailbox.get(slot_id).await? else {
                    return Ok(SwitchOff::Stopped(None));
                };
                if is_new_job(&slot, last_token) {
                    return Ok(SwitchOff::Assigned(slot));
                }
                let callback = slot.callback;
                slot.leave_running = false;
                mailbox.put_if(slot).await?;
                Ok(SwitchOff::Stopped(callback))
            })
            .await
    }

    /// Tell a parked control loop to wind down. Only a loop that is still
    /// parked on `token` will hear it.
    async fn request_stop(&self, token: Option<TaskToken>) {
        let Some(token) = token else { return };
        if let Err(e) = self.deps.control.send_success(token, WorkerReport::stop()).await {
            tracing::debug!(slot = %self.slot, error = %e, "Stop request not delivered");
        }
    }
}
