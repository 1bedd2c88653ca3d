use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::dispatch::{self, Dispatch};
use super::token::{ParkedTask, TaskOutcome};
use super::LoopContext;
use crate::error::Result;
use crate::mailbox::{MailboxStore, SlotStatus};
use crate::queue::QueueAddress;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    AwaitingRequest,
    Dispatching,
    Draining,
    Terminated,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The queue stayed empty.
    NoWork,
    /// The worker or an administrator set `leave_running = false`, or the
    /// slot disappeared.
    Drained,
    /// The worker went silent while a job was in flight.
    HeartbeatTimeout,
    /// An unexpected error during dispatch.
    Fault,
    Shutdown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopExit {
    pub slot: Uuid,
    pub dispatched: u32,
    pub reason: ExitReason,
}

pub struct ControlLoop {
    ctx: Arc<LoopContext>,
    slot: Uuid,
    address: QueueAddress,
}

impl ControlLoop {
    pub fn new(ctx: Arc<LoopContext>, slot: Uuid, address: QueueAddress) -> Self {
        Self { ctx, slot, address }
    }

    pub async fn run(self) -> LoopExit {
        let mut state = LoopState::Dispatching;
        let mut parked: Option<ParkedTask> = None;
        let mut dispatched = 0;
        let mut reason = ExitReason::Drained;

        while state != LoopState::Terminated {
            tracing::debug!(slot = %self.slot, state = ?state, "Control loop step");
            state = match state {
                LoopState::Dispatching => {
                    match dispatch::next_job(&self.ctx, self.slot, &self.address).await {
                        Ok(Dispatch::Assigned(task)) => {
                            dispatched += 1;
                            parked = Some(task);
                            LoopState::AwaitingRequest
                        }
                        Ok(Dispatch::NoWork) => {
                            reason = ExitReason::NoWork;
                            LoopState::Draining
                        }
                        Ok(Dispatch::Stopped) => {
                            reason = ExitReason::Drained;
                            LoopState::Draining
                        }
                        Err(e) => {
                            tracing::error!(slot = %self.slot, error = %e, "Dispatch failed, draining worker");
                            self.fail_in_flight(&e.to_string()).await;
                            reason = ExitReason::Fault;
                            LoopState::Draining
                        }
                    }
                }
                LoopState::AwaitingRequest => match parked.take() {
                    Some(task) => self.await_request(task, &mut reason).await,
                    None => LoopState::Dispatching,
                },
                LoopState::Draining => {
                    if let Err(e) = self.ctx.mailbox.delete(self.slot).await {
                        tracing::error!(slot = %self.slot, error = %e, "Failed to remove worker slot");
                    }
                    if let Some(released) = &self.ctx.released {
                        let _ = released.send(self.slot);
                    }
                    LoopState::Terminated
                }
                LoopState::Terminated => LoopState::Terminated,
            };
        }

        tracing::info!(slot = %self.slot, dispatched, reason = ?reason, "Control loop terminated");
        LoopExit {
            slot: self.slot,
            dispatched,
            reason,
        }
    }

    async fn await_request(&self, task: ParkedTask, reason: &mut ExitReason) -> LoopState {
        let timeout = self.ctx.timing.heartbeat_timeout();
        let outcome = tokio::select! {
            _ = self.ctx.shutdown.cancelled() => None,
            outcome = task.wait(timeout) => Some(outcome),
        };

        match outcome {
            None => {
                *reason = ExitReason::Shutdown;
                LoopState::Draining
            }
            Some(TaskOutcome::Success(report)) if !report.leave_running => {
                *reason = ExitReason::Drained;
                LoopState::Draining
            }
            Some(TaskOutcome::Success(_)) => LoopState::Dispatching,
            Some(TaskOutcome::Failure(error)) => {
                tracing::warn!(slot = %self.slot, error = %error, "Worker reported failure");
                self.fail_in_flight(&error).await;
                LoopState::Dispatching
            }
            Some(TaskOutcome::TimedOut) => {
                tracing::warn!(slot = %self.slot, ?timeout, "Worker heartbeat timed out");
                self.fail_in_flight("worker heartbeat timed out").await;
                *reason = ExitReason::HeartbeatTimeout;
                LoopState::Draining
            }
        }
    }

    /// Mark the slot's in-flight job Failed so the reconciler relays it.
    async fn fail_in_flight(&self, error: &str) {
        if let Err(e) = self.try_fail_in_flight(error).await {
            tracing::error!(slot = %self.slot, error = %e, "Failed to mark in-flight job failed");
        }
    }

    async fn try_fail_in_flight(&self, error: &str) -> Result<()> {
        let mailbox: &dyn MailboxStore = self.ctx.mailbox.as_ref();
        let slot = self.slot;
        self.ctx
            .retry
            .run("fail in-flight job", move || async move {
                let Some(mut current) = mailbox.get(slot).await? else {
                    return Ok(());
                };
                if !current.has_job_in_flight() {
                    return Ok(());
                }
                current.record(SlotStatus::Failed, error, Utc::now());
                mailbox.put_if(current).await?;
                Ok(())
            })
            .await
    }
}
