use chrono::Utc;
use uuid::Uuid;

use super::token::{ParkedTask, TaskToken};
use super::LoopContext;
use crate::error::Result;
use crate::mailbox::MailboxStore;
use crate::queue::QueueAddress;
use crate::scheduler::job::JobPayload;

/// Result of one `Dispatching` step.
pub enum Dispatch {
    /// A job was written onto the slot; the loop parks on the task.
    Assigned(ParkedTask),
    /// The queue stayed empty; the slot was told to stop.
    NoWork,
    /// The slot is gone or no longer wants work.
    Stopped,
}

/// Receive one job for the slot and hand it over.
///
/// The message is deleted only after the slot write succeeded, so a crash in
/// between redelivers the job once its visibility timeout runs out.
pub async fn next_job(ctx: &LoopContext, slot: Uuid, address: &QueueAddress) -> Result<Dispatch> {
    match ctx.mailbox.get(slot).await? {
        Some(current) if current.leave_running => {}
        _ => return Ok(Dispatch::Stopped),
    }

    let timing = &ctx.timing;
    let queue = ctx.queue.as_ref();
    let (visibility, wait) = (timing.visibility_timeout(), timing.receive_wait());
    let mut empty = 0;

    while empty < timing.receive_attempts {
        let received = ctx
            .retry
            .run("receive job", move || queue.receive(address, visibility, wait))
            .await?;
        let Some(message) = received else {
            empty += 1;
            if empty < timing.receive_attempts {
                tokio::time::sleep(timing.receive_backoff()).await;
            }
            continue;
        };

        let job: JobPayload = match serde_json::from_str(&message.body) {
            Ok(job) => job,
            Err(e) => {
                tracing::warn!(
                    queue = %address,
                    message_id = %message.message_id,
                    error = %e,
                    "Dropping malformed queue message"
                );
                queue.delete(address, &message.receipt_handle).await?;
                continue;
            }
        };

        let task = ctx.tokens.park();
        if !assign(ctx, slot, &job, task.token()).await? {
            tracing::info!(slot = %slot, job_id = %job.id, "Slot stopped before hand-off, leaving job queued");
            return Ok(Dispatch::Stopped);
        }
        queue.delete(address, &message.receipt_handle).await?;

        tracing::info!(
            slot = %slot,
            job_id = %job.id,
            queue = %address,
            receive_count = message.receive_count,
            "Job handed to worker"
        );
        return Ok(Dispatch::Assigned(task));
    }

    tracing::info!(slot = %slot, queue = %address, "No work left, stopping worker");
    stop(ctx, slot).await?;
    Ok(Dispatch::NoWork)
}

/// Write the job onto the slot, conditional on the slot still being the one
/// we read and still wanting work.
async fn assign(ctx: &LoopContext, slot: Uuid, job: &JobPayload, token: TaskToken) -> Result<bool> {
    let mailbox: &dyn MailboxStore = ctx.mailbox.as_ref();
    ctx.retry
        .run("assign job", move || async move {
            let Some(mut current) = mailbox.get(slot).await? else {
                return Ok(false);
            };
            if !current.leave_running {
                return Ok(false);
            }
            current.assign(job, token, Utc::now());
            mailbox.put_if(current).await?;
            Ok(true)
        })
        .await
}

/// Set `leave_running = false` on the slot.
pub async fn stop(ctx: &LoopContext, slot: Uuid) -> Result<()> {
    let mailbox: &dyn MailboxStore = ctx.mailbox.as_ref();
    ctx.retry
        .run("stop worker", move || async move {
            let Some(mut current) = mailbox.get(slot).await? else {
                return Ok(());
            };
            if !current.leave_running {
                return Ok(());
            }
            current.leave_running = false;
            mailbox.put_if(current).await?;
            Ok(())
        })
        .await
}
