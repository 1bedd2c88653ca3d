//! Worker control loops ("workflows").
//!
//! Each worker slot gets one long-lived [`ControlLoop`] that takes jobs off
//! the regional work queue and hands them to the worker through the mailbox,
//! then parks on a task token until the worker asks for more.
//!
//! - [`token`]: task-token registry and parked continuations
//! - [`dispatch`]: the get-start-delete step run in `Dispatching`
//! - [`control_loop`]: the state machine itself
//!
//! Workers talk to their loop only through [`ControlPlane`].

pub mod control_loop;
pub mod dispatch;
pub mod token;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::TimingConfig;
use crate::error::{CycloneError, Result};
use crate::mailbox::MailboxStore;
use crate::queue::{QueueAddress, WorkQueue};
use crate::retry::RetryPolicy;

pub use control_loop::{ControlLoop, ExitReason, LoopExit, LoopState};
pub use token::{TaskOutcome, TaskSignal, TaskToken, TaskTokenRegistry, WorkerReport};

/// The worker-facing surface of the control loops.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Start the loop of a freshly created slot. Counts as its first request.
    async fn start_execution(&self, slot: Uuid, address: QueueAddress) -> Result<()>;
    async fn send_heartbeat(&self, token: TaskToken) -> Result<()>;
    /// Resolve a parked loop: the worker is done and wants the next job.
    async fn send_success(&self, token: TaskToken, report: WorkerReport) -> Result<()>;
    async fn send_failure(&self, token: TaskToken, error: String) -> Result<()>;
}

/// Everything a control loop needs, shared by all loops of a node.
pub struct LoopContext {
    pub mailbox: Arc<dyn MailboxStore>,
    pub queue: Arc<dyn WorkQueue>,
    pub tokens: TaskTokenRegistry,
    pub timing: TimingConfig,
    pub retry: RetryPolicy,
    pub shutdown: CancellationToken,
    /// Receives the slot of every loop that reached `Draining`, so the
    /// instance behind it can be terminated.
    pub released: Option<mpsc::UnboundedSender<Uuid>>,
}

/// In-process [`ControlPlane`] running every loop as a tokio task.
pub struct Workflows {
    ctx: Arc<LoopContext>,
    loops: Mutex<HashMap<Uuid, JoinHandle<LoopExit>>>,
}

impl Workflows {
    pub fn new(ctx: LoopContext) -> Self {
        Self {
            ctx: Arc::new(ctx),
            loops: Mutex::new(HashMap::new()),
        }
    }

    pub fn tokens(&self) -> &TaskTokenRegistry {
        &self.ctx.tokens
    }

    /// Loops that have not terminated yet.
    pub fn active(&self) -> usize {
        self.loops
            .lock()
            .map(|loops| loops.values().filter(|h| !h.is_finished()).count())
            .unwrap_or(0)
    }

    /// Wait for the loop of `slot` to terminate.
    pub async fn join(&self, slot: Uuid) -> Option<LoopExit> {
        let handle = self.loops.lock().ok()?.remove(&slot)?;
        match handle.await {
            Ok(exit) => Some(exit),
            Err(e) => {
                tracing::error!(slot = %slot, error = %e, "Control loop task failed");
                None
            }
        }
    }
}

#[async_trait]
impl ControlPlane for Workflows {
    async fn start_execution(&self, slot: Uuid, address: QueueAddress) -> Result<()> {
        let mut loops = self
            .loops
            .lock()
            .map_err(|_| CycloneError::Internal("workflow table lock poisoned".into()))?;
        if loops.get(&slot).is_some_and(|h| !h.is_finished()) {
            return Err(CycloneError::Internal(format!(
                "control loop for slot {slot} is already running"
            )));
        }
        tracing::info!(slot = %slot, queue = %address, "Starting control loop");
        let control_loop = ControlLoop::new(self.ctx.clone(), slot, address);
        loops.insert(slot, tokio::spawn(control_loop.run()));
        Ok(())
    }

    async fn send_heartbeat(&self, token: TaskToken) -> Result<()> {
        self.ctx.tokens.signal(token, TaskSignal::Heartbeat)
    }

    async fn send_success(&self, token: TaskToken, report: WorkerReport) -> Result<()> {
        self.ctx.tokens.signal(token, TaskSignal::Success(report))
    }

    async fn send_failure(&self, token: TaskToken, error: String) -> Result<()> {
        self.ctx.tokens.signal(token, TaskSignal::Failure(error))
    }
}
