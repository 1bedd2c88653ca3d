//! Task tokens: resumable handles on parked control loops.
//!
//! A control loop parks by taking a [`ParkedTask`] from the
//! [`TaskTokenRegistry`]; whoever holds the token later resumes it with a
//! success or failure, or keeps it alive with heartbeats.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::{CycloneError, Result};
use crate::mailbox::SlotStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskToken(Uuid);

impl TaskToken {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskToken {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for TaskToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What the worker tells its control loop when asking for the next job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkerReport {
    pub leave_running: bool,
    pub status: Option<SlotStatus>,
    pub job_id: Option<String>,
}

impl WorkerReport {
    pub fn ready() -> Self {
        Self {
            leave_running: true,
            status: None,
            job_id: None,
        }
    }

    pub fn stop() -> Self {
        Self {
            leave_running: false,
            status: None,
            job_id: None,
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskSignal {
    Heartbeat,
    Success(WorkerReport),
    Failure(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TaskOutcome {
    Success(WorkerReport),
    Failure(String),
    /// No heartbeat or resolution arrived within the heartbeat timeout.
    TimedOut,
}

type Pending = HashMap<TaskToken, mpsc::UnboundedSender<TaskSignal>>;

/// Pending continuations, shared by every control loop of a node.
#[derive(Clone, Default)]
pub struct TaskTokenRegistry {
    pending: Arc<Mutex<Pending>>,
}

impl TaskTokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Pending> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Issue a fresh token and the receiver that waits on it.
    pub fn park(&self) -> ParkedTask {
        let token = TaskToken::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(token, tx);
        ParkedTask {
            token,
            rx,
            registry: self.clone(),
        }
    }

    /// Deliver a signal. Success and failure consume the token.
    pub fn signal(&self, token: TaskToken, signal: TaskSignal) -> Result<()> {
        let mut pending = self.lock();
        let delivered = match signal {
            TaskSignal::Heartbeat => pending
                .get(&token)
                .map(|tx| tx.send(TaskSignal::Heartbeat).is_ok()),
            resolution => pending
                .remove(&token)
                .map(|tx| tx.send(resolution).is_ok()),
        };
        match delivered {
            Some(true) => Ok(()),
            Some(false) => {
                pending.remove(&token);
                Err(CycloneError::TaskNotFound(token.to_string()))
            }
            None => Err(CycloneError::TaskNotFound(token.to_string())),
        }
    }

    pub fn is_pending(&self, token: TaskToken) -> bool {
        self.lock().contains_key(&token)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

/// A control loop suspended on a token. Dropping it withdraws the token.
pub struct ParkedTask {
    token: TaskToken,
    rx: mpsc::UnboundedReceiver<TaskSignal>,
    registry: TaskTokenRegistry,
}

impl ParkedTask {
    pub fn token(&self) -> TaskToken {
        self.token
    }

    /// Wait for the token to be resolved. Every heartbeat re-arms the timer.
    pub async fn wait(mut self, heartbeat_timeout: Duration) -> TaskOutcome {
        loop {
            match tokio::time::timeout(heartbeat_timeout, self.rx.recv()).await {
                Ok(Some(TaskSignal::Heartbeat)) => {
                    tracing::trace!(token = %self.token, "Heartbeat received");
                }
                Ok(Some(TaskSignal::Success(report))) => return TaskOutcome::Success(report),
                Ok(Some(TaskSignal::Failure(error))) => return TaskOutcome::Failure(error),
                Ok(None) => return TaskOutcome::Failure("task token abandoned".to_string()),
                Err(_) => return TaskOutcome::TimedOut,
            }
        }
    }
}

impl Drop for ParkedTask {
    fn drop(&mut self) {
        self.registry.lock().remove(&self.token);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn heartbeats_extend_the_wait() {
        let registry = TaskTokenRegistry::new();
        let task = registry.park();
        let token = task.token();

        let signaller = registry.clone();
        tokio::spawn(async move {
            for _ in 0..3 {
                tokio::time::sleep(Duration::from_secs(40)).await;
                signaller.signal(token, TaskSignal::Heartbeat).unwrap();
            }
            signaller
                .signal(token, TaskSignal::Success(WorkerReport::ready()))
                .unwrap();
        });

        let outcome = task.wait(Duration::from_secs(60)).await;
        assert_eq!(outcome, TaskOutcome::Success(WorkerReport::ready()));
        assert!(!registry.is_pending(token));
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out_and_withdraws_token() {
        let registry = TaskTokenRegistry::new();
        let task = registry.park();
        let token = task.token();

        assert_eq!(task.wait(Duration::from_secs(60)).await, TaskOutcome::TimedOut);
        let err = registry.signal(token, TaskSignal::Heartbeat).unwrap_err();
        assert!(matches!(err, CycloneError::TaskNotFound(_)));
    }

    #[test]
    fn resolution_consumes_token() {
        let registry = TaskTokenRegistry::new();
        let task = registry.park();
        let token = task.token();
        registry
            .signal(token, TaskSignal::Failure("boom".into()))
            .unwrap();
        assert!(registry
            .signal(token, TaskSignal::Success(WorkerReport::ready()))
            .is_err());
        drop(task);
        assert!(registry.is_empty());
    }
}
