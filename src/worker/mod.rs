//! Worker agent: the process side of a worker instance.
//!
//! - **Polling**: [`WorkerAgent`] polls its mailbox slot with an
//!   [`IdlePoller`](poll::IdlePoller) and exits after a run of idle polls
//! - **Job execution**: [`JobExecutor`] spawns the job script, streams stdout
//!   to the log sink and keeps the output tail
//! - **Heartbeat**: keeps the current task token alive and ships telemetry
//!
//! # Execution Flow
//!
//! 1. Agent creates its slot and starts its control loop
//! 2. Control loop writes a job onto the slot (`status = Starting`)
//! 3. Agent marks it Running, runs `sh -c <script>`, writes the result
//! 4. Agent resolves the task token, asking for the next job

pub mod agent;
pub mod executor;
pub mod heartbeat;
pub mod output;
pub mod poll;

pub use agent::{AgentDeps, AgentExit, AgentExitReason, WorkerAgent};
pub use executor::{ExecutionResult, JobExecutor};
