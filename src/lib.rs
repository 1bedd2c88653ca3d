pub mod api;
pub mod config;
pub mod error;
pub mod logsink;
pub mod mailbox;
pub mod node;
pub mod provision;
pub mod queue;
pub mod retry;
pub mod scheduler;
pub mod shutdown;
pub mod store;
pub mod trigger;
pub mod worker;
pub mod workflow;

pub use error::{CycloneError, Result};
