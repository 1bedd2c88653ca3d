//! Job-side scheduling: the Job Store, submission, region routing, fleet
//! sizing and the failure reconciler.

pub mod job;
pub mod reconciler;
pub mod rotation;
pub mod router;
pub mod sizer;
pub mod store;
pub mod submit;

pub use job::{JobPayload, JobRecord, JobSpec, JobStatus};
pub use store::{JobStore, MemoryJobStore};
