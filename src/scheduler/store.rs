use async_trait::async_trait;

use crate::error::{CycloneError, Result};
use crate::scheduler::job::{JobRecord, JobStatus};
use crate::store::{ChangeFeed, MemoryTable, Page, PageRequest, WriteConflict};

/// Largest number of records a single batch write may carry.
pub const MAX_BATCH_WRITE: usize = 25;

/// Durable job table, partitioned by queue.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Create a record; fails if the id is already taken in its queue.
    async fn insert(&self, job: JobRecord) -> Result<JobRecord>;

    async fn get(&self, queue: &str, id: &str) -> Result<Option<JobRecord>>;

    /// Unconditional write.
    async fn put(&self, job: JobRecord) -> Result<JobRecord>;

    /// Write only if the stored record still has `job.version`.
    async fn put_if(&self, job: JobRecord) -> Result<JobRecord>;

    async fn delete(&self, queue: &str, id: &str) -> Result<Option<JobRecord>>;

    /// Delete up to [`MAX_BATCH_WRITE`] records in one call.
    async fn delete_batch(&self, queue: &str, ids: &[String]) -> Result<usize>;

    /// Records of a queue in id order, optionally restricted to one status.
    async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        page: PageRequest,
    ) -> Result<Page<JobRecord>>;

    /// Secondary index on `jobDefinition`.
    async fn query_by_definition(
        &self,
        queue: &str,
        definition: &str,
        page: PageRequest,
    ) -> Result<Page<JobRecord>>;

    /// Secondary index on `jobName`, ordered by name.
    async fn query_by_name_prefix(
        &self,
        queue: &str,
        prefix: &str,
        page: PageRequest,
    ) -> Result<Page<JobRecord>>;

    fn subscribe(&self) -> ChangeFeed<JobRecord>;
}

type JobKey = (String, String);

fn job_key(queue: &str, id: &str) -> JobKey {
    (queue.to_string(), id.to_string())
}

/// Key of the name index: name first, id as tie breaker.
fn name_index_key(job: &JobRecord) -> String {
    format!("{}\u{1f}{}", job.job_name, job.id)
}

/// Cut one page out of `rows`, which must already be ordered by `key_of`.
fn paginate<F>(rows: Vec<JobRecord>, page: &PageRequest, key_of: F) -> Page<JobRecord>
where
    F: Fn(&JobRecord) -> String,
{
    let limit = page.limit.max(1);
    let mut items: Vec<JobRecord> = rows
        .into_iter()
        .filter(|job| match &page.start_after {
            Some(start) => key_of(job) > *start,
            None => true,
        })
        .take(limit + 1)
        .collect();

    let next = if items.len() > limit {
        items.truncate(limit);
        items.last().map(&key_of)
    } else {
        None
    };

    Page { items, next }
}

/// In-process [`JobStore`].
#[derive(Default)]
pub struct MemoryJobStore {
    table: MemoryTable<JobKey, JobRecord>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }

    fn queue_rows<F>(&self, queue: &str, keep: F) -> Vec<JobRecord>
    where
        F: Fn(&JobRecord) -> bool,
    {
        self.table
            .scan(.., |k, v| k.0 == queue && keep(v))
            .into_iter()
            .map(|(_, v)| v)
            .collect()
    }

    fn conflict(job: &JobRecord, conflict: WriteConflict) -> CycloneError {
        match conflict {
            WriteConflict::Missing => CycloneError::JobNotFound {
                queue: job.job_queue.clone(),
                id: job.id.clone(),
            },
            WriteConflict::Stale => {
                CycloneError::ConditionFailed(format!("{}/{}", job.job_queue, job.id))
            }
            WriteConflict::Exists => CycloneError::JobExists(job.id.clone()),
        }
    }
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: JobRecord) -> Result<JobRecord> {
        let key = job_key(&job.job_queue, &job.id);
        self.table
            .insert(key, job.clone())
            .map_err(|c| Self::conflict(&job, c))
    }

    async fn get(&self, queue: &str, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.table.get(&job_key(queue, id)))
    }

    async fn put(&self, job: JobRecord) -> Result<JobRecord> {
        let key = job_key(&job.job_queue, &job.id);
        Ok(self.table.put(key, job))
    }

    async fn put_if(&self, job: JobRecord) -> Result<JobRecord> {
        let key = job_key(&job.job_queue, &job.id);
        self.table
            .put_if(key, job.clone())
            .map_err(|c| Self::conflict(&job, c))
    }

    async fn delete(&self, queue: &str, id: &str) -> Result<Option<JobRecord>> {
        Ok(self.table.remove(&job_key(queue, id)))
    }

    async fn delete_batch(&self, queue: &str, ids: &[String]) -> Result<usize> {
        if ids.len() > MAX_BATCH_WRITE {
            return Err(CycloneError::InvalidSubmission(format!(
                "batch of {} deletes exceeds the limit of {MAX_BATCH_WRITE}",
                ids.len()
            )));
        }
        Ok(ids
            .iter()
            .filter(|id| self.table.remove(&job_key(queue, id)).is_some())
            .count())
    }

    async fn list(
        &self,
        queue: &str,
        status: Option<JobStatus>,
        page: PageRequest,
    ) -> Result<Page<JobRecord>> {
        let rows = self.queue_rows(queue, |job| status.map_or(true, |s| job.status == s));
        Ok(paginate(rows, &page, |job| job.id.clone()))
    }

    async fn query_by_definition(
        &self,
        queue: &str,
        definition: &str,
        page: PageRequest,
    ) -> Result<Page<JobRecord>> {
        let rows = self.queue_rows(queue, |job| job.job_definition == definition);
        Ok(paginate(rows, &page, |job| job.id.clone()))
    }

    async fn query_by_name_prefix(
        &self,
        queue: &str,
        prefix: &str,
        page: PageRequest,
    ) -> Result<Page<JobRecord>> {
        let mut rows = self.queue_rows(queue, |job| job.job_name.starts_with(prefix));
        rows.sort_by_key(name_index_key);
        Ok(paginate(rows, &page, name_index_key))
    }

    fn subscribe(&self) -> ChangeFeed<JobRecord> {
        self.table.subscribe()
    }
}
