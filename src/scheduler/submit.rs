use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{CycloneError, Result};
use crate::scheduler::job::{JobRecord, JobSpec};
use crate::scheduler::store::{JobStore, MAX_BATCH_WRITE};
use crate::store::PageRequest;

/// Page size used when walking the name index for prefix deletes.
const PREFIX_PAGE: usize = 100;

/// Result of an array submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArraySubmission {
    pub group_id: String,
    pub ids: Vec<String>,
}

/// Client-facing entry point into the Job Store.
#[derive(Clone)]
pub struct JobSubmitter {
    jobs: Arc<dyn JobStore>,
}

impl JobSubmitter {
    pub fn new(jobs: Arc<dyn JobStore>) -> Self {
        Self { jobs }
    }

    fn validate(spec: &JobSpec) -> Result<()> {
        if spec.job_queue.trim().is_empty() {
            return Err(CycloneError::InvalidSubmission("jobQueue is required".into()));
        }
        if spec.job_definition.trim().is_empty() {
            return Err(CycloneError::InvalidSubmission(
                "jobDefinition is required".into(),
            ));
        }
        Ok(())
    }

    pub async fn submit(&self, spec: JobSpec) -> Result<String> {
        Self::validate(&spec)?;
        let job = self.jobs.insert(JobRecord::new(spec)).await?;
        tracing::info!(job_id = %job.id, queue = %job.job_queue, definition = %job.job_definition, "Job submitted");
        Ok(job.id)
    }

    /// One record per params map, sharing a group id. Every key of a map is
    /// replaced by its value in the record's commands.
    pub async fn submit_array(
        &self,
        spec: JobSpec,
        params: &[BTreeMap<String, String>],
    ) -> Result<ArraySubmission> {
        Self::validate(&spec)?;
        if params.is_empty() {
            return Err(CycloneError::InvalidSubmission(
                "array submission needs at least one params entry".into(),
            ));
        }

        let group_id = Uuid::new_v4().to_string();
        let created = Utc::now();
        let mut ids = Vec::with_capacity(params.len());
        for (n, replacements) in params.iter().enumerate() {
            let mut member = spec.clone();
            member.commands = apply_params(&spec.commands, replacements);
            let id = format!("{group_id}--{}", n + 1);
            let mut job = JobRecord::with_id(id, member, created);
            job.group_id = Some(group_id.clone());
            ids.push(self.jobs.insert(job).await?.id);
        }

        tracing::info!(group_id = %group_id, jobs = ids.len(), queue = %spec.job_queue, "Array job submitted");
        Ok(ArraySubmission { group_id, ids })
    }

    pub async fn delete(&self, queue: &str, id: &str) -> Result<bool> {
        let deleted = self.jobs.delete(queue, id).await?.is_some();
        if deleted {
            tracing::info!(job_id = %id, queue, "Job deleted");
        }
        Ok(deleted)
    }

    /// Delete every job of `queue` whose name starts with `prefix`.
    pub async fn delete_by_name_prefix(&self, queue: &str, prefix: &str) -> Result<usize> {
        let mut deleted = 0;
        loop {
            // Deleted rows drop out of the index, so the first page is
            // always the next one.
            let page = self
                .jobs
                .query_by_name_prefix(queue, prefix, PageRequest::first(PREFIX_PAGE))
                .await?;
            if page.items.is_empty() {
                break;
            }
            let ids: Vec<String> = page.items.into_iter().map(|job| job.id).collect();
            let mut removed = 0;
            for batch in ids.chunks(MAX_BATCH_WRITE) {
                removed += self.jobs.delete_batch(queue, batch).await?;
            }
            if removed == 0 {
                break;
            }
            deleted += removed;
        }
        tracing::info!(queue, prefix, deleted, "Jobs deleted by name prefix");
        Ok(deleted)
    }
}

pub fn apply_params(commands: &str, params: &BTreeMap<String, String>) -> String {
    params
        .iter()
        .fold(commands.to_string(), |acc, (key, value)| acc.replace(key.as_str(), value))
}

/// Values carried by `#HYPER` lines of a job script.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScriptDirectives {
    pub job_name: Option<String>,
    pub job_queue: Option<String>,
    pub job_definition: Option<String>,
    pub retries: Option<u32>,
}

impl ScriptDirectives {
    /// Scan a script for `#HYPER -n|-q|-d|-r <value>` lines.
    pub fn parse(script: &str) -> Result<Self> {
        let mut directives = Self::default();
        for line in script.lines() {
            let Some(rest) = line.trim().strip_prefix("#HYPER") else {
                continue;
            };
            let Some((flag, value)) = rest.trim().split_once(char::is_whitespace) else {
                continue;
            };
            let value = value.trim().to_string();
            match flag {
                "-n" => directives.job_name = Some(value),
                "-q" => directives.job_queue = Some(value),
                "-d" => directives.job_definition = Some(value),
                "-r" => {
                    let retries = value.parse().map_err(|_| {
                        CycloneError::InvalidSubmission(format!("bad retry count {value:?}"))
                    })?;
                    directives.retries = Some(retries);
                }
                other => tracing::warn!(flag = other, "Ignoring unknown #HYPER directive"),
            }
        }
        Ok(directives)
    }

    /// Values set on `self` win over those in `script`.
    pub fn overriding(self, script: ScriptDirectives) -> Self {
        Self {
            job_name: self.job_name.or(script.job_name),
            job_queue: self.job_queue.or(script.job_queue),
            job_definition: self.job_definition.or(script.job_definition),
            retries: self.retries.or(script.retries),
        }
    }

    /// Build the job spec for `script`, with `explicit` taking precedence
    /// over the script's own directives.
    pub fn into_spec(script: &str, explicit: ScriptDirectives) -> Result<JobSpec> {
        let merged = explicit.overriding(Self::parse(script)?);
        let job_queue = merged
            .job_queue
            .ok_or_else(|| CycloneError::InvalidSubmission("no queue given (#HYPER -q)".into()))?;
        let job_definition = merged.job_definition.ok_or_else(|| {
            CycloneError::InvalidSubmission("no job definition given (#HYPER -d)".into())
        })?;
        Ok(JobSpec {
            job_name: merged.job_name,
            job_queue,
            job_definition,
            commands: script.to_string(),
            retries: merged.retries.unwrap_or(0),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn directives_are_read_from_script() {
        let script = "#!/bin/sh\n#HYPER -n nightly\n#HYPER -q research\n#HYPER -d render\n#HYPER -r 2\necho hi\n";
        let spec = ScriptDirectives::into_spec(script, ScriptDirectives::default()).unwrap();
        assert_eq!(spec.job_name.as_deref(), Some("nightly"));
        assert_eq!(spec.job_queue, "research");
        assert_eq!(spec.job_definition, "render");
        assert_eq!(spec.retries, 2);
        assert_eq!(spec.commands, script);
    }

    #[test]
    fn explicit_values_override_directives() {
        let script = "#HYPER -q research\n#HYPER -d render\n";
        let explicit = ScriptDirectives {
            job_queue: Some("urgent".into()),
            retries: Some(5),
            ..Default::default()
        };
        let spec = ScriptDirectives::into_spec(script, explicit).unwrap();
        assert_eq!(spec.job_queue, "urgent");
        assert_eq!(spec.job_definition, "render");
        assert_eq!(spec.retries, 5);
    }

    #[test]
    fn missing_queue_is_rejected() {
        let err = ScriptDirectives::into_spec("#HYPER -d render\n", ScriptDirectives::default())
            .unwrap_err();
        assert!(matches!(err, CycloneError::InvalidSubmission(_)));
    }

    #[test]
    fn params_replace_every_key() {
        let params = BTreeMap::from([
            ("SEED".to_string(), "7".to_string()),
            ("OUT".to_string(), "/tmp/x".to_string()),
        ]);
        assert_eq!(
            apply_params("run --seed SEED > OUT; echo SEED", &params),
            "run --seed 7 > /tmp/x; echo 7"
        );
    }
}
