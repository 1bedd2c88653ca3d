use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{CycloneError, Result};
use crate::retry::RetryPolicy;
use crate::scheduler::rotation::RegionWeightTable;

/// Configuration for Docker-based job execution.
///
/// When present, job commands run in sandboxed Docker containers instead of
/// directly under `sh -c` on the worker instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Docker image to use for job execution
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "256m")
    pub memory_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "alpine:latest".to_string(),
            network_disabled: true,
            memory_limit: Some("256m".to_string()),
            cpu_limit: Some("0.5".to_string()),
        }
    }
}

/// Timers and thresholds of the dispatch protocol. All durations are in
/// milliseconds so the file format stays flat.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimingConfig {
    /// Control loop gives up on a parked task after this long without a heartbeat.
    pub heartbeat_timeout_ms: u64,
    /// How often the agent heartbeats its current task and samples telemetry.
    pub agent_heartbeat_interval_ms: u64,
    /// Agent mailbox poll interval.
    pub poll_interval_ms: u64,
    /// Consecutive polls without a new job before the agent shuts down.
    pub max_idle_polls: u32,
    /// Work queue visibility timeout for a received message.
    pub visibility_timeout_ms: u64,
    /// Long-poll wait per receive attempt.
    pub receive_wait_ms: u64,
    /// Empty receives tolerated before the control loop drains the worker.
    pub receive_attempts: u32,
    /// Pause between empty receives.
    pub receive_backoff_ms: u64,
    pub log_flush_lines: usize,
    pub log_flush_interval_ms: u64,
    pub output_tail_lines: usize,
    /// Change feeds and dispatch streams are consumed in batches bounded by
    /// this window and record count.
    pub batch_window_ms: u64,
    pub batch_max_records: usize,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 60_000,
            agent_heartbeat_interval_ms: 20_000,
            poll_interval_ms: 1_000,
            max_idle_polls: 10,
            visibility_timeout_ms: 5_000,
            receive_wait_ms: 0,
            receive_attempts: 3,
            receive_backoff_ms: 1_000,
            log_flush_lines: 1_000,
            log_flush_interval_ms: 10_000,
            output_tail_lines: 50,
            batch_window_ms: 1_000,
            batch_max_records: 500,
        }
    }
}

impl TimingConfig {
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.heartbeat_timeout_ms)
    }

    pub fn agent_heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.agent_heartbeat_interval_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_millis(self.visibility_timeout_ms)
    }

    pub fn receive_wait(&self) -> Duration {
        Duration::from_millis(self.receive_wait_ms)
    }

    pub fn receive_backoff(&self) -> Duration {
        Duration::from_millis(self.receive_backoff_ms)
    }

    pub fn log_flush_interval(&self) -> Duration {
        Duration::from_millis(self.log_flush_interval_ms)
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Region weights used to build this queue's rotation list.
    pub regions: RegionWeightTable,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefinitionConfig {
    /// Pending jobs served by one worker instance.
    pub jobs_to_workers_ratio: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Ceiling on concurrently running local worker instances.
    pub max_instances: usize,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self { max_instances: 64 }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub listen_addr: SocketAddr,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8080)),
        }
    }
}

/// Top-level configuration of a cyclone deployment.
///
/// Ratios and weight tables are parsed into typed values once, here, and
/// validated before any component sees them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    pub main_region: String,
    pub regions: Vec<String>,
    pub queues: BTreeMap<String, QueueConfig>,
    pub definitions: BTreeMap<String, DefinitionConfig>,
    pub timing: TimingConfig,
    pub retry: RetryPolicy,
    pub provisioner: ProvisionerConfig,
    pub sandbox: Option<SandboxConfig>,
    pub api: ApiConfig,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            main_region: "us-east-1".to_string(),
            regions: vec!["us-east-1".to_string()],
            queues: BTreeMap::new(),
            definitions: BTreeMap::new(),
            timing: TimingConfig::default(),
            retry: RetryPolicy::default(),
            provisioner: ProvisionerConfig::default(),
            sandbox: None,
            api: ApiConfig::default(),
        }
    }
}

impl ClusterConfig {
    pub fn from_toml_str(data: &str) -> Result<Self> {
        let cfg: Self = toml::from_str(data)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let data = std::fs::read_to_string(path)?;
        Self::from_toml_str(&data)
    }

    pub fn with_queue(mut self, name: impl Into<String>, regions: RegionWeightTable) -> Self {
        self.queues.insert(name.into(), QueueConfig { regions });
        self
    }

    pub fn with_definition(mut self, name: impl Into<String>, jobs_to_workers_ratio: u32) -> Self {
        self.definitions.insert(
            name.into(),
            DefinitionConfig {
                jobs_to_workers_ratio,
            },
        );
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.regions.is_empty() {
            return Err(CycloneError::Config("no regions configured".to_string()));
        }
        if !self.regions.contains(&self.main_region) {
            return Err(CycloneError::Config(format!(
                "main region {} is not in the region list",
                self.main_region
            )));
        }
        for (queue, cfg) in &self.queues {
            if cfg.regions.is_empty() {
                return Err(CycloneError::Config(format!(
                    "queue {queue} has no region weights"
                )));
            }
            for region in cfg.regions.regions() {
                if !self.regions.iter().any(|r| r == region) {
                    return Err(CycloneError::UnknownRegion(format!(
                        "{region} (weight table of queue {queue})"
                    )));
                }
            }
        }
        for (definition, cfg) in &self.definitions {
            if cfg.jobs_to_workers_ratio == 0 {
                return Err(CycloneError::Config(format!(
                    "jobs_to_workers_ratio of {definition} must be at least 1"
                )));
            }
        }
        if self.timing.receive_attempts == 0 || self.timing.max_idle_polls == 0 {
            return Err(CycloneError::Config(
                "receive_attempts and max_idle_polls must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Jobs-to-workers ratio of a job definition.
    pub fn ratio_for(&self, definition: &str) -> Result<u32> {
        match self.definitions.get(definition) {
            Some(cfg) if cfg.jobs_to_workers_ratio >= 1 => Ok(cfg.jobs_to_workers_ratio),
            Some(_) => Err(CycloneError::Config(format!(
                "jobs_to_workers_ratio of {definition} must be at least 1"
            ))),
            None => Err(CycloneError::Config(format!(
                "no jobs_to_workers_ratio configured for definition {definition}"
            ))),
        }
    }

    pub fn weights_for(&self, queue: &str) -> Result<&RegionWeightTable> {
        self.queues
            .get(queue)
            .map(|q| &q.regions)
            .ok_or_else(|| CycloneError::Config(format!("no region weights for queue {queue}")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::rotation::WeightSpec;

    const SAMPLE: &str = r#"
main_region = "us-east-1"
regions = ["us-east-1", "eu-west-1"]

[queues.research.regions]
us-east-1 = 3
eu-west-1 = "auto"

[definitions.render]
jobs_to_workers_ratio = 10

[timing]
heartbeat_timeout_ms = 30000
"#;

    #[test]
    fn sandbox_config_default() {
        let cfg = SandboxConfig::default();
        assert_eq!(cfg.image, "alpine:latest");
        assert!(cfg.network_disabled);
        assert_eq!(cfg.memory_limit.as_deref(), Some("256m"));
        assert_eq!(cfg.cpu_limit.as_deref(), Some("0.5"));
    }

    #[test]
    fn timing_defaults_match_protocol() {
        let t = TimingConfig::default();
        assert_eq!(t.heartbeat_timeout(), Duration::from_secs(60));
        assert_eq!(t.agent_heartbeat_interval(), Duration::from_secs(20));
        assert_eq!(t.poll_interval(), Duration::from_secs(1));
        assert_eq!(t.max_idle_polls, 10);
        assert_eq!(t.receive_attempts, 3);
        assert_eq!(t.log_flush_lines, 1000);
        assert_eq!(t.output_tail_lines, 50);
    }

    #[test]
    fn parses_weights_and_ratios() {
        let cfg = ClusterConfig::from_toml_str(SAMPLE).unwrap();
        let weights = cfg.weights_for("research").unwrap();
        assert_eq!(weights.get("us-east-1"), Some(&WeightSpec::fixed(3)));
        assert_eq!(weights.get("eu-west-1"), Some(&WeightSpec::auto()));
        assert_eq!(cfg.ratio_for("render").unwrap(), 10);
        assert_eq!(cfg.timing.heartbeat_timeout_ms, 30_000);
        // untouched timing fields keep their defaults
        assert_eq!(cfg.timing.poll_interval_ms, 1_000);
    }

    #[test]
    fn missing_ratio_is_config_error() {
        let cfg = ClusterConfig::from_toml_str(SAMPLE).unwrap();
        let err = cfg.ratio_for("unknown").unwrap_err();
        assert!(matches!(err, CycloneError::Config(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn rejects_zero_ratio() {
        let data = SAMPLE.replace("jobs_to_workers_ratio = 10", "jobs_to_workers_ratio = 0");
        assert!(ClusterConfig::from_toml_str(&data).is_err());
    }

    #[test]
    fn rejects_unknown_region_in_weights() {
        let data = SAMPLE.replace("eu-west-1 = \"auto\"", "ap-south-9 = 1");
        let err = ClusterConfig::from_toml_str(&data).unwrap_err();
        assert!(matches!(err, CycloneError::UnknownRegion(_)));
    }

    #[test]
    fn parses_legacy_weight_string() {
        let data = SAMPLE.replace(
            "[queues.research.regions]\nus-east-1 = 3\neu-west-1 = \"auto\"",
            "[queues.research]\nregions = \"{'us-east-1': '3', 'eu-west-1': 'auto'}\"",
        );
        assert_ne!(data, SAMPLE);
        let cfg = ClusterConfig::from_toml_str(&data).unwrap();
        let weights = cfg.weights_for("research").unwrap();
        assert_eq!(weights.get("us-east-1"), Some(&WeightSpec::fixed(3)));
        assert_eq!(weights.get("eu-west-1"), Some(&WeightSpec::auto()));

        let bad = data.replace("'3'", "'lots'");
        assert!(ClusterConfig::from_toml_str(&bad).is_err());
    }

    #[test]
    fn load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cyclone.toml");
        std::fs::write(&path, SAMPLE).unwrap();
        let cfg = ClusterConfig::load(&path).unwrap();
        assert_eq!(cfg.regions.len(), 2);
    }

    #[test]
    fn builder_helpers() {
        let cfg = ClusterConfig::default()
            .with_queue("q", RegionWeightTable::from_fixed([("us-east-1", 1)]))
            .with_definition("d", 4);
        cfg.validate().unwrap();
        assert_eq!(cfg.ratio_for("d").unwrap(), 4);
    }
}
