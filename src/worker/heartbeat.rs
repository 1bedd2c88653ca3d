use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::logsink::{ship_or_warn, LogScope, LogSink, LogType};
use crate::mailbox::InstanceInfo;
use crate::workflow::{ControlPlane, TaskToken};

/// One telemetry sample of the worker instance.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricsSample {
    pub cpu_count: usize,
    pub load_1m: f64,
    pub mem_total_mb: u64,
    pub mem_available_mb: u64,
}

impl MetricsSample {
    /// Read from `/proc`; fields that cannot be read stay zero.
    pub fn collect() -> Self {
        let meminfo = std::fs::read_to_string("/proc/meminfo").unwrap_or_default();
        let loadavg = std::fs::read_to_string("/proc/loadavg").unwrap_or_default();
        Self {
            cpu_count: cpu_count(),
            load_1m: loadavg
                .split_whitespace()
                .next()
                .and_then(|v| v.parse().ok())
                .unwrap_or(0.0),
            mem_total_mb: meminfo_kb(&meminfo, "MemTotal") / 1024,
            mem_available_mb: meminfo_kb(&meminfo, "MemAvailable") / 1024,
        }
    }
}

fn cpu_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

fn meminfo_kb(meminfo: &str, field: &str) -> u64 {
    meminfo
        .lines()
        .find_map(|line| line.strip_prefix(field)?.strip_prefix(':'))
        .and_then(|rest| rest.split_whitespace().next())
        .and_then(|kb| kb.parse().ok())
        .unwrap_or(0)
}

/// Static description of this instance for its worker slot.
pub fn detect_instance(region: &str) -> InstanceInfo {
    let sample = MetricsSample::collect();
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|h| h.trim().to_string())
        .unwrap_or_else(|| "localhost".to_string());
    InstanceInfo {
        hostname,
        cpu_count: sample.cpu_count,
        mem_total_mb: sample.mem_total_mb,
        region: region.to_string(),
    }
}

/// Heartbeat sender that periodically keeps the worker's current task token
/// alive and ships a telemetry sample.
pub struct HeartbeatSender {
    interval: Duration,
    control: Arc<dyn ControlPlane>,
    sink: Arc<dyn LogSink>,
    scope: LogScope,
}

impl HeartbeatSender {
    pub fn new(
        interval: Duration,
        control: Arc<dyn ControlPlane>,
        sink: Arc<dyn LogSink>,
        scope: LogScope,
    ) -> Self {
        Self {
            interval,
            control,
            sink,
            scope,
        }
    }

    /// Run until cancelled. `current` carries the token of the job in hand.
    ///
    /// A failed heartbeat on the token that is still current stops
    /// heartbeats for that token only; the next token is picked up normally.
    pub async fn run(self, mut current: watch::Receiver<Option<TaskToken>>, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(self.interval);
        let mut given_up: Option<TaskToken> = None;

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                changed = current.changed() => {
                    if changed.is_err() {
                        // Sender dropped, the agent is gone
                        break;
                    }
                    continue;
                }
                _ = interval.tick() => {}
            }

            let sample = serde_json::to_value(MetricsSample::collect()).unwrap_or_default();
            ship_or_warn(self.sink.as_ref(), vec![self.scope.record(LogType::Metrics, sample)]).await;

            let token = *current.borrow();
            let Some(token) = token else { continue };
            if given_up == Some(token) {
                continue;
            }
            if let Err(e) = self.control.send_heartbeat(token).await {
                if *current.borrow() == Some(token) {
                    tracing::warn!(token = %token, error = %e, "Heartbeat rejected, no more heartbeats for this task");
                    given_up = Some(token);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meminfo_fields_parse() {
        let text = "MemTotal:       16384000 kB\nMemFree:  100 kB\nMemAvailable:    8192000 kB\n";
        assert_eq!(meminfo_kb(text, "MemTotal"), 16_384_000);
        assert_eq!(meminfo_kb(text, "MemAvailable"), 8_192_000);
        assert_eq!(meminfo_kb(text, "Swap"), 0);
    }

    #[test]
    fn instance_carries_region() {
        let info = detect_instance("eu-west-1");
        assert_eq!(info.region, "eu-west-1");
        assert!(info.cpu_count >= 1);
    }
}
