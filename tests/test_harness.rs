//! Test harness for in-process cyclone integration tests.
//!
//! Provides a cluster config with short timers and helpers for spawning a
//! node with an in-memory log sink.

#![allow(dead_code)]

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use cyclone::config::{ClusterConfig, TimingConfig};
use cyclone::logsink::MemoryLogSink;
use cyclone::node::Node;
use cyclone::retry::RetryPolicy;
use cyclone::scheduler::rotation::RegionWeightTable;
use tokio_util::sync::CancellationToken;

pub const REGION_A: &str = "us-east-1";
pub const REGION_B: &str = "eu-west-1";
pub const QUEUE: &str = "research";
pub const DEFINITION: &str = "render";

/// Timers short enough for a test to watch a job go through the whole
/// pipeline in well under a second.
pub fn fast_timing() -> TimingConfig {
    TimingConfig {
        heartbeat_timeout_ms: 2_000,
        agent_heartbeat_interval_ms: 100,
        poll_interval_ms: 20,
        max_idle_polls: 5,
        visibility_timeout_ms: 500,
        receive_wait_ms: 20,
        receive_attempts: 3,
        receive_backoff_ms: 20,
        log_flush_lines: 10,
        log_flush_interval_ms: 50,
        output_tail_lines: 50,
        batch_window_ms: 20,
        batch_max_records: 100,
    }
}

/// Two regions, one queue spread over both, one job definition.
pub fn test_config() -> ClusterConfig {
    ClusterConfig {
        main_region: REGION_A.to_string(),
        regions: vec![REGION_A.to_string(), REGION_B.to_string()],
        timing: fast_timing(),
        retry: RetryPolicy::new(3, Duration::from_millis(10)),
        ..ClusterConfig::default()
    }
    .with_queue(
        QUEUE,
        RegionWeightTable::from_fixed([(REGION_A, 1), (REGION_B, 1)]),
    )
    .with_definition(DEFINITION, 2)
}

/// Handle to a started node and the sink it logs into.
pub struct TestNode {
    pub node: Node,
    pub sink: Arc<MemoryLogSink>,
}

impl TestNode {
    pub async fn start(config: ClusterConfig) -> Self {
        let sink = Arc::new(MemoryLogSink::new());
        let mut node = Node::new(config, sink.clone(), CancellationToken::new())
            .expect("Test config should be valid");
        node.start().expect("Node should start");
        Self { node, sink }
    }

    pub async fn shutdown(self) {
        self.node.stop().await;
    }
}

/// Poll `check` every 10ms until it yields a value or `timeout` passes.
pub async fn wait_until<T, F, Fut>(timeout: Duration, mut check: F) -> Option<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(value) = check().await {
            return Some(value);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    None
}
