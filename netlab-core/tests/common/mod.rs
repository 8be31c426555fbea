// Common test utilities for the orchestrator integration tests

#![allow(dead_code)]

use netlab_core::config::ReadinessConfig;
use netlab_core::link::RecordingNetlink;
use netlab_core::node::NodeConfig;
use netlab_core::runtime::MockRuntime;
use netlab_core::test_helpers::{scripted_registry, EventLog, SCRIPTED_BRIDGE_KIND, SCRIPTED_KIND};
use netlab_core::{LabDefinition, NetlabConfig, Orchestrator};
use std::sync::{Arc, Once};
use std::time::Duration;
use tempfile::TempDir;

static TRACING: Once = Once::new();

/// Route logs to the test output; `RUST_LOG` selects what is shown
pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Everything a scripted lab run touches
pub struct TestLab {
    pub log: Arc<EventLog>,
    pub runtime: Arc<MockRuntime>,
    pub netlink: Arc<RecordingNetlink>,
    pub dir: TempDir,
}

impl TestLab {
    pub fn new() -> Self {
        init_tracing();
        Self {
            log: EventLog::new(),
            runtime: Arc::new(MockRuntime::new()),
            netlink: Arc::new(RecordingNetlink::new()),
            dir: TempDir::new().expect("temp dir"),
        }
    }

    pub fn orchestrator(&self, config: NetlabConfig) -> Orchestrator {
        Orchestrator::new(
            Arc::new(scripted_registry(self.log.clone())),
            self.runtime.clone(),
            self.netlink.clone(),
            config,
        )
    }

    /// Empty lab whose directory lives in the temp dir
    pub fn lab(&self, name: &str) -> LabDefinition {
        LabDefinition::new(name).with_lab_dir(self.dir.path().join(name))
    }
}

/// Readiness bounds short enough for tests
pub fn fast_config() -> NetlabConfig {
    NetlabConfig::default().with_readiness(ReadinessConfig::fixed(
        Duration::from_millis(10),
        Duration::from_secs(2),
    ))
}

pub fn scripted(name: &str) -> NodeConfig {
    NodeConfig::new(name, SCRIPTED_KIND).with_image("alpine:3")
}

pub fn scripted_bridge(name: &str) -> NodeConfig {
    NodeConfig::new(name, SCRIPTED_BRIDGE_KIND)
}

/// `{ phase: message }` for the `fail` extra
pub fn failing(cfg: NodeConfig, phase: &str, message: &str) -> NodeConfig {
    cfg.with_extra("fail", phase_map(phase, serde_json::json!(message)))
}

/// `{ phase: ms }` for the `delay-ms` extra
pub fn delayed(cfg: NodeConfig, phase: &str, ms: u64) -> NodeConfig {
    cfg.with_extra("delay-ms", phase_map(phase, serde_json::json!(ms)))
}

fn phase_map(phase: &str, value: serde_json::Value) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    map.insert(phase.to_string(), value);
    serde_json::Value::Object(map)
}
