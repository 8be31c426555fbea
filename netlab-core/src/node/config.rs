//! Per-node materialized configuration

use crate::kind_registry::Credentials;
use crate::stages::Stages;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

/// Label carrying the lab name on every container
pub const LABEL_LAB_NAME: &str = "clab-topo";
/// Label carrying the node short name on every container
pub const LABEL_NODE_NAME: &str = "clab-node-name";
/// Label carrying the node kind on every container
pub const LABEL_NODE_KIND: &str = "clab-node-kind";
/// Label carrying the node's lab directory
pub const LABEL_NODE_LAB_DIR: &str = "clab-node-lab-dir";

/// Fully resolved configuration of one node
///
/// Produced by the topology layer and owned by exactly one node instance.
/// Only the node's own hooks and the orchestrator's management-network
/// injection mutate it.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct NodeConfig {
    /// Name of the node inside the topology
    pub short_name: String,
    /// Container name (filled as `clab-<lab>-<node>` when empty)
    pub long_name: String,
    pub kind: String,
    pub image: String,
    pub cmd: String,
    pub entrypoint: String,
    pub env: BTreeMap<String, String>,
    /// `host-path:container-path[:mode]` bind mounts
    pub binds: Vec<String>,
    pub sysctls: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    /// The node's own directory below the lab directory
    pub lab_dir: PathBuf,
    pub network_mode: String,
    pub mgmt_ipv4_address: String,
    pub mgmt_ipv4_gateway: String,
    pub mgmt_ipv6_address: String,
    pub mgmt_ipv6_gateway: String,
    pub startup_config: Option<PathBuf>,
    /// Seconds to wait before the node is deployed
    pub startup_delay: u64,
    pub restart_policy: String,
    /// Overrides the kind's default credentials
    pub credentials: Option<Credentials>,
    pub stages: Stages,
    /// Commands executed once the node is ready
    pub exec: Vec<String>,
    /// Kind-specific knobs
    pub extras: BTreeMap<String, serde_json::Value>,
}

impl NodeConfig {
    pub fn new(short_name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            short_name: short_name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_stages(mut self, stages: Stages) -> Self {
        self.stages = stages;
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.extras.insert(key.into(), value);
        self
    }

    /// A string extra, if present
    pub fn extra_str(&self, key: &str) -> Option<&str> {
        self.extras.get(key).and_then(|v| v.as_str())
    }

    /// Whether the node shares no network namespace of its own
    pub fn network_mode_none(&self) -> bool {
        self.network_mode.eq_ignore_ascii_case("none")
    }

    /// Add `key=value` only when the user did not set `key`
    pub fn env_default(&mut self, key: &str, value: impl Into<String>) {
        self.env.entry(key.to_string()).or_insert_with(|| value.into());
    }

    /// Add a bind mount unless one already targets the same container path
    pub fn bind_default(&mut self, bind: String) {
        let target = bind.split(':').nth(1).map(str::to_string);
        let exists = self
            .binds
            .iter()
            .any(|b| b.split(':').nth(1).map(str::to_string) == target);
        if !exists {
            self.binds.push(bind);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_do_not_override_user_values() {
        let mut cfg = NodeConfig::new("r1", "linux");
        cfg.env.insert("MODE".into(), "user".into());
        cfg.binds.push("/tmp/a:/etc/config".into());

        cfg.env_default("MODE", "kind");
        cfg.env_default("OTHER", "kind");
        cfg.bind_default("/lab/r1/config:/etc/config:rw".into());
        cfg.bind_default("/lab/r1/flash:/mnt/flash".into());

        assert_eq!(cfg.env["MODE"], "user");
        assert_eq!(cfg.env["OTHER"], "kind");
        assert_eq!(cfg.binds, vec!["/tmp/a:/etc/config", "/lab/r1/flash:/mnt/flash"]);
    }

    #[test]
    fn test_deserialize_kebab_case() {
        let cfg: NodeConfig = serde_yaml::from_str(
            "short-name: leaf1\nkind: srl\nnetwork-mode: none\nstartup-delay: 5\nextras:\n  kvm-device: /dev/null\n",
        )
        .unwrap();
        assert_eq!(cfg.short_name, "leaf1");
        assert!(cfg.network_mode_none());
        assert_eq!(cfg.startup_delay, 5);
        assert_eq!(cfg.extra_str("kvm-device"), Some("/dev/null"));
    }
}
