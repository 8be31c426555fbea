//! Container runtime collaborator
//!
//! netlab never talks to docker, podman or a hypervisor directly. Node hooks
//! reach the runtime through [`ContainerRuntime`], which concrete backends
//! implement outside this crate.
//!
//! ## Contract
//!
//! - `create_container` must not start the container; `start_container`
//!   returns the network namespace handle used for link wiring and, for
//!   runtimes that finish spawning asynchronously (VM launchers), a
//!   [`SpawnHandle`] the orchestrator awaits before wiring and post-deploy.
//! - Every method is cancellation safe: dropping the future must not leave
//!   the runtime in an inconsistent state.

mod mock;

pub use mock::{MockOp, MockRuntime, RuntimeCall};

use crate::error::{NetlabError, NetlabResult};
use crate::exec::{ExecCmd, ExecResult};
use crate::node::config::{NodeConfig, LABEL_LAB_NAME, LABEL_NODE_KIND, LABEL_NODE_LAB_DIR, LABEL_NODE_NAME};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use tokio::sync::oneshot;

/// Management network as seen by the runtime
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MgmtNet {
    pub network: String,
    pub ipv4_gw: Option<String>,
    pub ipv6_gw: Option<String>,
    pub mtu: u32,
}

impl Default for MgmtNet {
    fn default() -> Self {
        Self {
            network: "clab".to_string(),
            ipv4_gw: None,
            ipv6_gw: None,
            mtu: 1500,
        }
    }
}

/// What the runtime needs to create a container
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: String,
    pub entrypoint: String,
    pub env: BTreeMap<String, String>,
    pub binds: Vec<String>,
    pub sysctls: BTreeMap<String, String>,
    pub labels: BTreeMap<String, String>,
    pub network_mode: String,
    pub restart_policy: String,
    pub mgmt_ipv4_address: String,
    pub mgmt_ipv6_address: String,
}

impl ContainerSpec {
    /// Build the spec for a node, adding the lab bookkeeping labels
    pub fn from_config(cfg: &NodeConfig, lab_name: &str) -> Self {
        let mut labels = cfg.labels.clone();
        labels.insert(LABEL_LAB_NAME.to_string(), lab_name.to_string());
        labels.insert(LABEL_NODE_NAME.to_string(), cfg.short_name.clone());
        labels.insert(LABEL_NODE_KIND.to_string(), cfg.kind.clone());
        labels.insert(
            LABEL_NODE_LAB_DIR.to_string(),
            cfg.lab_dir.display().to_string(),
        );

        Self {
            name: cfg.long_name.clone(),
            image: cfg.image.clone(),
            cmd: cfg.cmd.clone(),
            entrypoint: cfg.entrypoint.clone(),
            env: cfg.env.clone(),
            binds: cfg.binds.clone(),
            sysctls: cfg.sysctls.clone(),
            labels,
            network_mode: cfg.network_mode.clone(),
            restart_policy: cfg.restart_policy.clone(),
            mgmt_ipv4_address: cfg.mgmt_ipv4_address.clone(),
            mgmt_ipv6_address: cfg.mgmt_ipv6_address.clone(),
        }
    }
}

/// A container as listed by the runtime
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericContainer {
    pub names: Vec<String>,
    pub id: String,
    pub image: String,
    /// Runtime state, e.g. "created", "running", "exited"
    pub state: String,
    pub labels: BTreeMap<String, String>,
    pub netns_path: Option<PathBuf>,
    pub mgmt_ipv4_address: Option<String>,
    pub mgmt_ipv6_address: Option<String>,
}

impl GenericContainer {
    pub fn is_running(&self) -> bool {
        self.state == "running"
    }
}

/// Filter for [`ContainerRuntime::list_containers`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContainerFilter {
    Name(String),
    Label { key: String, value: Option<String> },
}

impl ContainerFilter {
    pub fn label(key: impl Into<String>, value: impl Into<String>) -> Self {
        ContainerFilter::Label {
            key: key.into(),
            value: Some(value.into()),
        }
    }

    pub fn matches(&self, container: &GenericContainer) -> bool {
        match self {
            ContainerFilter::Name(name) => container.names.iter().any(|n| n == name),
            ContainerFilter::Label { key, value } => match (container.labels.get(key), value) {
                (Some(_), None) => true,
                (Some(found), Some(expected)) => found == expected,
                (None, _) => false,
            },
        }
    }
}

/// Handle resolved when an asynchronously spawning node finished booting
#[derive(Debug)]
pub struct SpawnHandle {
    rx: oneshot::Receiver<NetlabResult<()>>,
}

/// Sending half of a [`SpawnHandle`]
#[derive(Debug)]
pub struct SpawnNotifier {
    tx: oneshot::Sender<NetlabResult<()>>,
}

impl SpawnHandle {
    /// Create a connected notifier/handle pair
    pub fn channel() -> (SpawnNotifier, SpawnHandle) {
        let (tx, rx) = oneshot::channel();
        (SpawnNotifier { tx }, SpawnHandle { rx })
    }

    /// A handle that is already resolved successfully
    pub fn finished() -> SpawnHandle {
        let (notifier, handle) = Self::channel();
        notifier.notify(Ok(()));
        handle
    }

    /// Wait until spawning finished
    pub async fn wait(self) -> NetlabResult<()> {
        self.rx
            .await
            .map_err(|_| NetlabError::runtime("spawn", "spawn notifier dropped without a result"))?
    }
}

impl SpawnNotifier {
    pub fn notify(self, result: NetlabResult<()>) {
        // the receiver may already be gone when the node was cancelled
        let _ = self.tx.send(result);
    }
}

/// Result of starting a container
#[derive(Debug, Default)]
pub struct StartedContainer {
    /// Path of the container's network namespace
    pub netns: Option<PathBuf>,
    pub spawn_finished: Option<SpawnHandle>,
}

/// Abstract interface for container/VM runtimes
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Runtime name, for logs
    fn name(&self) -> &str;

    /// Create (but do not start) a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> NetlabResult<String>;

    /// Start a created container
    async fn start_container(&self, id: &str, node: &str) -> NetlabResult<StartedContainer>;

    /// Execute a command inside a container and wait for the result
    async fn exec(&self, container: &str, cmd: &ExecCmd) -> NetlabResult<ExecResult>;

    /// Execute a command inside a container without waiting for it
    async fn exec_not_wait(&self, container: &str, cmd: &ExecCmd) -> NetlabResult<()>;

    /// Management network settings
    fn mgmt(&self) -> MgmtNet;

    async fn list_containers(&self, filters: &[ContainerFilter]) -> NetlabResult<Vec<GenericContainer>>;

    /// Wait until the named container is running
    async fn wait_for_container_running(&self, name: &str) -> NetlabResult<()>;

    /// Remove a container; removing an unknown container succeeds
    async fn delete_container(&self, name: &str) -> NetlabResult<()>;
}
