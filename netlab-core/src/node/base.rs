//! Shared node state and default hook bodies

use super::{interface::validate_kernel_name, NodeConfig, NodeOption, PreDeployParams};
use crate::command::CommandExecutor;
use crate::error::{NetlabError, NetlabResult};
use crate::exec::{ExecCmd, ExecResult};
use crate::kind_registry::Credentials;
use crate::link::{Endpoint, Netlink};
use crate::runtime::{ContainerFilter, ContainerRuntime, ContainerSpec, MgmtNet, SpawnHandle};
use crate::state_machine::DeploymentState;
use parking_lot::{Mutex, RwLock};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

#[derive(Default)]
struct Collaborators {
    runtime: Option<Arc<dyn ContainerRuntime>>,
    netlink: Option<Arc<dyn Netlink>>,
    executor: Option<Arc<dyn CommandExecutor>>,
    mgmt: MgmtNet,
    lab_name: String,
    default_credentials: Option<Credentials>,
}

#[derive(Default)]
struct RuntimeInfo {
    container_id: Option<String>,
    netns: Option<PathBuf>,
}

/// State every node kind composes
///
/// Locks are never held across an await point.
#[derive(Default)]
pub struct BaseNode {
    config: RwLock<NodeConfig>,
    endpoints: RwLock<Vec<Endpoint>>,
    state: RwLock<DeploymentState>,
    collaborators: RwLock<Collaborators>,
    runtime_info: RwLock<RuntimeInfo>,
    spawn_finished: Mutex<Option<SpawnHandle>>,
    initialized: AtomicBool,
}

impl BaseNode {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind `cfg` and apply `options`; a second call is an error
    pub fn init(&self, mut cfg: NodeConfig, options: Vec<NodeOption>) -> NetlabResult<()> {
        if self.initialized.swap(true, Ordering::SeqCst) {
            return Err(NetlabError::internal(format!(
                "node {} initialized twice",
                cfg.short_name
            )));
        }

        let mut collaborators = self.collaborators.write();
        for option in options {
            match option {
                NodeOption::Runtime(runtime) => collaborators.runtime = Some(runtime),
                NodeOption::Netlink(netlink) => collaborators.netlink = Some(netlink),
                NodeOption::CommandExecutor(executor) => collaborators.executor = Some(executor),
                NodeOption::MgmtNet(mgmt) => collaborators.mgmt = mgmt,
                NodeOption::LabName(name) => collaborators.lab_name = name,
                NodeOption::DefaultCredentials(credentials) => {
                    collaborators.default_credentials = credentials
                }
            }
        }

        if cfg.credentials.is_none() {
            cfg.credentials = collaborators.default_credentials.clone();
        }
        if cfg.long_name.is_empty() {
            cfg.long_name = if collaborators.lab_name.is_empty() {
                cfg.short_name.clone()
            } else {
                format!("clab-{}-{}", collaborators.lab_name, cfg.short_name)
            };
        }

        debug!(node = %cfg.short_name, kind = %cfg.kind, "node initialized");
        *self.config.write() = cfg;
        Ok(())
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::SeqCst)
    }

    /// Snapshot of the configuration
    pub fn config(&self) -> NodeConfig {
        self.config.read().clone()
    }

    pub fn with_config<R>(&self, f: impl FnOnce(&NodeConfig) -> R) -> R {
        f(&self.config.read())
    }

    pub fn update_config(&self, f: impl FnOnce(&mut NodeConfig)) {
        f(&mut self.config.write())
    }

    pub fn short_name(&self) -> String {
        self.config.read().short_name.clone()
    }

    pub fn long_name(&self) -> String {
        self.config.read().long_name.clone()
    }

    pub fn kind(&self) -> String {
        self.config.read().kind.clone()
    }

    /// The node's directory below the lab directory
    pub fn node_dir(&self) -> PathBuf {
        self.config.read().lab_dir.clone()
    }

    /// Credentials from the node config, falling back to the kind defaults
    pub fn credentials(&self) -> Option<Credentials> {
        self.config
            .read()
            .credentials
            .clone()
            .or_else(|| self.collaborators.read().default_credentials.clone())
    }

    pub fn lab_name(&self) -> String {
        self.collaborators.read().lab_name.clone()
    }

    pub fn mgmt(&self) -> MgmtNet {
        self.collaborators.read().mgmt.clone()
    }

    pub fn runtime(&self) -> NetlabResult<Arc<dyn ContainerRuntime>> {
        self.collaborators.read().runtime.clone().ok_or_else(|| {
            NetlabError::internal(format!("node {} has no container runtime", self.short_name()))
        })
    }

    pub fn netlink(&self) -> NetlabResult<Arc<dyn Netlink>> {
        self.collaborators.read().netlink.clone().ok_or_else(|| {
            NetlabError::internal(format!("node {} has no netlink handle", self.short_name()))
        })
    }

    pub fn executor(&self) -> NetlabResult<Arc<dyn CommandExecutor>> {
        self.collaborators.read().executor.clone().ok_or_else(|| {
            NetlabError::internal(format!("node {} has no command executor", self.short_name()))
        })
    }

    pub fn endpoints(&self) -> Vec<Endpoint> {
        self.endpoints.read().clone()
    }

    /// Register an endpoint; an interface can be used by one link only
    pub fn add_endpoint(&self, endpoint: Endpoint) -> NetlabResult<()> {
        let mut endpoints = self.endpoints.write();
        if endpoints.iter().any(|e| e.interface == endpoint.interface) {
            return Err(NetlabError::configuration(
                "links",
                format!("endpoint {} is used by more than one link", endpoint),
            ));
        }
        endpoints.push(endpoint);
        Ok(())
    }

    pub fn state(&self) -> DeploymentState {
        *self.state.read()
    }

    pub(crate) fn set_state(&self, state: DeploymentState) {
        *self.state.write() = state;
    }

    pub fn container_id(&self) -> Option<String> {
        self.runtime_info.read().container_id.clone()
    }

    pub fn netns(&self) -> Option<PathBuf> {
        self.runtime_info.read().netns.clone()
    }

    pub fn set_netns(&self, netns: Option<PathBuf>) {
        self.runtime_info.write().netns = netns;
    }

    pub fn set_spawn_handle(&self, handle: SpawnHandle) {
        *self.spawn_finished.lock() = Some(handle);
    }

    /// Spawn-finished handle captured by deploy, if any (taken once)
    pub fn take_spawn_handle(&self) -> Option<SpawnHandle> {
        self.spawn_finished.lock().take()
    }

    /// Check all endpoint names against the kernel rules
    pub fn check_kernel_names(&self) -> NetlabResult<()> {
        let node = self.short_name();
        for endpoint in self.endpoints.read().iter() {
            validate_kernel_name(&node, &endpoint.interface)?;
        }
        Ok(())
    }

    /// Create the node directory below the lab directory
    pub async fn create_node_dir(&self, _params: &PreDeployParams) -> NetlabResult<()> {
        let dir = self.node_dir();
        if !dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Default deploy: create and start the container through the runtime
    pub async fn deploy_container(&self) -> NetlabResult<()> {
        let runtime = self.runtime()?;
        let spec = ContainerSpec::from_config(&self.config(), &self.lab_name());
        let node = self.short_name();

        let id = runtime.create_container(&spec).await?;
        self.runtime_info.write().container_id = Some(id.clone());

        let started = runtime.start_container(&id, &node).await?;
        self.runtime_info.write().netns = started.netns;
        if let Some(handle) = started.spawn_finished {
            self.set_spawn_handle(handle);
        }
        info!(node = %node, container = %spec.name, runtime = runtime.name(), "container started");
        Ok(())
    }

    /// Default delete: remove the container if one was created
    pub async fn delete_container(&self) -> NetlabResult<()> {
        if self.container_id().is_none() {
            return Ok(());
        }
        let runtime = self.runtime()?;
        runtime.delete_container(&self.long_name()).await?;
        let mut info = self.runtime_info.write();
        info.container_id = None;
        info.netns = None;
        Ok(())
    }

    pub async fn exec(&self, cmd: &ExecCmd) -> NetlabResult<ExecResult> {
        self.runtime()?.exec(&self.long_name(), cmd).await
    }

    /// Whether the runtime lists the node's container as running
    pub async fn container_running(&self) -> NetlabResult<bool> {
        let containers = self
            .runtime()?
            .list_containers(&[ContainerFilter::Name(self.long_name())])
            .await?;
        Ok(containers.iter().any(|c| c.is_running()))
    }

    /// Fill unset management addresses from what the runtime assigned
    pub async fn update_config_from_runtime(&self) -> NetlabResult<()> {
        let containers = self
            .runtime()?
            .list_containers(&[ContainerFilter::Name(self.long_name())])
            .await?;
        let Some(container) = containers.into_iter().next() else {
            return Ok(());
        };

        self.update_config(|cfg| {
            if cfg.mgmt_ipv4_address.is_empty() {
                if let Some(addr) = container.mgmt_ipv4_address.clone() {
                    cfg.mgmt_ipv4_address = addr;
                }
            }
            if cfg.mgmt_ipv6_address.is_empty() {
                if let Some(addr) = container.mgmt_ipv6_address.clone() {
                    cfg.mgmt_ipv6_address = addr;
                }
            }
        });
        if self.netns().is_none() {
            self.set_netns(container.netns_path);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::MockRuntime;

    fn options(runtime: Arc<MockRuntime>) -> Vec<NodeOption> {
        vec![
            NodeOption::Runtime(runtime),
            NodeOption::LabName("lab".into()),
            NodeOption::DefaultCredentials(Some(Credentials::new("admin", "admin"))),
        ]
    }

    #[test]
    fn test_init_fills_names_and_credentials_once() {
        let base = BaseNode::new();
        let runtime = Arc::new(MockRuntime::new());
        base.init(NodeConfig::new("r1", "linux"), options(runtime.clone()))
            .unwrap();

        assert_eq!(base.long_name(), "clab-lab-r1");
        assert_eq!(base.credentials().unwrap().password, "admin");
        assert!(base
            .init(NodeConfig::new("r1", "linux"), options(runtime))
            .is_err());
    }

    #[tokio::test]
    async fn test_deploy_and_delete() {
        let base = BaseNode::new();
        let runtime = Arc::new(MockRuntime::new());
        base.init(NodeConfig::new("r1", "linux"), options(runtime.clone()))
            .unwrap();

        // never deployed
        base.delete_container().await.unwrap();
        assert_eq!(runtime.call_count(), 0);

        base.deploy_container().await.unwrap();
        assert!(base.container_running().await.unwrap());
        assert_eq!(base.netns(), Some(PathBuf::from("/run/netns/clab-lab-r1")));

        base.update_config_from_runtime().await.unwrap();
        assert!(!base.config().mgmt_ipv4_address.is_empty());

        base.delete_container().await.unwrap();
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(base.netns(), None);
    }

    #[test]
    fn test_duplicate_endpoint_rejected() {
        let base = BaseNode::new();
        let ep = Endpoint::new("r1", "eth1", crate::link::LinkEndpointType::Veth);
        base.add_endpoint(ep.clone()).unwrap();
        assert!(base.add_endpoint(ep).is_err());
    }
}
