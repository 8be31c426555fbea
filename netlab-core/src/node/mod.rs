//! Node contract
//!
//! Every node kind implements [`Node`]. Kinds compose a [`BaseNode`] that
//! holds the configuration, endpoints, collaborator handles and runtime
//! results, and override only the hooks whose behavior differs. Optional
//! capabilities are separate traits, queried through the `as_*` accessors
//! instead of downcasting.
//!
//! Hooks take `&self`: nodes are shared as `Arc<dyn Node>` between the
//! node's own unit and the units of its link peers, so mutable state sits
//! behind short-lived locks inside [`BaseNode`].

pub mod base;
pub mod config;
pub mod interface;

pub use base::BaseNode;
pub use config::NodeConfig;
pub use interface::{generic_vm_interface_check, validate_kernel_name, InterfaceMapping};

use crate::command::CommandExecutor;
use crate::error::NetlabResult;
use crate::exec::{ExecCmd, ExecResult};
use crate::kind_registry::Credentials;
use crate::link::{Endpoint, LinkEndpointType, Netlink};
use crate::runtime::{ContainerRuntime, MgmtNet};
use crate::stages::Stages;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

/// Functional options applied by [`Node::init`]
#[derive(Clone)]
pub enum NodeOption {
    Runtime(Arc<dyn ContainerRuntime>),
    Netlink(Arc<dyn Netlink>),
    CommandExecutor(Arc<dyn CommandExecutor>),
    MgmtNet(MgmtNet),
    LabName(String),
    /// Kind default credentials, used when the node config sets none
    DefaultCredentials(Option<Credentials>),
}

impl fmt::Debug for NodeOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeOption::Runtime(r) => write!(f, "Runtime({})", r.name()),
            NodeOption::Netlink(_) => f.write_str("Netlink"),
            NodeOption::CommandExecutor(_) => f.write_str("CommandExecutor"),
            NodeOption::MgmtNet(m) => write!(f, "MgmtNet({:?})", m),
            NodeOption::LabName(n) => write!(f, "LabName({})", n),
            NodeOption::DefaultCredentials(c) => write!(f, "DefaultCredentials({:?})", c),
        }
    }
}

/// TLS material handed to kinds that need a node certificate
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Certificate {
    pub cert: String,
    pub key: String,
    pub ca_cert: Option<String>,
}

impl fmt::Debug for Certificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Certificate")
            .field("cert_len", &self.cert.len())
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Source of node certificates (issuance itself lives outside netlab)
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn load_or_generate(&self, node: &str, lab: &str) -> NetlabResult<Certificate>;
}

/// Inputs of [`Node::pre_deploy`]
#[derive(Debug, Clone, Default)]
pub struct PreDeployParams {
    pub cert: Option<Certificate>,
    pub topology_name: String,
    /// The lab directory (node directories live below it)
    pub lab_dir: PathBuf,
    /// Public keys in authorized_keys format
    pub ssh_pub_keys: Vec<String>,
}

/// Inputs of [`Node::post_deploy`]
#[derive(Debug, Clone, Default)]
pub struct PostDeployParams {
    /// Short names of every other node in the lab
    pub peers: Vec<String>,
}

/// Kinds that can persist their running configuration
#[async_trait]
pub trait HasSaveConfig: Send + Sync {
    /// Must fail when the in-node save command fails
    async fn save_config(&self) -> NetlabResult<()>;
}

/// Kinds with their own interface naming rules
pub trait HasCustomInterfaceCheck: Send + Sync {
    fn check_interfaces(&self, endpoints: &[Endpoint]) -> NetlabResult<()>;
}

/// Kinds that live in the root namespace and never get a container
#[async_trait]
pub trait RootNamespaceBased: Send + Sync {
    /// Checked before any interface is created for a link to this node
    async fn check_attachable(&self, _netlink: &dyn Netlink) -> NetlabResult<()> {
        Ok(())
    }

    /// Attach a wired root-namespace leg to this node
    async fn attach_port(&self, netlink: &dyn Netlink, port: &str) -> NetlabResult<()>;
}

/// The contract every node kind implements
#[async_trait]
pub trait Node: Send + Sync {
    fn base(&self) -> &BaseNode;

    /// Bind the configuration and apply options, exactly once
    async fn init(&self, cfg: NodeConfig, options: Vec<NodeOption>) -> NetlabResult<()> {
        self.base().init(cfg, options)
    }

    /// Host-side preconditions; must not change anything
    async fn check_deployment_conditions(&self) -> NetlabResult<()> {
        Ok(())
    }

    /// Materialize on-disk artifacts below the node's lab directory
    async fn pre_deploy(&self, params: &PreDeployParams) -> NetlabResult<()> {
        self.base().create_node_dir(params).await
    }

    /// Create and start the container
    async fn deploy(&self) -> NetlabResult<()> {
        self.base().deploy_container().await
    }

    async fn post_deploy(&self, _params: &PostDeployParams) -> NetlabResult<()> {
        Ok(())
    }

    /// One readiness check; `Ok(false)` and errors both mean "not yet"
    async fn readiness_probe(&self) -> NetlabResult<bool> {
        self.base().container_running().await
    }

    /// Capture what the runtime assigned, such as management addresses
    async fn update_config_with_runtime_info(&self) -> NetlabResult<()> {
        self.base().update_config_from_runtime().await
    }

    /// Tear down; a no-op for nodes that were never deployed
    async fn delete(&self) -> NetlabResult<()> {
        self.base().delete_container().await
    }

    async fn run_exec(&self, cmd: &ExecCmd) -> NetlabResult<ExecResult> {
        self.base().exec(cmd).await
    }

    async fn save_config(&self) -> NetlabResult<()> {
        match self.as_save_config() {
            Some(capability) => capability.save_config().await,
            None => Ok(()),
        }
    }

    /// Validate every endpoint name of this node
    fn check_interface_name(&self) -> NetlabResult<()> {
        self.check_endpoints(&self.base().endpoints())
    }

    /// Validate one endpoint name
    fn check_endpoint(&self, endpoint: &Endpoint) -> NetlabResult<()> {
        self.check_endpoints(std::slice::from_ref(endpoint))
    }

    fn check_endpoints(&self, endpoints: &[Endpoint]) -> NetlabResult<()> {
        let node = self.base().short_name();
        for endpoint in endpoints {
            validate_kernel_name(&node, &endpoint.interface)?;
        }
        match self.as_custom_interface_check() {
            Some(check) => check.check_interfaces(endpoints),
            None => Ok(()),
        }
    }

    /// Translate vendor aliases to kernel interface names
    fn map_interface_name(&self, interface: &str) -> NetlabResult<String> {
        Ok(interface.to_string())
    }

    /// Register an endpoint of this node, returning it with the mapped name
    fn add_endpoint(&self, endpoint: Endpoint) -> NetlabResult<Endpoint> {
        let interface = self.map_interface_name(&endpoint.interface)?;
        let endpoint = Endpoint {
            interface,
            endpoint_type: self.link_endpoint_type(),
            ..endpoint
        };
        self.base().add_endpoint(endpoint.clone())?;
        Ok(endpoint)
    }

    fn link_endpoint_type(&self) -> LinkEndpointType {
        LinkEndpointType::Veth
    }

    /// Namespace the node's endpoints live in; root-namespace kinds have none
    fn namespace_path(&self) -> Option<PathBuf> {
        self.base().netns()
    }

    /// Stage dependencies the kind always wants
    fn default_stages(&self) -> Stages {
        Stages::default()
    }

    fn as_save_config(&self) -> Option<&dyn HasSaveConfig> {
        None
    }

    fn as_custom_interface_check(&self) -> Option<&dyn HasCustomInterfaceCheck> {
        None
    }

    fn as_root_namespace(&self) -> Option<&dyn RootNamespaceBased> {
        None
    }
}
