//! Bridges living in the root namespace
//!
//! Neither kind creates anything: the bridge must exist before the lab is
//! deployed, and links to it become bridge ports. `bridge` is a Linux
//! bridge managed through netlink, `ovs-bridge` an Open vSwitch bridge
//! managed through `ovs-vsctl`.

use async_trait::async_trait;
use netlab_core::command::CommandExecutor;
use netlab_core::exec::{ExecCmd, ExecResult};
use netlab_core::link::{LinkEndpointType, Netlink};
use netlab_core::node::{BaseNode, Node, PostDeployParams, RootNamespaceBased};
use netlab_core::{NetlabError, NetlabResult};
use nix::errno::Errno;
use regex::Regex;
use std::path::PathBuf;
use tracing::{debug, info, instrument};

pub const BRIDGE_KIND_NAMES: [&str; 1] = ["bridge"];
pub const OVS_KIND_NAMES: [&str; 1] = ["ovs-bridge"];

const IPTABLES: &str = "iptables";
const OVS_VSCTL: &str = "ovs-vsctl";
/// Seconds iptables waits for the xtables lock
const XTABLES_WAIT: &str = "5";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeFlavor {
    Linux,
    Ovs,
}

pub struct BridgeNode {
    base: BaseNode,
    flavor: BridgeFlavor,
}

impl BridgeNode {
    pub fn linux() -> Self {
        Self {
            base: BaseNode::new(),
            flavor: BridgeFlavor::Linux,
        }
    }

    pub fn ovs() -> Self {
        Self {
            base: BaseNode::new(),
            flavor: BridgeFlavor::Ovs,
        }
    }

    pub fn flavor(&self) -> BridgeFlavor {
        self.flavor
    }

    /// The bridge is named like the node
    fn bridge_name(&self) -> String {
        self.base.short_name()
    }

    async fn exists(&self, netlink: &dyn Netlink) -> NetlabResult<bool> {
        let name = self.bridge_name();
        match self.flavor {
            BridgeFlavor::Linux => netlink.link_exists(None, &name).await,
            BridgeFlavor::Ovs => {
                // br-exists exits with 2 when the bridge is unknown
                let output = self
                    .base
                    .executor()?
                    .execute_simple(OVS_VSCTL, &["br-exists", &name])
                    .await?;
                match output.status {
                    0 => Ok(true),
                    2 => Ok(false),
                    status => Err(NetlabError::runtime(
                        "ovs-vsctl br-exists",
                        format!("exit status {}: {}", status, output.stderr_lossy().trim()),
                    )),
                }
            }
        }
    }

    fn missing(&self) -> NetlabError {
        let what = match self.flavor {
            BridgeFlavor::Linux => "bridge",
            BridgeFlavor::Ovs => "ovs bridge",
        };
        NetlabError::netlink(
            "bridge-exists",
            Errno::ENODEV as i32,
            format!("could not find {} {:?}", what, self.bridge_name()),
        )
    }

    /// Allow forwarding through the bridge unless a rule for it exists
    async fn install_forward_rule(&self, executor: &dyn CommandExecutor) -> NetlabResult<()> {
        let bridge = self.bridge_name();
        let listing = executor
            .execute_simple(IPTABLES, &["-vL", "FORWARD", "-w", XTABLES_WAIT])
            .await?;

        let pattern = format!("ACCEPT[^\\n]+{}", regex::escape(&bridge));
        let existing = Regex::new(&pattern)
            .map_err(|e| NetlabError::internal(format!("bad forward rule pattern: {}", e)))?;
        if existing.is_match(&listing.stdout_lossy()) {
            debug!(bridge = %bridge, "forwarding rule already present");
            return Ok(());
        }
        if !listing.success {
            return Err(NetlabError::runtime(
                "iptables",
                format!(
                    "failed to list FORWARD rules for bridge {}: {}",
                    bridge,
                    listing.stderr_lossy().trim()
                ),
            ));
        }

        let output = executor
            .execute_simple(
                IPTABLES,
                &["-I", "FORWARD", "-i", &bridge, "-j", "ACCEPT", "-w", XTABLES_WAIT],
            )
            .await?;
        if !output.success {
            return Err(NetlabError::runtime(
                "iptables",
                format!(
                    "unable to create forwarding rule for bridge {}: {}",
                    bridge,
                    output.stderr_lossy().trim()
                ),
            ));
        }
        info!(bridge = %bridge, "forwarding rule installed");
        Ok(())
    }
}

#[async_trait]
impl Node for BridgeNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    #[instrument(skip(self), fields(bridge = %self.bridge_name()))]
    async fn check_deployment_conditions(&self) -> NetlabResult<()> {
        let netlink = self.base.netlink()?;
        if self.exists(netlink.as_ref()).await? {
            Ok(())
        } else {
            Err(self.missing())
        }
    }

    async fn pre_deploy(&self, _params: &netlab_core::node::PreDeployParams) -> NetlabResult<()> {
        Ok(())
    }

    async fn deploy(&self) -> NetlabResult<()> {
        Ok(())
    }

    async fn post_deploy(&self, _params: &PostDeployParams) -> NetlabResult<()> {
        match self.flavor {
            BridgeFlavor::Linux => {
                let executor = self.base.executor()?;
                self.install_forward_rule(executor.as_ref()).await
            }
            BridgeFlavor::Ovs => Ok(()),
        }
    }

    async fn readiness_probe(&self) -> NetlabResult<bool> {
        Ok(true)
    }

    async fn update_config_with_runtime_info(&self) -> NetlabResult<()> {
        Ok(())
    }

    async fn delete(&self) -> NetlabResult<()> {
        Ok(())
    }

    async fn run_exec(&self, cmd: &ExecCmd) -> NetlabResult<ExecResult> {
        Err(NetlabError::configuration(
            format!("nodes.{}.exec", self.bridge_name()),
            format!("exec is not supported for bridge nodes, cannot run {:?}", cmd.cmd_string()),
        ))
    }

    fn link_endpoint_type(&self) -> LinkEndpointType {
        LinkEndpointType::Bridge
    }

    fn namespace_path(&self) -> Option<PathBuf> {
        None
    }

    fn as_root_namespace(&self) -> Option<&dyn RootNamespaceBased> {
        Some(self)
    }
}

#[async_trait]
impl RootNamespaceBased for BridgeNode {
    async fn check_attachable(&self, netlink: &dyn Netlink) -> NetlabResult<()> {
        if self.exists(netlink).await? {
            Ok(())
        } else {
            Err(self.missing())
        }
    }

    async fn attach_port(&self, netlink: &dyn Netlink, port: &str) -> NetlabResult<()> {
        let bridge = self.bridge_name();
        match self.flavor {
            BridgeFlavor::Linux => netlink.link_set_master(port, &bridge).await,
            BridgeFlavor::Ovs => {
                let output = self
                    .base
                    .executor()?
                    .execute_simple(OVS_VSCTL, &["--may-exist", "add-port", &bridge, port])
                    .await?;
                if output.success {
                    Ok(())
                } else {
                    Err(NetlabError::netlink(
                        "ovs-add-port",
                        Errno::EINVAL as i32,
                        format!(
                            "adding {} to ovs bridge {} failed: {}",
                            port,
                            bridge,
                            output.stderr_lossy().trim()
                        ),
                    ))
                }
            }
        }
    }
}
