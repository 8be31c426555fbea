//! Plain Linux containers

use async_trait::async_trait;
use netlab_core::link::Endpoint;
use netlab_core::node::{
    BaseNode, HasCustomInterfaceCheck, Node, NodeConfig, NodeOption, PostDeployParams,
};
use netlab_core::{NetlabError, NetlabResult};
use tracing::{debug, instrument, warn};

pub const KIND_NAMES: [&str; 1] = ["linux"];

/// Management interface of every container
const MGMT_INTERFACE: &str = "eth0";

/// Env var telling the container entrypoint how many data interfaces to expect
pub const ENV_INTERFACE_COUNT: &str = "CLAB_INTFS";

#[derive(Default)]
pub struct LinuxNode {
    base: BaseNode,
}

impl LinuxNode {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Node for LinuxNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self, mut cfg: NodeConfig, options: Vec<NodeOption>) -> NetlabResult<()> {
        if cfg.restart_policy.is_empty() {
            cfg.restart_policy = "always".to_string();
        }
        if !cfg.network_mode.eq_ignore_ascii_case("host") {
            cfg.sysctls
                .entry("net.ipv6.conf.all.disable_ipv6".to_string())
                .or_insert_with(|| "0".to_string());
        }
        self.base.init(cfg, options)
    }

    #[instrument(skip(self), fields(node = %self.base.short_name()))]
    async fn deploy(&self) -> NetlabResult<()> {
        // endpoints are only known once every link was resolved
        let count = self.base.endpoints().len();
        self.base
            .update_config(|cfg| cfg.env_default(ENV_INTERFACE_COUNT, count.to_string()));
        self.base.deploy_container().await
    }

    async fn post_deploy(&self, _params: &PostDeployParams) -> NetlabResult<()> {
        let Some(netns) = self.base.netns() else {
            return Ok(());
        };
        if self.base.with_config(|cfg| cfg.network_mode_none()) {
            return Ok(());
        }
        let netlink = self.base.netlink()?;
        // a failure only costs throughput, the node stays usable
        match netlink
            .set_tx_offload(Some(&netns), MGMT_INTERFACE, false)
            .await
        {
            Ok(()) => debug!(node = %self.base.short_name(), "tx offload disabled on eth0"),
            Err(e) => warn!(
                node = %self.base.short_name(),
                error = %e,
                "failed to disable tx offload on eth0"
            ),
        }
        Ok(())
    }

    fn as_custom_interface_check(&self) -> Option<&dyn HasCustomInterfaceCheck> {
        Some(self)
    }
}

impl HasCustomInterfaceCheck for LinuxNode {
    fn check_interfaces(&self, endpoints: &[Endpoint]) -> NetlabResult<()> {
        if self.base.with_config(|cfg| cfg.network_mode_none()) {
            return Ok(());
        }
        match endpoints.iter().find(|ep| ep.interface == MGMT_INTERFACE) {
            Some(ep) => Err(NetlabError::interface_invalid(
                &ep.node,
                &ep.interface,
                "eth0 is the management interface; use it only with network-mode none",
            )),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_core::link::{LinkEndpointType, Netlink, RecordingNetlink};
    use std::path::PathBuf;
    use std::sync::Arc;
    use tracing_test::traced_test;

    #[tokio::test]
    async fn test_init_defaults() {
        let node = LinuxNode::new();
        node.init(NodeConfig::new("h1", "linux"), Vec::new())
            .await
            .unwrap();
        let cfg = node.base().config();
        assert_eq!(cfg.restart_policy, "always");
        assert_eq!(cfg.sysctls["net.ipv6.conf.all.disable_ipv6"], "0");
    }

    #[tokio::test]
    async fn test_host_network_mode_keeps_sysctls_untouched() {
        let node = LinuxNode::new();
        let mut cfg = NodeConfig::new("h1", "linux");
        cfg.network_mode = "host".into();
        cfg.restart_policy = "no".into();
        node.init(cfg, Vec::new()).await.unwrap();

        let cfg = node.base().config();
        assert!(cfg.sysctls.is_empty());
        assert_eq!(cfg.restart_policy, "no");
    }

    #[tokio::test]
    async fn test_eth0_allowed_only_without_network() {
        let eth0 = Endpoint::new("h1", "eth0", LinkEndpointType::Veth);

        let node = LinuxNode::new();
        node.init(NodeConfig::new("h1", "linux"), Vec::new())
            .await
            .unwrap();
        assert!(node.check_endpoint(&eth0).is_err());

        let isolated = LinuxNode::new();
        let mut cfg = NodeConfig::new("h1", "linux");
        cfg.network_mode = "none".into();
        isolated.init(cfg, Vec::new()).await.unwrap();
        assert!(isolated.check_endpoint(&eth0).is_ok());
    }

    #[tokio::test]
    #[traced_test]
    async fn test_tx_offload_failure_only_warns() {
        let netlink: Arc<dyn Netlink> = Arc::new(RecordingNetlink::new());
        let node = LinuxNode::new();
        node.init(
            NodeConfig::new("h1", "linux"),
            vec![NodeOption::Netlink(netlink)],
        )
        .await
        .unwrap();
        // the simulated namespace has no eth0
        node.base()
            .set_netns(Some(PathBuf::from("/run/netns/clab-lab-h1")));

        let params = PostDeployParams { peers: Vec::new() };
        node.post_deploy(&params).await.unwrap();
        assert!(logs_contain("failed to disable tx offload on eth0"));
    }
}
