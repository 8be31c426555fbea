//! The container host itself

use async_trait::async_trait;
use netlab_core::exec::{ExecCmd, ExecResult};
use netlab_core::link::{LinkEndpointType, Netlink};
use netlab_core::node::{BaseNode, Node, PreDeployParams, RootNamespaceBased};
use netlab_core::{NetlabError, NetlabResult};
use std::path::PathBuf;

pub const KIND_NAMES: [&str; 1] = ["host"];

/// Endpoints of a host node stay in the root namespace as plain veth legs
#[derive(Default)]
pub struct HostNode {
    base: BaseNode,
}

impl HostNode {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Node for HostNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn pre_deploy(&self, _params: &PreDeployParams) -> NetlabResult<()> {
        Ok(())
    }

    async fn deploy(&self) -> NetlabResult<()> {
        Ok(())
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

    /// Commands run on the host through the command executor
    async fn run_exec(&self, cmd: &ExecCmd) -> NetlabResult<ExecResult> {
        let Some((program, args)) = cmd.cmd.split_first() else {
            return Err(NetlabError::configuration("exec", "empty command"));
        };
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.base.executor()?.execute_simple(program, &args).await?;
        Ok(ExecResult::new(cmd).with_output(
            output.status,
            output.stdout_lossy(),
            output.stderr_lossy(),
        ))
    }

    fn link_endpoint_type(&self) -> LinkEndpointType {
        LinkEndpointType::Host
    }

    fn namespace_path(&self) -> Option<PathBuf> {
        None
    }

    fn as_root_namespace(&self) -> Option<&dyn RootNamespaceBased> {
        Some(self)
    }
}

#[async_trait]
impl RootNamespaceBased for HostNode {
    async fn attach_port(&self, _netlink: &dyn Netlink, _port: &str) -> NetlabResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use netlab_core::command::{CommandOutput, MockCommandExecutor};
    use netlab_core::node::{NodeConfig, NodeOption};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_exec_runs_on_host() {
        let executor = MockCommandExecutor::new();
        executor.expect("uname", &["-r"], Ok(CommandOutput::ok("6.1.0\n")));

        let node = HostNode::new();
        node.init(
            NodeConfig::new("host", "host"),
            vec![NodeOption::CommandExecutor(Arc::new(executor.clone()))],
        )
        .await
        .unwrap();

        let result = node.run_exec(&ExecCmd::new(["uname", "-r"])).await.unwrap();
        assert_eq!(result.return_code, 0);
        assert_eq!(result.stdout, "6.1.0\n");
        executor.verify().unwrap();
    }

    #[test]
    fn test_no_namespace() {
        let node = HostNode::new();
        assert!(node.namespace_path().is_none());
        assert_eq!(node.link_endpoint_type(), LinkEndpointType::Host);
    }
}
