//! VM-in-container platforms
//!
//! Each platform boots a router VM inside a launcher container. They share
//! [`VrNode`] and differ only in the static [`VrPlatform`] description:
//! names, default login, the vendor interface alias pattern and how the
//! launcher is started.
//!
//! The node directory holds two directories bind-mounted into the
//! launcher: `config/` with the startup config the VM boots from and
//! `tftpboot/` for images and licenses.

use crate::templates::{node_context, Templates};
use async_trait::async_trait;
use netlab_core::exec::ExecCmd;
use netlab_core::link::{Endpoint, LinkEndpointType};
use netlab_core::node::{
    generic_vm_interface_check, BaseNode, HasCustomInterfaceCheck, HasSaveConfig,
    InterfaceMapping, Node, NodeConfig, NodeOption, PreDeployParams,
};
use netlab_core::{Credentials, NetlabError, NetlabResult};
use std::path::PathBuf;
use tracing::{debug, info, instrument};

/// Launcher connection mode unless the node sets `CONNECTION_MODE`
pub const DEFAULT_CONNECTION_MODE: &str = "tc";

pub const CONFIG_DIR: &str = "config";
pub const TFTPBOOT_DIR: &str = "tftpboot";
pub const STARTUP_CONFIG_FILE: &str = "startup-config.cfg";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LauncherArgs {
    /// `--trace --connection-mode M --hostname H --variant "T"`
    Variant { default_type: &'static str },
    /// `--username U --password P --hostname H --connection-mode M --trace`
    Login,
}

/// Static description of one VM platform
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VrPlatform {
    pub names: &'static [&'static str],
    pub username: &'static str,
    pub password: &'static str,
    /// Vendor alias with a `port` capture group
    pub interface_pattern: &'static str,
    /// Vendor port number that maps to eth1
    pub interface_offset: u32,
    pub interface_help: &'static str,
    /// Format of the n-th data interface, for discovery output
    pub interface_format: &'static str,
    /// CLI command printing the running configuration
    pub show_config: &'static str,
    launcher: LauncherArgs,
}

pub const NOKIA_SROS: VrPlatform = VrPlatform {
    names: &["nokia_sros", "vr-sros", "vr-nokia_sros"],
    username: "admin",
    password: "admin",
    interface_pattern: r"^1/1/(?P<port>\d+)$",
    interface_offset: 1,
    interface_help: "1/1/X (where X >= 1) or ethX (where X >= 1)",
    interface_format: "1/1/{n}",
    show_config: "admin show configuration",
    launcher: LauncherArgs::Variant {
        default_type: "sr-1",
    },
};

pub const JUNIPER_VMX: VrPlatform = VrPlatform {
    names: &["juniper_vmx", "vr-vmx", "vr-juniper_vmx"],
    username: "admin",
    password: "admin@123",
    interface_pattern: r"^(et|xe|ge)-0/0/(?P<port>\d+)$",
    interface_offset: 0,
    interface_help: "(et|xe|ge)-0/0/X (where X >= 0) or ethX (where X >= 1)",
    interface_format: "ge-0/0/{n}",
    show_config: "show configuration | display set",
    launcher: LauncherArgs::Login,
};

pub const ARISTA_VEOS: VrPlatform = VrPlatform {
    names: &["arista_veos", "vr-veos", "vr-arista_veos"],
    username: "admin",
    password: "admin",
    interface_pattern: r"^(Et|Ethernet)1/(?P<port>\d+)$",
    interface_offset: 1,
    interface_help: "Et1/X or Ethernet1/X (where X >= 1) or ethX (where X >= 1)",
    interface_format: "Ethernet1/{n}",
    show_config: "show running-config",
    launcher: LauncherArgs::Login,
};

pub const PLATFORMS: [VrPlatform; 3] = [NOKIA_SROS, JUNIPER_VMX, ARISTA_VEOS];

impl VrPlatform {
    pub fn canonical_name(&self) -> &'static str {
        self.names[0]
    }

    pub fn credentials(&self) -> Credentials {
        Credentials::new(self.username, self.password)
    }

    fn mapping(&self) -> NetlabResult<InterfaceMapping> {
        InterfaceMapping::new(
            self.interface_pattern,
            self.interface_offset,
            self.interface_help,
        )
    }

    fn launcher_cmd(&self, cfg: &NodeConfig, credentials: &Credentials, mode: &str) -> String {
        match self.launcher {
            LauncherArgs::Variant { default_type } => format!(
                "--trace --connection-mode {} --hostname {} --variant {:?}",
                mode,
                cfg.short_name,
                cfg.extra_str("type").unwrap_or(default_type)
            ),
            LauncherArgs::Login => format!(
                "--username {} --password {} --hostname {} --connection-mode {} --trace",
                credentials.username, credentials.password, cfg.short_name, mode
            ),
        }
    }
}

pub struct VrNode {
    base: BaseNode,
    platform: VrPlatform,
}

impl VrNode {
    pub fn new(platform: VrPlatform) -> Self {
        Self {
            base: BaseNode::new(),
            platform,
        }
    }

    pub fn platform(&self) -> &VrPlatform {
        &self.platform
    }

    fn credentials(&self) -> Credentials {
        self.base
            .credentials()
            .unwrap_or_else(|| self.platform.credentials())
    }

    fn startup_config_path(&self) -> PathBuf {
        self.base
            .node_dir()
            .join(CONFIG_DIR)
            .join(STARTUP_CONFIG_FILE)
    }

    /// Ask the VM for its running configuration over ssh from inside the launcher
    fn show_config_cmd(&self) -> ExecCmd {
        let credentials = self.credentials();
        ExecCmd::new([
            "sshpass".to_string(),
            "-p".to_string(),
            credentials.password.clone(),
            "ssh".to_string(),
            "-o".to_string(),
            "StrictHostKeyChecking=no".to_string(),
            format!("{}@localhost", credentials.username),
            self.platform.show_config.to_string(),
        ])
    }
}

#[async_trait]
impl Node for VrNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self, mut cfg: NodeConfig, options: Vec<NodeOption>) -> NetlabResult<()> {
        let credentials = cfg
            .credentials
            .clone()
            .unwrap_or_else(|| self.platform.credentials());

        cfg.env_default("CONNECTION_MODE", DEFAULT_CONNECTION_MODE);
        if self.platform.launcher == LauncherArgs::Login {
            cfg.env_default("USERNAME", credentials.username.clone());
            cfg.env_default("PASSWORD", credentials.password.clone());
        }
        let mode = cfg
            .env
            .get("CONNECTION_MODE")
            .cloned()
            .unwrap_or_else(|| DEFAULT_CONNECTION_MODE.to_string());

        let lab_dir = cfg.lab_dir.clone();
        cfg.bind_default(format!("{}:/{}", lab_dir.join(CONFIG_DIR).display(), CONFIG_DIR));
        cfg.bind_default(format!(
            "{}:/{}",
            lab_dir.join(TFTPBOOT_DIR).display(),
            TFTPBOOT_DIR
        ));
        if mode == "macvtap" {
            cfg.bind_default("/dev:/dev".to_string());
        }
        if cfg.cmd.is_empty() {
            cfg.cmd = self.platform.launcher_cmd(&cfg, &credentials, &mode);
        }
        self.base.init(cfg, options)
    }

    #[instrument(skip_all, fields(node = %self.base.short_name(), platform = self.platform.canonical_name()))]
    async fn pre_deploy(&self, params: &PreDeployParams) -> NetlabResult<()> {
        let dir = self.base.node_dir();
        tokio::fs::create_dir_all(dir.join(CONFIG_DIR)).await?;
        tokio::fs::create_dir_all(dir.join(TFTPBOOT_DIR)).await?;

        let Some(source) = self.base.with_config(|cfg| cfg.startup_config.clone()) else {
            return Ok(());
        };
        let target = self.startup_config_path();
        // a saved configuration survives redeploys
        if tokio::fs::try_exists(&target).await? {
            debug!(path = %target.display(), "keeping saved config");
            return Ok(());
        }
        let credentials = self.credentials();
        let interfaces: Vec<String> = self
            .base
            .endpoints()
            .iter()
            .map(|ep| ep.interface.clone())
            .collect();
        let context = node_context(&self.base.config(), Some(&credentials), params, &interfaces);
        let content = Templates::render_file(&source, &context)?;
        tokio::fs::write(&target, content).await?;
        debug!(path = %target.display(), "partial startup config written");
        Ok(())
    }

    fn map_interface_name(&self, interface: &str) -> NetlabResult<String> {
        let node = self.base.short_name();
        if generic_vm_interface_check(&node, &[Endpoint::new(&node, interface, LinkEndpointType::Vm)]).is_ok() {
            return Ok(interface.to_string());
        }
        match self.platform.mapping()?.map(&node, interface)? {
            Some(mapped) => {
                debug!(node = %node, alias = interface, name = %mapped, "interface alias mapped");
                Ok(mapped)
            }
            None => Err(NetlabError::interface_invalid(
                node,
                interface,
                format!(
                    "could not be mapped to an ethX-based name, expected {}",
                    self.platform.interface_help
                ),
            )),
        }
    }

    fn link_endpoint_type(&self) -> LinkEndpointType {
        LinkEndpointType::Vm
    }

    fn as_save_config(&self) -> Option<&dyn HasSaveConfig> {
        Some(self)
    }

    fn as_custom_interface_check(&self) -> Option<&dyn HasCustomInterfaceCheck> {
        Some(self)
    }
}

#[async_trait]
impl HasSaveConfig for VrNode {
    async fn save_config(&self) -> NetlabResult<()> {
        let node = self.base.short_name();
        let result = self.base.exec(&self.show_config_cmd()).await?;
        if !result.is_success() {
            return Err(NetlabError::SaveConfig {
                node,
                message: format!(
                    "{:?} returned {}: {}",
                    self.platform.show_config,
                    result.return_code,
                    result.stderr.trim()
                ),
            });
        }
        if result.stdout.trim().is_empty() {
            return Err(NetlabError::SaveConfig {
                node,
                message: "the running configuration is empty".to_string(),
            });
        }

        let path = self.startup_config_path();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, &result.stdout)
            .await
            .map_err(|e| NetlabError::SaveConfig {
                node: node.clone(),
                message: format!("failed to write {}: {}", path.display(), e),
            })?;
        info!(node = %node, path = %path.display(), "saved configuration");
        Ok(())
    }
}

impl HasCustomInterfaceCheck for VrNode {
    fn check_interfaces(&self, endpoints: &[Endpoint]) -> NetlabResult<()> {
        generic_vm_interface_check(&self.base.short_name(), endpoints)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    async fn node(platform: VrPlatform) -> VrNode {
        let node = VrNode::new(platform);
        let mut cfg = NodeConfig::new("r1", platform.canonical_name());
        cfg.lab_dir = "/lab/r1".into();
        node.init(cfg, Vec::new()).await.unwrap();
        node
    }

    #[test_case(NOKIA_SROS, "1/1/1", "eth1")]
    #[test_case(NOKIA_SROS, "1/1/4", "eth4")]
    #[test_case(JUNIPER_VMX, "ge-0/0/0", "eth1")]
    #[test_case(JUNIPER_VMX, "xe-0/0/2", "eth3")]
    #[test_case(ARISTA_VEOS, "Ethernet1/1", "eth1")]
    #[test_case(ARISTA_VEOS, "Et1/3", "eth3")]
    #[test_case(ARISTA_VEOS, "eth5", "eth5")]
    #[tokio::test]
    async fn test_alias_mapping(platform: VrPlatform, alias: &str, expected: &str) {
        let node = node(platform).await;
        assert_eq!(node.map_interface_name(alias).unwrap(), expected);
    }

    #[tokio::test]
    async fn test_below_offset_is_rejected() {
        let node = node(NOKIA_SROS).await;
        let err = node.map_interface_name("1/1/0").unwrap_err().to_string();
        assert!(err.contains("1/1/X"));
    }

    #[tokio::test]
    async fn test_unmappable_name_lists_help() {
        let node = node(JUNIPER_VMX).await;
        let err = node.map_interface_name("Ethernet1").unwrap_err().to_string();
        assert!(err.contains("(et|xe|ge)-0/0/X"));
    }

    #[tokio::test]
    async fn test_login_launcher_cmd() {
        let node = node(ARISTA_VEOS).await;
        let cfg = node.base().config();
        assert_eq!(
            cfg.cmd,
            "--username admin --password admin --hostname r1 --connection-mode tc --trace"
        );
        assert_eq!(cfg.env["USERNAME"], "admin");
        assert!(cfg.binds.contains(&"/lab/r1/config:/config".to_string()));
    }

    #[tokio::test]
    async fn test_variant_launcher_cmd_with_macvtap() {
        let platform = NOKIA_SROS;
        let node = VrNode::new(platform);
        let mut cfg = NodeConfig::new("r1", "nokia_sros").with_extra("type", serde_json::json!("sr-2s"));
        cfg.env.insert("CONNECTION_MODE".into(), "macvtap".into());
        node.init(cfg, Vec::new()).await.unwrap();

        let cfg = node.base().config();
        assert_eq!(
            cfg.cmd,
            "--trace --connection-mode macvtap --hostname r1 --variant \"sr-2s\""
        );
        assert!(cfg.binds.contains(&"/dev:/dev".to_string()));
        assert!(!cfg.env.contains_key("USERNAME"));
    }
}
