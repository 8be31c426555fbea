//! Nokia SR Linux
//!
//! Data interfaces are named `e<slot>-<port>` (or `e<slot>-<port>-<breakout>`)
//! inside the container. The CLI names `ethernet-1/1` and `ethernet-1/1/2`
//! are accepted in links and mapped to the kernel form.
//!
//! PreDeploy lays out the node directory:
//!
//! ```text
//! <lab_dir>/<node>/
//!   config/config.json      startup configuration
//!   config/tls/             node certificate, when one was issued
//!   license.key             copied from the `license` extra
//! ```

use crate::templates::{node_context, Templates, SRL_CONFIG};
use async_trait::async_trait;
use netlab_core::exec::ExecCmd;
use netlab_core::link::Endpoint;
use netlab_core::node::{
    BaseNode, Certificate, HasCustomInterfaceCheck, HasSaveConfig, Node, NodeConfig, NodeOption,
    PreDeployParams,
};
use netlab_core::{Credentials, NetlabError, NetlabResult};
use std::path::Path;
use tracing::{debug, info, instrument};

pub const KIND_NAMES: [&str; 2] = ["srl", "nokia_srlinux"];
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "NokiaSrl1!";

const DEFAULT_TYPE: &str = "ixrd2";
const TYPES: [&str; 5] = ["ixr6", "ixr10", "ixrd1", "ixrd2", "ixrd3"];

const CMD: &str = "sudo bash -c 'touch /.dockerenv && /opt/srlinux/bin/sr_linux'";

const SYSCTLS: [(&str, &str); 6] = [
    ("net.ipv4.ip_forward", "0"),
    ("net.ipv6.conf.all.disable_ipv6", "0"),
    ("net.ipv6.conf.all.accept_dad", "0"),
    ("net.ipv6.conf.default.accept_dad", "0"),
    ("net.ipv6.conf.all.autoconf", "0"),
    ("net.ipv6.conf.default.autoconf", "0"),
];

pub const READY_COMMAND: &str = "info from state system app-management application mgmt_server state";
pub const SAVE_COMMAND: &str = "tools system configuration save";

fn sr_cli(command: &str) -> ExecCmd {
    ExecCmd::new(["sr_cli", "-d", command])
}

/// All-digit, non-empty
fn is_index(s: &str) -> bool {
    !s.is_empty() && s.chars().all(|c| c.is_ascii_digit())
}

/// `e1-1` or `e1-1-2`
fn is_kernel_name(name: &str) -> bool {
    let Some(rest) = name.strip_prefix('e') else {
        return false;
    };
    let parts: Vec<&str> = rest.split('-').collect();
    (2..=3).contains(&parts.len()) && parts.iter().all(|p| is_index(p))
}

/// `ethernet-1/1` -> `e1-1`, `ethernet-1/1/2` -> `e1-1-2`
fn map_cli_name(name: &str) -> Option<String> {
    let rest = name.strip_prefix("ethernet-")?;
    let parts: Vec<&str> = rest.split('/').collect();
    if (2..=3).contains(&parts.len()) && parts.iter().all(|p| is_index(p)) {
        Some(format!("e{}", parts.join("-")))
    } else {
        None
    }
}

/// `e1-1` -> `ethernet-1/1`, used in the generated config
fn cli_name(kernel: &str) -> String {
    format!(
        "ethernet-{}",
        kernel.trim_start_matches('e').replace('-', "/")
    )
}

#[derive(Default)]
pub struct SrlNode {
    base: BaseNode,
}

impl SrlNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn config_dir(&self) -> std::path::PathBuf {
        self.base.node_dir().join("config")
    }

    async fn write_certificate(&self, dir: &Path, cert: &Certificate) -> NetlabResult<()> {
        let tls = dir.join("tls");
        tokio::fs::create_dir_all(&tls).await?;
        let name = self.base.short_name();
        tokio::fs::write(tls.join(format!("{}.pem", name)), &cert.cert).await?;
        tokio::fs::write(tls.join(format!("{}-key.pem", name)), &cert.key).await?;
        if let Some(ca) = &cert.ca_cert {
            tokio::fs::write(tls.join("ca.pem"), ca).await?;
        }
        Ok(())
    }

    fn render_startup_config(&self, params: &PreDeployParams) -> NetlabResult<String> {
        let cfg = self.base.config();
        let interfaces: Vec<String> = self
            .base
            .endpoints()
            .iter()
            .map(|ep| cli_name(&ep.interface))
            .collect();
        let credentials = self
            .base
            .credentials()
            .unwrap_or_else(|| Credentials::new(DEFAULT_USERNAME, DEFAULT_PASSWORD));
        let context = node_context(&cfg, Some(&credentials), params, &interfaces);
        match &cfg.startup_config {
            Some(path) => Templates::render_file(path, &context),
            None => Templates::new()?.render(SRL_CONFIG, &context),
        }
    }
}

#[async_trait]
impl Node for SrlNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self, mut cfg: NodeConfig, options: Vec<NodeOption>) -> NetlabResult<()> {
        let node_type = cfg.extra_str("type").unwrap_or(DEFAULT_TYPE).to_string();
        if !TYPES.contains(&node_type.as_str()) {
            return Err(NetlabError::configuration(
                format!("nodes.{}.type", cfg.short_name),
                format!(
                    "wrong node type {:?}, should be any of {}",
                    node_type,
                    TYPES.join(", ")
                ),
            ));
        }

        if cfg.cmd.is_empty() {
            cfg.cmd = CMD.to_string();
        }
        cfg.env_default("SRLINUX", "1");
        for (key, value) in SYSCTLS {
            cfg.sysctls.insert(key.to_string(), value.to_string());
        }

        let lab_dir = cfg.lab_dir.clone();
        if cfg.extra_str("license").is_some() {
            cfg.bind_default(format!(
                "{}:/opt/srlinux/etc/license.key:ro",
                lab_dir.join("license.key").display()
            ));
        }
        cfg.bind_default(format!(
            "{}:/etc/opt/srlinux/:rw",
            lab_dir.join("config").display()
        ));
        self.base.init(cfg, options)
    }

    #[instrument(skip_all, fields(node = %self.base.short_name()))]
    async fn pre_deploy(&self, params: &PreDeployParams) -> NetlabResult<()> {
        let dir = self.config_dir();
        tokio::fs::create_dir_all(&dir).await?;

        let license = self.base.with_config(|cfg| cfg.extra_str("license").map(str::to_string));
        if let Some(license) = license {
            tokio::fs::copy(&license, self.base.node_dir().join("license.key")).await?;
        }
        if let Some(cert) = &params.cert {
            self.write_certificate(&dir, cert).await?;
        }

        let target = dir.join("config.json");
        let user_config = self.base.with_config(|cfg| cfg.startup_config.is_some());
        // without a user startup config, a config saved by an earlier run is kept
        if !user_config && tokio::fs::try_exists(&target).await? {
            debug!(path = %target.display(), "keeping existing config");
            return Ok(());
        }
        let content = self.render_startup_config(params)?;
        tokio::fs::write(&target, content).await?;
        debug!(path = %target.display(), "startup config written");
        Ok(())
    }

    async fn readiness_probe(&self) -> NetlabResult<bool> {
        let result = self.base.exec(&sr_cli(READY_COMMAND)).await?;
        Ok(result.is_success() && result.stdout.contains("running"))
    }

    fn map_interface_name(&self, interface: &str) -> NetlabResult<String> {
        Ok(map_cli_name(interface).unwrap_or_else(|| interface.to_string()))
    }

    fn as_save_config(&self) -> Option<&dyn HasSaveConfig> {
        Some(self)
    }

    fn as_custom_interface_check(&self) -> Option<&dyn HasCustomInterfaceCheck> {
        Some(self)
    }
}

#[async_trait]
impl HasSaveConfig for SrlNode {
    async fn save_config(&self) -> NetlabResult<()> {
        let node = self.base.short_name();
        let result = self.base.exec(&sr_cli(SAVE_COMMAND)).await?;
        if !result.is_success() || !result.stderr.trim().is_empty() {
            return Err(NetlabError::SaveConfig {
                node,
                message: format!(
                    "{:?} returned {}: {}",
                    SAVE_COMMAND,
                    result.return_code,
                    result.stderr.trim()
                ),
            });
        }
        info!(node = %node, output = %result.stdout.trim(), "saved SR Linux configuration");
        Ok(())
    }
}

impl HasCustomInterfaceCheck for SrlNode {
    fn check_interfaces(&self, endpoints: &[Endpoint]) -> NetlabResult<()> {
        for ep in endpoints {
            if !is_kernel_name(&ep.interface) {
                return Err(NetlabError::interface_invalid(
                    &ep.node,
                    &ep.interface,
                    "SR Linux interfaces must be named e<slot>-<port> or ethernet-<slot>/<port>",
                ));
            }
        }
        Ok(())
    }
}
