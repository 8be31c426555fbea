//! Arista cEOS

use crate::templates::{node_context, Templates, CEOS_CONFIG};
use async_trait::async_trait;
use netlab_core::exec::ExecCmd;
use netlab_core::link::Endpoint;
use netlab_core::node::{
    BaseNode, HasCustomInterfaceCheck, HasSaveConfig, InterfaceMapping, Node, NodeConfig,
    NodeOption, PreDeployParams,
};
use netlab_core::{Credentials, NetlabError, NetlabResult};
use rand::Rng;
use tracing::{debug, info, instrument};

pub const KIND_NAMES: [&str; 2] = ["ceos", "arista_ceos"];
pub const DEFAULT_USERNAME: &str = "admin";
pub const DEFAULT_PASSWORD: &str = "admin";

const ENV: [(&str, &str); 8] = [
    ("CEOS", "1"),
    ("EOS_PLATFORM", "ceoslab"),
    ("container", "docker"),
    ("ETBA", "1"),
    ("SKIP_ZEROTOUCH_BARRIER_IN_SYSDBINIT", "1"),
    ("INTFTYPE", "eth"),
    ("MAPETH0", "1"),
    ("MGMT_INTF", "eth0"),
];

const DEFAULT_MGMT_INTERFACE: &str = "Management0";
/// Arista OUI
const MAC_PREFIX: [u8; 3] = [0x00, 0x1c, 0x73];

pub const SAVE_COMMAND: &str = "copy running flash:startup-config";

const ALIAS_PATTERN: &str = r"^(Ethernet|Et)(?P<port>\d+)$";
const ALIAS_HELP: &str = "cEOS interfaces are named eth1, eth2, ... or Ethernet1, Ethernet2, ...";

fn alias_mapping() -> NetlabResult<InterfaceMapping> {
    InterfaceMapping::new(ALIAS_PATTERN, 1, ALIAS_HELP)
}

/// `eth<N>` or `et<N>` with optional sub-interface suffix, N >= 1
fn is_data_interface(name: &str) -> bool {
    let rest = name
        .strip_prefix("eth")
        .or_else(|| name.strip_prefix("et"))
        .unwrap_or_default();
    let mut chars = rest.chars();
    match chars.next() {
        Some(first) if ('1'..='9').contains(&first) => {
            chars.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '.')
        }
        _ => false,
    }
}

fn format_mac(bytes: &[u8; 6]) -> String {
    bytes
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<Vec<_>>()
        .join(":")
}

#[derive(Default)]
pub struct CeosNode {
    base: BaseNode,
}

impl CeosNode {
    pub fn new() -> Self {
        Self::default()
    }

    fn flash_dir(&self) -> std::path::PathBuf {
        self.base.node_dir().join("flash")
    }

    fn render_startup_config(&self, params: &PreDeployParams) -> NetlabResult<String> {
        let cfg = self.base.config();
        let interfaces: Vec<String> = self
            .base
            .endpoints()
            .iter()
            .filter_map(|ep| ep.interface.strip_prefix("eth"))
            .map(|n| format!("Ethernet{}", n))
            .collect();
        let credentials = self
            .base
            .credentials()
            .unwrap_or_else(|| Credentials::new(DEFAULT_USERNAME, DEFAULT_PASSWORD));
        let mut context = node_context(&cfg, Some(&credentials), params, &interfaces);
        context.insert(
            "mgmt_interface",
            cfg.extra_str("mgmt-intf").unwrap_or(DEFAULT_MGMT_INTERFACE),
        );
        match &cfg.startup_config {
            Some(path) => Templates::render_file(path, &context),
            None => Templates::new()?.render(CEOS_CONFIG, &context),
        }
    }

    /// The system MAC is one above the container's base MAC
    fn system_mac() -> String {
        let mut rng = rand::thread_rng();
        let mut mac = [MAC_PREFIX[0], MAC_PREFIX[1], MAC_PREFIX[2], 0, 0, 0];
        rng.fill(&mut mac[3..]);
        mac[5] = mac[5].wrapping_add(1);
        format_mac(&mac)
    }
}

#[async_trait]
impl Node for CeosNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self, mut cfg: NodeConfig, options: Vec<NodeOption>) -> NetlabResult<()> {
        for (key, value) in ENV {
            cfg.env_default(key, value);
        }
        if cfg.cmd.is_empty() {
            let setenv: Vec<String> = cfg
                .env
                .iter()
                .map(|(k, v)| format!("systemd.setenv={}={}", k, v))
                .collect();
            cfg.cmd = format!("/sbin/init {}", setenv.join(" "));
        }
        let flash = cfg.lab_dir.join("flash");
        cfg.bind_default(format!("{}:/mnt/flash/", flash.display()));
        self.base.init(cfg, options)
    }

    #[instrument(skip_all, fields(node = %self.base.short_name()))]
    async fn pre_deploy(&self, params: &PreDeployParams) -> NetlabResult<()> {
        let flash = self.flash_dir();
        tokio::fs::create_dir_all(&flash).await?;

        let startup = flash.join("startup-config");
        let user_config = self.base.with_config(|cfg| cfg.startup_config.is_some());
        if user_config || !tokio::fs::try_exists(&startup).await? {
            let content = self.render_startup_config(params)?;
            tokio::fs::write(&startup, content).await?;
            debug!(path = %startup.display(), "startup config written");
        }

        // boot straight into the startup config instead of zero touch provisioning
        tokio::fs::write(flash.join("zerotouch-config"), "DISABLE=True\n").await?;

        let mac_file = flash.join("system_mac_address");
        if !tokio::fs::try_exists(&mac_file).await? {
            tokio::fs::write(&mac_file, Self::system_mac()).await?;
        }
        Ok(())
    }

    fn map_interface_name(&self, interface: &str) -> NetlabResult<String> {
        let node = self.base.short_name();
        Ok(alias_mapping()?
            .map(&node, interface)?
            .unwrap_or_else(|| interface.to_string()))
    }

    fn as_save_config(&self) -> Option<&dyn HasSaveConfig> {
        Some(self)
    }

    fn as_custom_interface_check(&self) -> Option<&dyn HasCustomInterfaceCheck> {
        Some(self)
    }
}

#[async_trait]
impl HasSaveConfig for CeosNode {
    async fn save_config(&self) -> NetlabResult<()> {
        let node = self.base.short_name();
        let cmd = ExecCmd::new(["Cli", "-p", "15", "-c", SAVE_COMMAND]);
        let result = self.base.exec(&cmd).await?;
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
        info!(
            node = %node,
            path = %self.flash_dir().join("startup-config").display(),
            "saved cEOS configuration"
        );
        Ok(())
    }
}

impl HasCustomInterfaceCheck for CeosNode {
    fn check_interfaces(&self, endpoints: &[Endpoint]) -> NetlabResult<()> {
        match endpoints.iter().find(|ep| !is_data_interface(&ep.interface)) {
            Some(ep) => Err(NetlabError::interface_invalid(&ep.node, &ep.interface, ALIAS_HELP)),
            None => Ok(()),
        }
    }
}
