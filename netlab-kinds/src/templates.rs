//! Startup configuration templates
//!
//! Built-in templates are compiled into the binary. User-supplied startup
//! configs are rendered with the same context, so they may reference node
//! variables such as `{{ short_name }}` or `{{ mgmt_ipv4_gateway }}`.

use netlab_core::node::{NodeConfig, PreDeployParams};
use netlab_core::{Credentials, NetlabError, NetlabResult};
use std::path::Path;
use tera::{Context, Tera};

pub const SRL_CONFIG: &str = "srl-config.json";
pub const CEOS_CONFIG: &str = "ceos.cfg";

const BUILTIN: [(&str, &str); 2] = [
    (SRL_CONFIG, include_str!("../templates/srl-config.json")),
    (CEOS_CONFIG, include_str!("../templates/ceos.cfg")),
];

fn template_error(template: &str, error: tera::Error) -> NetlabError {
    // tera keeps the useful part of the message in the source chain
    let mut message = error.to_string();
    let mut source = std::error::Error::source(&error);
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    NetlabError::Template {
        template: template.to_string(),
        message,
    }
}

pub struct Templates {
    tera: Tera,
}

impl Templates {
    pub fn new() -> NetlabResult<Self> {
        let mut tera = Tera::default();
        for (name, content) in BUILTIN {
            tera.add_raw_template(name, content)
                .map_err(|e| template_error(name, e))?;
        }
        Ok(Self { tera })
    }

    pub fn render(&self, template: &str, context: &Context) -> NetlabResult<String> {
        self.tera
            .render(template, context)
            .map_err(|e| template_error(template, e))
    }

    /// Render a user-supplied startup config file
    pub fn render_file(path: &Path, context: &Context) -> NetlabResult<String> {
        let content = std::fs::read_to_string(path)?;
        Tera::one_off(&content, context, false)
            .map_err(|e| template_error(&path.display().to_string(), e))
    }
}

/// Variables every startup config template can use
pub fn node_context(
    cfg: &NodeConfig,
    credentials: Option<&Credentials>,
    params: &PreDeployParams,
    interfaces: &[String],
) -> Context {
    let mut context = Context::new();
    context.insert("short_name", &cfg.short_name);
    context.insert("long_name", &cfg.long_name);
    context.insert("kind", &cfg.kind);
    context.insert("image", &cfg.image);
    context.insert("topology", &params.topology_name);
    context.insert("mgmt_ipv4_address", &cfg.mgmt_ipv4_address);
    context.insert("mgmt_ipv4_gateway", &cfg.mgmt_ipv4_gateway);
    context.insert("mgmt_ipv6_address", &cfg.mgmt_ipv6_address);
    context.insert("mgmt_ipv6_gateway", &cfg.mgmt_ipv6_gateway);
    context.insert("ssh_pub_keys", &params.ssh_pub_keys);
    context.insert("interfaces", interfaces);
    if let Some(credentials) = credentials {
        context.insert("username", &credentials.username);
        context.insert("password", &credentials.password);
    }
    context
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_templates_parse() {
        assert!(Templates::new().is_ok());
    }

    #[test]
    fn test_user_template_renders_node_variables() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("startup.cfg");
        std::fs::write(&path, "hostname {{ short_name }}\n").unwrap();

        let cfg = NodeConfig::new("leaf1", "ceos");
        let context = node_context(&cfg, None, &PreDeployParams::default(), &[]);
        let rendered = Templates::render_file(&path, &context).unwrap();
        assert_eq!(rendered, "hostname leaf1\n");
    }

    #[test]
    fn test_broken_template_is_reported() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("broken.cfg");
        std::fs::write(&path, "hostname {{ short_name ").unwrap();

        let context = Context::new();
        let err = Templates::render_file(&path, &context).unwrap_err();
        assert!(matches!(err, NetlabError::Template { .. }));
    }
}
