//! Resolved lab definition
//!
//! The topology layer hands netlab a fully resolved lab: every node's
//! configuration and the list of links. Nothing here interprets kinds.

use crate::error::{NetlabError, NetlabResult};
use crate::link::LinkDefinition;
use crate::node::NodeConfig;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Everything needed to deploy one lab
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct LabDefinition {
    pub name: String,
    /// Directory holding the node directories; `clab-<name>` when empty
    pub lab_dir: PathBuf,
    /// Node name -> configuration
    pub nodes: BTreeMap<String, NodeConfig>,
    pub links: Vec<LinkDefinition>,
}

impl LabDefinition {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Default::default()
        }
    }

    pub fn with_lab_dir(mut self, lab_dir: impl Into<PathBuf>) -> Self {
        self.lab_dir = lab_dir.into();
        self
    }

    pub fn with_node(mut self, cfg: NodeConfig) -> Self {
        self.nodes.insert(cfg.short_name.clone(), cfg);
        self
    }

    pub fn with_link(mut self, link: LinkDefinition) -> Self {
        self.links.push(link);
        self
    }

    pub fn from_yaml_str(content: &str) -> NetlabResult<Self> {
        let lab: Self = serde_yaml::from_str(content)?;
        lab.validate()?;
        Ok(lab)
    }

    pub fn from_file(path: &Path) -> NetlabResult<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// The effective lab directory
    pub fn lab_dir(&self) -> PathBuf {
        if self.lab_dir.as_os_str().is_empty() {
            PathBuf::from(format!("clab-{}", self.name))
        } else {
            self.lab_dir.clone()
        }
    }

    /// Structural checks that need no kind knowledge
    pub fn validate(&self) -> NetlabResult<()> {
        if self.name.trim().is_empty() {
            return Err(NetlabError::configuration("name", "lab name must not be empty"));
        }
        if self.nodes.is_empty() {
            return Err(NetlabError::configuration("nodes", "lab has no nodes"));
        }
        for (name, cfg) in &self.nodes {
            if cfg.kind.is_empty() {
                return Err(NetlabError::configuration(
                    format!("nodes.{}.kind", name),
                    "kind is required",
                ));
            }
        }
        for link in &self.links {
            let (a, b) = link.pair()?;
            for endpoint in [a, b] {
                if !self.nodes.contains_key(&endpoint.node) {
                    return Err(NetlabError::configuration(
                        "links",
                        format!("endpoint {} refers to unknown node {:?}", endpoint, endpoint.node),
                    ));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stages::{Stage, WaitFor};
    use pretty_assertions::assert_eq;

    const MANIFEST: &str = r#"
name: dc1
nodes:
  spine:
    kind: srl
    image: ghcr.io/nokia/srlinux
  leaf:
    kind: linux
    stages:
      create:
        wait-for:
          - node: spine
            stage: create
links:
  - endpoints: ["spine:e1-1", "leaf:eth1"]
  - endpoints:
      - node: leaf
        interface: eth2
        mac: "aa:c1:ab:00:00:01"
      - spine:e1-2
    mtu: 1500
"#;

    #[test]
    fn test_parse_manifest() {
        let lab = LabDefinition::from_yaml_str(MANIFEST).unwrap();
        assert_eq!(lab.name, "dc1");
        assert_eq!(lab.lab_dir(), PathBuf::from("clab-dc1"));
        assert_eq!(lab.nodes.len(), 2);
        assert_eq!(
            lab.nodes["leaf"].stages.wait_for(Stage::Create),
            &[WaitFor::new("spine", Stage::Create)]
        );
        assert_eq!(lab.links[1].mtu, Some(1500));
        assert_eq!(lab.links[1].endpoints[0].mac.as_deref(), Some("aa:c1:ab:00:00:01"));
    }

    #[test]
    fn test_link_to_unknown_node_rejected() {
        let lab = LabDefinition::new("t")
            .with_node(NodeConfig::new("a", "linux"))
            .with_link(LinkDefinition::new("a:eth1", "ghost:eth1").unwrap());
        assert!(matches!(
            lab.validate(),
            Err(NetlabError::Configuration { .. })
        ));
    }

    #[test]
    fn test_empty_lab_rejected() {
        assert!(LabDefinition::new("t").validate().is_err());
        assert!(LabDefinition::new("")
            .with_node(NodeConfig::new("a", "linux"))
            .validate()
            .is_err());
    }
}
