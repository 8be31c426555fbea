//! Command handlers of the `netlab` binary
//!
//! Handlers return the text to print so they can be tested without a
//! terminal.

use anyhow::Context;
use netlab_core::exec::ExecOutputFormat;
use netlab_core::link::{LinkEndpointType, RecordingNetlink};
use netlab_core::runtime::MockRuntime;
use netlab_core::{KindRegistry, LabDefinition, LabPlan, NetlabConfig, Orchestrator};
use serde::Serialize;
use std::fmt::Write as _;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// One row of `netlab kinds`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct KindSummary {
    pub name: String,
    pub aliases: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interface_format: Option<String>,
    pub vm_based: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub endpoint_type: Option<LinkEndpointType>,
}

pub fn summarize_kinds(registry: &KindRegistry) -> Vec<KindSummary> {
    registry
        .entries()
        .iter()
        .map(|entry| {
            let hints = entry.platform_hints();
            KindSummary {
                name: entry.canonical_name().to_string(),
                aliases: entry.names().iter().skip(1).cloned().collect(),
                username: entry.credentials().map(|c| c.username.clone()),
                interface_format: entry.interface_name_format().map(str::to_string),
                vm_based: hints.vm_based,
                endpoint_type: hints.endpoint_type,
            }
        })
        .collect()
}

/// Render the kinds of `registry`
pub fn kinds(registry: &KindRegistry, format: ExecOutputFormat) -> anyhow::Result<String> {
    let summaries = summarize_kinds(registry);
    match format {
        ExecOutputFormat::Json => Ok(serde_json::to_string_pretty(&summaries)?),
        ExecOutputFormat::Plain => {
            let width = summaries.iter().map(|s| s.name.len()).max().unwrap_or(0);
            let mut out = String::new();
            for s in &summaries {
                let mut notes = Vec::new();
                if !s.aliases.is_empty() {
                    notes.push(format!("aliases: {}", s.aliases.join(", ")));
                }
                if let Some(format) = &s.interface_format {
                    notes.push(format!("interfaces: {}", format));
                }
                if s.vm_based {
                    notes.push("vm".to_string());
                }
                writeln!(out, "{:<width$}  {}", s.name, notes.join("; "), width = width)?;
            }
            Ok(out)
        }
    }
}

/// Pre-flight a lab manifest without touching a container runtime or the kernel
pub async fn preflight(
    registry: Arc<KindRegistry>,
    manifest: &Path,
    config: NetlabConfig,
) -> anyhow::Result<LabPlan> {
    let lab = LabDefinition::from_file(manifest)
        .with_context(|| format!("failed to load lab manifest {}", manifest.display()))?;
    debug!(lab = %lab.name, nodes = lab.nodes.len(), links = lab.links.len(), "manifest loaded");

    let orchestrator = Orchestrator::new(
        registry,
        Arc::new(MockRuntime::new()),
        Arc::new(RecordingNetlink::new()),
        config,
    );
    let plan = orchestrator
        .preflight(&lab)
        .await
        .with_context(|| format!("lab {:?} failed pre-flight", lab.name))?;
    info!(lab = %plan.lab, stages = plan.order.len(), "pre-flight passed");
    Ok(plan)
}

/// Render a pre-flight plan
pub fn render_plan(plan: &LabPlan, format: ExecOutputFormat) -> anyhow::Result<String> {
    match format {
        ExecOutputFormat::Json => Ok(serde_json::to_string_pretty(plan)?),
        ExecOutputFormat::Plain => {
            let mut out = String::new();
            writeln!(out, "lab {}", plan.lab)?;
            writeln!(out, "stages:")?;
            for (i, (node, stage)) in plan.order.iter().enumerate() {
                writeln!(out, "  {:>3}. {}:{}", i + 1, node, stage)?;
            }
            if !plan.links.is_empty() {
                writeln!(out, "links:")?;
                for link in &plan.links {
                    writeln!(out, "  {}", link)?;
                }
            }
            Ok(out)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_summaries_follow_registry_order() {
        let registry = netlab_kinds::build_registry().unwrap();
        let summaries = summarize_kinds(&registry);

        let srl = summaries.iter().find(|s| s.name == "srl").unwrap();
        assert_eq!(srl.aliases, vec!["nokia_srlinux".to_string()]);
        assert_eq!(srl.username.as_deref(), Some("admin"));
        assert_eq!(srl.interface_format.as_deref(), Some("e1-{n}"));

        let bridge = summaries.iter().find(|s| s.name == "bridge").unwrap();
        assert_eq!(bridge.endpoint_type, Some(LinkEndpointType::Bridge));
        assert!(bridge.username.is_none());
    }

    #[test]
    fn test_plain_kinds_lists_vm_kinds() {
        let registry = netlab_kinds::build_registry().unwrap();
        let out = kinds(&registry, ExecOutputFormat::Plain).unwrap();
        let sros = out.lines().find(|l| l.starts_with("nokia_sros")).unwrap();
        assert!(sros.contains("vr-sros"));
        assert!(sros.ends_with("vm"));
    }
}
