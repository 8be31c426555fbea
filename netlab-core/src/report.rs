//! Deployment reports
//!
//! The report distinguishes nodes that were attempted and failed (with the
//! original error) from nodes that were never attempted because a
//! dependency failed, and records the outcome of every link.

use crate::error::{NetlabError, NetlabResult};
use crate::exec::{ExecCollection, ExecOutputFormat};
use crate::stages::Stage;
use crate::state_machine::{DeploymentState, Phase};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::Duration;

fn serialize_error<S: Serializer>(error: &Arc<NetlabError>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&error.to_string())
}

/// Why a node ended up failed
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "cause", rename_all = "kebab-case")]
pub enum FailureCause {
    /// A hook ran and failed
    Attempted {
        phase: Phase,
        #[serde(serialize_with = "serialize_error")]
        error: Arc<NetlabError>,
    },
    /// Never attempted: a dependency failed before reaching `stage`
    Blocked { dependency: String, stage: Stage },
    /// Stopped by cancellation, deadline or a strict-mode abort
    Cancelled { phase: Option<Phase> },
}

impl FailureCause {
    pub fn is_blocked(&self) -> bool {
        matches!(self, FailureCause::Blocked { .. })
    }

    pub fn error(&self) -> Option<&NetlabError> {
        match self {
            FailureCause::Attempted { error, .. } => Some(error),
            _ => None,
        }
    }

    /// One-line human description
    pub fn describe(&self) -> String {
        match self {
            FailureCause::Attempted { phase, error } => format!("{} failed: {}", phase, error),
            FailureCause::Blocked { dependency, stage } => {
                format!("blocked-by-dependency: {} did not reach {}", dependency, stage)
            }
            FailureCause::Cancelled { phase: Some(phase) } => format!("cancelled during {}", phase),
            FailureCause::Cancelled { phase: None } => "cancelled".to_string(),
        }
    }
}

/// Final state of one node
#[derive(Debug, Clone, Serialize)]
pub struct NodeReport {
    pub name: String,
    pub kind: String,
    pub container: String,
    pub state: DeploymentState,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mgmt_ipv4_address: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub mgmt_ipv6_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureCause>,
}

impl NodeReport {
    pub fn is_ready(&self) -> bool {
        self.state == DeploymentState::Ready
    }
}

/// What happened to a link
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "kebab-case")]
pub enum LinkOutcome {
    Wired,
    Failed {
        #[serde(serialize_with = "serialize_error")]
        error: Arc<NetlabError>,
    },
    /// One side never became wiring-ready
    NotAttempted { reason: String },
    Unwired,
}

/// Outcome of one link
#[derive(Debug, Clone, Serialize)]
pub struct LinkReport {
    pub id: String,
    pub endpoints: [String; 2],
    #[serde(flatten)]
    pub outcome: LinkOutcome,
}

/// Whole-lab result
#[derive(Debug, Clone, Serialize)]
pub struct LabReport {
    pub lab: String,
    pub nodes: BTreeMap<String, NodeReport>,
    pub links: Vec<LinkReport>,
    #[serde(skip_serializing_if = "ExecCollection::is_empty")]
    pub exec: ExecCollection,
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
}

impl LabReport {
    pub fn new(lab: impl Into<String>) -> Self {
        Self {
            lab: lab.into(),
            nodes: BTreeMap::new(),
            links: Vec::new(),
            exec: ExecCollection::new(),
            duration: Duration::ZERO,
        }
    }

    pub fn node(&self, name: &str) -> Option<&NodeReport> {
        self.nodes.get(name)
    }

    pub fn link(&self, id: &str) -> Option<&LinkReport> {
        self.links.iter().find(|l| l.id == id)
    }

    /// Every node ready and every link wired
    pub fn is_success(&self) -> bool {
        self.nodes.values().all(NodeReport::is_ready)
            && self.links.iter().all(|l| matches!(l.outcome, LinkOutcome::Wired))
    }

    /// Nodes that ran a hook which failed
    pub fn failed_nodes(&self) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| matches!(n.failure, Some(FailureCause::Attempted { .. })))
            .map(|n| n.name.as_str())
            .collect()
    }

    /// Nodes never attempted because a dependency failed
    pub fn blocked_nodes(&self) -> Vec<&str> {
        self.nodes
            .values()
            .filter(|n| n.failure.as_ref().map(FailureCause::is_blocked).unwrap_or(false))
            .map(|n| n.name.as_str())
            .collect()
    }

    pub fn render(&self, format: ExecOutputFormat) -> NetlabResult<String> {
        match format {
            ExecOutputFormat::Json => Ok(serde_json::to_string_pretty(self)?),
            ExecOutputFormat::Plain => Ok(self.render_plain()),
        }
    }

    fn render_plain(&self) -> String {
        let name_width = self.nodes.keys().map(String::len).max().unwrap_or(4).max(4);
        let mut out = String::new();
        let _ = writeln!(out, "lab {} ({:?})", self.lab, self.duration);
        let _ = writeln!(out, "{:<name_width$}  {:<12}  {:<18}  DETAIL", "NODE", "KIND", "STATE");
        for node in self.nodes.values() {
            let detail = node
                .failure
                .as_ref()
                .map(FailureCause::describe)
                .unwrap_or_else(|| node.mgmt_ipv4_address.clone());
            let _ = writeln!(
                out,
                "{:<name_width$}  {:<12}  {:<18}  {}",
                node.name, node.kind, node.state, detail
            );
        }
        for link in &self.links {
            let outcome = match &link.outcome {
                LinkOutcome::Wired => "wired".to_string(),
                LinkOutcome::Unwired => "unwired".to_string(),
                LinkOutcome::Failed { error } => format!("failed: {}", error),
                LinkOutcome::NotAttempted { reason } => format!("not attempted: {}", reason),
            };
            let _ = writeln!(out, "link {} <-> {}: {}", link.endpoints[0], link.endpoints[1], outcome);
        }
        out
    }
}
