//! Lifecycle stages and wait-for edges
//!
//! A stage is a named milestone in a node's lifecycle. Other nodes may
//! declare that they must not enter one of their own stages before a target
//! node reached a given stage. Each stage may also carry commands executed
//! inside the node when the stage is entered or left.

use crate::error::{NetlabError, NetlabResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Named milestones, in lifecycle order
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "kebab-case")]
pub enum Stage {
    /// The container/VM exists (reached after Deploy)
    #[default]
    Create,
    /// The node wired the links whose peers were already wiring-ready
    CreateLinks,
    /// Post-deploy configuration finished
    Configure,
    /// The readiness probe succeeded
    Healthy,
    /// The node unit completed successfully
    Exit,
}

impl Stage {
    pub const ALL: [Stage; 5] = [
        Stage::Create,
        Stage::CreateLinks,
        Stage::Configure,
        Stage::Healthy,
        Stage::Exit,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Create => "create",
            Stage::CreateLinks => "create-links",
            Stage::Configure => "configure",
            Stage::Healthy => "healthy",
            Stage::Exit => "exit",
        }
    }

    /// The stage a node passes through right before this one
    pub fn previous(&self) -> Option<Stage> {
        match self {
            Stage::Create => None,
            Stage::CreateLinks => Some(Stage::Create),
            Stage::Configure => Some(Stage::CreateLinks),
            Stage::Healthy => Some(Stage::Configure),
            Stage::Exit => Some(Stage::Healthy),
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = NetlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Stage::ALL
            .into_iter()
            .find(|stage| stage.as_str() == s.trim())
            .ok_or_else(|| NetlabError::UnknownStage {
                stage: s.to_string(),
            })
    }
}

/// Dependency on another node having reached a stage
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WaitFor {
    pub node: String,
    #[serde(default)]
    pub stage: Stage,
}

impl WaitFor {
    pub fn new(node: impl Into<String>, stage: Stage) -> Self {
        Self {
            node: node.into(),
            stage,
        }
    }
}

impl fmt::Display for WaitFor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.stage)
    }
}

/// When a stage command runs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecPhase {
    OnEnter,
    #[default]
    OnExit,
}

/// Command executed inside the node around a stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageExec {
    pub command: String,
    #[serde(default)]
    pub phase: ExecPhase,
}

impl StageExec {
    pub fn new(command: impl Into<String>, phase: ExecPhase) -> Self {
        Self {
            command: command.into(),
            phase,
        }
    }
}

/// Wait-for edges and commands of one stage
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct StageSpec {
    pub wait_for: Vec<WaitFor>,
    pub exec: Vec<StageExec>,
}

impl StageSpec {
    pub fn execs(&self, phase: ExecPhase) -> impl Iterator<Item = &StageExec> {
        self.exec.iter().filter(move |e| e.phase == phase)
    }
}

/// All stages of a node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Stages {
    pub create: StageSpec,
    pub create_links: StageSpec,
    pub configure: StageSpec,
    pub healthy: StageSpec,
    pub exit: StageSpec,
}

impl Stages {
    pub fn get(&self, stage: Stage) -> &StageSpec {
        match stage {
            Stage::Create => &self.create,
            Stage::CreateLinks => &self.create_links,
            Stage::Configure => &self.configure,
            Stage::Healthy => &self.healthy,
            Stage::Exit => &self.exit,
        }
    }

    pub fn get_mut(&mut self, stage: Stage) -> &mut StageSpec {
        match stage {
            Stage::Create => &mut self.create,
            Stage::CreateLinks => &mut self.create_links,
            Stage::Configure => &mut self.configure,
            Stage::Healthy => &mut self.healthy,
            Stage::Exit => &mut self.exit,
        }
    }

    pub fn wait_for(&self, stage: Stage) -> &[WaitFor] {
        &self.get(stage).wait_for
    }

    /// Add a wait-for edge unless an identical one exists
    pub fn add_wait_for(&mut self, stage: Stage, wait_for: WaitFor) {
        let spec = self.get_mut(stage);
        if !spec.wait_for.contains(&wait_for) {
            spec.wait_for.push(wait_for);
        }
    }

    /// Builder form of [`Stages::add_wait_for`]
    pub fn with_wait_for(mut self, stage: Stage, node: impl Into<String>, target: Stage) -> Self {
        self.add_wait_for(stage, WaitFor::new(node, target));
        self
    }

    pub fn with_exec(mut self, stage: Stage, exec: StageExec) -> Self {
        self.get_mut(stage).exec.push(exec);
        self
    }

    /// Merge `other` into `self`; wait-for edges are deduplicated, commands appended
    pub fn merge(&mut self, other: &Stages) {
        for stage in Stage::ALL {
            for wait_for in other.wait_for(stage) {
                self.add_wait_for(stage, wait_for.clone());
            }
            self.get_mut(stage)
                .exec
                .extend(other.get(stage).exec.iter().cloned());
        }
    }

    /// Every (stage, wait-for) pair of this node
    pub fn edges(&self) -> impl Iterator<Item = (Stage, &WaitFor)> {
        Stage::ALL
            .into_iter()
            .flat_map(move |stage| self.wait_for(stage).iter().map(move |w| (stage, w)))
    }

    /// Reject stage commands that cannot run, such as on-enter commands of
    /// `create` (no container exists yet at that point).
    pub fn validate(&self, node: &str) -> NetlabResult<()> {
        if self.create.execs(ExecPhase::OnEnter).next().is_some() {
            return Err(NetlabError::configuration(
                format!("nodes.{}.stages.create", node),
                "on-enter commands are not supported for the create stage",
            ));
        }
        for (stage, spec) in Stage::ALL.into_iter().map(|s| (s, self.get(s))) {
            for exec in &spec.exec {
                crate::exec::ExecCmd::parse(&exec.command).map_err(|e| {
                    NetlabError::configuration(
                        format!("nodes.{}.stages.{}", node, stage),
                        e.to_string(),
                    )
                })?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_stage_parse_and_order() {
        assert_eq!("create-links".parse::<Stage>().unwrap(), Stage::CreateLinks);
        assert!(matches!(
            "boot".parse::<Stage>(),
            Err(NetlabError::UnknownStage { .. })
        ));
        assert!(Stage::Create < Stage::Configure);
        assert_eq!(Stage::Healthy.previous(), Some(Stage::Configure));
        assert_eq!(Stage::Create.previous(), None);
    }

    #[test]
    fn test_merge_deduplicates_wait_for() {
        let mut kind_defaults = Stages::default().with_wait_for(Stage::Create, "a", Stage::Create);
        let user = Stages::default()
            .with_wait_for(Stage::Create, "a", Stage::Create)
            .with_wait_for(Stage::Configure, "b", Stage::Healthy)
            .with_exec(Stage::Healthy, StageExec::new("echo hi", ExecPhase::OnExit));

        kind_defaults.merge(&user);

        assert_eq!(kind_defaults.wait_for(Stage::Create).len(), 1);
        assert_eq!(
            kind_defaults.wait_for(Stage::Configure),
            &[WaitFor::new("b", Stage::Healthy)]
        );
        assert_eq!(kind_defaults.healthy.exec.len(), 1);
        assert_eq!(kind_defaults.edges().count(), 2);
    }

    #[test]
    fn test_deserialize_stages() {
        let stages: Stages = serde_yaml::from_str(
            "create:\n  wait-for:\n    - node: spine\n      stage: healthy\n    - node: other\nconfigure:\n  exec:\n    - command: ip link\n      phase: on-enter\n",
        )
        .unwrap();
        assert_eq!(
            stages.wait_for(Stage::Create),
            &[WaitFor::new("spine", Stage::Healthy), WaitFor::new("other", Stage::Create)]
        );
        assert_eq!(stages.configure.execs(ExecPhase::OnEnter).count(), 1);
    }

    #[test]
    fn test_create_on_enter_rejected() {
        let stages =
            Stages::default().with_exec(Stage::Create, StageExec::new("true", ExecPhase::OnEnter));
        assert!(stages.validate("r1").is_err());

        let stages =
            Stages::default().with_exec(Stage::Create, StageExec::new("true", ExecPhase::OnExit));
        assert!(stages.validate("r1").is_ok());
    }
}
