//! Per-node deployment state machine
//!
//! ```text
//! Defined -> Initializing -> ConditionsChecked -> PreDeployed -> Deployed
//!         -> PostDeployed -> Ready
//!
//! any state -> Failed | Deleted
//! ```
//!
//! [`NodeStateMachine`] is the only writer of a node's [`DeploymentState`].
//! It runs one hook at a time, bounded by the shared worker semaphore and
//! the run's cancellation token, and classifies hook errors by phase.

use crate::error::{NetlabError, NetlabResult};
use crate::node::Node;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Lifecycle state of one node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DeploymentState {
    #[default]
    Defined,
    Initializing,
    ConditionsChecked,
    PreDeployed,
    Deployed,
    PostDeployed,
    Ready,
    Failed,
    Deleted,
}

impl DeploymentState {
    fn rank(&self) -> u8 {
        match self {
            DeploymentState::Defined => 0,
            DeploymentState::Initializing => 1,
            DeploymentState::ConditionsChecked => 2,
            DeploymentState::PreDeployed => 3,
            DeploymentState::Deployed => 4,
            DeploymentState::PostDeployed => 5,
            DeploymentState::Ready => 6,
            DeploymentState::Failed | DeploymentState::Deleted => u8::MAX,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DeploymentState::Ready | DeploymentState::Failed | DeploymentState::Deleted
        )
    }

    /// Forward-only along the lifecycle; Failed and Deleted from anywhere,
    /// nothing out of Deleted
    pub fn can_transition_to(&self, next: DeploymentState) -> bool {
        match (self, next) {
            (DeploymentState::Deleted, _) => false,
            (_, DeploymentState::Failed | DeploymentState::Deleted) => true,
            (DeploymentState::Failed, _) => false,
            (current, next) => next.rank() == current.rank() + 1,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentState::Defined => "defined",
            DeploymentState::Initializing => "initializing",
            DeploymentState::ConditionsChecked => "conditions-checked",
            DeploymentState::PreDeployed => "pre-deployed",
            DeploymentState::Deployed => "deployed",
            DeploymentState::PostDeployed => "post-deployed",
            DeploymentState::Ready => "ready",
            DeploymentState::Failed => "failed",
            DeploymentState::Deleted => "deleted",
        }
    }
}

impl fmt::Display for DeploymentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.as_str())
    }
}

/// A lifecycle hook invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Phase {
    Init,
    CheckConditions,
    PreDeploy,
    Deploy,
    PostDeploy,
    Readiness,
    Delete,
}

impl Phase {
    /// State entered when the phase succeeds
    pub fn target_state(&self) -> DeploymentState {
        match self {
            Phase::Init => DeploymentState::Initializing,
            Phase::CheckConditions => DeploymentState::ConditionsChecked,
            Phase::PreDeploy => DeploymentState::PreDeployed,
            Phase::Deploy => DeploymentState::Deployed,
            Phase::PostDeploy => DeploymentState::PostDeployed,
            Phase::Readiness => DeploymentState::Ready,
            Phase::Delete => DeploymentState::Deleted,
        }
    }

    /// Readiness polling can last minutes and must not hold a worker slot
    fn uses_worker(&self) -> bool {
        !matches!(self, Phase::Readiness)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::CheckConditions => "check-deployment-conditions",
            Phase::PreDeploy => "pre-deploy",
            Phase::Deploy => "deploy",
            Phase::PostDeploy => "post-deploy",
            Phase::Readiness => "readiness",
            Phase::Delete => "delete",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Drives one node through its phases
#[derive(Clone)]
pub struct NodeStateMachine {
    node: Arc<dyn Node>,
    name: String,
    cancel: CancellationToken,
    workers: Option<Arc<Semaphore>>,
}

impl NodeStateMachine {
    pub fn new(
        node: Arc<dyn Node>,
        name: impl Into<String>,
        cancel: CancellationToken,
        workers: Option<Arc<Semaphore>>,
    ) -> Self {
        Self {
            node,
            name: name.into(),
            cancel,
            workers,
        }
    }

    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> DeploymentState {
        self.node.base().state()
    }

    /// Apply a validated transition
    pub fn transition(&self, next: DeploymentState) -> NetlabResult<()> {
        let current = self.state();
        if !current.can_transition_to(next) {
            return Err(NetlabError::internal(format!(
                "node {}: invalid state transition {} -> {}",
                self.name, current, next
            )));
        }
        debug!(node = %self.name, from = %current, to = %next, "state transition");
        self.node.base().set_state(next);
        Ok(())
    }

    /// Mark the node failed unless it was already deleted
    pub fn fail(&self) {
        if self.state() != DeploymentState::Deleted {
            self.node.base().set_state(DeploymentState::Failed);
        }
    }

    async fn acquire(&self, phase: Phase) -> NetlabResult<Option<OwnedSemaphorePermit>> {
        let Some(workers) = self.workers.clone().filter(|_| phase.uses_worker()) else {
            return Ok(None);
        };
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(NetlabError::cancelled(format!("{} of {}", phase, self.name))),
            permit = workers.acquire_owned() => permit
                .map(Some)
                .map_err(|_| NetlabError::internal("worker pool closed")),
        }
    }

    /// Run `hook` as `phase`.
    ///
    /// On success the node moves to the phase's target state. On error or
    /// cancellation it moves to `Failed` and the error is classified with
    /// [`NetlabError::for_phase`].
    pub async fn run_phase<T, F>(&self, phase: Phase, hook: F) -> NetlabResult<T>
    where
        F: Future<Output = NetlabResult<T>> + Send,
    {
        let result = match self.acquire(phase).await {
            Ok(permit) => {
                let result = tokio::select! {
                    biased;
                    _ = self.cancel.cancelled() => Err(NetlabError::cancelled(format!("{} of {}", phase, self.name))),
                    r = hook => r,
                };
                drop(permit);
                result
            }
            Err(e) => Err(e),
        };

        match result {
            Ok(value) => {
                self.transition(phase.target_state())?;
                Ok(value)
            }
            Err(e) => {
                warn!(node = %self.name, %phase, error = %e, "phase failed");
                self.fail();
                Err(NetlabError::for_phase(phase, &self.name, e))
            }
        }
    }

    /// Delete the node; it ends `Deleted` even when the hook fails
    pub async fn delete(&self) -> NetlabResult<()> {
        let result = self.node.delete().await;
        if let Err(e) = &result {
            warn!(node = %self.name, error = %e, "delete failed, marking node deleted anyway");
        }
        self.node.base().set_state(DeploymentState::Deleted);
        result
    }
}
