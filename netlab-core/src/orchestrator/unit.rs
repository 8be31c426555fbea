//! One node's unit of execution
//!
//! A unit walks its node through the lifecycle, blocking on the stage
//! barriers declared for the node between hooks:
//!
//! ```text
//! check-conditions
//!   [create]        pre-deploy, deploy          -> create reached
//!   spawn finished
//!   [create-links]  publish + wire ready peers  -> create-links reached
//!   [configure]     post-deploy                 -> configure reached
//!   [healthy]       readiness probe, exec       -> healthy reached
//!   [exit]                                      -> exit reached
//! ```

use super::board::WiringBoard;
use crate::config::ReadinessConfig;
use crate::dependency::{Barrier, StageSignals, StageStatus};
use crate::error::{NetlabError, NetlabResult};
use crate::exec::{ExecCmd, ExecResult};
use crate::node::{CertificateProvider, Node, PostDeployParams, PreDeployParams};
use crate::readiness::poll_until_ready;
use crate::report::FailureCause;
use crate::runtime::MgmtNet;
use crate::stages::{ExecPhase, Stage, Stages};
use crate::state_machine::{NodeStateMachine, Phase};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// State shared by every unit of a run
pub(crate) struct UnitContext {
    pub(crate) signals: Arc<StageSignals>,
    pub(crate) board: Arc<WiringBoard>,
    pub(crate) workers: Option<Arc<Semaphore>>,
    pub(crate) cancel: CancellationToken,
    pub(crate) mgmt: MgmtNet,
    pub(crate) certificates: Option<Arc<dyn CertificateProvider>>,
    /// Lab-wide pre-deploy inputs; the certificate is filled per node
    pub(crate) pre_deploy: PreDeployParams,
}

/// What a unit reports back
pub(crate) struct UnitOutcome {
    pub(crate) name: String,
    pub(crate) failure: Option<FailureCause>,
    pub(crate) exec: Vec<ExecResult>,
}

pub(crate) struct NodeUnit {
    pub(crate) name: String,
    pub(crate) node: Arc<dyn Node>,
    pub(crate) stages: Stages,
    pub(crate) commands: Vec<ExecCmd>,
    pub(crate) readiness: ReadinessConfig,
    pub(crate) needs_certificate: bool,
    pub(crate) peers: Vec<String>,
    pub(crate) ctx: Arc<UnitContext>,
}

fn phase_failure(phase: Phase) -> impl FnOnce(NetlabError) -> FailureCause {
    move |error| {
        if error.is_cancelled() {
            FailureCause::Cancelled { phase: Some(phase) }
        } else {
            FailureCause::Attempted {
                phase,
                error: Arc::new(error),
            }
        }
    }
}

/// The hook a stage barrier sits in front of
fn gated_phase(stage: Stage) -> Phase {
    match stage {
        Stage::Create => Phase::PreDeploy,
        Stage::CreateLinks => Phase::Deploy,
        Stage::Configure => Phase::PostDeploy,
        Stage::Healthy | Stage::Exit => Phase::Readiness,
    }
}

impl NodeUnit {
    pub(crate) async fn run(self) -> UnitOutcome {
        let sm = NodeStateMachine::new(
            self.node.clone(),
            &self.name,
            self.ctx.cancel.clone(),
            self.ctx.workers.clone(),
        );
        let mut exec = Vec::new();

        let failure = match self.drive(&sm, &mut exec).await {
            Ok(()) => None,
            Err(cause) => {
                sm.fail();
                self.ctx.board.retract(&self.name);
                self.ctx.signals.fail_remaining(&self.name);
                match &cause {
                    FailureCause::Attempted { .. } => error!(cause = %cause.describe(), "node failed"),
                    FailureCause::Blocked { .. } => warn!(cause = %cause.describe(), "node blocked"),
                    FailureCause::Cancelled { .. } => debug!("node unit cancelled"),
                }
                Some(cause)
            }
        };

        UnitOutcome {
            name: self.name,
            failure,
            exec,
        }
    }

    async fn drive(&self, sm: &NodeStateMachine, exec: &mut Vec<ExecResult>) -> Result<(), FailureCause> {
        let node = self.node.as_ref();

        sm.run_phase(Phase::CheckConditions, async {
            node.check_interface_name()?;
            node.check_deployment_conditions().await
        })
        .await
        .map_err(phase_failure(Phase::CheckConditions))?;

        self.enter(Stage::Create, exec).await?;
        self.inject_mgmt();
        sm.run_phase(Phase::PreDeploy, async {
            let params = self.pre_deploy_params().await?;
            node.pre_deploy(&params).await
        })
        .await
        .map_err(phase_failure(Phase::PreDeploy))?;

        self.startup_delay().await?;
        sm.run_phase(Phase::Deploy, async {
            node.deploy().await?;
            node.update_config_with_runtime_info().await
        })
        .await
        .map_err(phase_failure(Phase::Deploy))?;
        self.reach(Stage::Create, exec).await;

        self.await_spawn().await?;

        self.enter(Stage::CreateLinks, exec).await?;
        let wired = self.ctx.board.publish(&self.name).await;
        debug!(wired, "published for wiring");
        self.reach(Stage::CreateLinks, exec).await;

        self.enter(Stage::Configure, exec).await?;
        let params = PostDeployParams {
            peers: self.peers.clone(),
        };
        sm.run_phase(Phase::PostDeploy, node.post_deploy(&params))
            .await
            .map_err(phase_failure(Phase::PostDeploy))?;
        self.reach(Stage::Configure, exec).await;

        self.enter(Stage::Healthy, exec).await?;
        let attempts = sm
            .run_phase(
                Phase::Readiness,
                poll_until_ready(&self.name, &self.readiness, &self.ctx.cancel, move || {
                    node.readiness_probe()
                }),
            )
            .await
            .map_err(phase_failure(Phase::Readiness))?;
        info!(attempts, "node ready");
        self.reach(Stage::Healthy, exec).await;

        for cmd in &self.commands {
            exec.push(self.exec(cmd).await);
        }

        self.enter(Stage::Exit, exec).await?;
        self.reach(Stage::Exit, exec).await;
        Ok(())
    }

    /// Block on the stage's wait-for edges, then run its on-enter commands
    async fn enter(&self, stage: Stage, exec: &mut Vec<ExecResult>) -> Result<(), FailureCause> {
        let waits = self.stages.wait_for(stage);
        if !waits.is_empty() {
            debug!(%stage, waits = waits.len(), "waiting on dependencies");
        }

        match self.ctx.signals.wait_all(waits, &self.ctx.cancel).await {
            Ok(Barrier::Open) => {}
            Ok(Barrier::Blocked(wait_for)) => {
                return Err(FailureCause::Blocked {
                    dependency: wait_for.node,
                    stage: wait_for.stage,
                })
            }
            Err(e) if e.is_cancelled() => return Err(FailureCause::Cancelled { phase: None }),
            Err(e) => return Err(phase_failure(gated_phase(stage))(e)),
        }

        self.run_stage_execs(stage, ExecPhase::OnEnter, exec).await;
        Ok(())
    }

    /// Run the stage's on-exit commands and broadcast that it was reached
    async fn reach(&self, stage: Stage, exec: &mut Vec<ExecResult>) {
        self.run_stage_execs(stage, ExecPhase::OnExit, exec).await;
        self.ctx.signals.signal(&self.name, stage, StageStatus::Reached);
        debug!(%stage, "stage reached");
    }

    async fn run_stage_execs(&self, stage: Stage, phase: ExecPhase, out: &mut Vec<ExecResult>) {
        let commands: Vec<&str> = self
            .stages
            .get(stage)
            .execs(phase)
            .map(|e| e.command.as_str())
            .collect();
        if commands.is_empty() {
            return;
        }
        if self.node.as_root_namespace().is_some() {
            debug!(%stage, "root-namespace node has no container, skipping stage commands");
            return;
        }
        for command in commands {
            match ExecCmd::parse(command) {
                Ok(cmd) => out.push(self.exec(&cmd).await),
                Err(e) => warn!(%stage, command, error = %e, "skipping unparsable stage command"),
            }
        }
    }

    /// Exec failures are recorded in the result, they never fail the node
    async fn exec(&self, cmd: &ExecCmd) -> ExecResult {
        let result = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(NetlabError::cancelled(format!("exec {}", cmd))),
            r = self.node.run_exec(cmd) => r,
        };
        match result {
            Ok(result) => {
                if !result.is_success() {
                    warn!(cmd = %cmd, return_code = result.return_code, "command failed");
                }
                result
            }
            Err(e) => {
                warn!(cmd = %cmd, error = %e, "command could not run");
                ExecResult::new(cmd).with_output(-1, "", e.to_string())
            }
        }
    }

    /// Fill management gateways the topology left empty from the runtime
    fn inject_mgmt(&self) {
        let mgmt = &self.ctx.mgmt;
        self.node.base().update_config(|cfg| {
            if cfg.mgmt_ipv4_gateway.is_empty() {
                if let Some(gw) = &mgmt.ipv4_gw {
                    cfg.mgmt_ipv4_gateway = gw.clone();
                }
            }
            if cfg.mgmt_ipv6_gateway.is_empty() {
                if let Some(gw) = &mgmt.ipv6_gw {
                    cfg.mgmt_ipv6_gateway = gw.clone();
                }
            }
        });
    }

    async fn pre_deploy_params(&self) -> NetlabResult<PreDeployParams> {
        let mut params = self.ctx.pre_deploy.clone();
        if self.needs_certificate {
            match &self.ctx.certificates {
                Some(provider) => {
                    let cert = provider
                        .load_or_generate(&self.name, &params.topology_name)
                        .await?;
                    params.cert = Some(cert);
                }
                None => debug!("kind wants a certificate but no provider is configured"),
            }
        }
        Ok(params)
    }

    async fn startup_delay(&self) -> Result<(), FailureCause> {
        let secs = self.node.base().with_config(|cfg| cfg.startup_delay);
        if secs == 0 {
            return Ok(());
        }
        info!(delay_secs = secs, "delaying deploy");
        tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(FailureCause::Cancelled { phase: Some(Phase::Deploy) }),
            _ = tokio::time::sleep(Duration::from_secs(secs)) => Ok(()),
        }
    }

    /// Wait for runtimes that finish spawning after start returned
    async fn await_spawn(&self) -> Result<(), FailureCause> {
        let Some(handle) = self.node.base().take_spawn_handle() else {
            return Ok(());
        };
        debug!("waiting for spawn to finish");
        let result = tokio::select! {
            biased;
            _ = self.ctx.cancel.cancelled() => Err(NetlabError::cancelled(format!("spawn of {}", self.name))),
            r = handle.wait() => r,
        };
        result.map_err(|e| phase_failure(Phase::Deploy)(NetlabError::for_phase(Phase::Deploy, &self.name, e)))
    }
}
