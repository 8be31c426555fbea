//! Dependency-ordered lab orchestration
//!
//! The orchestrator owns the whole-lab view. A run has three parts:
//!
//! 1. **Pre-flight**: construct every node through the registry, initialise
//!    it, resolve links and endpoints, and validate the stage graph. Any
//!    error here aborts the run before a single runtime call is made.
//! 2. **Units**: one task per node walks the node's state machine, gated by
//!    the stage barriers. Nodes publish themselves for link wiring once
//!    their namespace exists.
//! 3. **Report**: every node ends `Ready` or `Failed`, with the failure
//!    cause kept apart from nodes that were blocked by a dependency.
//!
//! In strict mode the first node failure cancels every other unit, tears
//! down what was created and is returned as [`NetlabError::StrictAbort`].

mod board;
mod unit;

use crate::command::{CommandExecutor, TokioCommandExecutor};
use crate::config::{FailurePolicy, NetlabConfig};
use crate::dependency::{DependencyGraph, StageKey, StageSignals};
use crate::error::{NetlabError, NetlabResult};
use crate::exec::ExecCmd;
use crate::kind_registry::{KindEntry, KindRegistry};
use crate::lab::LabDefinition;
use crate::link::{Endpoint, EndpointDefinition, Link, LinkEndpointType, LinkWirer, Netlink};
use crate::node::{CertificateProvider, Node, NodeOption, PreDeployParams};
use crate::report::{FailureCause, LabReport, LinkOutcome, LinkReport, NodeReport};
use crate::runtime::ContainerRuntime;
use crate::stages::Stages;
use crate::state_machine::{DeploymentState, NodeStateMachine, Phase};
use board::WiringBoard;
use futures::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, instrument, warn, Instrument};
use unit::{NodeUnit, UnitContext, UnitOutcome};

/// A deployed lab: the report plus the live nodes and links
pub struct Deployment {
    report: LabReport,
    nodes: BTreeMap<String, Arc<dyn Node>>,
    links: Vec<Arc<Link>>,
}

impl Deployment {
    pub fn report(&self) -> &LabReport {
        &self.report
    }

    pub fn lab(&self) -> &str {
        &self.report.lab
    }

    pub fn node(&self, name: &str) -> Option<&Arc<dyn Node>> {
        self.nodes.get(name)
    }

    pub fn nodes(&self) -> impl Iterator<Item = (&String, &Arc<dyn Node>)> {
        self.nodes.iter()
    }

    pub fn links(&self) -> &[Arc<Link>] {
        &self.links
    }

    pub fn into_report(self) -> LabReport {
        self.report
    }
}

/// Result of a successful pre-flight
#[derive(Debug, Clone, Serialize)]
pub struct LabPlan {
    pub lab: String,
    /// Every (node, stage) in a valid execution order
    pub order: Vec<StageKey>,
    pub links: Vec<String>,
}

struct PreparedNode {
    node: Arc<dyn Node>,
    entry: Arc<KindEntry>,
    stages: Stages,
    commands: Vec<ExecCmd>,
}

struct PreparedLab {
    name: String,
    lab_dir: PathBuf,
    nodes: BTreeMap<String, PreparedNode>,
    /// Nodes whose Init failed; they never get a unit
    init_failures: BTreeMap<String, NetlabError>,
    links: Vec<Arc<Link>>,
    graph: DependencyGraph,
}

/// Drives a whole lab through deployment, teardown and config saves
pub struct Orchestrator {
    registry: Arc<KindRegistry>,
    runtime: Arc<dyn ContainerRuntime>,
    netlink: Arc<dyn Netlink>,
    executor: Arc<dyn CommandExecutor>,
    config: NetlabConfig,
    certificates: Option<Arc<dyn CertificateProvider>>,
    ssh_pub_keys: Vec<String>,
}

impl Orchestrator {
    pub fn new(
        registry: Arc<KindRegistry>,
        runtime: Arc<dyn ContainerRuntime>,
        netlink: Arc<dyn Netlink>,
        config: NetlabConfig,
    ) -> Self {
        Self {
            registry,
            runtime,
            netlink,
            executor: Arc::new(TokioCommandExecutor::new()),
            config,
            certificates: None,
            ssh_pub_keys: Vec::new(),
        }
    }

    /// Host command executor handed to the nodes
    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_certificate_provider(mut self, provider: Arc<dyn CertificateProvider>) -> Self {
        self.certificates = Some(provider);
        self
    }

    pub fn with_ssh_pub_keys(mut self, keys: Vec<String>) -> Self {
        self.ssh_pub_keys = keys;
        self
    }

    pub fn config(&self) -> &NetlabConfig {
        &self.config
    }

    pub fn registry(&self) -> &KindRegistry {
        &self.registry
    }

    fn node_options(&self, lab: &str, entry: &KindEntry) -> Vec<NodeOption> {
        vec![
            NodeOption::Runtime(self.runtime.clone()),
            NodeOption::Netlink(self.netlink.clone()),
            NodeOption::CommandExecutor(self.executor.clone()),
            NodeOption::MgmtNet(self.runtime.mgmt()),
            NodeOption::LabName(lab.to_string()),
            NodeOption::DefaultCredentials(entry.credentials().cloned()),
        ]
    }

    /// Construct, initialise and validate everything without touching the
    /// runtime or the kernel
    async fn prepare(&self, lab: &LabDefinition) -> NetlabResult<PreparedLab> {
        lab.validate()?;
        let lab_dir = lab.lab_dir();

        // every kind must resolve before any node is constructed
        let mut entries = BTreeMap::new();
        for (name, cfg) in &lab.nodes {
            entries.insert(name.clone(), self.registry.entry(&cfg.kind)?.clone());
        }

        let mut nodes = BTreeMap::new();
        let mut init_failures = BTreeMap::new();
        let mut stage_map = BTreeMap::new();
        for (name, cfg) in &lab.nodes {
            let Some(entry) = entries.remove(name) else {
                continue;
            };
            let node = entry.construct();

            let mut cfg = cfg.clone();
            cfg.short_name = name.clone();
            if cfg.lab_dir.as_os_str().is_empty() {
                cfg.lab_dir = lab_dir.join(name);
            }
            let commands = cfg
                .exec
                .iter()
                .map(|c| {
                    ExecCmd::parse(c).map_err(|e| {
                        NetlabError::configuration(format!("nodes.{}.exec", name), e.to_string())
                    })
                })
                .collect::<NetlabResult<Vec<_>>>()?;
            let user_stages = cfg.stages.clone();
            let kind = cfg.kind.clone();

            let sm = NodeStateMachine::new(node.clone(), name, CancellationToken::new(), None);
            let init = node.init(cfg, self.node_options(&lab.name, &entry));
            let stages = match sm.run_phase(Phase::Init, init).await {
                Ok(()) => {
                    let mut stages = node.default_stages();
                    stages.merge(&user_stages);
                    node.base().update_config(|c| c.stages = stages.clone());
                    stages
                }
                Err(e) => {
                    warn!(node = %name, error = %e, "node init failed");
                    node.base().update_config(|c| {
                        c.short_name = name.clone();
                        c.kind = kind;
                    });
                    init_failures.insert(name.clone(), e);
                    user_stages
                }
            };
            stages.validate(name)?;
            stage_map.insert(name.clone(), stages.clone());
            nodes.insert(
                name.clone(),
                PreparedNode {
                    node,
                    entry,
                    stages,
                    commands,
                },
            );
        }

        let graph = DependencyGraph::build(&stage_map)?;

        let mut links = Vec::with_capacity(lab.links.len());
        for def in &lab.links {
            let (a, b) = def.pair()?;
            let a = Self::endpoint(&nodes, &init_failures, a)?;
            let b = Self::endpoint(&nodes, &init_failures, b)?;
            links.push(Arc::new(Link::new(a, b, def.mtu)?));
        }

        Ok(PreparedLab {
            name: lab.name.clone(),
            lab_dir,
            nodes,
            init_failures,
            links,
            graph,
        })
    }

    /// Register an endpoint with its node; nodes that failed Init keep the
    /// declared name since they will never be wired
    fn endpoint(
        nodes: &BTreeMap<String, PreparedNode>,
        init_failures: &BTreeMap<String, NetlabError>,
        def: &EndpointDefinition,
    ) -> NetlabResult<Endpoint> {
        let mut endpoint = Endpoint::new(&def.node, &def.interface, LinkEndpointType::Veth);
        if let Some(mac) = &def.mac {
            endpoint = endpoint.with_mac(mac);
        }
        match nodes.get(&def.node) {
            Some(prepared) if !init_failures.contains_key(&def.node) => {
                prepared.node.add_endpoint(endpoint)
            }
            Some(_) => Ok(endpoint),
            None => Err(NetlabError::configuration(
                "links",
                format!("endpoint {} refers to unknown node {:?}", def, def.node),
            )),
        }
    }

    /// Validate a lab without side effects: kinds, Init, stage graph,
    /// endpoints and interface names
    #[instrument(skip_all, fields(lab = %lab.name))]
    pub async fn preflight(&self, lab: &LabDefinition) -> NetlabResult<LabPlan> {
        let prepared = self.prepare(lab).await?;
        if let Some((_, e)) = prepared.init_failures.into_iter().next() {
            return Err(e);
        }
        for prepared_node in prepared.nodes.values() {
            prepared_node.node.check_interface_name()?;
        }
        Ok(LabPlan {
            lab: prepared.name,
            order: prepared.graph.topological_order().to_vec(),
            links: prepared.links.iter().map(|l| l.to_string()).collect(),
        })
    }

    /// Deploy `lab`.
    ///
    /// Pre-flight errors are returned before anything is created. Node and
    /// link failures are recorded in the report of the returned
    /// [`Deployment`]; only strict mode turns a node failure into an error.
    #[instrument(skip_all, fields(lab = %lab.name))]
    pub async fn deploy(&self, lab: &LabDefinition, cancel: CancellationToken) -> NetlabResult<Deployment> {
        let started = Instant::now();
        let mut prepared = self.prepare(lab).await?;
        let policy = self.config.orchestrator.failure_policy;

        if policy == FailurePolicy::Strict {
            if let Some((node, e)) = std::mem::take(&mut prepared.init_failures).into_iter().next() {
                return Err(NetlabError::StrictAbort {
                    node,
                    source: Arc::new(e),
                });
            }
        }

        if !prepared.lab_dir.as_os_str().is_empty() {
            tokio::fs::create_dir_all(&prepared.lab_dir).await?;
        }
        info!(
            nodes = prepared.nodes.len(),
            links = prepared.links.len(),
            policy = %policy,
            "deploying lab"
        );

        let run = cancel.child_token();
        let signals = Arc::new(StageSignals::new(prepared.nodes.keys().cloned()));
        for name in prepared.init_failures.keys() {
            signals.fail_remaining(name);
        }

        let live: BTreeMap<String, Arc<dyn Node>> = prepared
            .nodes
            .iter()
            .map(|(name, p)| (name.clone(), p.node.clone()))
            .collect();
        let wirer = Arc::new(LinkWirer::new(self.netlink.clone(), self.config.wiring.clone()));
        let board = Arc::new(WiringBoard::new(live.clone(), prepared.links.clone(), wirer));

        let ctx = Arc::new(UnitContext {
            signals,
            board: board.clone(),
            workers: self.workers(),
            cancel: run.clone(),
            mgmt: self.runtime.mgmt(),
            certificates: self.certificates.clone(),
            pre_deploy: PreDeployParams {
                cert: None,
                topology_name: prepared.name.clone(),
                lab_dir: prepared.lab_dir.clone(),
                ssh_pub_keys: self.ssh_pub_keys.clone(),
            },
        });

        let mut units = JoinSet::new();
        for (name, p) in &prepared.nodes {
            if prepared.init_failures.contains_key(name) {
                continue;
            }
            if p.node.as_root_namespace().is_some() {
                board.publish_root(name);
            }
            let hints = p.entry.platform_hints();
            let unit = NodeUnit {
                name: name.clone(),
                node: p.node.clone(),
                stages: p.stages.clone(),
                commands: p.commands.clone(),
                readiness: hints
                    .readiness
                    .clone()
                    .unwrap_or_else(|| self.config.readiness.clone()),
                needs_certificate: hints.needs_certificate,
                peers: prepared.nodes.keys().filter(|n| *n != name).cloned().collect(),
                ctx: ctx.clone(),
            };
            let span = info_span!("node", node = %name, kind = %p.entry.canonical_name());
            units.spawn(unit.run().instrument(span));
        }

        let (mut outcomes, abort) = self.collect(&mut units, &run).await;

        let mut report = LabReport::new(&prepared.name);
        for (name, p) in &prepared.nodes {
            let (failure, exec) = match prepared.init_failures.remove(name) {
                Some(e) => (
                    Some(FailureCause::Attempted {
                        phase: Phase::Init,
                        error: Arc::new(e),
                    }),
                    Vec::new(),
                ),
                None => match outcomes.remove(name) {
                    Some(outcome) => (outcome.failure, outcome.exec),
                    None => {
                        let phase = next_phase(p.node.base().state());
                        p.node.base().set_state(DeploymentState::Failed);
                        let error = NetlabError::internal(format!("unit of node {} panicked", name));
                        (
                            Some(FailureCause::Attempted {
                                phase,
                                error: Arc::new(error),
                            }),
                            Vec::new(),
                        )
                    }
                },
            };
            report.exec.extend(name, exec);
            report
                .nodes
                .insert(name.clone(), node_report(name, p.node.as_ref(), failure));
        }
        report.links = board.report();
        report.duration = started.elapsed();

        if let Some((node, source)) = abort {
            self.teardown(&prepared.name, &live, &prepared.links).await;
            return Err(NetlabError::StrictAbort { node, source });
        }

        info!(
            ready = report.nodes.values().filter(|n| n.is_ready()).count(),
            failed = report.failed_nodes().len(),
            blocked = report.blocked_nodes().len(),
            duration = ?report.duration,
            "lab deployed"
        );
        Ok(Deployment {
            report,
            nodes: live,
            links: prepared.links,
        })
    }

    fn workers(&self) -> Option<Arc<Semaphore>> {
        match self.config.orchestrator.max_workers {
            0 => None,
            n => Some(Arc::new(Semaphore::new(n))),
        }
    }

    /// Join every unit, enforcing the deadline and the strict policy
    async fn collect(
        &self,
        units: &mut JoinSet<UnitOutcome>,
        run: &CancellationToken,
    ) -> (BTreeMap<String, UnitOutcome>, Option<(String, Arc<NetlabError>)>) {
        let strict = self.config.orchestrator.failure_policy == FailurePolicy::Strict;
        let deadline = self
            .config
            .orchestrator
            .deadline()
            .map(|d| tokio::time::Instant::now() + d);
        let mut timed_out = false;
        let mut outcomes = BTreeMap::new();
        let mut abort = None;

        loop {
            let joined = match deadline {
                Some(at) if !timed_out => tokio::select! {
                    joined = units.join_next() => joined,
                    _ = tokio::time::sleep_until(at) => {
                        warn!("deploy deadline reached, cancelling remaining nodes");
                        timed_out = true;
                        run.cancel();
                        continue;
                    }
                },
                _ => units.join_next().await,
            };
            let Some(joined) = joined else {
                break;
            };

            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(error = %e, "node unit did not complete");
                    continue;
                }
            };
            if strict && abort.is_none() {
                if let Some(FailureCause::Attempted { error, .. }) = &outcome.failure {
                    error!(node = %outcome.name, "strict mode, aborting run");
                    abort = Some((outcome.name.clone(), error.clone()));
                    run.cancel();
                }
            }
            outcomes.insert(outcome.name.clone(), outcome);
        }
        (outcomes, abort)
    }

    /// Unwire every link and delete every node of a deployment.
    ///
    /// Best effort: errors are recorded in the report and every node ends
    /// `Deleted`.
    #[instrument(skip_all, fields(lab = %deployment.lab()))]
    pub async fn destroy(&self, deployment: &Deployment) -> LabReport {
        self.teardown(deployment.lab(), &deployment.nodes, &deployment.links)
            .await
    }

    async fn teardown(
        &self,
        lab: &str,
        nodes: &BTreeMap<String, Arc<dyn Node>>,
        links: &[Arc<Link>],
    ) -> LabReport {
        let started = Instant::now();
        let wirer = LinkWirer::new(self.netlink.clone(), self.config.wiring.clone());
        let mut report = LabReport::new(lab);

        for link in links {
            let (a, b) = link.endpoints();
            let outcome = match wirer.unwire(link).await {
                Ok(()) => LinkOutcome::Unwired,
                Err(e) => {
                    warn!(link = %link, error = %e, "unwire failed");
                    LinkOutcome::Failed { error: Arc::new(e) }
                }
            };
            report.links.push(LinkReport {
                id: link.id().to_string(),
                endpoints: [a.to_string(), b.to_string()],
                outcome,
            });
        }

        let limit = match self.config.orchestrator.max_workers {
            0 => nodes.len(),
            n => n,
        }
        .max(1);
        let deleted: Vec<(String, Option<FailureCause>)> = stream::iter(nodes.iter())
            .map(|(name, node)| async move {
                let sm = NodeStateMachine::new(node.clone(), name, CancellationToken::new(), None);
                let failure = sm.delete().await.err().map(|e| FailureCause::Attempted {
                    phase: Phase::Delete,
                    error: Arc::new(e),
                });
                (name.clone(), failure)
            })
            .buffer_unordered(limit)
            .collect()
            .await;

        for (name, failure) in deleted {
            if let Some(node) = nodes.get(&name) {
                report
                    .nodes
                    .insert(name.clone(), node_report(&name, node.as_ref(), failure));
            }
        }
        report.duration = started.elapsed();
        info!(nodes = report.nodes.len(), links = report.links.len(), "lab destroyed");
        report
    }

    /// Save the running configuration of every ready node that supports it.
    ///
    /// Returns the errors per node; an empty map means every save succeeded.
    #[instrument(skip_all, fields(lab = %deployment.lab()))]
    pub async fn save_configs(&self, deployment: &Deployment) -> BTreeMap<String, NetlabError> {
        let saves = deployment
            .nodes
            .iter()
            .filter(|(_, node)| {
                node.as_save_config().is_some() && node.base().state() == DeploymentState::Ready
            })
            .map(|(name, node)| async move { (name.clone(), node.save_config().await) });

        let mut errors = BTreeMap::new();
        for (name, result) in futures::future::join_all(saves).await {
            match result {
                Ok(()) => info!(node = %name, "configuration saved"),
                Err(e @ NetlabError::SaveConfig { .. }) => {
                    error!(node = %name, error = %e, "saving configuration failed");
                    errors.insert(name, e);
                }
                Err(e) => {
                    error!(node = %name, error = %e, "saving configuration failed");
                    errors.insert(
                        name.clone(),
                        NetlabError::SaveConfig {
                            node: name,
                            message: e.to_string(),
                        },
                    );
                }
            }
        }
        errors
    }
}

/// The phase a node in `state` would have run next
fn next_phase(state: DeploymentState) -> Phase {
    match state {
        DeploymentState::Defined => Phase::Init,
        DeploymentState::Initializing => Phase::CheckConditions,
        DeploymentState::ConditionsChecked => Phase::PreDeploy,
        DeploymentState::PreDeployed => Phase::Deploy,
        DeploymentState::Deployed => Phase::PostDeploy,
        DeploymentState::PostDeployed
        | DeploymentState::Ready
        | DeploymentState::Failed => Phase::Readiness,
        DeploymentState::Deleted => Phase::Delete,
    }
}

fn node_report(name: &str, node: &dyn Node, failure: Option<FailureCause>) -> NodeReport {
    let base = node.base();
    let (ipv4, ipv6) = base.with_config(|cfg| {
        (
            cfg.mgmt_ipv4_address.clone(),
            cfg.mgmt_ipv6_address.clone(),
        )
    });
    NodeReport {
        name: name.to_string(),
        kind: base.kind(),
        container: base.long_name(),
        state: base.state(),
        mgmt_ipv4_address: ipv4,
        mgmt_ipv6_address: ipv6,
        failure,
    }
}
