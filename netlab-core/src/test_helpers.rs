//! Test doubles for node kinds
//!
//! [`ScriptedNode`] is a node kind whose hooks record themselves in a shared
//! [`EventLog`] and fail or stall on request. The script comes either from
//! method calls or from the node config extras, so whole labs can be
//! scripted through the registry:
//!
//! ```yaml
//! extras:
//!   fail: { check-deployment-conditions: "no license" }
//!   delay-ms: { deploy: 50 }
//!   not-ready-probes: 2
//! ```

use crate::error::{NetlabError, NetlabResult};
use crate::kind_registry::{KindEntry, KindRegistry};
use crate::link::{LinkEndpointType, Netlink};
use crate::node::{
    BaseNode, HasSaveConfig, Node, NodeConfig, NodeOption, PostDeployParams, PreDeployParams,
    RootNamespaceBased,
};
use crate::state_machine::Phase;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const SCRIPTED_KIND: &str = "scripted";
pub const SCRIPTED_BRIDGE_KIND: &str = "scripted-bridge";

const PHASES: [Phase; 7] = [
    Phase::Init,
    Phase::CheckConditions,
    Phase::PreDeploy,
    Phase::Deploy,
    Phase::PostDeploy,
    Phase::Readiness,
    Phase::Delete,
];

/// Whether an event marks the start or the end of a hook
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Start,
    End,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookEvent {
    pub node: String,
    pub hook: String,
    pub kind: EventKind,
}

/// Ordered record of hook invocations across nodes
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<HookEvent>>,
}

impl EventLog {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn record(&self, node: &str, hook: &str, kind: EventKind) {
        self.events.lock().push(HookEvent {
            node: node.to_string(),
            hook: hook.to_string(),
            kind,
        });
    }

    pub fn events(&self) -> Vec<HookEvent> {
        self.events.lock().clone()
    }

    /// Position of the first matching event
    pub fn position(&self, node: &str, hook: &str, kind: EventKind) -> Option<usize> {
        self.events
            .lock()
            .iter()
            .position(|e| e.node == node && e.hook == hook && e.kind == kind)
    }

    /// Whether `node` ever started `hook`
    pub fn called(&self, node: &str, hook: &str) -> bool {
        self.position(node, hook, EventKind::Start).is_some()
    }

    pub fn calls_for(&self, node: &str) -> Vec<String> {
        self.events
            .lock()
            .iter()
            .filter(|e| e.node == node && e.kind == EventKind::Start)
            .map(|e| e.hook.clone())
            .collect()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptedOutcome {
    Ok,
    Failed,
}

/// Node kind with scripted hook behavior
pub struct ScriptedNode {
    base: BaseNode,
    log: Arc<EventLog>,
    failures: Mutex<HashMap<Phase, String>>,
    delays: Mutex<HashMap<Phase, Duration>>,
    outcomes: Mutex<HashMap<Phase, ScriptedOutcome>>,
    not_ready_probes: AtomicU32,
    root_namespace: bool,
}

impl Default for ScriptedNode {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedNode {
    pub fn new() -> Self {
        Self::with_log(EventLog::new())
    }

    pub fn with_log(log: Arc<EventLog>) -> Self {
        Self {
            base: BaseNode::new(),
            log,
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            outcomes: Mutex::new(HashMap::new()),
            not_ready_probes: AtomicU32::new(0),
            root_namespace: false,
        }
    }

    /// A root-namespace node whose links attach to a bridge named like the node
    pub fn bridge(log: Arc<EventLog>) -> Self {
        Self {
            root_namespace: true,
            ..Self::with_log(log)
        }
    }

    pub fn fail_in(&self, phase: Phase, message: &str) {
        self.failures.lock().insert(phase, message.to_string());
    }

    pub fn delay_in(&self, phase: Phase, delay: Duration) {
        self.delays.lock().insert(phase, delay);
    }

    pub fn not_ready_for(&self, probes: u32) {
        self.not_ready_probes.store(probes, Ordering::SeqCst);
    }

    pub fn outcome(&self, phase: Phase) -> Option<ScriptedOutcome> {
        self.outcomes.lock().get(&phase).copied()
    }

    pub fn log(&self) -> &Arc<EventLog> {
        &self.log
    }

    fn name(&self) -> String {
        self.base.short_name()
    }

    /// Read `fail`, `delay-ms` and `not-ready-probes` from the extras
    fn load_script(&self, cfg: &NodeConfig) {
        for phase in PHASES {
            if let Some(message) = cfg
                .extras
                .get("fail")
                .and_then(|v| v.get(phase.as_str()))
                .and_then(|v| v.as_str())
            {
                self.fail_in(phase, message);
            }
            if let Some(ms) = cfg
                .extras
                .get("delay-ms")
                .and_then(|v| v.get(phase.as_str()))
                .and_then(|v| v.as_u64())
            {
                self.delay_in(phase, Duration::from_millis(ms));
            }
        }
        if let Some(n) = cfg.extras.get("not-ready-probes").and_then(|v| v.as_u64()) {
            self.not_ready_for(n as u32);
        }
    }

    async fn hook<T, F>(&self, phase: Phase, body: F) -> NetlabResult<T>
    where
        F: Future<Output = NetlabResult<T>> + Send,
    {
        let name = self.name();
        self.log.record(&name, phase.as_str(), EventKind::Start);

        let delay = self.delays.lock().get(&phase).copied();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = self.failures.lock().get(&phase).cloned();
        let result = match failure {
            Some(message) => Err(NetlabError::internal(message)),
            None => body.await,
        };

        let outcome = if result.is_ok() {
            ScriptedOutcome::Ok
        } else {
            ScriptedOutcome::Failed
        };
        self.outcomes.lock().insert(phase, outcome);
        self.log.record(&name, phase.as_str(), EventKind::End);
        result
    }
}

#[async_trait]
impl Node for ScriptedNode {
    fn base(&self) -> &BaseNode {
        &self.base
    }

    async fn init(&self, cfg: NodeConfig, options: Vec<NodeOption>) -> NetlabResult<()> {
        self.load_script(&cfg);
        self.log.record(&cfg.short_name, Phase::Init.as_str(), EventKind::Start);
        let failure = self.failures.lock().get(&Phase::Init).cloned();
        let result = match failure {
            Some(message) => Err(NetlabError::internal(message)),
            None => self.base.init(cfg.clone(), options),
        };
        self.log.record(&cfg.short_name, Phase::Init.as_str(), EventKind::End);
        result
    }

    async fn check_deployment_conditions(&self) -> NetlabResult<()> {
        self.hook(Phase::CheckConditions, async { Ok(()) }).await
    }

    async fn pre_deploy(&self, params: &PreDeployParams) -> NetlabResult<()> {
        self.hook(Phase::PreDeploy, self.base.create_node_dir(params))
            .await
    }

    async fn deploy(&self) -> NetlabResult<()> {
        self.hook(Phase::Deploy, async {
            if self.root_namespace {
                Ok(())
            } else {
                self.base.deploy_container().await
            }
        })
        .await
    }

    async fn post_deploy(&self, _params: &PostDeployParams) -> NetlabResult<()> {
        self.hook(Phase::PostDeploy, async { Ok(()) }).await
    }

    async fn readiness_probe(&self) -> NetlabResult<bool> {
        self.hook(Phase::Readiness, async {
            let remaining = self.not_ready_probes.load(Ordering::SeqCst);
            if remaining > 0 {
                self.not_ready_probes.store(remaining - 1, Ordering::SeqCst);
                return Ok(false);
            }
            if self.root_namespace {
                Ok(true)
            } else {
                self.base.container_running().await
            }
        })
        .await
    }

    async fn update_config_with_runtime_info(&self) -> NetlabResult<()> {
        if self.root_namespace {
            return Ok(());
        }
        self.base.update_config_from_runtime().await
    }

    async fn delete(&self) -> NetlabResult<()> {
        self.hook(Phase::Delete, async {
            if self.root_namespace {
                Ok(())
            } else {
                self.base.delete_container().await
            }
        })
        .await
    }

    fn link_endpoint_type(&self) -> LinkEndpointType {
        if self.root_namespace {
            LinkEndpointType::Bridge
        } else {
            LinkEndpointType::Veth
        }
    }

    fn namespace_path(&self) -> Option<std::path::PathBuf> {
        if self.root_namespace {
            None
        } else {
            self.base.netns()
        }
    }

    fn as_save_config(&self) -> Option<&dyn HasSaveConfig> {
        Some(self)
    }

    fn as_root_namespace(&self) -> Option<&dyn RootNamespaceBased> {
        if self.root_namespace {
            Some(self)
        } else {
            None
        }
    }
}

#[async_trait]
impl HasSaveConfig for ScriptedNode {
    async fn save_config(&self) -> NetlabResult<()> {
        let name = self.name();
        self.log.record(&name, "save-config", EventKind::Start);
        self.log.record(&name, "save-config", EventKind::End);
        Ok(())
    }
}

#[async_trait]
impl RootNamespaceBased for ScriptedNode {
    async fn check_attachable(&self, netlink: &dyn Netlink) -> NetlabResult<()> {
        let bridge = self.name();
        if netlink.link_exists(None, &bridge).await? {
            Ok(())
        } else {
            Err(NetlabError::netlink(
                "bridge-exists",
                nix::errno::Errno::ENODEV as i32,
                format!("bridge {} does not exist", bridge),
            ))
        }
    }

    async fn attach_port(&self, netlink: &dyn Netlink, port: &str) -> NetlabResult<()> {
        netlink.link_set_master(port, &self.name()).await
    }
}

/// Registry with the scripted kinds, all logging into `log`
pub fn scripted_registry(log: Arc<EventLog>) -> KindRegistry {
    let mut registry = KindRegistry::new();
    let veth_log = log.clone();
    let entries = [
        KindEntry::new(&[SCRIPTED_KIND], move || {
            Arc::new(ScriptedNode::with_log(veth_log.clone())) as Arc<dyn Node>
        }),
        KindEntry::new(&[SCRIPTED_BRIDGE_KIND], move || {
            Arc::new(ScriptedNode::bridge(log.clone())) as Arc<dyn Node>
        }),
    ];
    for entry in entries {
        if let Err(e) = registry.register(entry) {
            tracing::error!(error = %e, "scripted kinds collide");
        }
    }
    registry
}
