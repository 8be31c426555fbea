//! Full lab runs with the shipped kinds against the mock runtime, the
//! recording netlink and a mock command executor

use netlab_core::command::{CommandOutput, MockCommandExecutor};
use netlab_core::config::ReadinessConfig;
use netlab_core::link::{LinkDefinition, LinkState, RecordingNetlink};
use netlab_core::node::NodeConfig;
use netlab_core::report::{FailureCause, LinkOutcome};
use netlab_core::runtime::MockRuntime;
use netlab_core::state_machine::Phase;
use netlab_core::{DeploymentState, LabDefinition, NetlabConfig, NetlabError, Orchestrator};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

struct Harness {
    runtime: Arc<MockRuntime>,
    netlink: Arc<RecordingNetlink>,
    executor: MockCommandExecutor,
    dir: TempDir,
}

impl Harness {
    fn new() -> Self {
        Self {
            runtime: Arc::new(MockRuntime::new()),
            netlink: Arc::new(RecordingNetlink::new()),
            executor: MockCommandExecutor::new().with_fallback(CommandOutput::ok("")),
            dir: TempDir::new().unwrap(),
        }
    }

    fn orchestrator(&self) -> Orchestrator {
        let config = NetlabConfig::default().with_readiness(ReadinessConfig::fixed(
            Duration::from_millis(10),
            Duration::from_secs(2),
        ));
        Orchestrator::new(
            Arc::new(netlab_kinds::build_registry().unwrap()),
            self.runtime.clone(),
            self.netlink.clone(),
            config,
        )
        .with_executor(Arc::new(self.executor.clone()))
    }

    fn lab(&self, name: &str) -> LabDefinition {
        LabDefinition::new(name).with_lab_dir(self.dir.path().join(name))
    }

    fn node_dir(&self, lab: &str, node: &str) -> std::path::PathBuf {
        self.dir.path().join(lab).join(node)
    }

    async fn deploy(&self, lab: &LabDefinition) -> netlab_core::Deployment {
        self.orchestrator()
            .deploy(lab, CancellationToken::new())
            .await
            .unwrap()
    }
}

fn node(name: &str, kind: &str) -> NodeConfig {
    NodeConfig::new(name, kind).with_image("registry.local/image:latest")
}

fn link(a: &str, b: &str) -> LinkDefinition {
    LinkDefinition::new(a, b).unwrap()
}

#[tokio::test]
async fn test_linux_nodes_on_a_bridge() {
    let h = Harness::new();
    h.netlink.add_bridge("br0");
    let lab = h
        .lab("bridged")
        .with_node(node("h1", "linux"))
        .with_node(node("h2", "linux"))
        .with_node(NodeConfig::new("br0", "bridge"))
        .with_link(link("h1:eth1", "br0:br0-h1"))
        .with_link(link("h2:eth1", "br0:br0-h2"));

    let deployment = h.deploy(&lab).await;
    let report = deployment.report();
    assert!(report.is_success(), "{:?}", report.failed_nodes());

    for port in ["br0-h1", "br0-h2"] {
        let iface = h.netlink.interface(None, port).unwrap();
        assert_eq!(iface.master.as_deref(), Some("br0"));
    }
    let h1 = h
        .netlink
        .interface(Some(Path::new("/run/netns/clab-bridged-h1")), "eth1")
        .unwrap();
    assert!(h1.up);

    // the entrypoint learns how many data interfaces to wait for
    let cfg = deployment.node("h1").unwrap().base().config();
    assert_eq!(cfg.env["CLAB_INTFS"], "1");
    assert_eq!(cfg.restart_policy, "always");

    // the bridge has no container
    assert!(h.runtime.calls_for("br0").is_empty());
    assert!(h.executor.executed().iter().any(|line| line
        == &["iptables", "-I", "FORWARD", "-i", "br0", "-j", "ACCEPT", "-w", "5"]));
}

#[tokio::test]
async fn test_existing_forward_rule_is_kept() {
    let h = Harness::new();
    h.netlink.add_bridge("br0");
    h.executor.expect(
        "iptables",
        &["-vL", "FORWARD", "-w", "5"],
        Ok(CommandOutput::ok(
            "Chain FORWARD (policy DROP)\n 0 0 ACCEPT all -- br0 any anywhere anywhere\n",
        )),
    );
    let lab = h.lab("rule").with_node(NodeConfig::new("br0", "bridge"));

    assert!(h.deploy(&lab).await.report().is_success());
    assert!(!h
        .executor
        .executed()
        .iter()
        .any(|line| line.get(1).map(String::as_str) == Some("-I")));
}

#[tokio::test]
async fn test_missing_bridge_fails_its_checks() {
    let h = Harness::new();
    let lab = h
        .lab("nobridge")
        .with_node(node("h1", "linux"))
        .with_node(NodeConfig::new("br0", "bridge"))
        .with_link(link("h1:eth1", "br0:br0-h1"));

    let deployment = h.deploy(&lab).await;
    let report = deployment.report();

    let bridge = report.node("br0").unwrap();
    assert_eq!(bridge.state, DeploymentState::Failed);
    assert!(matches!(
        bridge.failure,
        Some(FailureCause::Attempted {
            phase: Phase::CheckConditions,
            ..
        })
    ));
    assert!(report.node("h1").unwrap().is_ready());
    assert!(!matches!(report.links[0].outcome, LinkOutcome::Wired));
    assert_eq!(h.netlink.interface_count(), 0);
}

#[tokio::test]
async fn test_ovs_bridge_ports_are_added_with_ovs_vsctl() {
    let h = Harness::new();
    let lab = h
        .lab("ovs")
        .with_node(node("h1", "linux"))
        .with_node(NodeConfig::new("ovs0", "ovs-bridge"))
        .with_link(link("h1:eth1", "ovs0:ovs0-h1"));

    let deployment = h.deploy(&lab).await;
    assert!(deployment.report().is_success());

    let executed = h.executor.executed();
    assert!(executed.contains(&vec![
        "ovs-vsctl".to_string(),
        "br-exists".to_string(),
        "ovs0".to_string()
    ]));
    assert!(executed.contains(&vec![
        "ovs-vsctl".to_string(),
        "--may-exist".to_string(),
        "add-port".to_string(),
        "ovs0".to_string(),
        "ovs0-h1".to_string()
    ]));
    // no iptables rule for ovs bridges
    assert!(!executed.iter().any(|line| line[0] == "iptables"));
}

#[tokio::test]
async fn test_host_leg_stays_in_root_namespace() {
    let h = Harness::new();
    let lab = h
        .lab("hostlink")
        .with_node(node("h1", "linux"))
        .with_node(NodeConfig::new("host", "host"))
        .with_link(link("h1:eth1", "host:veth-h1"));

    let deployment = h.deploy(&lab).await;
    assert!(deployment.report().is_success());

    let leg = h.netlink.interface(None, "veth-h1").unwrap();
    assert!(leg.up);
    assert_eq!(leg.master, None);
    assert_eq!(deployment.links()[0].state(), LinkState::Wired);
}

#[tokio::test]
async fn test_srl_renders_config_and_waits_for_mgmt_server() {
    let h = Harness::new();
    h.runtime.push_exec_response_once("srl1", "mgmt_server", 0, "state starting");
    h.runtime.set_exec_response("srl1", "mgmt_server", 0, "state running");
    let lab = h
        .lab("srl")
        .with_node(node("srl1", "srl"))
        .with_node(node("h1", "linux"))
        .with_link(link("srl1:ethernet-1/1", "h1:eth1"));

    let deployment = h.deploy(&lab).await;
    assert!(deployment.report().is_success());

    // the CLI name was mapped to the kernel name
    assert!(h
        .netlink
        .interface(Some(Path::new("/run/netns/clab-srl-srl1")), "e1-1")
        .is_some());

    let path = h.node_dir("srl", "srl1").join("config").join("config.json");
    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap();
    assert_eq!(
        config["srl_nokia-system:system"]["name"]["host-name"],
        "srl1"
    );
    assert_eq!(
        config["srl_nokia-system:system"]["aaa"]["authentication"]["admin-user"]["password"],
        "NokiaSrl1!"
    );
    let interfaces = config["srl_nokia-interfaces:interface"].as_array().unwrap();
    assert!(interfaces.iter().any(|i| i["name"] == "ethernet-1/1"));
    let next_hop = &config["srl_nokia-network-instance:network-instance"][0]["next-hop-groups"]
        ["group"][0]["nexthop"][0]["ip-address"];
    assert_eq!(next_hop, "172.20.20.1");

    let binds = deployment.node("srl1").unwrap().base().config().binds;
    assert!(binds.iter().any(|b| b.ends_with(":/etc/opt/srlinux/:rw")));
}

#[tokio::test]
async fn test_srl_save_config_fails_loudly() {
    let h = Harness::new();
    h.runtime.set_exec_response("srl1", "mgmt_server", 0, "running");
    h.runtime
        .set_exec_response("srl1", "configuration save", 1, "");
    let lab = h.lab("srlsave").with_node(node("srl1", "srl"));

    let orchestrator = h.orchestrator();
    let deployment = orchestrator
        .deploy(&lab, CancellationToken::new())
        .await
        .unwrap();
    let errors = orchestrator.save_configs(&deployment).await;

    assert!(matches!(
        errors.get("srl1"),
        Some(NetlabError::SaveConfig { node, .. }) if node == "srl1"
    ));
}

#[tokio::test]
async fn test_ceos_flash_layout() {
    let h = Harness::new();
    let lab = h
        .lab("arista")
        .with_node(node("ceos1", "ceos"))
        .with_node(node("ceos2", "arista_ceos"))
        .with_link(link("ceos1:Ethernet1", "ceos2:eth1"));

    let deployment = h.deploy(&lab).await;
    assert!(deployment.report().is_success());
    assert_eq!(
        deployment.report().links[0].id,
        "ceos1:eth1__ceos2:eth1"
    );

    let flash = h.node_dir("arista", "ceos1").join("flash");
    let startup = std::fs::read_to_string(flash.join("startup-config")).unwrap();
    assert!(startup.contains("hostname ceos1"));
    assert!(startup.contains("username admin privilege 15 secret admin"));
    assert!(startup.contains("interface Ethernet1"));
    assert!(startup.contains("ip route vrf MGMT 0.0.0.0/0 172.20.20.1"));
    assert_eq!(
        std::fs::read_to_string(flash.join("zerotouch-config")).unwrap(),
        "DISABLE=True\n"
    );
    assert!(flash.join("system_mac_address").is_file());

    let errors = h.orchestrator().save_configs(&deployment).await;
    assert!(errors.is_empty());
    assert!(h
        .runtime
        .calls_for("ceos1")
        .iter()
        .any(|c| c.cmd.last().map(String::as_str) == Some("copy running flash:startup-config")));
}

#[tokio::test]
async fn test_ceos_user_startup_config_is_a_template() {
    let h = Harness::new();
    let template = h.dir.path().join("ceos.cfg");
    std::fs::write(&template, "hostname {{ short_name }}-lab\n").unwrap();
    let mut cfg = node("ceos1", "ceos");
    cfg.startup_config = Some(template);
    let lab = h.lab("custom").with_node(cfg);

    assert!(h.deploy(&lab).await.report().is_success());
    let startup = std::fs::read_to_string(
        h.node_dir("custom", "ceos1").join("flash").join("startup-config"),
    )
    .unwrap();
    assert_eq!(startup, "hostname ceos1-lab\n");
}

#[tokio::test]
async fn test_vr_save_config_writes_running_config() {
    let h = Harness::new();
    h.runtime
        .set_exec_response("r1", "show configuration", 0, "configure router\n");
    let lab = h
        .lab("vr")
        .with_node(node("r1", "vr-sros"))
        .with_node(node("r2", "juniper_vmx"))
        .with_link(link("r1:1/1/1", "r2:ge-0/0/0"));

    let orchestrator = h.orchestrator();
    let deployment = orchestrator
        .deploy(&lab, CancellationToken::new())
        .await
        .unwrap();
    assert!(deployment.report().is_success());
    assert_eq!(deployment.report().links[0].id, "r1:eth1__r2:eth1");
    for dir in ["config", "tftpboot"] {
        assert!(h.node_dir("vr", "r1").join(dir).is_dir());
    }

    h.runtime
        .set_exec_response("r2", "show configuration", 1, "");
    let errors = orchestrator.save_configs(&deployment).await;

    let saved = h
        .node_dir("vr", "r1")
        .join("config")
        .join("startup-config.cfg");
    assert_eq!(std::fs::read_to_string(saved).unwrap(), "configure router\n");
    assert!(!errors.contains_key("r1"));
    assert!(matches!(errors.get("r2"), Some(NetlabError::SaveConfig { .. })));
}

#[tokio::test]
async fn test_preflight_rejects_eth0_on_linux() {
    let h = Harness::new();
    let lab = h
        .lab("eth0")
        .with_node(node("h1", "linux"))
        .with_node(node("h2", "linux"))
        .with_link(link("h1:eth0", "h2:eth1"));

    let err = h.orchestrator().preflight(&lab).await.unwrap_err();
    assert!(matches!(
        err,
        NetlabError::InterfaceNameInvalid { node, interface, .. } if node == "h1" && interface == "eth0"
    ));
    assert_eq!(h.runtime.call_count(), 0);
}

#[tokio::test]
async fn test_preflight_rejects_unmappable_vm_interface() {
    let h = Harness::new();
    let lab = h
        .lab("badvm")
        .with_node(node("r1", "arista_veos"))
        .with_node(node("h1", "linux"))
        .with_link(link("r1:Management1", "h1:eth1"));

    let err = h.orchestrator().preflight(&lab).await.unwrap_err();
    assert!(err.to_string().contains("Ethernet1/X"));
}

#[tokio::test]
async fn test_unknown_kind_lists_shipped_kinds() {
    let h = Harness::new();
    let lab = h.lab("unknown").with_node(node("x", "frr"));

    match h.orchestrator().preflight(&lab).await {
        Err(NetlabError::UnknownKind { kind, supported }) => {
            assert_eq!(kind, "frr");
            assert!(supported.contains(&"nokia_srlinux".to_string()));
            assert!(supported.windows(2).all(|w| w[0] <= w[1]));
        }
        other => panic!("expected UnknownKind, got {:?}", other.map(|p| p.order)),
    }
}
