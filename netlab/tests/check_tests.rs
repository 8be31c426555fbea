use netlab_core::exec::ExecOutputFormat;
use netlab_core::stages::Stage;
use netlab_core::NetlabConfig;
use std::path::PathBuf;
use std::sync::Arc;
use tempfile::TempDir;

const MANIFEST: &str = r#"
name: dc1
nodes:
  leaf1:
    kind: nokia_srlinux
    image: ghcr.io/nokia/srlinux
  h1:
    kind: linux
    image: alpine:3
    stages:
      create:
        wait-for:
          - node: leaf1
            stage: healthy
links:
  - endpoints: ["leaf1:ethernet-1/1", "h1:eth1"]
"#;

fn write_manifest(dir: &TempDir, content: &str) -> PathBuf {
    let path = dir.path().join("lab.yml");
    std::fs::write(&path, content).unwrap();
    path
}

fn registry() -> Arc<netlab_core::KindRegistry> {
    Arc::new(netlab_kinds::build_registry().unwrap())
}

#[tokio::test]
async fn test_check_prints_order_and_mapped_links() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(&dir, MANIFEST);

    let plan = netlab::preflight(registry(), &manifest, NetlabConfig::default())
        .await
        .unwrap();
    assert_eq!(plan.lab, "dc1");
    assert_eq!(plan.links, vec!["leaf1:e1-1 <-> h1:eth1".to_string()]);

    let position = |node: &str, stage: Stage| {
        plan.order
            .iter()
            .position(|(n, s)| n == node && *s == stage)
            .unwrap()
    };
    assert!(position("leaf1", Stage::Healthy) < position("h1", Stage::Create));

    let plain = netlab::render_plan(&plan, ExecOutputFormat::Plain).unwrap();
    assert!(plain.starts_with("lab dc1\n"));
    assert!(plain.contains("leaf1:e1-1 <-> h1:eth1"));

    let json: serde_json::Value =
        serde_json::from_str(&netlab::render_plan(&plan, ExecOutputFormat::Json).unwrap()).unwrap();
    assert_eq!(json["lab"], "dc1");
}

#[tokio::test]
async fn test_check_reports_unknown_kind() {
    let dir = TempDir::new().unwrap();
    let manifest = write_manifest(
        &dir,
        "name: bad\nnodes:\n  r1:\n    kind: frr\n",
    );

    let err = netlab::preflight(registry(), &manifest, NetlabConfig::default())
        .await
        .unwrap_err();
    let message = format!("{:#}", err);
    assert!(message.contains("failed pre-flight"));
    assert!(message.contains("\"frr\""));
}

#[tokio::test]
async fn test_check_reports_missing_manifest() {
    let dir = TempDir::new().unwrap();
    let err = netlab::preflight(registry(), &dir.path().join("nope.yml"), NetlabConfig::default())
        .await
        .unwrap_err();
    assert!(err.to_string().contains("failed to load lab manifest"));
}

#[test]
fn test_kinds_json_lists_every_kind() {
    let out = netlab::kinds(&registry(), ExecOutputFormat::Json).unwrap();
    let kinds: Vec<serde_json::Value> = serde_json::from_str(&out).unwrap();
    assert_eq!(kinds.len(), 9);
    let vmx = kinds.iter().find(|k| k["name"] == "juniper_vmx").unwrap();
    assert_eq!(vmx["vm-based"], true);
    assert_eq!(vmx["interface-format"], "ge-0/0/{n}");
}
