use super::{
    ContainerFilter, ContainerRuntime, ContainerSpec, GenericContainer, MgmtNet, SpawnHandle,
    StartedContainer,
};
use crate::error::{NetlabError, NetlabResult};
use crate::exec::{ExecCmd, ExecResult};
use crate::node::config::LABEL_NODE_NAME;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Runtime operations the mock can record, fail or delay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Create,
    Start,
    Exec,
    ExecNotWait,
    List,
    WaitRunning,
    Delete,
}

/// One recorded runtime call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeCall {
    pub op: MockOp,
    /// Node short name when known, container name otherwise
    pub node: String,
    pub container: String,
    pub cmd: Vec<String>,
}

struct ExecResponse {
    node: String,
    needle: String,
    once: bool,
    result: ExecResult,
}

/// Mock runtime for testing (no containers are created)
///
/// Keeps simulated containers in memory, records every call, and lets tests
/// inject failures, delays and canned exec output per node.
pub struct MockRuntime {
    calls: Mutex<Vec<RuntimeCall>>,
    containers: Mutex<HashMap<String, GenericContainer>>,
    ids: Mutex<HashMap<String, String>>,
    failures: Mutex<HashMap<(String, MockOp), String>>,
    delays: Mutex<HashMap<(String, MockOp), Duration>>,
    exec_responses: Mutex<Vec<ExecResponse>>,
    spawn_delays: Mutex<HashMap<String, Duration>>,
    gone_namespaces: Mutex<HashSet<String>>,
    mgmt: MgmtNet,
    next_id: AtomicU64,
}

impl Default for MockRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRuntime {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            containers: Mutex::new(HashMap::new()),
            ids: Mutex::new(HashMap::new()),
            failures: Mutex::new(HashMap::new()),
            delays: Mutex::new(HashMap::new()),
            exec_responses: Mutex::new(Vec::new()),
            spawn_delays: Mutex::new(HashMap::new()),
            gone_namespaces: Mutex::new(HashSet::new()),
            mgmt: MgmtNet {
                ipv4_gw: Some("172.20.20.1".to_string()),
                ipv6_gw: Some("3fff:172:20:20::1".to_string()),
                ..MgmtNet::default()
            },
            next_id: AtomicU64::new(1),
        }
    }

    pub fn with_mgmt(mut self, mgmt: MgmtNet) -> Self {
        self.mgmt = mgmt;
        self
    }

    /// Make `op` fail for `node` (short name or container name)
    pub fn fail_on(&self, node: &str, op: MockOp, message: &str) {
        self.failures
            .lock()
            .insert((node.to_string(), op), message.to_string());
    }

    /// Delay `op` for `node`
    pub fn delay_on(&self, node: &str, op: MockOp, delay: Duration) {
        self.delays.lock().insert((node.to_string(), op), delay);
    }

    /// Make `start_container` return a spawn handle resolved after `delay`
    pub fn spawn_async(&self, node: &str, delay: Duration) {
        self.spawn_delays.lock().insert(node.to_string(), delay);
    }

    /// Answer every exec on `node` whose command line contains `needle`
    pub fn set_exec_response(&self, node: &str, needle: &str, return_code: i32, stdout: &str) {
        self.push_response(node, needle, false, return_code, stdout);
    }

    /// Answer the next matching exec only; consumed before persistent responses
    pub fn push_exec_response_once(&self, node: &str, needle: &str, return_code: i32, stdout: &str) {
        self.push_response(node, needle, true, return_code, stdout);
    }

    fn push_response(&self, node: &str, needle: &str, once: bool, return_code: i32, stdout: &str) {
        let result = ExecResult {
            return_code,
            stdout: stdout.to_string(),
            stderr: if return_code == 0 {
                String::new()
            } else {
                format!("exit status {}", return_code)
            },
            ..Default::default()
        };
        let mut responses = self.exec_responses.lock();
        let entry = ExecResponse {
            node: node.to_string(),
            needle: needle.to_string(),
            once,
            result,
        };
        if once {
            responses.insert(0, entry);
        } else {
            responses.push(entry);
        }
    }

    /// Pretend the container of `node` died and its namespace vanished
    pub fn kill_container(&self, node: &str) {
        let mut containers = self.containers.lock();
        for container in containers.values_mut() {
            if container.labels.get(LABEL_NODE_NAME).map(String::as_str) == Some(node) {
                container.state = "exited".to_string();
                if let Some(path) = container.netns_path.take() {
                    self.gone_namespaces
                        .lock()
                        .insert(path.display().to_string());
                }
            }
        }
    }

    pub fn calls(&self) -> Vec<RuntimeCall> {
        self.calls.lock().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }

    pub fn calls_for(&self, node: &str) -> Vec<RuntimeCall> {
        self.calls
            .lock()
            .iter()
            .filter(|c| c.node == node)
            .cloned()
            .collect()
    }

    pub fn container(&self, name: &str) -> Option<GenericContainer> {
        self.containers.lock().get(name).cloned()
    }

    pub fn container_count(&self) -> usize {
        self.containers.lock().len()
    }

    fn node_of(&self, container: &str) -> String {
        self.containers
            .lock()
            .get(container)
            .and_then(|c| c.labels.get(LABEL_NODE_NAME).cloned())
            .unwrap_or_else(|| container.to_string())
    }

    fn record(&self, op: MockOp, node: &str, container: &str, cmd: &[String]) {
        self.calls.lock().push(RuntimeCall {
            op,
            node: node.to_string(),
            container: container.to_string(),
            cmd: cmd.to_vec(),
        });
    }

    /// Apply configured delay and failure for `op`
    async fn intercept(&self, op: MockOp, node: &str, container: &str) -> NetlabResult<()> {
        let delay = {
            let delays = self.delays.lock();
            delays
                .get(&(node.to_string(), op))
                .or_else(|| delays.get(&(container.to_string(), op)))
                .copied()
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let failure = {
            let failures = self.failures.lock();
            failures
                .get(&(node.to_string(), op))
                .or_else(|| failures.get(&(container.to_string(), op)))
                .cloned()
        };
        match failure {
            Some(message) => Err(NetlabError::runtime(format!("{:?}", op).to_lowercase(), message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for MockRuntime {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create_container(&self, spec: &ContainerSpec) -> NetlabResult<String> {
        let node = spec
            .labels
            .get(LABEL_NODE_NAME)
            .cloned()
            .unwrap_or_else(|| spec.name.clone());
        self.record(MockOp::Create, &node, &spec.name, &[]);
        self.intercept(MockOp::Create, &node, &spec.name).await?;

        let mut containers = self.containers.lock();
        if containers.contains_key(&spec.name) {
            return Err(NetlabError::runtime(
                "create",
                format!("container {} already exists", spec.name),
            ));
        }
        let id = format!("mock-{:08}", self.next_id.fetch_add(1, Ordering::SeqCst));
        containers.insert(
            spec.name.clone(),
            GenericContainer {
                names: vec![spec.name.clone()],
                id: id.clone(),
                image: spec.image.clone(),
                state: "created".to_string(),
                labels: spec.labels.clone(),
                netns_path: None,
                mgmt_ipv4_address: None,
                mgmt_ipv6_address: None,
            },
        );
        self.ids.lock().insert(id.clone(), spec.name.clone());
        Ok(id)
    }

    async fn start_container(&self, id: &str, node: &str) -> NetlabResult<StartedContainer> {
        let name = self
            .ids
            .lock()
            .get(id)
            .cloned()
            .unwrap_or_else(|| id.to_string());
        self.record(MockOp::Start, node, &name, &[]);
        self.intercept(MockOp::Start, node, &name).await?;

        let index = self.next_id.fetch_add(1, Ordering::SeqCst);
        let netns = PathBuf::from(format!("/run/netns/{}", name));
        {
            let mut containers = self.containers.lock();
            let container = containers.get_mut(&name).ok_or_else(|| {
                NetlabError::runtime("start", format!("no such container {}", name))
            })?;
            container.state = "running".to_string();
            container.netns_path = Some(netns.clone());
            container.mgmt_ipv4_address = Some(format!("172.20.20.{}", 1 + index % 250));
            container.mgmt_ipv6_address = Some(format!("3fff:172:20:20::{:x}", 1 + index % 250));
        }

        let spawn_delay = self.spawn_delays.lock().get(node).copied();
        let spawn_finished = spawn_delay.map(|delay| {
            let (notifier, handle) = SpawnHandle::channel();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                notifier.notify(Ok(()));
            });
            handle
        });

        Ok(StartedContainer {
            netns: Some(netns),
            spawn_finished,
        })
    }

    async fn exec(&self, container: &str, cmd: &ExecCmd) -> NetlabResult<ExecResult> {
        let node = self.node_of(container);
        self.record(MockOp::Exec, &node, container, &cmd.cmd);
        self.intercept(MockOp::Exec, &node, container).await?;

        let running = self
            .containers
            .lock()
            .get(container)
            .map(GenericContainer::is_running)
            .unwrap_or(false);
        if !running {
            return Err(NetlabError::runtime(
                "exec",
                format!("container {} is not running", container),
            ));
        }

        let line = cmd.cmd_string();
        let mut responses = self.exec_responses.lock();
        let found = responses
            .iter()
            .position(|r| r.node == node && line.contains(&r.needle));
        let mut result = match found {
            Some(pos) if responses[pos].once => responses.remove(pos).result,
            Some(pos) => responses[pos].result.clone(),
            None => ExecResult::default(),
        };
        result.cmd = cmd.cmd.clone();
        Ok(result)
    }

    async fn exec_not_wait(&self, container: &str, cmd: &ExecCmd) -> NetlabResult<()> {
        let node = self.node_of(container);
        self.record(MockOp::ExecNotWait, &node, container, &cmd.cmd);
        self.intercept(MockOp::ExecNotWait, &node, container).await
    }

    fn mgmt(&self) -> MgmtNet {
        self.mgmt.clone()
    }

    async fn list_containers(&self, filters: &[ContainerFilter]) -> NetlabResult<Vec<GenericContainer>> {
        self.record(MockOp::List, "", "", &[]);
        let mut found: Vec<GenericContainer> = self
            .containers
            .lock()
            .values()
            .filter(|c| filters.iter().all(|f| f.matches(c)))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.names.cmp(&b.names));
        Ok(found)
    }

    async fn wait_for_container_running(&self, name: &str) -> NetlabResult<()> {
        let node = self.node_of(name);
        self.record(MockOp::WaitRunning, &node, name, &[]);
        self.intercept(MockOp::WaitRunning, &node, name).await?;
        match self.containers.lock().get(name) {
            Some(c) if c.is_running() => Ok(()),
            Some(c) => Err(NetlabError::runtime(
                "wait-running",
                format!("container {} is {}", name, c.state),
            )),
            None => Err(NetlabError::runtime(
                "wait-running",
                format!("no such container {}", name),
            )),
        }
    }

    async fn delete_container(&self, name: &str) -> NetlabResult<()> {
        let node = self.node_of(name);
        self.record(MockOp::Delete, &node, name, &[]);
        self.intercept(MockOp::Delete, &node, name).await?;
        if let Some(container) = self.containers.lock().remove(name) {
            self.ids.lock().remove(&container.id);
        }
        Ok(())
    }
}

impl MockRuntime {
    /// Whether the namespace at `path` was removed by [`MockRuntime::kill_container`]
    pub fn namespace_gone(&self, path: &std::path::Path) -> bool {
        self.gone_namespaces
            .lock()
            .contains(&path.display().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::config::NodeConfig;

    fn spec(node: &str) -> ContainerSpec {
        let mut cfg = NodeConfig::new(node, "linux");
        cfg.long_name = format!("clab-test-{}", node);
        ContainerSpec::from_config(&cfg, "test")
    }

    #[tokio::test]
    async fn test_mock_lifecycle() {
        let runtime = MockRuntime::new();
        let id = runtime.create_container(&spec("r1")).await.unwrap();
        let started = runtime.start_container(&id, "r1").await.unwrap();
        assert_eq!(started.netns, Some(PathBuf::from("/run/netns/clab-test-r1")));
        assert!(started.spawn_finished.is_none());

        runtime.wait_for_container_running("clab-test-r1").await.unwrap();
        let listed = runtime
            .list_containers(&[ContainerFilter::label(LABEL_NODE_NAME, "r1")])
            .await
            .unwrap();
        assert_eq!(listed.len(), 1);

        runtime.delete_container("clab-test-r1").await.unwrap();
        runtime.delete_container("clab-test-r1").await.unwrap();
        assert_eq!(runtime.container_count(), 0);
        assert_eq!(runtime.calls_for("r1").len(), 5);
    }

    #[tokio::test]
    async fn test_injected_failure() {
        let runtime = MockRuntime::new();
        runtime.fail_on("r1", MockOp::Create, "image not found");
        let err = runtime.create_container(&spec("r1")).await.unwrap_err();
        assert!(err.to_string().contains("image not found"));
        assert_eq!(runtime.call_count(), 1);
    }

    #[tokio::test]
    async fn test_exec_responses() {
        let runtime = MockRuntime::new();
        let id = runtime.create_container(&spec("r1")).await.unwrap();
        runtime.start_container(&id, "r1").await.unwrap();
        runtime.push_exec_response_once("r1", "state", 0, "starting");
        runtime.set_exec_response("r1", "state", 0, "running");

        let cmd = ExecCmd::new(["show", "state"]);
        assert_eq!(runtime.exec("clab-test-r1", &cmd).await.unwrap().stdout, "starting");
        assert_eq!(runtime.exec("clab-test-r1", &cmd).await.unwrap().stdout, "running");
        assert_eq!(runtime.exec("clab-test-r1", &cmd).await.unwrap().stdout, "running");

        let other = runtime.exec("clab-test-r1", &ExecCmd::new(["true"])).await.unwrap();
        assert_eq!(other.return_code, 0);
        assert_eq!(other.cmd, vec!["true"]);
    }

    #[tokio::test]
    async fn test_async_spawn_handle() {
        let runtime = MockRuntime::new();
        runtime.spawn_async("r1", Duration::from_millis(5));
        let id = runtime.create_container(&spec("r1")).await.unwrap();
        let started = runtime.start_container(&id, "r1").await.unwrap();
        started.spawn_finished.unwrap().wait().await.unwrap();
    }
}
