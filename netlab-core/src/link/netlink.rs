//! Kernel link operations
//!
//! [`Netlink`] is the narrow set of interface operations wiring needs.
//! [`IpCommandNetlink`] drives iproute2 and ethtool through a
//! [`CommandExecutor`]; [`RecordingNetlink`] simulates the kernel in memory
//! for tests.

use crate::command::CommandExecutor;
use crate::config::WiringConfig;
use crate::error::{NetlabError, NetlabResult};
use async_trait::async_trait;
use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// Interface operations used by link wiring
///
/// `netns: None` addresses the root namespace.
#[async_trait]
pub trait Netlink: Send + Sync {
    /// Create a veth pair `a`/`b` in the root namespace
    async fn link_add_veth(&self, a: &str, b: &str, mtu: u32) -> NetlabResult<()>;

    /// Move a root-namespace interface into the namespace at `netns`
    async fn link_set_netns(&self, name: &str, netns: &Path) -> NetlabResult<()>;

    async fn link_set_name(&self, netns: Option<&Path>, current: &str, new: &str) -> NetlabResult<()>;

    async fn link_set_mac(&self, netns: Option<&Path>, name: &str, mac: &str) -> NetlabResult<()>;

    async fn link_set_up(&self, netns: Option<&Path>, name: &str) -> NetlabResult<()>;

    /// Attach a root-namespace interface to bridge `master`
    async fn link_set_master(&self, name: &str, master: &str) -> NetlabResult<()>;

    async fn link_del(&self, netns: Option<&Path>, name: &str) -> NetlabResult<()>;

    async fn link_exists(&self, netns: Option<&Path>, name: &str) -> NetlabResult<bool>;

    async fn namespace_exists(&self, netns: &Path) -> NetlabResult<bool>;

    async fn set_tx_offload(&self, netns: Option<&Path>, name: &str, enabled: bool) -> NetlabResult<()>;
}

/// Map iproute2/ethtool error output to an errno
pub fn errno_from_stderr(stderr: &str) -> Errno {
    let table: &[(&str, Errno)] = &[
        ("File exists", Errno::EEXIST),
        ("Cannot find device", Errno::ENODEV),
        ("does not exist", Errno::ENODEV),
        ("No such device", Errno::ENODEV),
        ("Operation not permitted", Errno::EPERM),
        ("Permission denied", Errno::EACCES),
        ("No such file or directory", Errno::ENOENT),
        ("Invalid argument", Errno::EINVAL),
        ("Device or resource busy", Errno::EBUSY),
        ("Numerical result out of range", Errno::ERANGE),
        ("Operation not supported", Errno::EOPNOTSUPP),
    ];
    table
        .iter()
        .find(|(needle, _)| stderr.contains(needle))
        .map(|(_, errno)| *errno)
        .unwrap_or(Errno::EIO)
}

/// [`Netlink`] implemented with `ip`, `ethtool` and `nsenter`
pub struct IpCommandNetlink {
    executor: Arc<dyn CommandExecutor>,
    config: WiringConfig,
}

impl IpCommandNetlink {
    pub fn new(executor: Arc<dyn CommandExecutor>, config: WiringConfig) -> Self {
        Self { executor, config }
    }

    async fn run(&self, operation: &str, netns: Option<&Path>, program: &str, args: &[&str]) -> NetlabResult<String> {
        let nsenter_arg;
        let mut full: Vec<&str> = Vec::with_capacity(args.len() + 4);
        let binary = match netns {
            Some(path) => {
                nsenter_arg = format!("--net={}", path.display());
                full.push(&nsenter_arg);
                full.push("--");
                full.push(program);
                self.config.nsenter_binary.as_str()
            }
            None => program,
        };
        full.extend_from_slice(args);

        debug!(operation, "{} {}", binary, full.join(" "));
        let output = self
            .executor
            .execute(binary, &full, Some(self.config.command_timeout))
            .await?;
        if output.success {
            Ok(output.stdout_lossy())
        } else {
            let stderr = output.stderr_lossy();
            let errno = errno_from_stderr(&stderr);
            Err(NetlabError::netlink(operation, errno as i32, stderr.trim()))
        }
    }

    async fn ip(&self, operation: &str, netns: Option<&Path>, args: &[&str]) -> NetlabResult<String> {
        let ip = self.config.ip_binary.clone();
        self.run(operation, netns, &ip, args).await
    }
}

/// Argument `ip link set ... netns <target>` accepts for a namespace path
fn netns_target(path: &Path) -> NetlabResult<String> {
    let parts: Vec<&str> = path
        .components()
        .filter_map(|c| c.as_os_str().to_str())
        .filter(|c| *c != "/")
        .collect();
    match parts.as_slice() {
        ["proc", pid, "ns", "net"] if pid.chars().all(|c| c.is_ascii_digit()) => Ok(pid.to_string()),
        ["var", "run", "netns", name] | ["run", "netns", name] => Ok(name.to_string()),
        _ => Err(NetlabError::netlink(
            "link-set-netns",
            Errno::EINVAL as i32,
            format!("unsupported namespace path {}", path.display()),
        )),
    }
}

#[async_trait]
impl Netlink for IpCommandNetlink {
    async fn link_add_veth(&self, a: &str, b: &str, mtu: u32) -> NetlabResult<()> {
        let mtu = mtu.to_string();
        self.ip(
            "link-add",
            None,
            &["link", "add", a, "mtu", &mtu, "type", "veth", "peer", "name", b, "mtu", &mtu],
        )
        .await
        .map(drop)
    }

    async fn link_set_netns(&self, name: &str, netns: &Path) -> NetlabResult<()> {
        let target = netns_target(netns)?;
        self.ip("link-set-netns", None, &["link", "set", "dev", name, "netns", &target])
            .await
            .map(drop)
    }

    async fn link_set_name(&self, netns: Option<&Path>, current: &str, new: &str) -> NetlabResult<()> {
        self.ip("link-set-name", netns, &["link", "set", "dev", current, "name", new])
            .await
            .map(drop)
    }

    async fn link_set_mac(&self, netns: Option<&Path>, name: &str, mac: &str) -> NetlabResult<()> {
        self.ip("link-set-address", netns, &["link", "set", "dev", name, "address", mac])
            .await
            .map(drop)
    }

    async fn link_set_up(&self, netns: Option<&Path>, name: &str) -> NetlabResult<()> {
        self.ip("link-set-up", netns, &["link", "set", "dev", name, "up"])
            .await
            .map(drop)
    }

    async fn link_set_master(&self, name: &str, master: &str) -> NetlabResult<()> {
        self.ip("link-set-master", None, &["link", "set", "dev", name, "master", master])
            .await
            .map(drop)
    }

    async fn link_del(&self, netns: Option<&Path>, name: &str) -> NetlabResult<()> {
        self.ip("link-del", netns, &["link", "del", "dev", name])
            .await
            .map(drop)
    }

    async fn link_exists(&self, netns: Option<&Path>, name: &str) -> NetlabResult<bool> {
        match self.ip("link-show", netns, &["link", "show", "dev", name]).await {
            Ok(_) => Ok(true),
            Err(e) if e.errno() == Some(Errno::ENODEV as i32) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn namespace_exists(&self, netns: &Path) -> NetlabResult<bool> {
        Ok(tokio::fs::metadata(netns).await.is_ok())
    }

    async fn set_tx_offload(&self, netns: Option<&Path>, name: &str, enabled: bool) -> NetlabResult<()> {
        let ethtool = self.config.ethtool_binary.clone();
        let value = if enabled { "on" } else { "off" };
        self.run("set-tx-offload", netns, &ethtool, &["-K", name, "tx", value])
            .await
            .map(drop)
    }
}

/// A mutation performed on [`RecordingNetlink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NetlinkOp {
    AddVeth { a: String, b: String, mtu: u32 },
    SetNetns { name: String, netns: PathBuf },
    SetName { netns: Option<PathBuf>, current: String, new: String },
    SetMac { netns: Option<PathBuf>, name: String, mac: String },
    SetUp { netns: Option<PathBuf>, name: String },
    SetMaster { name: String, master: String },
    Del { netns: Option<PathBuf>, name: String },
    SetTxOffload { netns: Option<PathBuf>, name: String, enabled: bool },
}

impl NetlinkOp {
    /// Short operation name, used to inject failures
    pub fn kind(&self) -> &'static str {
        match self {
            NetlinkOp::AddVeth { .. } => "add-veth",
            NetlinkOp::SetNetns { .. } => "set-netns",
            NetlinkOp::SetName { .. } => "set-name",
            NetlinkOp::SetMac { .. } => "set-mac",
            NetlinkOp::SetUp { .. } => "set-up",
            NetlinkOp::SetMaster { .. } => "set-master",
            NetlinkOp::Del { .. } => "del",
            NetlinkOp::SetTxOffload { .. } => "set-tx-offload",
        }
    }
}

/// Simulated interface of [`RecordingNetlink`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimInterface {
    pub id: u64,
    pub netns: Option<PathBuf>,
    pub name: String,
    pub up: bool,
    pub mac: Option<String>,
    pub master: Option<String>,
    pub mtu: u32,
    pub tx_offload: bool,
    pub peer: Option<u64>,
    pub is_bridge: bool,
}

#[derive(Default)]
struct SimState {
    ops: Vec<NetlinkOp>,
    interfaces: Vec<SimInterface>,
    gone: HashSet<PathBuf>,
    failures: Vec<(&'static str, Errno)>,
    next_id: u64,
}

impl SimState {
    fn find(&self, netns: Option<&Path>, name: &str) -> Option<usize> {
        self.interfaces
            .iter()
            .position(|i| i.netns.as_deref() == netns && i.name == name)
    }

    fn require(&self, netns: Option<&Path>, name: &str) -> NetlabResult<usize> {
        if let Some(path) = netns {
            if self.gone.contains(path) {
                return Err(sim_error("lookup", Errno::ENOENT, &format!("namespace {} is gone", path.display())));
            }
        }
        self.find(netns, name)
            .ok_or_else(|| sim_error("lookup", Errno::ENODEV, &format!("Cannot find device \"{}\"", name)))
    }

    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }
}

fn sim_error(operation: &str, errno: Errno, message: &str) -> NetlabError {
    NetlabError::netlink(operation, errno as i32, message)
}

/// In-memory kernel simulation that records every mutation
///
/// Namespaces exist unless removed with [`RecordingNetlink::remove_namespace`].
#[derive(Default)]
pub struct RecordingNetlink {
    state: Mutex<SimState>,
}

impl RecordingNetlink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a bridge in the root namespace
    pub fn add_bridge(&self, name: &str) {
        let mut state = self.state.lock();
        let id = state.next_id();
        state.interfaces.push(SimInterface {
            id,
            netns: None,
            name: name.to_string(),
            up: true,
            mac: None,
            master: None,
            mtu: 1500,
            tx_offload: true,
            peer: None,
            is_bridge: true,
        });
    }

    /// Make the namespace at `path` disappear, with everything inside it
    pub fn remove_namespace(&self, path: &Path) {
        let mut state = self.state.lock();
        state.gone.insert(path.to_path_buf());
        let removed: Vec<u64> = state
            .interfaces
            .iter()
            .filter(|i| i.netns.as_deref() == Some(path))
            .map(|i| i.id)
            .collect();
        state
            .interfaces
            .retain(|i| !removed.contains(&i.id) && !i.peer.map(|p| removed.contains(&p)).unwrap_or(false));
    }

    /// Fail every following operation of `kind` (see [`NetlinkOp::kind`])
    pub fn fail_on(&self, kind: &'static str, errno: Errno) {
        self.state.lock().failures.push((kind, errno));
    }

    /// Drop every failure injected with [`RecordingNetlink::fail_on`]
    pub fn clear_failures(&self) {
        self.state.lock().failures.clear();
    }

    pub fn mutations(&self) -> Vec<NetlinkOp> {
        self.state.lock().ops.clone()
    }

    pub fn mutation_count(&self) -> usize {
        self.state.lock().ops.len()
    }

    /// Number of non-bridge interfaces currently present
    pub fn interface_count(&self) -> usize {
        self.state.lock().interfaces.iter().filter(|i| !i.is_bridge).count()
    }

    pub fn interfaces(&self) -> Vec<SimInterface> {
        self.state.lock().interfaces.clone()
    }

    pub fn interface(&self, netns: Option<&Path>, name: &str) -> Option<SimInterface> {
        let state = self.state.lock();
        state.find(netns, name).map(|i| state.interfaces[i].clone())
    }

    fn check_failure(state: &SimState, kind: &'static str) -> NetlabResult<()> {
        match state.failures.iter().find(|(k, _)| *k == kind) {
            Some((_, errno)) => Err(sim_error(kind, *errno, errno.desc())),
            None => Ok(()),
        }
    }

    fn mutate<F>(&self, op: NetlinkOp, apply: F) -> NetlabResult<()>
    where
        F: FnOnce(&mut SimState) -> NetlabResult<()>,
    {
        let mut state = self.state.lock();
        Self::check_failure(&state, op.kind())?;
        apply(&mut state)?;
        state.ops.push(op);
        Ok(())
    }
}

#[async_trait]
impl Netlink for RecordingNetlink {
    async fn link_add_veth(&self, a: &str, b: &str, mtu: u32) -> NetlabResult<()> {
        let op = NetlinkOp::AddVeth {
            a: a.to_string(),
            b: b.to_string(),
            mtu,
        };
        self.mutate(op, |state| {
            if state.find(None, a).is_some() || state.find(None, b).is_some() || a == b {
                return Err(sim_error("add-veth", Errno::EEXIST, "RTNETLINK answers: File exists"));
            }
            let id_a = state.next_id();
            let id_b = state.next_id();
            for (id, name, peer) in [(id_a, a, id_b), (id_b, b, id_a)] {
                state.interfaces.push(SimInterface {
                    id,
                    netns: None,
                    name: name.to_string(),
                    up: false,
                    mac: None,
                    master: None,
                    mtu,
                    tx_offload: true,
                    peer: Some(peer),
                    is_bridge: false,
                });
            }
            Ok(())
        })
    }

    async fn link_set_netns(&self, name: &str, netns: &Path) -> NetlabResult<()> {
        let op = NetlinkOp::SetNetns {
            name: name.to_string(),
            netns: netns.to_path_buf(),
        };
        self.mutate(op, |state| {
            let idx = state.require(None, name)?;
            if state.gone.contains(netns) {
                return Err(sim_error("set-netns", Errno::ENOENT, "No such file or directory"));
            }
            if state.find(Some(netns), name).is_some() {
                return Err(sim_error("set-netns", Errno::EEXIST, "RTNETLINK answers: File exists"));
            }
            state.interfaces[idx].netns = Some(netns.to_path_buf());
            state.interfaces[idx].up = false;
            Ok(())
        })
    }

    async fn link_set_name(&self, netns: Option<&Path>, current: &str, new: &str) -> NetlabResult<()> {
        let op = NetlinkOp::SetName {
            netns: netns.map(Path::to_path_buf),
            current: current.to_string(),
            new: new.to_string(),
        };
        self.mutate(op, |state| {
            let idx = state.require(netns, current)?;
            if state.find(netns, new).is_some() {
                return Err(sim_error("set-name", Errno::EEXIST, "RTNETLINK answers: File exists"));
            }
            state.interfaces[idx].name = new.to_string();
            Ok(())
        })
    }

    async fn link_set_mac(&self, netns: Option<&Path>, name: &str, mac: &str) -> NetlabResult<()> {
        let op = NetlinkOp::SetMac {
            netns: netns.map(Path::to_path_buf),
            name: name.to_string(),
            mac: mac.to_string(),
        };
        self.mutate(op, |state| {
            let idx = state.require(netns, name)?;
            state.interfaces[idx].mac = Some(mac.to_string());
            Ok(())
        })
    }

    async fn link_set_up(&self, netns: Option<&Path>, name: &str) -> NetlabResult<()> {
        let op = NetlinkOp::SetUp {
            netns: netns.map(Path::to_path_buf),
            name: name.to_string(),
        };
        self.mutate(op, |state| {
            let idx = state.require(netns, name)?;
            state.interfaces[idx].up = true;
            Ok(())
        })
    }

    async fn link_set_master(&self, name: &str, master: &str) -> NetlabResult<()> {
        let op = NetlinkOp::SetMaster {
            name: name.to_string(),
            master: master.to_string(),
        };
        self.mutate(op, |state| {
            let bridge = state.require(None, master)?;
            if !state.interfaces[bridge].is_bridge {
                return Err(sim_error("set-master", Errno::EINVAL, "not a bridge"));
            }
            let idx = state.require(None, name)?;
            state.interfaces[idx].master = Some(master.to_string());
            Ok(())
        })
    }

    async fn link_del(&self, netns: Option<&Path>, name: &str) -> NetlabResult<()> {
        let op = NetlinkOp::Del {
            netns: netns.map(Path::to_path_buf),
            name: name.to_string(),
        };
        self.mutate(op, |state| {
            let idx = state.require(netns, name)?;
            let removed = state.interfaces.remove(idx);
            if let Some(peer) = removed.peer {
                state.interfaces.retain(|i| i.id != peer);
            }
            Ok(())
        })
    }

    async fn link_exists(&self, netns: Option<&Path>, name: &str) -> NetlabResult<bool> {
        let state = self.state.lock();
        if let Some(path) = netns {
            if state.gone.contains(path) {
                return Ok(false);
            }
        }
        Ok(state.find(netns, name).is_some())
    }

    async fn namespace_exists(&self, netns: &Path) -> NetlabResult<bool> {
        Ok(!self.state.lock().gone.contains(netns))
    }

    async fn set_tx_offload(&self, netns: Option<&Path>, name: &str, enabled: bool) -> NetlabResult<()> {
        let op = NetlinkOp::SetTxOffload {
            netns: netns.map(Path::to_path_buf),
            name: name.to_string(),
            enabled,
        };
        self.mutate(op, |state| {
            let idx = state.require(netns, name)?;
            state.interfaces[idx].tx_offload = enabled;
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockCommandExecutor};
    use pretty_assertions::assert_eq;
    use test_case::test_case;

    #[test_case("RTNETLINK answers: File exists", Errno::EEXIST; "exists")]
    #[test_case("Cannot find device \"eth9\"", Errno::ENODEV; "no device")]
    #[test_case("RTNETLINK answers: Operation not permitted", Errno::EPERM; "permission")]
    #[test_case("something odd", Errno::EIO; "fallback")]
    fn test_errno_from_stderr(stderr: &str, expected: Errno) {
        assert_eq!(errno_from_stderr(stderr), expected);
    }

    #[test_case("/proc/4242/ns/net", Some("4242"); "pid path")]
    #[test_case("/run/netns/clab-r1", Some("clab-r1"); "run netns")]
    #[test_case("/var/run/netns/clab-r1", Some("clab-r1"); "var run netns")]
    #[test_case("/tmp/whatever", None; "unsupported")]
    fn test_netns_target(path: &str, expected: Option<&str>) {
        assert_eq!(netns_target(Path::new(path)).ok().as_deref(), expected);
    }

    #[tokio::test]
    async fn test_ip_command_in_namespace() {
        let executor = MockCommandExecutor::new();
        executor.expect(
            "nsenter",
            &["--net=/run/netns/r1", "--", "ip", "link", "set", "dev", "nlabc", "name", "eth1"],
            Ok(CommandOutput::ok("")),
        );
        executor.expect(
            "ip",
            &["link", "set", "dev", "eth1", "master", "br0"],
            Ok(CommandOutput::failed(2, "RTNETLINK answers: File exists\n")),
        );
        let netlink = IpCommandNetlink::new(Arc::new(executor.clone()), WiringConfig::default());

        netlink
            .link_set_name(Some(Path::new("/run/netns/r1")), "nlabc", "eth1")
            .await
            .unwrap();
        let err = netlink.link_set_master("eth1", "br0").await.unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EEXIST as i32));
        executor.verify().unwrap();
    }

    #[tokio::test]
    async fn test_link_exists_maps_enodev_to_false() {
        let executor = MockCommandExecutor::new();
        executor.expect(
            "ip",
            &["link", "show", "dev", "br0"],
            Ok(CommandOutput::failed(1, "Device \"br0\" does not exist.\n")),
        );
        let netlink = IpCommandNetlink::new(Arc::new(executor), WiringConfig::default());
        assert!(!netlink.link_exists(None, "br0").await.unwrap());
    }

    #[tokio::test]
    async fn test_recording_netlink_veth_lifecycle() {
        let netlink = RecordingNetlink::new();
        let ns = Path::new("/run/netns/r1");
        netlink.link_add_veth("nla", "nlb", 1500).await.unwrap();
        netlink.link_set_netns("nla", ns).await.unwrap();
        netlink.link_set_name(Some(ns), "nla", "eth1").await.unwrap();
        netlink.link_set_up(Some(ns), "eth1").await.unwrap();

        let iface = netlink.interface(Some(ns), "eth1").unwrap();
        assert!(iface.up);
        assert_eq!(netlink.interface_count(), 2);

        // deleting one leg removes the peer as well
        netlink.link_del(Some(ns), "eth1").await.unwrap();
        assert_eq!(netlink.interface_count(), 0);
        assert_eq!(netlink.mutation_count(), 5);
    }

    #[tokio::test]
    async fn test_recording_netlink_injected_failure() {
        let netlink = RecordingNetlink::new();
        netlink.fail_on("add-veth", Errno::EPERM);
        let err = netlink.link_add_veth("a", "b", 1500).await.unwrap_err();
        assert_eq!(err.errno(), Some(Errno::EPERM as i32));
        assert_eq!(netlink.mutation_count(), 0);
    }
}
