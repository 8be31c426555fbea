//! Links and endpoints
//!
//! A [`Link`] connects two [`Endpoint`]s of two distinct nodes. Links are
//! declared by the topology layer as [`LinkDefinition`]s, resolved against
//! the live nodes during preflight, and wired by [`LinkWirer`] once both
//! endpoint nodes are wiring-ready.

mod netlink;
mod wiring;

pub use netlink::{IpCommandNetlink, Netlink, NetlinkOp, RecordingNetlink, SimInterface};
pub use wiring::{LinkWirer, WiredLeg};

use crate::error::{NetlabError, NetlabResult};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use std::sync::atomic::{AtomicU8, Ordering};

/// Prefix of generated MAC addresses (locally administered, unicast)
pub const MAC_PREFIX: &str = "aa:c1:ab";

/// Default MTU of wired veth pairs
pub const DEFAULT_LINK_MTU: u32 = 9500;

/// How an endpoint of a node kind is wired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkEndpointType {
    /// veth leg moved into the node's own namespace
    #[default]
    Veth,
    /// veth leg attached as a port of a bridge in the root namespace
    Bridge,
    /// veth leg left in the root namespace
    Host,
    /// veth leg in the namespace of a container running a VM
    Vm,
}

impl LinkEndpointType {
    /// Endpoints whose leg stays in the root namespace
    pub fn is_root_namespace(&self) -> bool {
        matches!(self, LinkEndpointType::Bridge | LinkEndpointType::Host)
    }
}

impl fmt::Display for LinkEndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LinkEndpointType::Veth => "veth",
            LinkEndpointType::Bridge => "bridge",
            LinkEndpointType::Host => "host",
            LinkEndpointType::Vm => "vm",
        };
        f.write_str(name)
    }
}

/// One interface of one node
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Endpoint {
    pub node: String,
    pub interface: String,
    pub endpoint_type: LinkEndpointType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

impl Endpoint {
    pub fn new(node: impl Into<String>, interface: impl Into<String>, endpoint_type: LinkEndpointType) -> Self {
        Self {
            node: node.into(),
            interface: interface.into(),
            endpoint_type,
            mac: None,
        }
    }

    pub fn with_mac(mut self, mac: impl Into<String>) -> Self {
        self.mac = Some(mac.into());
        self
    }

    /// Configured MAC, or the deterministic one derived from node and interface
    pub fn mac_address(&self) -> String {
        self.mac
            .clone()
            .unwrap_or_else(|| generate_mac(&self.node, &self.interface))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.interface)
    }
}

/// Deterministic locally administered MAC for `node`/`interface`
pub fn generate_mac(node: &str, interface: &str) -> String {
    let mut hasher = DefaultHasher::new();
    node.hash(&mut hasher);
    interface.hash(&mut hasher);
    let bytes = hasher.finish().to_be_bytes();
    format!("{}:{:02x}:{:02x}:{:02x}", MAC_PREFIX, bytes[5], bytes[6], bytes[7])
}

/// Endpoint as declared by the topology layer, `node:interface` or a map
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawEndpoint")]
pub struct EndpointDefinition {
    pub node: String,
    pub interface: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mac: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawEndpoint {
    Short(String),
    Full {
        node: String,
        interface: String,
        #[serde(default)]
        mac: Option<String>,
    },
}

impl TryFrom<RawEndpoint> for EndpointDefinition {
    type Error = NetlabError;

    fn try_from(raw: RawEndpoint) -> Result<Self, Self::Error> {
        match raw {
            RawEndpoint::Short(s) => s.parse(),
            RawEndpoint::Full { node, interface, mac } => Ok(Self { node, interface, mac }),
        }
    }
}

impl FromStr for EndpointDefinition {
    type Err = NetlabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((node, interface)) if !node.is_empty() && !interface.is_empty() => Ok(Self {
                node: node.to_string(),
                interface: interface.to_string(),
                mac: None,
            }),
            _ => Err(NetlabError::configuration(
                "links",
                format!("endpoint {:?} must have the form node:interface", s),
            )),
        }
    }
}

impl fmt::Display for EndpointDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.interface)
    }
}

/// Point-to-point link as declared by the topology layer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkDefinition {
    pub endpoints: Vec<EndpointDefinition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtu: Option<u32>,
}

impl LinkDefinition {
    pub fn new(a: &str, b: &str) -> NetlabResult<Self> {
        Ok(Self {
            endpoints: vec![a.parse()?, b.parse()?],
            mtu: None,
        })
    }

    pub fn with_mtu(mut self, mtu: u32) -> Self {
        self.mtu = Some(mtu);
        self
    }

    /// The two endpoints, or a configuration error when there are not exactly two
    pub fn pair(&self) -> NetlabResult<(&EndpointDefinition, &EndpointDefinition)> {
        match self.endpoints.as_slice() {
            [a, b] => Ok((a, b)),
            other => Err(NetlabError::configuration(
                "links",
                format!("a link needs exactly two endpoints, got {}", other.len()),
            )),
        }
    }
}

/// Wiring state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
#[repr(u8)]
pub enum LinkState {
    Unwired = 0,
    Wiring = 1,
    Wired = 2,
    Failed = 3,
}

impl LinkState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => LinkState::Wiring,
            2 => LinkState::Wired,
            3 => LinkState::Failed,
            _ => LinkState::Unwired,
        }
    }
}

/// A resolved link between two node endpoints
///
/// The wiring state is an atomic so both endpoint units can race to claim
/// the link; only the winner of [`Link::try_claim`] performs the wiring.
#[derive(Debug)]
pub struct Link {
    id: String,
    a: Endpoint,
    b: Endpoint,
    mtu: u32,
    state: AtomicU8,
    legs: Mutex<Vec<WiredLeg>>,
}

impl Link {
    /// Fails on self-links
    pub fn new(a: Endpoint, b: Endpoint, mtu: Option<u32>) -> NetlabResult<Self> {
        if a.node == b.node {
            return Err(NetlabError::configuration(
                "links",
                format!("link {} <-> {} connects a node to itself", a, b),
            ));
        }
        Ok(Self {
            id: format!("{}__{}", a, b),
            a,
            b,
            mtu: mtu.unwrap_or(DEFAULT_LINK_MTU),
            state: AtomicU8::new(LinkState::Unwired as u8),
            legs: Mutex::new(Vec::new()),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn endpoints(&self) -> (&Endpoint, &Endpoint) {
        (&self.a, &self.b)
    }

    pub fn mtu(&self) -> u32 {
        self.mtu
    }

    pub fn touches(&self, node: &str) -> bool {
        self.a.node == node || self.b.node == node
    }

    /// The endpoint on the other side of `node`
    pub fn peer_of(&self, node: &str) -> Option<&Endpoint> {
        if self.a.node == node {
            Some(&self.b)
        } else if self.b.node == node {
            Some(&self.a)
        } else {
            None
        }
    }

    pub fn state(&self) -> LinkState {
        LinkState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move Unwired to Wiring; false if someone else owns the link
    pub fn try_claim(&self) -> bool {
        self.state
            .compare_exchange(
                LinkState::Unwired as u8,
                LinkState::Wiring as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn set_state(&self, state: LinkState) {
        self.state.store(state as u8, Ordering::Release);
    }

    pub(crate) fn record_legs(&self, legs: Vec<WiredLeg>) {
        *self.legs.lock() = legs;
    }

    pub(crate) fn take_legs(&self) -> Vec<WiredLeg> {
        std::mem::take(&mut *self.legs.lock())
    }

    pub fn wired_legs(&self) -> Vec<WiredLeg> {
        self.legs.lock().clone()
    }
}

impl fmt::Display for Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} <-> {}", self.a, self.b)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_generated_mac_is_stable_and_local() {
        let a = generate_mac("r1", "eth1");
        assert_eq!(a, generate_mac("r1", "eth1"));
        assert_ne!(a, generate_mac("r1", "eth2"));
        assert!(a.starts_with("aa:c1:ab:"));
        assert_eq!(a.len(), 17);
    }

    #[test]
    fn test_link_definition_deserialize_both_forms() {
        let def: LinkDefinition = serde_yaml::from_str(
            "endpoints:\n  - srl1:e1-1\n  - node: srl2\n    interface: e1-1\n    mac: aa:bb:cc:dd:ee:ff\nmtu: 1500\n",
        )
        .unwrap();
        let (a, b) = def.pair().unwrap();
        assert_eq!(a.to_string(), "srl1:e1-1");
        assert_eq!(b.mac.as_deref(), Some("aa:bb:cc:dd:ee:ff"));
        assert_eq!(def.mtu, Some(1500));

        assert!(serde_yaml::from_str::<LinkDefinition>("endpoints: [\"nointerface\", \"a:b\"]").is_err());
    }

    #[test]
    fn test_self_link_rejected() {
        let a = Endpoint::new("r1", "eth1", LinkEndpointType::Veth);
        let b = Endpoint::new("r1", "eth2", LinkEndpointType::Veth);
        assert!(Link::new(a, b, None).is_err());
    }

    #[test]
    fn test_claim_is_exclusive() {
        let link = Link::new(
            Endpoint::new("r1", "eth1", LinkEndpointType::Veth),
            Endpoint::new("br", "br-p1", LinkEndpointType::Bridge),
            None,
        )
        .unwrap();
        assert!(link.try_claim());
        assert!(!link.try_claim());
        assert_eq!(link.state(), LinkState::Wiring);
        assert_eq!(link.peer_of("r1").unwrap().node, "br");
        assert_eq!(link.mtu(), DEFAULT_LINK_MTU);
    }
}
