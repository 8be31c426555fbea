//! Veth wiring between two node endpoints

use super::{Endpoint, Link, LinkState, Netlink};
use crate::config::WiringConfig;
use crate::error::{NetlabError, NetlabResult};
use crate::node::Node;
use nix::errno::Errno;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// One leg of a wired link, where it ended up
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WiredLeg {
    pub node: String,
    pub name: String,
    /// `None` for legs in the root namespace
    pub netns: Option<PathBuf>,
}

/// Where one side of a link goes
struct Side<'a> {
    node: &'a dyn Node,
    endpoint: &'a Endpoint,
    netns: Option<PathBuf>,
}

/// Current name and namespace of a leg during wiring, for rollback
struct LegCursor {
    name: String,
    netns: Option<PathBuf>,
}

/// Transient interface name used between creation and rename
fn transient_name() -> String {
    let suffix: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(8)
        .map(char::from)
        .collect();
    format!("nl{}", suffix)
}

/// Creates and removes veth pairs for links
pub struct LinkWirer {
    netlink: Arc<dyn Netlink>,
    config: WiringConfig,
}

impl LinkWirer {
    pub fn new(netlink: Arc<dyn Netlink>, config: WiringConfig) -> Self {
        Self { netlink, config }
    }

    pub fn netlink(&self) -> &Arc<dyn Netlink> {
        &self.netlink
    }

    /// Wire `link` between the nodes owning its endpoints.
    ///
    /// The link is claimed atomically first; a second call fails with
    /// [`NetlabError::AlreadyWired`]. Interface names, namespaces and bridge
    /// presence are validated before the first mutation, and a failure after
    /// the pair was created deletes it again.
    #[instrument(skip_all, fields(link = %link))]
    pub async fn wire(&self, link: &Link, a: &dyn Node, b: &dyn Node) -> NetlabResult<()> {
        if !link.try_claim() {
            return Err(NetlabError::AlreadyWired {
                link: link.id().to_string(),
            });
        }

        let sides = match self.validate(link, a, b).await {
            Ok(sides) => sides,
            Err(e) => {
                link.set_state(LinkState::Unwired);
                return Err(NetlabError::wiring(link.id(), e));
            }
        };

        match self.create_pair(link, &sides).await {
            Ok(legs) => {
                link.record_legs(legs);
                link.set_state(LinkState::Wired);
                info!("link wired");
                Ok(())
            }
            Err(e) => {
                link.set_state(LinkState::Failed);
                Err(NetlabError::wiring(link.id(), e))
            }
        }
    }

    async fn validate<'a>(&self, link: &'a Link, a: &'a dyn Node, b: &'a dyn Node) -> NetlabResult<[Side<'a>; 2]> {
        let (ep_a, ep_b) = link.endpoints();
        a.check_endpoint(ep_a)?;
        b.check_endpoint(ep_b)?;

        let side_a = self.resolve_side(a, ep_a).await?;
        let side_b = self.resolve_side(b, ep_b).await?;
        Ok([side_a, side_b])
    }

    async fn resolve_side<'a>(&self, node: &'a dyn Node, endpoint: &'a Endpoint) -> NetlabResult<Side<'a>> {
        if endpoint.endpoint_type.is_root_namespace() {
            if let Some(root) = node.as_root_namespace() {
                root.check_attachable(self.netlink.as_ref()).await?;
            }
            return Ok(Side {
                node,
                endpoint,
                netns: None,
            });
        }

        let netns = node.namespace_path().ok_or_else(|| NetlabError::NamespaceGone {
            node: endpoint.node.clone(),
            path: "<none>".to_string(),
        })?;
        if !self.netlink.namespace_exists(&netns).await? {
            return Err(NetlabError::NamespaceGone {
                node: endpoint.node.clone(),
                path: netns.display().to_string(),
            });
        }
        Ok(Side {
            node,
            endpoint,
            netns: Some(netns),
        })
    }

    async fn create_pair(&self, link: &Link, sides: &[Side<'_>; 2]) -> NetlabResult<Vec<WiredLeg>> {
        let mut legs = [
            LegCursor {
                name: transient_name(),
                netns: None,
            },
            LegCursor {
                name: transient_name(),
                netns: None,
            },
        ];
        self.netlink
            .link_add_veth(&legs[0].name, &legs[1].name, link.mtu())
            .await?;
        debug!(a = %legs[0].name, b = %legs[1].name, "veth pair created");

        for (i, side) in sides.iter().enumerate() {
            if let Err(e) = self.place_leg(&mut legs[i], side).await {
                self.rollback(&legs).await;
                return Err(e);
            }
        }

        Ok(sides
            .iter()
            .map(|side| WiredLeg {
                node: side.endpoint.node.clone(),
                name: side.endpoint.interface.clone(),
                netns: side.netns.clone(),
            })
            .collect())
    }

    /// Move, rename, address and enable one leg, tracking where it is
    async fn place_leg(&self, leg: &mut LegCursor, side: &Side<'_>) -> NetlabResult<()> {
        if let Some(netns) = &side.netns {
            self.netlink.link_set_netns(&leg.name, netns).await?;
            leg.netns = Some(netns.clone());
        }
        let netns = leg.netns.as_deref();
        let interface = side.endpoint.interface.as_str();

        self.netlink.link_set_name(netns, &leg.name, interface).await?;
        leg.name = interface.to_string();

        self.netlink
            .link_set_mac(netns, interface, &side.endpoint.mac_address())
            .await?;
        self.netlink.link_set_up(netns, interface).await?;

        if self.config.disable_tx_offload && netns.is_some() {
            self.netlink.set_tx_offload(netns, interface, false).await?;
        }

        if let Some(root) = side.node.as_root_namespace() {
            root.attach_port(self.netlink.as_ref(), interface).await?;
        }
        Ok(())
    }

    /// Deleting one veth leg removes its peer, so one successful delete is enough
    async fn rollback(&self, legs: &[LegCursor]) {
        for leg in legs {
            match self.netlink.link_del(leg.netns.as_deref(), &leg.name).await {
                Ok(()) => return,
                Err(e) => warn!(leg = %leg.name, error = %e, "rollback could not delete veth leg"),
            }
        }
    }

    /// Remove the interfaces of a wired link; no-op for links that are not wired
    #[instrument(skip_all, fields(link = %link))]
    pub async fn unwire(&self, link: &Link) -> NetlabResult<()> {
        if link.state() != LinkState::Wired {
            return Ok(());
        }

        let legs = link.take_legs();
        for (i, leg) in legs.iter().enumerate() {
            if let Err(e) = self.delete_leg(leg).await {
                // legs not yet deleted stay recorded so a retry finds them
                link.record_legs(legs[i..].to_vec());
                return Err(NetlabError::wiring(link.id(), e));
            }
        }
        link.set_state(LinkState::Unwired);
        debug!("link unwired");
        Ok(())
    }

    async fn delete_leg(&self, leg: &WiredLeg) -> NetlabResult<()> {
        if !self.leg_present(leg.netns.as_deref(), &leg.name).await? {
            return Ok(());
        }
        match self.netlink.link_del(leg.netns.as_deref(), &leg.name).await {
            Err(e) if e.errno() == Some(Errno::ENODEV as i32) => Ok(()),
            result => result,
        }
    }

    async fn leg_present(&self, netns: Option<&Path>, name: &str) -> NetlabResult<bool> {
        if let Some(path) = netns {
            if !self.netlink.namespace_exists(path).await? {
                return Ok(false);
            }
        }
        self.netlink.link_exists(netns, name).await
    }
}
