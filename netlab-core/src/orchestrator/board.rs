//! Link wiring board
//!
//! Nodes publish themselves here once their namespace is ready. Publishing
//! wires every link whose peer is already published; the link's atomic
//! claim makes sure a link racing between its two endpoints is wired once.

use crate::error::NetlabError;
use crate::link::{Link, LinkState, LinkWirer};
use crate::node::Node;
use crate::report::{LinkOutcome, LinkReport};
use crate::state_machine::DeploymentState;
use dashmap::{DashMap, DashSet};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, warn};

pub(crate) struct WiringBoard {
    nodes: BTreeMap<String, Arc<dyn Node>>,
    links: Vec<Arc<Link>>,
    wirer: Arc<LinkWirer>,
    ready: DashSet<String>,
    outcomes: DashMap<String, LinkOutcome>,
}

impl WiringBoard {
    pub(crate) fn new(
        nodes: BTreeMap<String, Arc<dyn Node>>,
        links: Vec<Arc<Link>>,
        wirer: Arc<LinkWirer>,
    ) -> Self {
        Self {
            nodes,
            links,
            wirer,
            ready: DashSet::new(),
            outcomes: DashMap::new(),
        }
    }

    /// Mark a root-namespace node ready without wiring anything; it has no
    /// namespace to wait for and no peer can be ready yet
    pub(crate) fn publish_root(&self, node: &str) {
        self.ready.insert(node.to_string());
    }

    /// Withdraw a failed node; links to it are no longer wired
    pub(crate) fn retract(&self, node: &str) {
        if self.ready.remove(node).is_some() {
            debug!(node, "node withdrawn from wiring");
        }
    }

    fn wireable(&self, node: &str) -> bool {
        self.ready.contains(node)
            && self
                .nodes
                .get(node)
                .is_some_and(|n| n.base().state() != DeploymentState::Failed)
    }

    /// Mark `node` wiring-ready and wire its links whose peer is ready too.
    ///
    /// Returns the number of links this call wired.
    pub(crate) async fn publish(&self, node: &str) -> usize {
        self.ready.insert(node.to_string());

        let mut wired = 0;
        for link in self.links.iter().filter(|l| l.touches(node)) {
            let Some(peer) = link.peer_of(node) else {
                continue;
            };
            if !self.wireable(&peer.node) || link.state() != LinkState::Unwired {
                continue;
            }
            if self.wire(link).await {
                wired += 1;
            }
        }
        wired
    }

    async fn wire(&self, link: &Link) -> bool {
        let (a, b) = link.endpoints();
        let (Some(node_a), Some(node_b)) = (self.nodes.get(&a.node), self.nodes.get(&b.node)) else {
            return false;
        };

        match self.wirer.wire(link, node_a.as_ref(), node_b.as_ref()).await {
            Ok(()) => {
                self.outcomes.insert(link.id().to_string(), LinkOutcome::Wired);
                true
            }
            // the peer's unit won the race for this link
            Err(NetlabError::AlreadyWired { .. }) => {
                debug!(link = %link, "link claimed by peer");
                false
            }
            Err(e) => {
                warn!(link = %link, error = %e, "wiring failed");
                self.outcomes.insert(
                    link.id().to_string(),
                    LinkOutcome::Failed { error: Arc::new(e) },
                );
                false
            }
        }
    }

    pub(crate) fn is_ready(&self, node: &str) -> bool {
        self.ready.contains(node)
    }

    /// Per-link outcome once every unit finished
    pub(crate) fn report(&self) -> Vec<LinkReport> {
        self.links
            .iter()
            .map(|link| {
                let (a, b) = link.endpoints();
                let outcome = match self.outcomes.get(link.id()) {
                    Some(outcome) => outcome.clone(),
                    None => {
                        let missing: Vec<&str> = [a.node.as_str(), b.node.as_str()]
                            .into_iter()
                            .filter(|n| !self.is_ready(n))
                            .collect();
                        let reason = if missing.is_empty() {
                            "run stopped before the link was wired".to_string()
                        } else {
                            format!("{} never became wiring-ready", missing.join(" and "))
                        };
                        LinkOutcome::NotAttempted { reason }
                    }
                };
                LinkReport {
                    id: link.id().to_string(),
                    endpoints: [a.to_string(), b.to_string()],
                    outcome,
                }
            })
            .collect()
    }
}
