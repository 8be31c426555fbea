//! Cross-node stage dependencies
//!
//! [`DependencyGraph`] validates the wait-for edges of a lab before anything
//! runs. [`StageSignals`] carries the "node X reached stage S" broadcasts the
//! node units block on at run time.

use crate::error::{NetlabError, NetlabResult};
use crate::stages::{Stage, Stages, WaitFor};
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// A vertex of the dependency graph
pub type StageKey = (String, Stage);

/// Validated (node, stage) dependency graph
#[derive(Debug, Clone, Default)]
pub struct DependencyGraph {
    /// dependency -> dependents
    dependents: BTreeMap<StageKey, Vec<StageKey>>,
    in_degree: BTreeMap<StageKey, usize>,
    order: Vec<StageKey>,
}

impl DependencyGraph {
    /// Build and validate the graph for `nodes` (node name -> stages).
    ///
    /// Fails with [`NetlabError::UnknownWaitForTarget`] when an edge points
    /// at a node that is not part of the lab and with
    /// [`NetlabError::CycleDetected`] when the edges form a cycle.
    pub fn build(nodes: &BTreeMap<String, Stages>) -> NetlabResult<Self> {
        let mut graph = Self::default();

        for name in nodes.keys() {
            for stage in Stage::ALL {
                graph.in_degree.entry((name.clone(), stage)).or_insert(0);
                if let Some(previous) = stage.previous() {
                    graph.add_edge((name.clone(), previous), (name.clone(), stage));
                }
            }
        }

        for (name, stages) in nodes {
            for (stage, wait_for) in stages.edges() {
                if !nodes.contains_key(&wait_for.node) {
                    return Err(NetlabError::UnknownWaitForTarget {
                        node: name.clone(),
                        target: wait_for.node.clone(),
                    });
                }
                graph.add_edge(
                    (wait_for.node.clone(), wait_for.stage),
                    (name.clone(), stage),
                );
            }
        }

        graph.order = graph.sort()?;
        Ok(graph)
    }

    fn add_edge(&mut self, from: StageKey, to: StageKey) {
        let dependents = self.dependents.entry(from).or_default();
        if dependents.contains(&to) {
            return;
        }
        dependents.push(to.clone());
        *self.in_degree.entry(to).or_insert(0) += 1;
    }

    /// Kahn's algorithm; on a cycle, report the nodes that sit on it
    fn sort(&self) -> NetlabResult<Vec<StageKey>> {
        let mut in_degree = self.in_degree.clone();
        let mut queue: VecDeque<StageKey> = in_degree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(k, _)| k.clone())
            .collect();
        let mut order = Vec::with_capacity(in_degree.len());

        while let Some(key) = queue.pop_front() {
            for next in self.dependents.get(&key).into_iter().flatten() {
                if let Some(d) = in_degree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        queue.push_back(next.clone());
                    }
                }
            }
            order.push(key);
        }

        if order.len() == in_degree.len() {
            return Ok(order);
        }

        let sorted: BTreeSet<&StageKey> = order.iter().collect();
        let leftover: BTreeSet<StageKey> = in_degree
            .keys()
            .filter(|k| !sorted.contains(k))
            .cloned()
            .collect();
        Err(NetlabError::CycleDetected {
            nodes: self.cycle_nodes(leftover),
        })
    }

    /// Strip vertices that are merely downstream of a cycle
    fn cycle_nodes(&self, mut remaining: BTreeSet<StageKey>) -> Vec<String> {
        loop {
            let sinks: Vec<StageKey> = remaining
                .iter()
                .filter(|k| {
                    !self
                        .dependents
                        .get(*k)
                        .into_iter()
                        .flatten()
                        .any(|d| remaining.contains(d))
                })
                .cloned()
                .collect();
            if sinks.is_empty() {
                break;
            }
            for sink in sinks {
                remaining.remove(&sink);
            }
        }
        let nodes: BTreeSet<String> = remaining.into_iter().map(|(node, _)| node).collect();
        nodes.into_iter().collect()
    }

    /// Every (node, stage) vertex in a valid execution order
    pub fn topological_order(&self) -> &[StageKey] {
        &self.order
    }

    /// Direct dependents of a vertex
    pub fn dependents(&self, node: &str, stage: Stage) -> &[StageKey] {
        self.dependents
            .get(&(node.to_string(), stage))
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Nodes that transitively wait on `node`, excluding `node` itself
    pub fn transitive_dependents(&self, node: &str) -> BTreeSet<String> {
        let mut seen: BTreeSet<StageKey> = BTreeSet::new();
        let mut queue: VecDeque<StageKey> = Stage::ALL
            .into_iter()
            .map(|s| (node.to_string(), s))
            .collect();
        while let Some(key) = queue.pop_front() {
            for next in self.dependents.get(&key).into_iter().flatten() {
                if seen.insert(next.clone()) {
                    queue.push_back(next.clone());
                }
            }
        }
        seen.into_iter()
            .map(|(n, _)| n)
            .filter(|n| n != node)
            .collect()
    }
}

/// State of one (node, stage) signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageStatus {
    Pending,
    Reached,
    Failed,
}

/// Outcome of waiting on a set of wait-for edges
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Barrier {
    Open,
    /// A dependency failed before reaching the awaited stage
    Blocked(WaitFor),
}

/// One-shot broadcast per (node, stage)
///
/// The set of keys is fixed at construction; statuses only move from
/// `Pending` to `Reached` or `Failed`, once.
#[derive(Debug)]
pub struct StageSignals {
    senders: HashMap<StageKey, watch::Sender<StageStatus>>,
}

impl StageSignals {
    pub fn new<I, S>(nodes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut senders = HashMap::new();
        for node in nodes {
            let node = node.into();
            for stage in Stage::ALL {
                let (tx, _rx) = watch::channel(StageStatus::Pending);
                senders.insert((node.clone(), stage), tx);
            }
        }
        Self { senders }
    }

    /// Resolve a pending signal; later calls for the same key are ignored
    pub fn signal(&self, node: &str, stage: Stage, status: StageStatus) {
        if let Some(tx) = self.senders.get(&(node.to_string(), stage)) {
            tx.send_if_modified(|current| {
                if *current == StageStatus::Pending {
                    *current = status;
                    true
                } else {
                    false
                }
            });
        }
    }

    /// Fail every stage of `node` that was not reached
    pub fn fail_remaining(&self, node: &str) {
        for stage in Stage::ALL {
            self.signal(node, stage, StageStatus::Failed);
        }
    }

    pub fn status(&self, node: &str, stage: Stage) -> Option<StageStatus> {
        self.senders
            .get(&(node.to_string(), stage))
            .map(|tx| *tx.borrow())
    }

    /// Wait until `wait_for` resolves
    pub async fn wait(&self, wait_for: &WaitFor, cancel: &CancellationToken) -> NetlabResult<StageStatus> {
        let tx = self
            .senders
            .get(&(wait_for.node.clone(), wait_for.stage))
            .ok_or_else(|| NetlabError::internal(format!("no stage signal for {}", wait_for)))?;
        let mut rx = tx.subscribe();

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(NetlabError::cancelled(format!("waiting for {}", wait_for))),
            status = rx.wait_for(|s| *s != StageStatus::Pending) => status
                .map(|s| *s)
                .map_err(|_| NetlabError::internal(format!("stage signal for {} closed", wait_for))),
        }
    }

    /// Wait on all edges concurrently; the first failed dependency blocks
    pub async fn wait_all(&self, waits: &[WaitFor], cancel: &CancellationToken) -> NetlabResult<Barrier> {
        let mut pending: FuturesUnordered<_> = waits
            .iter()
            .map(|w| async move { (w, self.wait(w, cancel).await) })
            .collect();

        while let Some((wait_for, status)) = pending.next().await {
            if status? == StageStatus::Failed {
                return Ok(Barrier::Blocked(wait_for.clone()));
            }
        }
        Ok(Barrier::Open)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::time::Duration;

    fn lab(edges: &[(&str, Stage, &str, Stage)], nodes: &[&str]) -> BTreeMap<String, Stages> {
        let mut map: BTreeMap<String, Stages> =
            nodes.iter().map(|n| (n.to_string(), Stages::default())).collect();
        for (node, stage, target, target_stage) in edges {
            map.entry(node.to_string())
                .or_default()
                .add_wait_for(*stage, WaitFor::new(*target, *target_stage));
        }
        map
    }

    #[test]
    fn test_acyclic_order_respects_edges() {
        let nodes = lab(
            &[("c", Stage::Create, "a", Stage::Create), ("c", Stage::Create, "b", Stage::Healthy)],
            &["a", "b", "c"],
        );
        let graph = DependencyGraph::build(&nodes).unwrap();
        let order = graph.topological_order();
        let pos = |n: &str, s: Stage| order.iter().position(|k| k.0 == n && k.1 == s).unwrap();

        assert_eq!(order.len(), 15);
        assert!(pos("a", Stage::Create) < pos("c", Stage::Create));
        assert!(pos("b", Stage::Healthy) < pos("c", Stage::Create));
        assert_eq!(
            graph.transitive_dependents("b"),
            BTreeSet::from(["c".to_string()])
        );
    }

    #[test]
    fn test_cycle_reports_involved_nodes_only() {
        let nodes = lab(
            &[
                ("a", Stage::Create, "b", Stage::Create),
                ("b", Stage::Create, "a", Stage::Create),
                ("c", Stage::Create, "a", Stage::Exit),
            ],
            &["a", "b", "c"],
        );
        match DependencyGraph::build(&nodes) {
            Err(NetlabError::CycleDetected { nodes }) => assert_eq!(nodes, vec!["a", "b"]),
            other => panic!("expected cycle, got {:?}", other),
        }
    }

    #[test]
    fn test_intra_node_stage_order_creates_cycle() {
        // a cannot be created before it is healthy
        let nodes = lab(&[("a", Stage::Create, "a", Stage::Healthy)], &["a"]);
        assert!(matches!(
            DependencyGraph::build(&nodes),
            Err(NetlabError::CycleDetected { .. })
        ));
    }

    #[test]
    fn test_unknown_target() {
        let nodes = lab(&[("a", Stage::Configure, "ghost", Stage::Create)], &["a"]);
        assert!(matches!(
            DependencyGraph::build(&nodes),
            Err(NetlabError::UnknownWaitForTarget { target, .. }) if target == "ghost"
        ));
    }

    #[tokio::test]
    async fn test_wait_all_opens_after_both_signals() {
        let signals = Arc::new(StageSignals::new(["a", "b", "c"]));
        let cancel = CancellationToken::new();
        let waits = vec![WaitFor::new("a", Stage::Create), WaitFor::new("b", Stage::Create)];

        let waiter = {
            let signals = signals.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { signals.wait_all(&waits, &cancel).await })
        };

        signals.signal("a", Stage::Create, StageStatus::Reached);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        signals.signal("b", Stage::Create, StageStatus::Reached);
        assert_eq!(waiter.await.unwrap().unwrap(), Barrier::Open);
    }

    #[tokio::test]
    async fn test_failed_dependency_blocks() {
        let signals = StageSignals::new(["spine", "leaf"]);
        signals.fail_remaining("spine");
        // already resolved signals are not overwritten
        signals.signal("spine", Stage::Create, StageStatus::Reached);

        let barrier = signals
            .wait_all(&[WaitFor::new("spine", Stage::Create)], &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(barrier, Barrier::Blocked(WaitFor::new("spine", Stage::Create)));
    }

    #[tokio::test]
    async fn test_wait_is_cancellable() {
        let signals = StageSignals::new(["a"]);
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = signals
            .wait(&WaitFor::new("a", Stage::Healthy), &cancel)
            .await
            .unwrap_err();
        assert!(err.is_cancelled());
    }
}
