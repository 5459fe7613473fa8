// Cross-node deadlock detection (spec §5).
//
// Each node periodically snapshots its local wait-for graph (waiter GTID
// -> holder GTID), publishes it under `lock-graph-<i>`, reads every peer's
// graph, unions them, and searches for cycles. If a peer's graph is
// missing (a gossip gap, not yet published, or a transient config-store
// miss), the detector fails open — see the Open Question decision in
// `DESIGN.md` — rather than optimistically declaring a cluster-wide
// deadlock on incomplete data.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use crate::common::{Gtid, NodeId};
use crate::config_store::{lock_graph_key, SharedConfigStore};
use crate::error::CoreResult;

#[derive(Debug, Clone, Default)]
pub struct DeadlockStats {
    pub detection_runs: u64,
    pub deadlocks_found: u64,
    pub victims_selected: u64,
    pub missing_peer_graphs: u64,
}

/// Local wait-for graph: waiter -> set of holders it is blocked on.
type WaitForGraph = HashMap<Gtid, HashSet<Gtid>>;

pub struct DeadlockDetector {
    node: NodeId,
    config_store: Arc<dyn SharedConfigStore>,
    local_graph: RwLock<WaitForGraph>,
    stats: RwLock<DeadlockStats>,
}

impl DeadlockDetector {
    pub fn new(node: NodeId, config_store: Arc<dyn SharedConfigStore>) -> Self {
        Self {
            node,
            config_store,
            local_graph: RwLock::new(HashMap::new()),
            stats: RwLock::new(DeadlockStats::default()),
        }
    }

    pub fn stats(&self) -> DeadlockStats {
        self.stats.read().clone()
    }

    /// Records that `waiter` is blocked on `holder`.
    pub fn add_wait(&self, waiter: Gtid, holder: Gtid) {
        self.local_graph.write().entry(waiter).or_default().insert(holder);
    }

    pub fn remove_waiter(&self, waiter: &Gtid) {
        self.local_graph.write().remove(waiter);
    }

    /// Publishes this node's current wait-for graph under `lock-graph-<i>`.
    pub async fn publish(&self) -> CoreResult<()> {
        let bytes = crate::config_store::encode(&self.snapshot_graph())?;
        self.config_store.put(&lock_graph_key(self.node), bytes).await?;
        Ok(())
    }

    /// The `dump-lock-graph` administrative operation (spec §6): a
    /// point-in-time snapshot of this node's local wait-for graph as
    /// `(waiter, holders)` pairs.
    pub fn snapshot_graph(&self) -> Vec<(Gtid, Vec<Gtid>)> {
        self.local_graph
            .read()
            .iter()
            .map(|(waiter, holders)| (*waiter, holders.iter().copied().collect()))
            .collect()
    }

    /// Reads every peer's published graph (fetching peer `i`'s blob from
    /// `lock-graph-<i>`), unions them with the local graph, and searches
    /// for a cycle. Missing peer data is treated fail-open (skipped, not
    /// treated as evidence of a cycle).
    pub async fn detect(&self, peers: &[NodeId]) -> CoreResult<Option<Vec<Gtid>>> {
        self.stats.write().detection_runs += 1;
        let mut union_graph = self.local_graph.read().clone();

        for &peer in peers {
            if peer == self.node {
                continue;
            }
            let key = lock_graph_key(peer);
            match self.config_store.get(&key).await? {
                Some(bytes) => {
                    let entries: Vec<(Gtid, Vec<Gtid>)> = crate::config_store::decode(&bytes)?;
                    for (waiter, holders) in entries {
                        union_graph.entry(waiter).or_default().extend(holders);
                    }
                }
                None => {
                    self.stats.write().missing_peer_graphs += 1;
                }
            }
        }

        let cycle = find_cycle(&union_graph);
        if let Some(ref cycle) = cycle {
            self.stats.write().deadlocks_found += 1;
            info!(?cycle, "cross-node deadlock detected");
        }
        Ok(cycle)
    }

    /// Selects the youngest (highest local xid) participant in the cycle
    /// as the abort victim.
    pub fn select_victim(&self, cycle: &[Gtid]) -> Option<Gtid> {
        let victim = cycle.iter().max_by_key(|g| g.xid).copied();
        if victim.is_some() {
            self.stats.write().victims_selected += 1;
        }
        victim
    }
}

/// DFS cycle search over the unioned wait-for graph.
fn find_cycle(graph: &WaitForGraph) -> Option<Vec<Gtid>> {
    let mut visited: HashSet<Gtid> = HashSet::new();
    let mut stack: Vec<Gtid> = Vec::new();
    let mut on_stack: HashSet<Gtid> = HashSet::new();

    for &start in graph.keys() {
        if visited.contains(&start) {
            continue;
        }
        if let Some(cycle) = dfs(start, graph, &mut visited, &mut stack, &mut on_stack) {
            return Some(cycle);
        }
    }
    None
}

fn dfs(
    node: Gtid,
    graph: &WaitForGraph,
    visited: &mut HashSet<Gtid>,
    stack: &mut Vec<Gtid>,
    on_stack: &mut HashSet<Gtid>,
) -> Option<Vec<Gtid>> {
    visited.insert(node);
    stack.push(node);
    on_stack.insert(node);

    if let Some(holders) = graph.get(&node) {
        for &holder in holders {
            if on_stack.contains(&holder) {
                let start = stack.iter().position(|&g| g == holder).unwrap();
                return Some(stack[start..].to_vec());
            }
            if !visited.contains(&holder) {
                if let Some(cycle) = dfs(holder, graph, visited, stack, on_stack) {
                    return Some(cycle);
                }
            }
        }
    }

    stack.pop();
    on_stack.remove(&node);
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::InMemoryConfigStore;

    fn gtid(node: u8, xid: u64) -> Gtid {
        Gtid::new(NodeId::new(node).unwrap(), xid)
    }

    #[tokio::test]
    async fn cross_node_cycle_is_detected_after_publishing() {
        let store = Arc::new(InMemoryConfigStore::new());
        let n1 = NodeId::new(1).unwrap();
        let n2 = NodeId::new(2).unwrap();
        let d1 = DeadlockDetector::new(n1, store.clone());
        let d2 = DeadlockDetector::new(n2, store.clone());

        // T1 on node 1 holds A, waits for B held by T2 on node 2.
        // T2 on node 2 holds B, waits for A held by T1 on node 1.
        d1.add_wait(gtid(1, 1), gtid(2, 2));
        d2.add_wait(gtid(2, 2), gtid(1, 1));
        d1.publish().await.unwrap();
        d2.publish().await.unwrap();

        let cycle = d1.detect(&[n1, n2]).await.unwrap();
        assert!(cycle.is_some());
        let victim = d1.select_victim(&cycle.unwrap());
        assert!(victim.is_some());
    }

    #[tokio::test]
    async fn missing_peer_graph_fails_open_not_closed() {
        let store = Arc::new(InMemoryConfigStore::new());
        let n1 = NodeId::new(1).unwrap();
        let n2 = NodeId::new(2).unwrap();
        let d1 = DeadlockDetector::new(n1, store.clone());
        d1.add_wait(gtid(1, 1), gtid(2, 2));
        d1.publish().await.unwrap();
        // node 2 never published; its graph is missing entirely.
        let cycle = d1.detect(&[n1, n2]).await.unwrap();
        assert!(cycle.is_none());
        assert_eq!(d1.stats().missing_peer_graphs, 1);
    }

    #[tokio::test]
    async fn acyclic_graph_reports_no_deadlock() {
        let store = Arc::new(InMemoryConfigStore::new());
        let n1 = NodeId::new(1).unwrap();
        let d1 = DeadlockDetector::new(n1, store);
        d1.add_wait(gtid(1, 1), gtid(1, 2));
        d1.add_wait(gtid(1, 2), gtid(1, 3));
        let cycle = d1.detect(&[n1]).await.unwrap();
        assert!(cycle.is_none());
    }
}
