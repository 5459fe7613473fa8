// Cluster and per-node configuration.
//
// `ClusterConfig` is constructed once per process and handed to `NodeContext`
// at startup; nothing here is mutated after construction.

use std::time::Duration;

use crate::common::{NodeId, MAX_NODES};

/// One other node's connection information: host/port for the replication
/// transport, the arbiter (vote) socket, and the shared config store.
#[derive(Debug, Clone)]
pub struct NodeAddress {
    pub id: NodeId,
    pub host: String,
    pub replication_port: u16,
    pub arbiter_port: u16,
    pub config_store_port: u16,
}

/// Numeric knobs named in spec §6, plus the per-node connection string list.
#[derive(Debug, Clone)]
pub struct ClusterConfig {
    /// This process's own node ID.
    pub local_node: NodeId,
    /// Every node in the cluster, including `local_node`.
    pub nodes: Vec<NodeAddress>,
    /// Upper bound on cluster size; fixed at construction (spec §9).
    pub max_nodes: usize,

    /// Interval between heartbeat publications to the shared config store.
    pub heartbeat_send_timeout: Duration,
    /// Time since last heartbeat from a peer before the watchdog marks it
    /// unreachable in the local connectivity mask.
    pub heartbeat_recv_timeout: Duration,
    /// Minimum time between successive status-change debounces for one node.
    pub node_disable_delay: Duration,
    /// Floor for the per-transaction PREPARE timeout.
    pub min_2pc_timeout: Duration,
    /// Percentage applied to a transaction's own prepare latency to derive
    /// its PREPARE timeout: `max(min_2pc_timeout, (csn0-snapshot)*ratio/100)`.
    pub prepare_ratio: u32,
    /// WAL-to-slot lag below which a recovering node is "almost caught up".
    pub min_recovery_lag: u64,
    /// WAL-to-slot lag above which a recovery slot is dropped.
    pub max_recovery_lag: u64,
    /// Window subtracted from the minimum reported `oldest-snapshot` when
    /// computing the cluster-wide vacuum horizon.
    pub vacuum_delay: Duration,
    /// Size of the apply-worker pool used to apply incoming transactions.
    pub worker_pool_size: usize,
}

impl ClusterConfig {
    /// Builds a config for `local_node` among `nodes`, with every numeric
    /// knob at its default and `worker_pool_size` derived from the host's
    /// CPU count.
    pub fn new(local_node: NodeId, nodes: Vec<NodeAddress>) -> Self {
        Self {
            local_node,
            nodes,
            ..Self::default()
        }
    }

    pub fn peer(&self, id: NodeId) -> Option<&NodeAddress> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Majority threshold `floor(N/2) + 1` used by both the arbiter's clique
    /// quorum rule and the minority/online status transitions.
    pub fn majority(&self) -> usize {
        self.node_count() / 2 + 1
    }
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            local_node: NodeId::MIN,
            nodes: Vec::new(),
            max_nodes: MAX_NODES,
            heartbeat_send_timeout: Duration::from_millis(1000),
            heartbeat_recv_timeout: Duration::from_millis(5000),
            node_disable_delay: Duration::from_millis(2000),
            min_2pc_timeout: Duration::from_millis(5000),
            prepare_ratio: 300,
            min_recovery_lag: 16 * 1024 * 1024,
            max_recovery_lag: 1024 * 1024 * 1024,
            vacuum_delay: Duration::from_secs(60),
            worker_pool_size: num_cpus::get(),
        }
    }
}
