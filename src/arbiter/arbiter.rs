use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::common::{NodeId, NodeSet};
use crate::config::ClusterConfig;
use crate::config_store::{node_mask_key, SharedConfigStore};
use crate::error::CoreResult;

use super::clique::{build_adjacency, max_clique};
use super::status::ClusterStatus;

#[derive(Debug, Clone, Default)]
pub struct ArbiterStats {
    pub heartbeats_sent: u64,
    pub watchdog_disconnects: u64,
    pub clique_recomputations: u64,
    pub status_transitions: u64,
    pub debounced_transitions: u64,
}

/// C5: the failure detector. Owns the local connectivity mask, the
/// disabled-mask, and cluster status, and runs the heartbeat-send and
/// watchdog periodic tasks (spec §4.5, §5).
pub struct Arbiter {
    node: NodeId,
    config: Arc<ClusterConfig>,
    config_store: Arc<dyn SharedConfigStore>,
    connectivity_mask: RwLock<NodeSet>,
    last_heartbeat: RwLock<HashMap<NodeId, Instant>>,
    disabled_mask: RwLock<NodeSet>,
    /// Publishes every `disabled_mask` change so the coordinator can
    /// re-evaluate an in-flight PREPARE's `votes_needed` without waiting
    /// out the full timeout (spec §4.4's config-change-counter rule).
    disabled_mask_tx: watch::Sender<NodeSet>,
    /// Which peers' logical-replication receivers are reconnected. Starts
    /// full (every node is "connected" at boot); recovery resets it to
    /// empty for the recovering node and fills it in as the donor channel
    /// and then steady-state peers reconnect (spec §4.5's gate on
    /// `online`).
    connected_receivers: RwLock<NodeSet>,
    status: RwLock<ClusterStatus>,
    last_status_change: RwLock<Instant>,
    stats: RwLock<ArbiterStats>,
}

impl Arbiter {
    pub fn new(node: NodeId, config: Arc<ClusterConfig>, config_store: Arc<dyn SharedConfigStore>) -> Self {
        let n = config.node_count();
        let now = Instant::now();
        let mut last_heartbeat = HashMap::new();
        for peer in config.nodes.iter().map(|a| a.id) {
            last_heartbeat.insert(peer, now);
        }
        let (disabled_mask_tx, _) = watch::channel(NodeSet::EMPTY);
        Self {
            node,
            config,
            config_store,
            connectivity_mask: RwLock::new(NodeSet::EMPTY),
            last_heartbeat: RwLock::new(last_heartbeat),
            disabled_mask: RwLock::new(NodeSet::EMPTY),
            disabled_mask_tx,
            connected_receivers: RwLock::new(NodeSet::full(n)),
            status: RwLock::new(if n <= 1 {
                ClusterStatus::Online
            } else {
                ClusterStatus::Initializing
            }),
            // Backdated so the first real status transition after boot is
            // never itself suppressed by the debounce window.
            last_status_change: RwLock::new(now.checked_sub(Duration::from_secs(3600)).unwrap_or(now)),
            stats: RwLock::new(ArbiterStats::default()),
        }
    }

    pub fn stats(&self) -> ArbiterStats {
        self.stats.read().clone()
    }

    pub fn status(&self) -> ClusterStatus {
        *self.status.read()
    }

    pub fn disabled_mask(&self) -> NodeSet {
        *self.disabled_mask.read()
    }

    pub fn connectivity_mask(&self) -> NodeSet {
        *self.connectivity_mask.read()
    }

    /// Subscribes to disabled-mask changes (spec §4.4's
    /// config-change-counter: the coordinator watches this rather than
    /// polling to re-evaluate an in-flight PREPARE).
    pub fn disabled_mask_watch(&self) -> watch::Receiver<NodeSet> {
        self.disabled_mask_tx.subscribe()
    }

    fn publish_disabled_mask(&self, mask: NodeSet) {
        self.disabled_mask_tx.send_replace(mask);
    }

    pub fn record_heartbeat(&self, from: NodeId) {
        self.last_heartbeat.write().insert(from, Instant::now());
    }

    /// Publishes the local connectivity mask to the shared config store,
    /// called every `heartbeat_send_timeout` by the owning task.
    pub async fn publish_heartbeat(&self) -> CoreResult<()> {
        let mask = *self.connectivity_mask.read();
        let bytes = crate::config_store::encode(&mask)?;
        self.config_store.put(&node_mask_key(self.node), bytes).await?;
        self.stats.write().heartbeats_sent += 1;
        Ok(())
    }

    /// Watchdog sweep: marks peers unreachable if their heartbeat is stale.
    pub fn run_watchdog(&self) {
        let now = Instant::now();
        let mut mask = self.connectivity_mask.write();
        let last = self.last_heartbeat.read();
        for peer in self.config.nodes.iter().map(|a| a.id) {
            if peer == self.node {
                continue;
            }
            let stale = last
                .get(&peer)
                .map(|t| now.duration_since(*t) > self.config.heartbeat_recv_timeout)
                .unwrap_or(true);
            if stale && !mask.contains(peer) {
                mask.insert(peer);
                self.stats.write().watchdog_disconnects += 1;
                warn!(peer = %peer, "watchdog marking peer unreachable");
            }
        }
    }

    /// Rebuilds the clique from every node's published mask and updates
    /// `disabled_mask` and `status` accordingly (spec §4.5). `masks[i]` is
    /// node `i+1`'s last-known connectivity mask (fetched by the caller
    /// from the shared config store for every node including itself).
    pub fn recompute_clique(&self, masks: &[NodeSet]) {
        let n = self.config.node_count();
        let adjacency = build_adjacency(masks, n);
        let clique = max_clique(&adjacency, n);
        self.stats.write().clique_recomputations += 1;

        let majority = self.config.majority();
        if clique.popcount() as usize >= majority {
            // I5: disabled-mask is a subset of the complement of the
            // majority clique. Nodes inside the clique that were
            // previously disabled stay disabled until recovery clears
            // them explicitly — clique membership alone never re-enables.
            let outside = clique.complement(n);
            let mut disabled = self.disabled_mask.write();
            let next = disabled.intersect(clique).union(outside);
            let changed = next != *disabled;
            *disabled = next;
            drop(disabled);
            if changed {
                self.publish_disabled_mask(next);
            }

            if clique.contains(self.node) {
                if *self.connected_receivers.read() == NodeSet::full(n) {
                    self.transition(ClusterStatus::Online);
                } else {
                    self.transition(ClusterStatus::Connected);
                }
            } else {
                self.transition(ClusterStatus::Offline);
            }
        } else {
            self.transition(ClusterStatus::InMinority);
        }
    }

    pub fn enable_node(&self, node: NodeId) {
        let mut disabled = self.disabled_mask.write();
        disabled.remove(node);
        let next = *disabled;
        drop(disabled);
        self.publish_disabled_mask(next);
    }

    pub fn disable_node(&self, node: NodeId) {
        let mut disabled = self.disabled_mask.write();
        disabled.insert(node);
        let next = *disabled;
        drop(disabled);
        self.publish_disabled_mask(next);
    }

    /// Resets the receiver-reconnection gate to empty, called when a node
    /// enters recovery: it must not jump straight to `online` the moment it
    /// rejoins the majority clique (spec §4.5) until every
    /// logical-replication receiver reconnects.
    pub fn reset_receivers(&self) {
        *self.connected_receivers.write() = NodeSet::EMPTY;
    }

    /// Marks one peer's logical-replication receiver reconnected. If this
    /// was the last one pending and the node is already in the majority
    /// clique (status `connected`), completes the transition to `online`.
    pub fn mark_receiver_connected(&self, peer: NodeId) {
        let n = self.config.node_count();
        let mut receivers = self.connected_receivers.write();
        receivers.insert(peer);
        let complete = *receivers == NodeSet::full(n);
        drop(receivers);
        if complete && *self.status.read() == ClusterStatus::Connected {
            self.transition(ClusterStatus::Online);
        }
    }

    pub fn mark_receiver_disconnected(&self, peer: NodeId) {
        self.connected_receivers.write().remove(peer);
    }

    /// Applies a status transition, debounced by `node_disable_delay`
    /// (spec §4.5: "ignored if the previous change occurred within
    /// node-disable-delay ms — this prevents flapping").
    fn transition(&self, next: ClusterStatus) {
        let mut status = self.status.write();
        if *status == next {
            return;
        }
        let mut last_change = self.last_status_change.write();
        if last_change.elapsed() < self.config.node_disable_delay {
            self.stats.write().debounced_transitions += 1;
            return;
        }
        let prev = *status;
        *status = next;
        *last_change = Instant::now();
        self.stats.write().status_transitions += 1;
        match next {
            ClusterStatus::OutOfService => error!(?prev, ?next, "node transitioning out-of-service"),
            _ => info!(?prev, ?next, "cluster status transition"),
        }
    }

    /// Non-recoverable local error: marks the node `out-of-service`
    /// immediately, bypassing debounce (spec §7).
    pub fn mark_out_of_service(&self) {
        *self.status.write() = ClusterStatus::OutOfService;
        *self.last_status_change.write() = Instant::now();
        self.stats.write().status_transitions += 1;
        error!("node marked out-of-service");
    }
}
