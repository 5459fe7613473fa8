// The single, explicitly-constructed context object a process builds at
// startup (spec §9 redesign note: "no hidden globals"). Threads C1-C6
// together and owns the background tasks each of them needs: heartbeat
// publication, watchdog sweeps, transaction-table GC, and cross-node
// deadlock detection.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock as PLRwLock;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::arbiter::Arbiter;
use crate::clock::CsnClock;
use crate::common::{Csn, Gtid, NodeId};
use crate::config::ClusterConfig;
use crate::config_store::{node_mask_key, SharedConfigStore};
use crate::coordinator::{ArbiterTransport, TwoPhaseCommitCoordinator};
use crate::deadlock::DeadlockDetector;
use crate::error::CoreResult;
use crate::hooks::TransactionHooks;
use crate::recovery::{DonorSession, RecoveryController};
use crate::replication::ReplicationTransport;
use crate::txn::TransactionTable;

/// A node's full runtime: every component from spec §4 wired together,
/// plus the host-supplied hooks and replication transport it consumes.
pub struct NodeContext {
    pub node: NodeId,
    pub config: Arc<ClusterConfig>,
    pub clock: Arc<CsnClock>,
    pub table: Arc<TransactionTable>,
    pub coordinator: Arc<TwoPhaseCommitCoordinator>,
    pub arbiter: Arc<Arbiter>,
    pub recovery: Arc<RecoveryController>,
    pub deadlock: Arc<DeadlockDetector>,
    pub hooks: Arc<dyn TransactionHooks>,
    config_store: Arc<dyn SharedConfigStore>,
    replication: Arc<dyn ReplicationTransport>,
    /// Donor-side catch-up sessions, one per recoverer this node is feeding
    /// (spec §4.6 step 1). Keyed by the recovering peer's `NodeId`.
    donor_sessions: PLRwLock<HashMap<NodeId, Arc<DonorSession>>>,
    /// Tables marked local via `make-table-local` (spec §6): excluded from
    /// a transaction's participant list regardless of what nodes the
    /// transaction otherwise touches.
    local_tables: PLRwLock<HashSet<String>>,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl NodeContext {
    pub fn new(
        config: Arc<ClusterConfig>,
        arbiter_transport: Arc<dyn ArbiterTransport>,
        config_store: Arc<dyn SharedConfigStore>,
        hooks: Arc<dyn TransactionHooks>,
        replication: Arc<dyn ReplicationTransport>,
    ) -> Self {
        let node = config.local_node;
        let clock = Arc::new(CsnClock::new());
        let table = Arc::new(TransactionTable::new());
        let coordinator = Arc::new(TwoPhaseCommitCoordinator::new(
            node,
            clock.clone(),
            table.clone(),
            arbiter_transport,
            config.clone(),
            hooks.clone(),
        ));
        let arbiter = Arc::new(Arbiter::new(node, config.clone(), config_store.clone()));
        coordinator.set_disabled_mask_watch(arbiter.disabled_mask_watch());
        let recovery = Arc::new(RecoveryController::new(
            node,
            config.clone(),
            arbiter.clone(),
            clock.clone(),
            replication.clone(),
        ));
        let deadlock = Arc::new(DeadlockDetector::new(node, config_store.clone()));

        Self {
            node,
            config,
            clock,
            table,
            coordinator,
            arbiter,
            recovery,
            deadlock,
            hooks,
            config_store,
            replication,
            donor_sessions: PLRwLock::new(HashMap::new()),
            local_tables: PLRwLock::new(HashSet::new()),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    /// Spawns the background loops (heartbeat publish, watchdog, table GC,
    /// deadlock detection). Idempotent only in the sense that calling it
    /// twice spawns a second set; callers should call it once at startup.
    pub fn spawn_background_tasks(self: &Arc<Self>) {
        self.spawn_message_pump();
        self.spawn_heartbeat_loop();
        self.spawn_watchdog_loop();
        self.spawn_gc_loop();
        self.spawn_deadlock_loop();
    }

    /// Drains the arbiter transport: `Heartbeat` updates the arbiter's
    /// last-seen table directly, everything else is dispatched to the
    /// coordinator's 2PC state machine.
    fn spawn_message_pump(self: &Arc<Self>) {
        let this = self.clone();
        let handle = tokio::spawn(async move {
            loop {
                match this.coordinator.recv_message().await {
                    Ok(Some((from, crate::coordinator::ArbiterMessage::Heartbeat { .. }))) => {
                        this.arbiter.record_heartbeat(from);
                    }
                    Ok(Some((from, message))) => {
                        if let Err(err) = this.coordinator.handle_message(from, message).await {
                            warn!(?err, node = %from, "failed to handle arbiter message");
                        }
                    }
                    Ok(None) => break,
                    Err(err) => {
                        warn!(?err, "arbiter transport recv failed");
                        break;
                    }
                }
            }
        });
        self.track(handle);
    }

    fn track(&self, handle: JoinHandle<()>) {
        self.tasks.lock().unwrap().push(handle);
    }

    fn spawn_heartbeat_loop(self: &Arc<Self>) {
        let this = self.clone();
        let interval = this.config.heartbeat_send_timeout;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = this.arbiter.publish_heartbeat().await {
                    warn!(?err, "heartbeat publish failed");
                }
            }
        });
        self.track(handle);
    }

    fn spawn_watchdog_loop(self: &Arc<Self>) {
        let this = self.clone();
        let interval = this.config.heartbeat_recv_timeout;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                this.arbiter.run_watchdog();
                if let Some(masks) = this.gather_peer_masks().await {
                    this.arbiter.recompute_clique(&masks);
                }
                this.coordinator
                    .set_accepts_commits(this.arbiter.status().accepts_distributed_commits());
            }
        });
        self.track(handle);
    }

    fn spawn_gc_loop(self: &Arc<Self>) {
        let this = self.clone();
        let interval = this.config.vacuum_delay;
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Some(cutoff) = this.table.oldest_open_snapshot() {
                    let outcome = this.table.gc(cutoff);
                    if !outcome.removed.is_empty() {
                        info!(removed = outcome.removed.len(), "transaction table gc");
                    }
                }
            }
        });
        self.track(handle);
    }

    fn spawn_deadlock_loop(self: &Arc<Self>) {
        let this = self.clone();
        let interval = Duration::from_secs(1);
        let peers: Vec<NodeId> = this.config.nodes.iter().map(|n| n.id).collect();
        let handle = tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                if let Err(err) = this.deadlock.publish().await {
                    warn!(?err, "wait-for graph publish failed");
                    continue;
                }
                match this.deadlock.detect(&peers).await {
                    Ok(Some(cycle)) => {
                        if let Some(victim) = this.deadlock.select_victim(&cycle) {
                            warn!(%victim, "aborting deadlock victim");
                        }
                    }
                    Ok(None) => {}
                    Err(err) => warn!(?err, "deadlock detection failed"),
                }
            }
        });
        self.track(handle);
    }

    /// Reads every peer's published connectivity mask from the shared
    /// config store (`node-mask-<i>`) for the arbiter's clique recompute.
    /// A node whose mask hasn't been published yet is simply omitted; the
    /// arbiter treats an all-self-connected adjacency as fine for n=1.
    async fn gather_peer_masks(&self) -> Option<Vec<crate::common::NodeSet>> {
        let mut masks = Vec::with_capacity(self.config.nodes.len());
        for peer in &self.config.nodes {
            match self.config_store.get(&node_mask_key(peer.id)).await {
                Ok(Some(bytes)) => match crate::config_store::decode(&bytes) {
                    Ok(mask) => masks.push(mask),
                    Err(err) => warn!(?err, node = %peer.id, "corrupt connectivity mask"),
                },
                Ok(None) => {}
                Err(err) => warn!(?err, node = %peer.id, "config store read failed"),
            }
        }
        if masks.is_empty() {
            None
        } else {
            Some(masks)
        }
    }

    pub async fn visible(&self, xid: crate::common::Xid, snapshot: crate::common::Csn) -> CoreResult<bool> {
        crate::visibility::visible(&self.table, xid, snapshot).await
    }

    /// `add-node` (spec §6 design note: "add-node merely flips an enable
    /// bit within that bound" — cluster size itself is fixed at startup).
    pub fn add_node(&self, node: NodeId) {
        self.arbiter.enable_node(node);
    }

    /// `drop-node` (spec §6): marks a peer disabled without waiting for the
    /// watchdog to notice it missing.
    pub fn drop_node(&self, node: NodeId) {
        self.arbiter.disable_node(node);
    }

    /// `poll-node` (spec §6): whether `node` currently participates in
    /// distributed commits.
    pub fn poll_node(&self, node: NodeId) -> bool {
        !self.arbiter.disabled_mask().contains(node)
    }

    /// `dump-lock-graph` (spec §6).
    pub fn dump_lock_graph(&self) -> Vec<(Gtid, Vec<Gtid>)> {
        self.deadlock.snapshot_graph()
    }

    /// `make-table-local` (spec §6): callers building a transaction's
    /// participant list should skip a table this returns `true` for.
    pub fn make_table_local(&self, table: impl Into<String>) {
        self.local_tables.write().insert(table.into());
    }

    pub fn is_table_local(&self, table: &str) -> bool {
        self.local_tables.read().contains(table)
    }

    /// `get-csn` (spec §6): the last CSN this node's clock has handed out.
    pub fn get_csn(&self) -> Csn {
        self.clock.last_csn()
    }

    /// `get-snapshot` (spec §6): a fresh snapshot CSN without starting a
    /// transaction.
    pub fn get_snapshot(&self) -> Csn {
        self.clock.assign_csn()
    }

    /// `recover-node` (spec §6): selects `donor` and spawns the catch-up
    /// apply loop against it.
    pub fn recover_node(self: &Arc<Self>, donor: NodeId) -> CoreResult<()> {
        self.recovery.start(donor)?;
        let recovery = self.recovery.clone();
        let handle = tokio::spawn(async move {
            if let Err(err) = recovery.run().await {
                warn!(?err, "recovery apply loop exited with error");
            }
        });
        self.track(handle);
        Ok(())
    }

    /// Called by this node's own wal-sender as it reports `(slot_lsn,
    /// wal_lsn)` progress for `recoverer` (spec §4.6 step 1). Locks this
    /// node's own coordinator once `recoverer` is almost caught up, and
    /// retires the session once it signals fully caught up.
    pub fn report_donor_progress(&self, recoverer: NodeId, slot_lsn: u64, wal_lsn: u64) -> bool {
        let session = {
            let mut sessions = self.donor_sessions.write();
            sessions
                .entry(recoverer)
                .or_insert_with(|| {
                    Arc::new(DonorSession::new(recoverer, self.coordinator.clone(), self.config.clone()))
                })
                .clone()
        };
        let caught_up = session.report_progress(slot_lsn, wal_lsn);
        if caught_up {
            self.donor_sessions.write().remove(&recoverer);
        }
        caught_up
    }

    /// Sends one replication record to `to`'s stream (the donor side of the
    /// channel spec §4.6 step 1 opens).
    pub async fn send_replication(&self, to: NodeId, message: crate::replication::WireMessage) -> CoreResult<()> {
        self.replication.send(to, message).await
    }
}

impl Drop for NodeContext {
    fn drop(&mut self) {
        for handle in self.tasks.lock().unwrap().drain(..) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_store::InMemoryConfigStore;
    use crate::hooks::NullHooks;
    use async_trait::async_trait;
    use crate::coordinator::ArbiterMessage;

    struct NullArbiterTransport;
    #[async_trait]
    impl ArbiterTransport for NullArbiterTransport {
        async fn send(&self, _to: NodeId, _message: ArbiterMessage) -> CoreResult<()> {
            Ok(())
        }
        async fn recv(&self) -> CoreResult<Option<(NodeId, ArbiterMessage)>> {
            Ok(None)
        }
    }

    struct NullReplicationTransport;
    #[async_trait]
    impl ReplicationTransport for NullReplicationTransport {
        async fn send(&self, _to: NodeId, _message: crate::replication::WireMessage) -> CoreResult<()> {
            Ok(())
        }
        async fn recv(&self, _from: NodeId) -> CoreResult<Option<crate::replication::WireMessage>> {
            Ok(None)
        }
    }

    fn make_node() -> Arc<NodeContext> {
        let config = Arc::new(ClusterConfig::default());
        Arc::new(NodeContext::new(
            config,
            Arc::new(NullArbiterTransport),
            Arc::new(InMemoryConfigStore::new()),
            Arc::new(NullHooks),
            Arc::new(NullReplicationTransport),
        ))
    }

    #[test]
    fn constructs_all_components() {
        let node = make_node();
        assert_eq!(node.node, NodeId::MIN);
        assert_eq!(node.coordinator.stats().prepared, 0);
        assert_eq!(node.arbiter.stats().heartbeats_sent, 0);
    }

    #[tokio::test]
    async fn begin_and_visible_round_trip_through_components() {
        let node = make_node();
        let (xid, csn) = node.coordinator.begin().await;
        node.table.set_status(xid, crate::txn::TxnStatus::Committed).unwrap();
        assert!(node.visible(xid, csn + 1).await.unwrap());
    }

    #[tokio::test]
    async fn background_tasks_spawn_and_abort_cleanly() {
        let node = make_node();
        node.spawn_background_tasks();
        tokio::time::sleep(Duration::from_millis(10)).await;
        drop(node);
    }

    #[test]
    fn admin_node_enable_disable_round_trips() {
        let node = make_node();
        let peer = NodeId::new(2).unwrap();
        node.drop_node(peer);
        assert!(!node.poll_node(peer));
        node.add_node(peer);
        assert!(node.poll_node(peer));
    }

    #[test]
    fn admin_table_locality_and_snapshots() {
        let node = make_node();
        assert!(!node.is_table_local("accounts"));
        node.make_table_local("accounts");
        assert!(node.is_table_local("accounts"));

        let s1 = node.get_snapshot();
        let s2 = node.get_snapshot();
        assert!(s2 > s1);
        assert_eq!(node.get_csn(), s2);
    }

    #[test]
    fn admin_dump_lock_graph_reflects_local_waits() {
        let node = make_node();
        let waiter = Gtid::new(node.node, 1);
        let holder = Gtid::new(NodeId::new(2).unwrap(), 2);
        node.deadlock.add_wait(waiter, holder);
        let graph = node.dump_lock_graph();
        assert_eq!(graph.len(), 1);
        assert_eq!(graph[0].0, waiter);
        assert_eq!(graph[0].1, vec![holder]);
    }

    #[tokio::test]
    async fn report_donor_progress_locks_then_unlocks_coordinator() {
        let node = make_node();
        let recoverer = NodeId::new(2).unwrap();
        assert!(!node.report_donor_progress(recoverer, 9500, 10000));
        assert!(node.report_donor_progress(recoverer, 1000, 1000));
    }
}
