// End-to-end scenarios mirroring spec.md §8's seed tests, exercised at the
// commit-core level (no SQL engine, no storage) with in-memory fakes for
// the arbiter transport, replication transport, and shared config store.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, Mutex};

use concord_core::arbiter::Arbiter;
use concord_core::clock::CsnClock;
use concord_core::common::{NodeId, NodeSet};
use concord_core::config::{ClusterConfig, NodeAddress};
use concord_core::config_store::InMemoryConfigStore;
use concord_core::coordinator::{ArbiterMessage, ArbiterTransport, TwoPhaseCommitCoordinator};
use concord_core::deadlock::DeadlockDetector;
use concord_core::error::CoreError;
use concord_core::hooks::NullHooks;
use concord_core::recovery::RecoveryController;
use concord_core::replication::{ReplicationTransport, WireMessage};
use concord_core::txn::TransactionTable;

struct Router {
    senders: HashMap<NodeId, mpsc::UnboundedSender<(NodeId, ArbiterMessage)>>,
}

struct LoopbackTransport {
    from: NodeId,
    router: Arc<Router>,
    inbox: Mutex<mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)>>,
}

#[async_trait]
impl ArbiterTransport for LoopbackTransport {
    async fn send(&self, to: NodeId, message: ArbiterMessage) -> concord_core::CoreResult<()> {
        self.router
            .senders
            .get(&to)
            .expect("unknown peer in test router")
            .send((self.from, message))
            .ok();
        Ok(())
    }

    async fn recv(&self) -> concord_core::CoreResult<Option<(NodeId, ArbiterMessage)>> {
        Ok(self.inbox.lock().await.recv().await)
    }
}

fn node_addr(id: NodeId) -> NodeAddress {
    NodeAddress {
        id,
        host: "127.0.0.1".into(),
        replication_port: 0,
        arbiter_port: 0,
        config_store_port: 0,
    }
}

/// Builds `n` coordinators wired through an in-process router, returning
/// them alongside a pump handle per node that drains inbound messages into
/// the coordinator's `handle_*` methods.
fn make_cluster(n: u8) -> Vec<Arc<TwoPhaseCommitCoordinator>> {
    let ids: Vec<NodeId> = (1..=n).map(|i| NodeId::new(i).unwrap()).collect();
    let mut senders = HashMap::new();
    let mut receivers = HashMap::new();
    for &id in &ids {
        let (tx, rx) = mpsc::unbounded_channel();
        senders.insert(id, tx);
        receivers.insert(id, rx);
    }
    let router = Arc::new(Router { senders });

    let mut coordinators = Vec::new();
    for &id in &ids {
        let nodes: Vec<NodeAddress> = ids.iter().map(|&i| node_addr(i)).collect();
        let config = Arc::new(ClusterConfig::new(id, nodes));
        let transport = Arc::new(LoopbackTransport {
            from: id,
            router: router.clone(),
            inbox: Mutex::new(receivers.remove(&id).unwrap()),
        });
        let coordinator = Arc::new(TwoPhaseCommitCoordinator::new(
            id,
            Arc::new(CsnClock::new()),
            Arc::new(TransactionTable::new()),
            transport,
            config,
            Arc::new(NullHooks),
        ));
        coordinators.push(coordinator);
    }

    coordinators
}

#[tokio::test]
async fn three_node_commit_replicates_final_csn() {
    let nodes = make_cluster(3);
    let (node1, node2, node3) = (nodes[0].clone(), nodes[1].clone(), nodes[2].clone());
    spawn_pump(node1.clone());
    spawn_pump(node2.clone());
    spawn_pump(node3.clone());

    let (xid, _snapshot) = node1.begin().await;
    let participants = vec![NodeId::new(2).unwrap(), NodeId::new(3).unwrap()];
    let final_csn = node1.commit(xid, &participants, false).await.unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    assert_eq!(node1.stats().committed, 1);
    assert!(final_csn > 0);
}

#[tokio::test]
async fn local_only_commit_never_touches_participants() {
    let nodes = make_cluster(2);
    let node1 = nodes[0].clone();
    let (xid, snapshot) = node1.begin().await;
    let csn = node1.commit(xid, &[], true).await.unwrap();
    assert!(csn >= snapshot);
    assert_eq!(node1.stats().committed, 1);
    assert_eq!(node1.stats().prepared, 0);
}

#[tokio::test]
async fn minority_status_rejects_new_distributed_commits() {
    let nodes = make_cluster(1);
    let node1 = nodes[0].clone();
    node1.set_accepts_commits(false);
    let (xid, _) = node1.begin().await;
    let err = node1.commit(xid, &[], false).await.unwrap_err();
    assert!(matches!(err, CoreError::InMinority));
}

#[tokio::test]
async fn clique_split_leaves_minority_side_unable_to_commit() {
    let n = 5usize;
    let ids: Vec<NodeId> = (1..=n as u8).map(NodeId::new).map(Option::unwrap).collect();
    let config = |id: NodeId| {
        let mut c = ClusterConfig::new(id, ids.iter().map(|&i| node_addr(i)).collect());
        c.node_disable_delay = std::time::Duration::from_millis(0);
        Arc::new(c)
    };

    let store = Arc::new(InMemoryConfigStore::new());
    let arbiters: Vec<Arc<Arbiter>> = ids
        .iter()
        .map(|&id| Arc::new(Arbiter::new(id, config(id), store.clone())))
        .collect();

    // {1,2} mutually reachable; {3,4,5} mutually reachable; no cross edges.
    let mut masks = vec![NodeSet::EMPTY; n];
    for &i in &[0usize, 1] {
        for &j in &[0usize, 1] {
            if i != j {
                masks[i].insert(ids[j]);
            }
        }
    }
    for &i in &[2usize, 3, 4] {
        for &j in &[2usize, 3, 4] {
            if i != j {
                masks[i].insert(ids[j]);
            }
        }
    }

    for arbiter in &arbiters {
        arbiter.recompute_clique(&masks);
    }

    assert!(!arbiters[0].status().accepts_distributed_commits());
    assert!(!arbiters[1].status().accepts_distributed_commits());
    assert!(arbiters[2].status().accepts_distributed_commits());
    assert!(arbiters[3].status().accepts_distributed_commits());
    assert!(arbiters[4].status().accepts_distributed_commits());
}

struct QueueReplicationTransport {
    inbox: Mutex<std::collections::VecDeque<WireMessage>>,
}

#[async_trait]
impl ReplicationTransport for QueueReplicationTransport {
    async fn send(&self, _to: NodeId, _message: WireMessage) -> concord_core::CoreResult<()> {
        Ok(())
    }
    async fn recv(&self, _from: NodeId) -> concord_core::CoreResult<Option<WireMessage>> {
        Ok(self.inbox.lock().await.pop_front())
    }
}

#[tokio::test]
async fn minority_node_recovers_after_donor_catches_it_up() {
    let node = NodeId::new(3).unwrap();
    let donor = NodeId::new(1).unwrap();
    let config = Arc::new(ClusterConfig::default());
    let store = Arc::new(InMemoryConfigStore::new());
    let arbiter = Arc::new(Arbiter::new(node, config.clone(), store));
    arbiter.disable_node(node);

    let mut inbox = std::collections::VecDeque::new();
    inbox.push_back(WireMessage::Commit {
        kind: concord_core::replication::CommitKind::Commit,
        origin_node: donor,
        caught_up: true,
        end_lsn: 1000,
        commit_timestamp_us: 0,
        final_csn: Some(1000),
        gid: None,
    });
    let replication = Arc::new(QueueReplicationTransport {
        inbox: Mutex::new(inbox),
    });

    let controller = Arc::new(RecoveryController::new(
        node,
        config,
        arbiter.clone(),
        Arc::new(CsnClock::new()),
        replication,
    ));
    controller.start(donor).unwrap();
    controller.run().await.unwrap();

    assert!(!controller.is_recovering());
    assert!(!arbiter.disabled_mask().contains(node));
}

#[tokio::test]
async fn crash_restart_during_prepare_is_resolved_by_redelivered_commit() {
    // Simulates scenario 4: a participant that has voted READY but whose
    // process "restarted" before the COMMIT message arrived. Re-delivering
    // COMMIT for the same gid must still resolve the transaction (R2).
    struct NullTransport;
    #[async_trait]
    impl ArbiterTransport for NullTransport {
        async fn send(&self, _to: NodeId, _m: ArbiterMessage) -> concord_core::CoreResult<()> {
            Ok(())
        }
        async fn recv(&self) -> concord_core::CoreResult<Option<(NodeId, ArbiterMessage)>> {
            Ok(None)
        }
    }

    let participant_node = NodeId::new(2).unwrap();
    let config = Arc::new(ClusterConfig::default());
    let participant = TwoPhaseCommitCoordinator::new(
        participant_node,
        Arc::new(CsnClock::new()),
        Arc::new(TransactionTable::new()),
        Arc::new(NullTransport),
        config,
        Arc::new(NullHooks),
    );

    let coordinator_node = NodeId::new(1).unwrap();
    let gtid = concord_core::common::Gtid::new(coordinator_node, 42);
    participant
        .handle_prepare(coordinator_node, "1_42".to_string(), gtid, 100)
        .await
        .unwrap();

    // First delivery of COMMIT.
    participant.handle_commit("1_42", 150).await.unwrap();
    // Simulated crash-restart redelivery of the same COMMIT: must be a
    // harmless no-op, not a panic or a rejected double-commit.
    participant.handle_commit("1_42", 150).await.unwrap();
}

#[tokio::test]
async fn cross_node_deadlock_is_detected_and_one_victim_chosen() {
    let store = Arc::new(InMemoryConfigStore::new());
    let n1 = NodeId::new(1).unwrap();
    let n2 = NodeId::new(2).unwrap();
    let d1 = DeadlockDetector::new(n1, store.clone());
    let d2 = DeadlockDetector::new(n2, store.clone());

    let t1 = concord_core::common::Gtid::new(n1, 10);
    let t2 = concord_core::common::Gtid::new(n2, 20);
    d1.add_wait(t1, t2);
    d2.add_wait(t2, t1);
    d1.publish().await.unwrap();
    d2.publish().await.unwrap();

    let cycle = d1.detect(&[n1, n2]).await.unwrap().expect("cycle must be found");
    let victim = d1.select_victim(&cycle).unwrap();
    assert!(victim == t1 || victim == t2);
}

fn spawn_pump(coordinator: Arc<TwoPhaseCommitCoordinator>) {
    tokio::spawn(async move {
        loop {
            match coordinator.recv_message().await {
                Ok(Some((from, message))) => {
                    let _ = coordinator.handle_message(from, message).await;
                }
                _ => break,
            }
        }
    });
}
