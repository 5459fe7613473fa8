// concord-node: a demo binary that wires up a single-process, multi-node
// loopback cluster against in-memory fakes for the arbiter transport and
// shared config store, to exercise the commit core end to end.

use std::sync::Arc;

use concord_core::arbiter::Arbiter;
use concord_core::common::NodeId;
use concord_core::config::{ClusterConfig, NodeAddress};
use concord_core::config_store::InMemoryConfigStore;
use concord_core::hooks::NullHooks;
use concord_core::node::NodeContext;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_target(false)
        .with_thread_ids(true)
        .with_level(true)
        .init();

    print_banner();

    let node_id = NodeId::new(1).unwrap();
    let nodes = vec![NodeAddress {
        id: node_id,
        host: "127.0.0.1".into(),
        replication_port: 5433,
        arbiter_port: 5434,
        config_store_port: 5435,
    }];
    let config = Arc::new(ClusterConfig::new(node_id, nodes));
    let config_store = Arc::new(InMemoryConfigStore::new());

    let ctx = Arc::new(NodeContext::new(
        config.clone(),
        Arc::new(LoopbackArbiterTransport),
        config_store.clone(),
        Arc::new(NullHooks),
        Arc::new(NullReplicationTransport),
    ));

    tracing::info!(node = %node_id, "concord-core node initialized");
    ctx.spawn_background_tasks();

    let (xid, snapshot) = ctx.coordinator.begin().await;
    tracing::info!(xid, snapshot, "local transaction started");
    match ctx.coordinator.commit(xid, &[], true).await {
        Ok(final_csn) => tracing::info!(xid, final_csn, "local transaction committed"),
        Err(err) => tracing::error!(xid, ?err, "local transaction failed"),
    }

    let arbiter: &Arbiter = &ctx.arbiter;
    tracing::info!(status = ?arbiter.status(), "cluster status");
}

struct LoopbackArbiterTransport;

#[async_trait::async_trait]
impl concord_core::coordinator::ArbiterTransport for LoopbackArbiterTransport {
    async fn send(
        &self,
        _to: concord_core::common::NodeId,
        _message: concord_core::coordinator::ArbiterMessage,
    ) -> concord_core::CoreResult<()> {
        Ok(())
    }

    async fn recv(
        &self,
    ) -> concord_core::CoreResult<Option<(concord_core::common::NodeId, concord_core::coordinator::ArbiterMessage)>> {
        Ok(None)
    }
}

struct NullReplicationTransport;

#[async_trait::async_trait]
impl concord_core::replication::ReplicationTransport for NullReplicationTransport {
    async fn send(
        &self,
        _to: concord_core::common::NodeId,
        _message: concord_core::replication::WireMessage,
    ) -> concord_core::CoreResult<()> {
        Ok(())
    }

    async fn recv(
        &self,
        _from: concord_core::common::NodeId,
    ) -> concord_core::CoreResult<Option<concord_core::replication::WireMessage>> {
        Ok(None)
    }
}

fn print_banner() {
    println!("concord-core demo node");
    println!("single-node loopback cluster, in-memory config store");
    println!();
}
