use async_trait::async_trait;

use crate::common::NodeId;
use crate::error::CoreResult;

use super::messages::ArbiterMessage;

/// The arbiter socket: a direct, ordered channel per (origin, receiver)
/// pair carrying PREPARE votes and COMMIT/ABORT notifications. Kept
/// separate from the `replication::Transport` trait and the shared config
/// store, per spec §4.5 ("this is the latency-critical path").
#[async_trait]
pub trait ArbiterTransport: Send + Sync {
    async fn send(&self, to: NodeId, message: ArbiterMessage) -> CoreResult<()>;

    /// Blocks until the next message addressed to this node arrives, or
    /// returns `Ok(None)` if the transport was closed.
    async fn recv(&self) -> CoreResult<Option<(NodeId, ArbiterMessage)>>;
}
