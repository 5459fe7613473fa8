use async_trait::async_trait;

use crate::common::NodeId;
use crate::error::CoreResult;

use super::wire::WireMessage;

/// A single ordered stream per (origin, receiver) pair (spec §5: "Per-
/// originator write order is preserved end-to-end"). Implemented by the
/// external logical-decoding plugin; the core only defines the framing
/// (`wire::WireMessage`) and consumes this trait.
#[async_trait]
pub trait ReplicationTransport: Send + Sync {
    /// Sends the next message in order to `to`'s stream from this node.
    async fn send(&self, to: NodeId, message: WireMessage) -> CoreResult<()>;

    /// Receives the next message from `from`'s stream, in the order it was
    /// sent. Returns `Ok(None)` when the stream closes.
    async fn recv(&self, from: NodeId) -> CoreResult<Option<WireMessage>>;
}
