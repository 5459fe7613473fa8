// Shared config store: an opaque, cluster-wide put/get of small byte blobs
// (spec §1, §6). Used for connectivity masks and wait-for graphs only —
// never for commit messages, which go over the arbiter channel.

use async_trait::async_trait;
use dashmap::DashMap;

use crate::error::{CoreError, CoreResult};

#[async_trait]
pub trait SharedConfigStore: Send + Sync {
    async fn put(&self, key: &str, value: Vec<u8>) -> CoreResult<()>;
    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>>;
}

/// `node-mask-<i>` key, per spec §6.
pub fn node_mask_key(node: crate::common::NodeId) -> String {
    format!("node-mask-{}", node.0)
}

/// `lock-graph-<i>` key, per spec §6.
pub fn lock_graph_key(node: crate::common::NodeId) -> String {
    format!("lock-graph-{}", node.0)
}

/// In-memory `SharedConfigStore`, used by tests and the demo binary. The
/// store is internally serialized per spec §5 ("nodes treat put/get as
/// single-writer-per-key"); a `DashMap` gives us that without a global lock.
#[derive(Default)]
pub struct InMemoryConfigStore {
    values: DashMap<String, Vec<u8>>,
}

impl InMemoryConfigStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl SharedConfigStore for InMemoryConfigStore {
    async fn put(&self, key: &str, value: Vec<u8>) -> CoreResult<()> {
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    async fn get(&self, key: &str) -> CoreResult<Option<Vec<u8>>> {
        Ok(self.values.get(key).map(|v| v.clone()))
    }
}

/// Helper used by both the arbiter (masks) and the deadlock detector
/// (wait-for graphs) to serialize a small struct into a config-store blob.
pub fn encode<T: serde::Serialize>(value: &T) -> CoreResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(CoreError::from)
}

pub fn decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> CoreResult<T> {
    serde_json::from_slice(bytes).map_err(CoreError::from)
}
