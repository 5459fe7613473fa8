// Shared identifiers and constants used across the distributed commit core.
//
// Every other module (`clock`, `txn`, `visibility`, `coordinator`, `arbiter`,
// `recovery`, `replication`, `deadlock`) imports its primitive identifiers
// from here so that a node ID, a CSN, and a local transaction ID are never
// accidentally interchanged despite all being unsigned integers underneath.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Upper bound on cluster size. Node sets are represented as a `u64`
/// bitmask, so `NodeId` values must fit in `[1, MAX_NODES]`.
pub const MAX_NODES: usize = 64;

/// A node's local transaction identifier (primary key of the transaction
/// state table on the node that originated it).
pub type Xid = u64;

/// Commit Sequence Number: a 64-bit, strictly-monotone-per-node logical
/// timestamp used both as a snapshot and as a commit timestamp.
pub type Csn = u64;

/// One-based node identifier, fixed at cluster creation and never reused
/// for a different physical node. `0` is reserved as "no node" / sentinel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u8);

impl NodeId {
    /// Smallest valid node ID.
    pub const MIN: NodeId = NodeId(1);

    pub fn new(id: u8) -> Option<Self> {
        if id == 0 || id as usize > MAX_NODES {
            None
        } else {
            Some(NodeId(id))
        }
    }

    /// Zero-based bit position of this node within a `NodeSet`.
    #[inline]
    pub fn bit(self) -> u32 {
        (self.0 - 1) as u32
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Global Transaction ID: the pair that identifies a transaction uniquely
/// across the whole cluster, independent of which node a reader is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Gtid {
    pub node: NodeId,
    pub xid: Xid,
}

impl Gtid {
    pub fn new(node: NodeId, xid: Xid) -> Self {
        Self { node, xid }
    }
}

impl fmt::Display for Gtid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.node, self.xid)
    }
}

/// A bitset over `[1, MAX_NODES]`, backed by a single `u64` so membership
/// tests, unions, and popcounts are all single instructions. Used for
/// connectivity masks, the disabled-mask, and clique candidate sets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct NodeSet(u64);

impl NodeSet {
    pub const EMPTY: NodeSet = NodeSet(0);

    pub fn single(node: NodeId) -> Self {
        NodeSet(1u64 << node.bit())
    }

    /// The set `{1, ..., n}`.
    pub fn full(n: usize) -> Self {
        debug_assert!(n <= MAX_NODES);
        if n == 0 {
            NodeSet(0)
        } else if n >= 64 {
            NodeSet(u64::MAX)
        } else {
            NodeSet((1u64 << n) - 1)
        }
    }

    #[inline]
    pub fn contains(self, node: NodeId) -> bool {
        self.0 & (1u64 << node.bit()) != 0
    }

    #[inline]
    pub fn insert(&mut self, node: NodeId) {
        self.0 |= 1u64 << node.bit();
    }

    #[inline]
    pub fn remove(&mut self, node: NodeId) {
        self.0 &= !(1u64 << node.bit());
    }

    #[inline]
    pub fn union(self, other: NodeSet) -> NodeSet {
        NodeSet(self.0 | other.0)
    }

    #[inline]
    pub fn intersect(self, other: NodeSet) -> NodeSet {
        NodeSet(self.0 & other.0)
    }

    #[inline]
    pub fn difference(self, other: NodeSet) -> NodeSet {
        NodeSet(self.0 & !other.0)
    }

    #[inline]
    pub fn complement(self, n: usize) -> NodeSet {
        Self::full(n).difference(self)
    }

    #[inline]
    pub fn popcount(self) -> u32 {
        self.0.count_ones()
    }

    #[inline]
    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn iter(self, n: usize) -> impl Iterator<Item = NodeId> {
        (1..=n as u8).filter_map(move |i| {
            let node = NodeId(i);
            if self.contains(node) {
                Some(node)
            } else {
                None
            }
        })
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn from_raw(bits: u64) -> Self {
        NodeSet(bits)
    }
}

impl fmt::Display for NodeSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{")?;
        let mut first = true;
        for i in 0..MAX_NODES as u8 {
            if self.0 & (1u64 << i) != 0 {
                if !first {
                    write!(f, ",")?;
                }
                write!(f, "{}", i + 1)?;
                first = false;
            }
        }
        write!(f, "}}")
    }
}
