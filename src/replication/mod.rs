// Logical replication transport: byte-stream framing (spec §6) plus the
// trait the external logical-decoding plugin implements. Everything about
// the WAL format, slot persistence, and on-disk storage is out of scope
// (spec §1 Non-goals); the core only consumes an ordered stream of these
// messages per (origin, receiver) pair.

mod transport;
mod wire;

pub use transport::ReplicationTransport;
pub use wire::{CaughtUpFlag, CommitKind, TupleAttr, TupleBlock, WireMessage};
