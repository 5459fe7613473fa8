// Byte-stream framing for the logical replication transport (spec §6).
// The external logical-decoding plugin delivers these messages; this
// module defines the wire shapes the core consumes/produces, using the
// same `bytes`-based manual framing as the rest of `replication::wal`.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::common::{Csn, NodeId, Xid};
use crate::error::{CoreError, CoreResult};

/// One live attribute's value within a tuple block (spec §6's kind bytes).
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TupleAttr {
    Null,
    UnchangedToast,
    InternalBinary(Vec<u8>),
    SendRecvBinary(Vec<u8>),
    Text(Vec<u8>),
}

impl TupleAttr {
    fn kind_byte(&self) -> u8 {
        match self {
            TupleAttr::Null => b'n',
            TupleAttr::UnchangedToast => b'u',
            TupleAttr::InternalBinary(_) => b'b',
            TupleAttr::SendRecvBinary(_) => b's',
            TupleAttr::Text(_) => b't',
        }
    }

    fn encode(&self, out: &mut BytesMut) {
        out.put_u8(self.kind_byte());
        match self {
            TupleAttr::Null | TupleAttr::UnchangedToast => {}
            TupleAttr::InternalBinary(bytes)
            | TupleAttr::SendRecvBinary(bytes)
            | TupleAttr::Text(bytes) => {
                out.put_u32(bytes.len() as u32);
                out.put_slice(bytes);
            }
        }
    }

    fn decode(buf: &mut Bytes) -> CoreResult<Self> {
        let kind = read_u8(buf)?;
        Ok(match kind {
            b'n' => TupleAttr::Null,
            b'u' => TupleAttr::UnchangedToast,
            b'b' => TupleAttr::InternalBinary(read_lenprefixed(buf)?),
            b's' => TupleAttr::SendRecvBinary(read_lenprefixed(buf)?),
            b't' => TupleAttr::Text(read_lenprefixed(buf)?),
            other => {
                return Err(CoreError::Deserialization(format!(
                    "unknown tuple attribute kind byte {other}"
                )))
            }
        })
    }
}

/// `T` tuple block: a 2-byte live-attribute count followed by that many
/// `TupleAttr`s.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TupleBlock(pub Vec<TupleAttr>);

impl TupleBlock {
    fn encode(&self, out: &mut BytesMut) {
        out.put_u16(self.0.len() as u16);
        for attr in &self.0 {
            attr.encode(out);
        }
    }

    fn decode(buf: &mut Bytes) -> CoreResult<Self> {
        let count = read_u16(buf)?;
        let mut attrs = Vec::with_capacity(count as usize);
        for _ in 0..count {
            attrs.push(TupleAttr::decode(buf)?);
        }
        Ok(TupleBlock(attrs))
    }
}

/// The flags byte on a `C` COMMIT message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommitKind {
    Commit,
    Prepare,
    CommitPrepared,
    AbortPrepared,
}

impl CommitKind {
    fn to_byte(self) -> u8 {
        match self {
            CommitKind::Commit => 0,
            CommitKind::Prepare => 1,
            CommitKind::CommitPrepared => 2,
            CommitKind::AbortPrepared => 3,
        }
    }

    fn from_byte(b: u8) -> CoreResult<Self> {
        Ok(match b {
            0 => CommitKind::Commit,
            1 => CommitKind::Prepare,
            2 => CommitKind::CommitPrepared,
            3 => CommitKind::AbortPrepared,
            other => return Err(CoreError::Deserialization(format!("unknown commit kind {other}"))),
        })
    }
}

/// Set exactly on the COMMIT that first reports the donor has reached
/// `slot_lsn == wal_lsn` with zero active transactions during recovery;
/// always `false` in steady-state replication (Open Question decision,
/// see `DESIGN.md`).
pub type CaughtUpFlag = bool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Begin {
        origin_node: NodeId,
        origin_xid: Xid,
        snapshot_csn: Csn,
    },
    Commit {
        kind: CommitKind,
        origin_node: NodeId,
        caught_up: CaughtUpFlag,
        end_lsn: u64,
        commit_timestamp_us: u64,
        final_csn: Option<Csn>,
        gid: Option<String>,
    },
    Relation {
        schema: String,
        relation: String,
    },
    Insert {
        tuple: TupleBlock,
    },
    Update {
        tuple: TupleBlock,
    },
    Delete {
        tuple: TupleBlock,
    },
}

impl WireMessage {
    pub fn encode(&self) -> Bytes {
        let mut out = BytesMut::new();
        match self {
            WireMessage::Begin {
                origin_node,
                origin_xid,
                snapshot_csn,
            } => {
                out.put_u8(b'B');
                out.put_u8(origin_node.0);
                out.put_u64(*origin_xid);
                out.put_u64(*snapshot_csn);
            }
            WireMessage::Commit {
                kind,
                origin_node,
                caught_up,
                end_lsn,
                commit_timestamp_us,
                final_csn,
                gid,
            } => {
                out.put_u8(b'C');
                out.put_u8(kind.to_byte());
                out.put_u8(origin_node.0);
                out.put_u8(if *caught_up { 1 } else { 0 });
                out.put_u64(*end_lsn);
                out.put_u64(*commit_timestamp_us);
                match final_csn {
                    Some(csn) => {
                        out.put_u8(1);
                        out.put_u64(*csn);
                    }
                    None => out.put_u8(0),
                }
                match gid {
                    Some(gid) => {
                        out.put_u8(1);
                        put_lenprefixed_str(&mut out, gid);
                    }
                    None => out.put_u8(0),
                }
            }
            WireMessage::Relation { schema, relation } => {
                out.put_u8(b'R');
                put_lenprefixed_str(&mut out, schema);
                put_lenprefixed_str(&mut out, relation);
            }
            WireMessage::Insert { tuple } => {
                out.put_u8(b'I');
                tuple.encode(&mut out);
            }
            WireMessage::Update { tuple } => {
                out.put_u8(b'U');
                tuple.encode(&mut out);
            }
            WireMessage::Delete { tuple } => {
                out.put_u8(b'D');
                tuple.encode(&mut out);
            }
        }
        out.freeze()
    }

    pub fn decode(bytes: Bytes) -> CoreResult<Self> {
        let mut buf = bytes;
        let tag = read_u8(&mut buf)?;
        Ok(match tag {
            b'B' => WireMessage::Begin {
                origin_node: NodeId::new(read_u8(&mut buf)?)
                    .ok_or_else(|| CoreError::Deserialization("invalid node id".into()))?,
                origin_xid: read_u64(&mut buf)?,
                snapshot_csn: read_u64(&mut buf)?,
            },
            b'C' => {
                let kind = CommitKind::from_byte(read_u8(&mut buf)?)?;
                let origin_node = NodeId::new(read_u8(&mut buf)?)
                    .ok_or_else(|| CoreError::Deserialization("invalid node id".into()))?;
                let caught_up = read_u8(&mut buf)? != 0;
                let end_lsn = read_u64(&mut buf)?;
                let commit_timestamp_us = read_u64(&mut buf)?;
                let final_csn = if read_u8(&mut buf)? != 0 {
                    Some(read_u64(&mut buf)?)
                } else {
                    None
                };
                let gid = if read_u8(&mut buf)? != 0 {
                    Some(read_lenprefixed_str(&mut buf)?)
                } else {
                    None
                };
                WireMessage::Commit {
                    kind,
                    origin_node,
                    caught_up,
                    end_lsn,
                    commit_timestamp_us,
                    final_csn,
                    gid,
                }
            }
            b'R' => WireMessage::Relation {
                schema: read_lenprefixed_str(&mut buf)?,
                relation: read_lenprefixed_str(&mut buf)?,
            },
            b'I' => WireMessage::Insert {
                tuple: TupleBlock::decode(&mut buf)?,
            },
            b'U' => WireMessage::Update {
                tuple: TupleBlock::decode(&mut buf)?,
            },
            b'D' => WireMessage::Delete {
                tuple: TupleBlock::decode(&mut buf)?,
            },
            other => {
                return Err(CoreError::Deserialization(format!(
                    "unknown replication message tag {other:?}"
                )))
            }
        })
    }

    /// A BEGIN with no recovery flag and an invalid (zero) snapshot CSN
    /// must be dropped by the output side (spec §6: "filtered txn") — the
    /// mechanism that keeps read-only/local-only transactions off the wire.
    pub fn is_filtered_begin(&self) -> bool {
        matches!(self, WireMessage::Begin { snapshot_csn: 0, .. })
    }
}

fn read_u8(buf: &mut Bytes) -> CoreResult<u8> {
    if buf.remaining() < 1 {
        return Err(CoreError::Deserialization("truncated message".into()));
    }
    Ok(buf.get_u8())
}

fn read_u16(buf: &mut Bytes) -> CoreResult<u16> {
    if buf.remaining() < 2 {
        return Err(CoreError::Deserialization("truncated message".into()));
    }
    Ok(buf.get_u16())
}

fn read_u64(buf: &mut Bytes) -> CoreResult<u64> {
    if buf.remaining() < 8 {
        return Err(CoreError::Deserialization("truncated message".into()));
    }
    Ok(buf.get_u64())
}

fn read_lenprefixed(buf: &mut Bytes) -> CoreResult<Vec<u8>> {
    let len = {
        if buf.remaining() < 4 {
            return Err(CoreError::Deserialization("truncated length prefix".into()));
        }
        buf.get_u32() as usize
    };
    if buf.remaining() < len {
        return Err(CoreError::Deserialization("truncated payload".into()));
    }
    let mut out = vec![0u8; len];
    buf.copy_to_slice(&mut out);
    Ok(out)
}

fn read_lenprefixed_str(buf: &mut Bytes) -> CoreResult<String> {
    let bytes = read_lenprefixed(buf)?;
    String::from_utf8(bytes).map_err(|e| CoreError::Deserialization(e.to_string()))
}

fn put_lenprefixed_str(out: &mut BytesMut, s: &str) {
    out.put_u32(s.len() as u32);
    out.put_slice(s.as_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn begin_round_trips() {
        let msg = WireMessage::Begin {
            origin_node: NodeId::new(2).unwrap(),
            origin_xid: 42,
            snapshot_csn: 1000,
        };
        let encoded = msg.encode();
        let decoded = WireMessage::decode(encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn commit_prepared_round_trips_with_optional_fields() {
        let msg = WireMessage::Commit {
            kind: CommitKind::CommitPrepared,
            origin_node: NodeId::new(1).unwrap(),
            caught_up: true,
            end_lsn: 999,
            commit_timestamp_us: 12345,
            final_csn: Some(777),
            gid: Some("g1".to_string()),
        };
        let decoded = WireMessage::decode(msg.encode()).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn tuple_block_preserves_every_attribute_kind() {
        let tuple = TupleBlock(vec![
            TupleAttr::Null,
            TupleAttr::UnchangedToast,
            TupleAttr::InternalBinary(vec![1, 2, 3]),
            TupleAttr::SendRecvBinary(vec![4, 5]),
            TupleAttr::Text(b"hello".to_vec()),
        ]);
        let msg = WireMessage::Insert { tuple: tuple.clone() };
        let decoded = WireMessage::decode(msg.encode()).unwrap();
        match decoded {
            WireMessage::Insert { tuple: decoded_tuple } => assert_eq!(decoded_tuple, tuple),
            _ => panic!("wrong variant"),
        }
    }

    #[test]
    fn zero_csn_begin_is_filtered() {
        let msg = WireMessage::Begin {
            origin_node: NodeId::new(1).unwrap(),
            origin_xid: 1,
            snapshot_csn: 0,
        };
        assert!(msg.is_filtered_begin());
    }

    #[test]
    fn relation_round_trips() {
        let msg = WireMessage::Relation {
            schema: "public".into(),
            relation: "t".into(),
        };
        assert_eq!(WireMessage::decode(msg.encode()).unwrap(), msg);
    }
}
