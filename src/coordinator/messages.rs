// Wire messages on the arbiter channel (spec §6): the latency-critical
// direct socket between coordinator and participants, distinct from the
// shared config store used for heartbeats' mask publication.

use serde::{Deserialize, Serialize};

use crate::common::{Csn, Gtid, NodeId, NodeSet};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ArbiterMessage {
    /// Coordinator -> all live participants.
    Prepare {
        gid: String,
        gtid: Gtid,
        commit_csn0: Csn,
    },
    /// Participant -> coordinator on successful prepare.
    Ready { gid: String, participant_csn: Csn },
    /// Participant -> coordinator on refusal.
    Aborted { gid: String },
    /// Coordinator -> participants with the final commit CSN.
    Commit { gid: String, final_csn: Csn },
    /// Coordinator -> participants.
    Abort { gid: String },
    /// Any -> any, published at `heartbeat_send_timeout` cadence.
    Heartbeat {
        node: NodeId,
        timestamp_us: u64,
        mask: NodeSet,
    },
}
