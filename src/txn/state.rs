use serde::{Deserialize, Serialize};

use crate::common::{Csn, Gtid, Xid};

/// `status` of a TransactionState, per spec §3. `Unknown` is the in-doubt
/// state: a participant has PREPAREd but not yet learned the coordinator's
/// final decision. I3: `Unknown` transitions only to `Committed` or `Aborted`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TxnStatus {
    InProgress,
    Unknown,
    Committed,
    Aborted,
}

impl TxnStatus {
    /// Enforces I3 by rejecting any transition out of `Unknown` other than
    /// to a terminal status.
    pub fn can_transition_to(self, next: TxnStatus) -> bool {
        match self {
            TxnStatus::Unknown => matches!(next, TxnStatus::Committed | TxnStatus::Aborted),
            TxnStatus::InProgress => true,
            TxnStatus::Committed | TxnStatus::Aborted => false,
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, TxnStatus::Committed | TxnStatus::Aborted)
    }
}

/// One per active or recently-finished XID (spec §3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub xid: Xid,
    pub gtid: Gtid,
    pub gid: String,
    pub status: TxnStatus,
    /// CSN taken at BEGIN.
    pub snapshot: Csn,
    /// Final commit CSN; set at PREPARE, may increase to the cluster
    /// maximum once all participants have reported theirs.
    pub csn: Csn,
    /// True iff this transaction must never be replicated.
    pub is_local: bool,
    pub votes_needed: u32,
    pub votes_received: u32,
    pub voting_complete: bool,
    /// Committed child sub-transactions, inheriting this record's final
    /// status/CSN; inserted immediately after the parent in GC order.
    pub subxids: Vec<Xid>,
    /// Local waiter to notify once voting completes; opaque outside C4.
    pub waiter_procno: Option<u64>,
}

impl TransactionRecord {
    pub fn begin(xid: Xid, gtid: Gtid, snapshot: Csn) -> Self {
        Self {
            xid,
            gtid,
            gid: String::new(),
            status: TxnStatus::InProgress,
            snapshot,
            csn: 0,
            is_local: false,
            votes_needed: 0,
            votes_received: 0,
            voting_complete: false,
            subxids: Vec::new(),
            waiter_procno: None,
        }
    }

    /// Applies a status transition, enforcing I3. Returns the rejected
    /// `(from, to)` pair as an error tuple when the transition is illegal.
    pub fn set_status(&mut self, next: TxnStatus) -> Result<(), (TxnStatus, TxnStatus)> {
        if !self.status.can_transition_to(next) {
            return Err((self.status, next));
        }
        self.status = next;
        Ok(())
    }

    pub fn record_vote(&mut self, participant_csn: Csn) {
        self.votes_received += 1;
        if participant_csn > self.csn {
            self.csn = participant_csn;
        }
        if self.votes_received >= self.votes_needed {
            self.voting_complete = true;
        }
    }
}
