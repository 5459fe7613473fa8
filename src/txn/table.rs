use std::collections::{HashMap, VecDeque};

use parking_lot::RwLock;
use tracing::{info, warn};

use crate::common::{Csn, Gtid, Xid};
use crate::error::{CoreError, CoreResult};

use super::state::{TransactionRecord, TxnStatus};

/// Outcome of one GC scan, for logging and `get-cluster-state` reporting.
#[derive(Debug, Clone, Default)]
pub struct GcOutcome {
    pub removed: Vec<Xid>,
    pub stopped_at: Option<Xid>,
}

/// C2: the per-node transaction state table. A single `parking_lot::RwLock`
/// guards both hashes and the FIFO queue together, per spec §4.2 ("a single
/// writer lock protects both hashes and the list; read paths may take a
/// shared lock").
pub struct TransactionTable {
    inner: RwLock<Inner>,
}

struct Inner {
    by_xid: HashMap<Xid, TransactionRecord>,
    by_gid: HashMap<String, Xid>,
    /// Insertion-ordered queue of XIDs, oldest first, used for GC (the
    /// arena-index reimplementation of spec's intrusive `next` pointer).
    insertion_order: VecDeque<Xid>,
}

impl TransactionTable {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                by_xid: HashMap::new(),
                by_gid: HashMap::new(),
                insertion_order: VecDeque::new(),
            }),
        }
    }

    /// Inserts a new record. I1: at most one TransactionState per XID.
    pub fn insert(&self, record: TransactionRecord) -> CoreResult<()> {
        let mut inner = self.inner.write();
        if inner.by_xid.contains_key(&record.xid) {
            return Err(CoreError::Internal(format!(
                "duplicate TransactionState for xid {} violates uniqueness invariant",
                record.xid
            )));
        }
        inner.insertion_order.push_back(record.xid);
        inner.by_xid.insert(record.xid, record);
        Ok(())
    }

    /// Attaches a GID to an existing record (done at PRE_PREPARE/PREPARE)
    /// and indexes it in the secondary GID map.
    pub fn assign_gid(&self, xid: Xid, gid: String) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let record = inner
            .by_xid
            .get_mut(&xid)
            .ok_or(CoreError::UnknownXid(xid))?;
        record.gid = gid.clone();
        inner.by_gid.insert(gid, xid);
        Ok(())
    }

    /// Inserts a committed sub-transaction immediately after its parent in
    /// GC order, inheriting the parent's status and CSN (spec §4.2).
    pub fn insert_subxid(&self, parent: Xid, sub_xid: Xid) -> CoreResult<()> {
        let mut inner = self.inner.write();
        let parent_record = inner
            .by_xid
            .get(&parent)
            .ok_or(CoreError::UnknownXid(parent))?
            .clone();
        if inner.by_xid.contains_key(&sub_xid) {
            return Err(CoreError::Internal(format!(
                "duplicate TransactionState for xid {} violates uniqueness invariant",
                sub_xid
            )));
        }
        let mut sub = TransactionRecord::begin(sub_xid, parent_record.gtid, parent_record.snapshot);
        sub.status = parent_record.status;
        sub.csn = parent_record.csn;

        let parent_pos = inner
            .insertion_order
            .iter()
            .position(|&x| x == parent)
            .expect("parent xid present in insertion_order");
        inner.insertion_order.insert(parent_pos + 1, sub_xid);
        inner
            .by_xid
            .get_mut(&parent)
            .unwrap()
            .subxids
            .push(sub_xid);
        inner.by_xid.insert(sub_xid, sub);
        Ok(())
    }

    pub fn get(&self, xid: Xid) -> Option<TransactionRecord> {
        self.inner.read().by_xid.get(&xid).cloned()
    }

    pub fn get_by_gid(&self, gid: &str) -> Option<TransactionRecord> {
        let inner = self.inner.read();
        let xid = *inner.by_gid.get(gid)?;
        inner.by_xid.get(&xid).cloned()
    }

    /// Applies `f` to the record for `xid` under the write lock, enforcing
    /// I3 via `TransactionRecord::set_status` when `f` changes status.
    pub fn update<F, R>(&self, xid: Xid, f: F) -> CoreResult<R>
    where
        F: FnOnce(&mut TransactionRecord) -> R,
    {
        let mut inner = self.inner.write();
        let record = inner
            .by_xid
            .get_mut(&xid)
            .ok_or(CoreError::UnknownXid(xid))?;
        Ok(f(record))
    }

    pub fn set_status(&self, xid: Xid, status: TxnStatus) -> CoreResult<()> {
        let gtid = self.update(xid, |record| {
            let gtid = record.gtid;
            record.set_status(status).map(|_| gtid)
        })?;
        match gtid {
            Ok(gtid) => {
                info!(xid, gtid = %gtid, ?status, "transaction status transition");
                Ok(())
            }
            Err((from, to)) => {
                let gtid = self.get(xid).map(|r| r.gtid);
                Err(CoreError::invalid_state_transition(
                    gtid.unwrap_or(Gtid::new(crate::common::NodeId::MIN, xid)),
                    status_label(from),
                    status_label(to),
                ))
            }
        }
    }

    /// Number of live records, for diagnostics and `get-cluster-state`.
    pub fn len(&self) -> usize {
        self.inner.read().by_xid.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Oldest snapshot among currently in-progress or in-doubt transactions,
    /// used by C3's `oldest-xmin` aggregation. `None` if the table holds no
    /// still-open transaction.
    pub fn oldest_open_snapshot(&self) -> Option<Csn> {
        self.inner
            .read()
            .by_xid
            .values()
            .filter(|r| !r.status.is_terminal())
            .map(|r| r.snapshot)
            .min()
    }

    /// GC scan from the head of the insertion-ordered queue: stop at the
    /// first record younger than `cutoff` or still open (I6: `oldest-xid`
    /// never advances past any snapshot held by an in-progress transaction).
    pub fn gc(&self, cutoff: Csn) -> GcOutcome {
        let mut inner = self.inner.write();
        let mut outcome = GcOutcome::default();
        loop {
            let Some(&xid) = inner.insertion_order.front() else {
                break;
            };
            let Some(record) = inner.by_xid.get(&xid) else {
                // already removed out of band; drop the stale queue entry
                inner.insertion_order.pop_front();
                continue;
            };
            if !record.status.is_terminal() {
                outcome.stopped_at = Some(xid);
                break;
            }
            if record.csn >= cutoff {
                outcome.stopped_at = Some(xid);
                break;
            }
            let gid = record.gid.clone();
            inner.insertion_order.pop_front();
            inner.by_xid.remove(&xid);
            if !gid.is_empty() {
                inner.by_gid.remove(&gid);
            }
            outcome.removed.push(xid);
        }
        if !outcome.removed.is_empty() {
            info!(count = outcome.removed.len(), "transaction table GC reclaimed records");
        }
        outcome
    }
}

impl Default for TransactionTable {
    fn default() -> Self {
        Self::new()
    }
}

fn status_label(status: TxnStatus) -> &'static str {
    match status {
        TxnStatus::InProgress => "in-progress",
        TxnStatus::Unknown => "unknown",
        TxnStatus::Committed => "committed",
        TxnStatus::Aborted => "aborted",
    }
}

/// Logged by the GC driver (in `node.rs`) on a failed/retried scan, per the
/// §7 policy of logging GC errors at warning level and retrying.
pub fn log_gc_retry(reason: &str) {
    warn!(reason, "GC scan retried after misfire");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::NodeId;

    fn gtid(xid: Xid) -> Gtid {
        Gtid::new(NodeId::MIN, xid)
    }

    #[test]
    fn insert_rejects_duplicate_xid() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(1, gtid(1), 10)).unwrap();
        let err = table
            .insert(TransactionRecord::begin(1, gtid(1), 20))
            .unwrap_err();
        assert!(matches!(err, CoreError::Internal(_)));
    }

    #[test]
    fn gid_lookup_finds_record_by_secondary_index() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(5, gtid(5), 1)).unwrap();
        table.assign_gid(5, "g1".into()).unwrap();
        let found = table.get_by_gid("g1").unwrap();
        assert_eq!(found.xid, 5);
    }

    #[test]
    fn unknown_status_cannot_return_to_in_progress() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(1, gtid(1), 1)).unwrap();
        table.set_status(1, TxnStatus::Unknown).unwrap();
        let err = table.set_status(1, TxnStatus::InProgress).unwrap_err();
        assert!(matches!(err, CoreError::InvalidStateTransition { .. }));
        // but it may still resolve to committed or aborted
        table.set_status(1, TxnStatus::Committed).unwrap();
    }

    #[test]
    fn gc_stops_at_first_young_or_open_record() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(1, gtid(1), 10)).unwrap();
        table.set_status(1, TxnStatus::Committed).unwrap();
        table.update(1, |r| r.csn = 10).unwrap();

        table.insert(TransactionRecord::begin(2, gtid(2), 20)).unwrap();
        // xid 2 remains in-progress: I6 says GC must not pass it.

        let outcome = table.gc(1000);
        assert_eq!(outcome.removed, vec![1]);
        assert_eq!(outcome.stopped_at, Some(2));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn subxid_inherits_parent_status_and_csn() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(1, gtid(1), 5)).unwrap();
        table.set_status(1, TxnStatus::Committed).unwrap();
        table.update(1, |r| r.csn = 99).unwrap();
        table.insert_subxid(1, 2).unwrap();
        let sub = table.get(2).unwrap();
        assert_eq!(sub.status, TxnStatus::Committed);
        assert_eq!(sub.csn, 99);
    }
}
