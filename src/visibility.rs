// C3: visibility & snapshot service.
//
// `visible` consults C2 directly; it never takes a lock across a suspension
// point (spec §9: "take a shared lock, read the state, drop the lock,
// sleep, retake — never sleep under a lock").

use std::time::Duration;

use tracing::debug;

use crate::common::{Csn, Xid};
use crate::error::{CoreError, CoreResult};
use crate::txn::{TransactionTable, TxnStatus};

const INITIAL_BACKOFF: Duration = Duration::from_millis(1);
const MAX_BACKOFF: Duration = Duration::from_millis(100);
const MAX_RETRIES: u32 = 100;

/// MVCC visibility check, waiting out in-doubt transactions.
///
/// Returns `Ok(true)` if the XID's writes are visible under `snapshot`,
/// `Ok(false)` if invisible, or `Err(CoreError::VisibilityExhausted)` if the
/// XID stayed `unknown` past the retry cap — per the Open Question decision
/// in `DESIGN.md`, this aborts the *reader's* query, not the in-doubt
/// transaction (whose outcome is still pending at the coordinator).
pub async fn visible(table: &TransactionTable, xid: Xid, snapshot: Csn) -> CoreResult<bool> {
    let mut backoff = INITIAL_BACKOFF;
    for attempt in 0..MAX_RETRIES {
        let Some(record) = table.get(xid) else {
            // No state at all: treat as not-yet-begun / already GC'd and
            // terminal, i.e. invisible. A fully accurate engine would
            // consult the clog, which is out of scope here.
            return Ok(false);
        };
        match record.status {
            TxnStatus::Aborted => return Ok(false),
            TxnStatus::Committed => return Ok(record.csn <= snapshot),
            TxnStatus::InProgress => return Ok(false),
            TxnStatus::Unknown => {
                debug!(xid, attempt, backoff_ms = backoff.as_millis() as u64, "waiting on in-doubt xid");
                tokio::time::sleep(backoff).await;
                backoff = (backoff * 2).min(MAX_BACKOFF);
            }
        }
    }
    Err(CoreError::VisibilityExhausted(xid))
}

/// Cluster-wide vacuum horizon: the local engine's xmin, lowered to the
/// minimum of every node's reported `oldest-snapshot` minus `vacuum_delay`
/// (spec §4.3), so a snapshot on one node stays readable while any other
/// node might still reference the tuples it needs.
pub fn oldest_xmin(local_xmin: Csn, peer_oldest_snapshots: &[Csn], vacuum_delay_csn_units: u64) -> Csn {
    let peers_min = peer_oldest_snapshots.iter().copied().min();
    let floor = match peers_min {
        Some(min) => min.saturating_sub(vacuum_delay_csn_units),
        None => local_xmin,
    };
    local_xmin.min(floor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Gtid, NodeId};
    use crate::txn::TransactionRecord;

    fn gtid(xid: Xid) -> Gtid {
        Gtid::new(NodeId::MIN, xid)
    }

    #[tokio::test]
    async fn committed_below_snapshot_is_visible() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(1, gtid(1), 5)).unwrap();
        table.set_status(1, TxnStatus::Committed).unwrap();
        table.update(1, |r| r.csn = 10).unwrap();

        assert!(visible(&table, 1, 20).await.unwrap());
        assert!(!visible(&table, 1, 5).await.unwrap());
    }

    #[tokio::test]
    async fn aborted_is_never_visible() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(2, gtid(2), 5)).unwrap();
        table.set_status(2, TxnStatus::Aborted).unwrap();
        assert!(!visible(&table, 2, 1000).await.unwrap());
    }

    #[tokio::test]
    async fn in_progress_is_invisible_without_waiting() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(3, gtid(3), 5)).unwrap();
        assert!(!visible(&table, 3, 1000).await.unwrap());
    }

    #[tokio::test]
    async fn unknown_resolves_to_committed_after_a_few_retries() {
        let table = TransactionTable::new();
        table.insert(TransactionRecord::begin(4, gtid(4), 5)).unwrap();
        table.set_status(4, TxnStatus::Unknown).unwrap();

        let table2 = &table;
        let resolver = async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            table2.set_status(4, TxnStatus::Committed).unwrap();
            table2.update(4, |r| r.csn = 50).unwrap();
        };
        let (result, _) = tokio::join!(visible(&table, 4, 1000), resolver);
        assert!(result.unwrap());
    }

    #[test]
    fn oldest_xmin_respects_peers_and_vacuum_delay() {
        let result = oldest_xmin(100, &[80, 90], 10);
        assert_eq!(result, 70);
    }

    #[test]
    fn oldest_xmin_falls_back_to_local_with_no_peers() {
        assert_eq!(oldest_xmin(50, &[], 10), 50);
    }
}
