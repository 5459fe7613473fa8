// Transaction lifecycle hooks (spec §1, §9): the core consumes these from
// the host SQL/storage engine rather than owning them. Ordering contract:
// `begin` fires once at BEGIN; `pre_prepare` fires exactly once before any
// row-change record is emitted for the transaction; `post_prepare` fires
// once the coordinator knows the vote outcome (whether this node's vote or
// the global decision); `commit`/`abort` finalize and are mutually
// exclusive, each firing exactly once per transaction.

use async_trait::async_trait;

use crate::common::{Csn, Gtid, Xid};
use crate::error::CoreResult;

#[async_trait]
pub trait TransactionHooks: Send + Sync {
    /// Called once when a (possibly distributed) transaction begins locally.
    async fn begin(&self, xid: Xid, snapshot: Csn) -> CoreResult<()>;

    /// Called exactly once, before any row-change record for `gtid` is
    /// emitted onto the replication transport. A non-`Ok` return aborts the
    /// transaction locally before prepare is attempted.
    async fn pre_prepare(&self, gtid: Gtid) -> CoreResult<()>;

    /// Called once the coordinator has decided this participant's vote
    /// (spec: "after the coordinator knows the vote outcome"), i.e. right
    /// after this node answers READY or ABORTED, before the global decision
    /// is known.
    async fn post_prepare(&self, gtid: Gtid, voted_ready: bool) -> CoreResult<()>;

    /// Finalizes a successful commit at `final_csn`. Fires exactly once,
    /// mutually exclusive with `abort`.
    async fn commit(&self, gtid: Gtid, final_csn: Csn) -> CoreResult<()>;

    /// Finalizes an abort. Fires exactly once, mutually exclusive with
    /// `commit`.
    async fn abort(&self, gtid: Gtid) -> CoreResult<()>;
}

/// No-op implementation for embedding contexts that have no host engine
/// (demo binary, tests exercising only the commit core).
pub struct NullHooks;

#[async_trait]
impl TransactionHooks for NullHooks {
    async fn begin(&self, _xid: Xid, _snapshot: Csn) -> CoreResult<()> {
        Ok(())
    }

    async fn pre_prepare(&self, _gtid: Gtid) -> CoreResult<()> {
        Ok(())
    }

    async fn post_prepare(&self, _gtid: Gtid, _voted_ready: bool) -> CoreResult<()> {
        Ok(())
    }

    async fn commit(&self, _gtid: Gtid, _final_csn: Csn) -> CoreResult<()> {
        Ok(())
    }

    async fn abort(&self, _gtid: Gtid) -> CoreResult<()> {
        Ok(())
    }
}
