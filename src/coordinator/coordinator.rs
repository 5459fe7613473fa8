// C4: two-phase commit coordinator.
//
// Drives both sides of the state machine in spec §4.4: the coordinator
// side (BEGIN -> ACTIVE -> PRE-PREPARE -> PREPARE LOCAL -> AWAITING VOTES ->
// COMMITTING/ABORTING -> COMMITTED/ABORTED) and the participant side
// (BEGIN -> ACTIVE -> PREPARED -> COMMITTED/ABORTED). One coordinator
// instance runs per node and plays both roles depending on which side of a
// given transaction it is on.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::RwLock;
use tokio::sync::{watch, Notify};
use tracing::{error, info, warn};

use crate::clock::CsnClock;
use crate::common::{Csn, Gtid, NodeId, NodeSet, Xid};
use crate::config::ClusterConfig;
use crate::error::{CoreError, CoreResult};
use crate::hooks::TransactionHooks;
use crate::txn::{TransactionRecord, TransactionTable, TxnStatus};

use super::messages::ArbiterMessage;
use super::transport::ArbiterTransport;

/// Counters backing the `get-cluster-state`/`get-nodes-state` admin
/// operations (spec §6), following the per-component `stats()` snapshot
/// convention used throughout.
#[derive(Debug, Clone, Default)]
pub struct TwoPhaseCommitStats {
    pub prepared: u64,
    pub committed: u64,
    pub aborted: u64,
    pub prepare_timeouts: u64,
    pub quorum_lost: u64,
}

struct PendingVote {
    notify: Arc<Notify>,
    aborted_early: Arc<std::sync::atomic::AtomicBool>,
}

/// Test-only fault-injection hook backing the `inject-2pc-error`
/// administrative operation (spec §6). Never referenced outside tests.
#[cfg(test)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFault {
    ForceParticipantAbort,
    ForceTimeout,
}

pub struct TwoPhaseCommitCoordinator {
    node: NodeId,
    clock: Arc<CsnClock>,
    table: Arc<TransactionTable>,
    transport: Arc<dyn ArbiterTransport>,
    config: Arc<ClusterConfig>,
    stats: RwLock<TwoPhaseCommitStats>,
    next_xid: AtomicU64,
    pending_votes: DashMap<String, PendingVote>,
    /// Set while a donor wal-sender is in the "almost caught up" phase
    /// (§4.6's cluster-lock interlock); new PREPAREs wait on it.
    cluster_locked: Arc<std::sync::atomic::AtomicBool>,
    /// Mirrors the arbiter's `ClusterStatus::accepts_distributed_commits()`
    /// (P6); a node in `in-minority` or below refuses new distributed
    /// commits outright rather than attempting a prepare doomed to lose
    /// quorum.
    accepts_commits: Arc<std::sync::atomic::AtomicBool>,
    /// The arbiter's disabled-mask, watched so an in-flight PREPARE can
    /// re-evaluate `votes_needed` the instant a pending participant is
    /// disabled instead of waiting out the full prepare timeout (spec
    /// §4.4's config-change-counter re-evaluation rule).
    disabled_mask_rx: RwLock<Option<watch::Receiver<NodeSet>>>,
    hooks: Arc<dyn TransactionHooks>,
    #[cfg(test)]
    injected_fault: RwLock<Option<InjectedFault>>,
}

impl TwoPhaseCommitCoordinator {
    pub fn new(
        node: NodeId,
        clock: Arc<CsnClock>,
        table: Arc<TransactionTable>,
        transport: Arc<dyn ArbiterTransport>,
        config: Arc<ClusterConfig>,
        hooks: Arc<dyn TransactionHooks>,
    ) -> Self {
        Self {
            node,
            clock,
            table,
            transport,
            config,
            stats: RwLock::new(TwoPhaseCommitStats::default()),
            next_xid: AtomicU64::new(1),
            pending_votes: DashMap::new(),
            cluster_locked: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            accepts_commits: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            disabled_mask_rx: RwLock::new(None),
            hooks,
            #[cfg(test)]
            injected_fault: RwLock::new(None),
        }
    }

    pub fn stats(&self) -> TwoPhaseCommitStats {
        self.stats.read().clone()
    }

    /// Wires the arbiter's disabled-mask watch channel so `commit()` can
    /// react to a participant being disabled mid-vote (spec §4.4, §5).
    pub fn set_disabled_mask_watch(&self, rx: watch::Receiver<NodeSet>) {
        *self.disabled_mask_rx.write() = Some(rx);
    }

    #[cfg(test)]
    pub fn inject_fault(&self, fault: Option<InjectedFault>) {
        *self.injected_fault.write() = fault;
    }

    /// Set by the recovery controller while a donor is almost-caught-up
    /// (§4.6); cleared once catch-up completes.
    pub fn set_cluster_locked(&self, locked: bool) {
        self.cluster_locked.store(locked, Ordering::SeqCst);
    }

    /// Called whenever the arbiter's status changes (P6).
    pub fn set_accepts_commits(&self, accepts: bool) {
        self.accepts_commits.store(accepts, Ordering::SeqCst);
    }

    /// BEGIN: assigns a snapshot CSN and creates the local TransactionState.
    pub async fn begin(&self) -> (Xid, Csn) {
        let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.clock.assign_csn();
        let gtid = Gtid::new(self.node, xid);
        self.table
            .insert(TransactionRecord::begin(xid, gtid, snapshot))
            .expect("freshly allocated xid cannot already be in the table");
        if let Err(err) = self.hooks.begin(xid, snapshot).await {
            warn!(?err, xid, "begin hook failed");
        }
        (xid, snapshot)
    }

    /// Drives PRE-PREPARE through COMMITTED/ABORTED for a local transaction
    /// with the given set of live (non-disabled) participant nodes.
    /// `is_local` transactions (spec §4.4 filtering rule) skip replication
    /// entirely and commit with a locally-assigned CSN.
    pub async fn commit(
        &self,
        xid: Xid,
        participants: &[NodeId],
        is_local: bool,
    ) -> CoreResult<Csn> {
        if !self.accepts_commits.load(Ordering::SeqCst) {
            return Err(CoreError::InMinority);
        }

        while self.cluster_locked.load(Ordering::SeqCst) {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        let record = self.table.get(xid).ok_or(CoreError::UnknownXid(xid))?;
        let gtid = record.gtid;

        if is_local || participants.is_empty() {
            let csn = self.clock.assign_csn();
            self.table.update(xid, |r| {
                r.csn = csn;
                r.is_local = true;
            })?;
            self.table.set_status(xid, TxnStatus::Committed)?;
            self.stats.write().committed += 1;
            if let Err(err) = self.hooks.commit(gtid, csn).await {
                warn!(?err, xid, "commit hook failed");
            }
            return Ok(csn);
        }

        if let Err(err) = self.hooks.pre_prepare(gtid).await {
            self.table.set_status(xid, TxnStatus::Aborted)?;
            self.stats.write().aborted += 1;
            return Err(err);
        }

        let gid = format!("{}_{}", self.node.0, xid);
        let commit_csn0 = self.clock.assign_csn();
        self.table.assign_gid(xid, gid.clone())?;
        self.table.update(xid, |r| {
            r.votes_needed = participants.len() as u32;
            r.votes_received = 0;
            r.voting_complete = false;
            r.csn = commit_csn0;
        })?;

        let notify = Arc::new(Notify::new());
        let aborted_early = Arc::new(std::sync::atomic::AtomicBool::new(false));
        self.pending_votes.insert(
            gid.clone(),
            PendingVote {
                notify: notify.clone(),
                aborted_early: aborted_early.clone(),
            },
        );

        for &p in participants {
            self.transport
                .send(
                    p,
                    ArbiterMessage::Prepare {
                        gid: gid.clone(),
                        gtid,
                        commit_csn0,
                    },
                )
                .await?;
        }
        self.stats.write().prepared += 1;

        let timeout = self.prepare_timeout(record.snapshot, commit_csn0);
        let disabled_rx = self.disabled_mask_rx.read().clone();
        let voted = self
            .await_votes(xid, &gid, participants, notify, timeout, disabled_rx)
            .await;
        self.pending_votes.remove(&gid);

        #[cfg(test)]
        if self.injected_fault.read().as_ref() == Some(&InjectedFault::ForceTimeout) {
            let _ = voted;
            return self.abort_distributed(gtid, xid, &gid, participants).await;
        }

        if !voted {
            self.stats.write().prepare_timeouts += 1;
            warn!(gid, "prepare phase timed out, aborting");
            return self.abort_distributed(gtid, xid, &gid, participants).await;
        }

        if aborted_early.load(Ordering::SeqCst) {
            return self.abort_distributed(gtid, xid, &gid, participants).await;
        }

        let record = self.table.get(xid).ok_or(CoreError::UnknownXid(xid))?;
        if !record.voting_complete {
            return self.abort_distributed(gtid, xid, &gid, participants).await;
        }

        let final_csn = record.csn.max(commit_csn0);
        self.table.update(xid, |r| r.csn = final_csn)?;
        self.table.set_status(xid, TxnStatus::Committed)?;
        for &p in participants {
            self.transport
                .send(
                    p,
                    ArbiterMessage::Commit {
                        gid: gid.clone(),
                        final_csn,
                    },
                )
                .await?;
        }
        self.stats.write().committed += 1;
        if let Err(err) = self.hooks.commit(gtid, final_csn).await {
            warn!(?err, gid, "commit hook failed");
        }
        info!(gid, final_csn, "distributed transaction committed");
        Ok(final_csn)
    }

    /// Waits for voting to complete, the prepare timeout to elapse, or the
    /// arbiter's disabled-mask to change. A mid-vote disablement
    /// re-evaluates `votes_needed` against the currently-disabled
    /// participants so the coordinator does not block for the full timeout
    /// when one drops out (spec §4.4: "does not block... the coordinator
    /// observes the config-change-counter increment and re-evaluates").
    async fn await_votes(
        &self,
        xid: Xid,
        gid: &str,
        participants: &[NodeId],
        notify: Arc<Notify>,
        timeout: Duration,
        mut disabled_rx: Option<watch::Receiver<NodeSet>>,
    ) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);
            let watch_changed = async {
                match disabled_rx.as_mut() {
                    Some(rx) => rx.changed().await,
                    None => std::future::pending().await,
                }
            };
            tokio::select! {
                _ = notify.notified() => return true,
                _ = &mut sleep => return false,
                changed = watch_changed => {
                    match (changed, disabled_rx.as_ref()) {
                        (Ok(()), Some(rx)) => {
                            let disabled = *rx.borrow();
                            if self.reevaluate_quorum(xid, gid, participants, disabled) {
                                return true;
                            }
                        }
                        _ => disabled_rx = None,
                    }
                }
            }
        }
    }

    /// Drops any now-disabled participant from `votes_needed`; returns
    /// `true` if voting is complete as a result.
    fn reevaluate_quorum(&self, xid: Xid, gid: &str, participants: &[NodeId], disabled: NodeSet) -> bool {
        let live = participants.iter().filter(|p| !disabled.contains(**p)).count() as u32;
        let complete = self
            .table
            .update(xid, |r| {
                if live < r.votes_needed {
                    r.votes_needed = live;
                }
                if r.votes_received >= r.votes_needed {
                    r.voting_complete = true;
                }
                r.voting_complete
            })
            .unwrap_or(false);
        if complete {
            info!(gid, live, "quorum re-evaluated after disabled-mask change");
        }
        complete
    }

    async fn abort_distributed(
        &self,
        gtid: Gtid,
        xid: Xid,
        gid: &str,
        participants: &[NodeId],
    ) -> CoreResult<Csn> {
        self.table.set_status(xid, TxnStatus::Aborted)?;
        for &p in participants {
            let _ = self
                .transport
                .send(p, ArbiterMessage::Abort { gid: gid.to_string() })
                .await;
        }
        self.stats.write().aborted += 1;
        if let Err(err) = self.hooks.abort(gtid).await {
            warn!(?err, gid, "abort hook failed");
        }
        Err(CoreError::QuorumLost { gtid })
    }

    /// `max(min_2pc_timeout, (csn0-snapshot)*prepare_ratio/100)` (spec §4.4).
    fn prepare_timeout(&self, snapshot: Csn, commit_csn0: Csn) -> Duration {
        let elapsed = commit_csn0.saturating_sub(snapshot);
        let scaled_us = elapsed.saturating_mul(self.config.prepare_ratio as u64) / 100;
        self.config.min_2pc_timeout.max(Duration::from_micros(scaled_us))
    }

    /// Participant side: handles an inbound PREPARE by assigning a local
    /// CSN, marking the transaction `unknown`, and replying READY.
    pub async fn handle_prepare(&self, from: NodeId, gid: String, gtid: Gtid, commit_csn0: Csn) -> CoreResult<()> {
        self.clock.sync(commit_csn0);
        let participant_csn = self.clock.assign_csn();

        #[cfg(test)]
        if self.injected_fault.read().as_ref() == Some(&InjectedFault::ForceParticipantAbort) {
            self.transport
                .send(from, ArbiterMessage::Aborted { gid })
                .await?;
            if let Err(err) = self.hooks.post_prepare(gtid, false).await {
                warn!(?err, "post_prepare hook failed");
            }
            return Ok(());
        }

        match self.table.get_by_gid(&gid) {
            Some(existing) if existing.status.is_terminal() => {
                // R2: duplicate PREPARE delivery after resolution is a no-op.
                return Ok(());
            }
            Some(_) => {}
            None => {
                let xid = self.next_xid.fetch_add(1, Ordering::SeqCst);
                self.table
                    .insert(TransactionRecord::begin(xid, gtid, commit_csn0))?;
                self.table.assign_gid(xid, gid.clone())?;
            }
        }
        let xid = self
            .table
            .get_by_gid(&gid)
            .ok_or_else(|| CoreError::UnknownGid { gid: gid.clone() })?
            .xid;
        self.table.update(xid, |r| r.csn = participant_csn)?;
        self.table.set_status(xid, TxnStatus::Unknown)?;

        self.transport
            .send(from, ArbiterMessage::Ready { gid, participant_csn })
            .await?;
        if let Err(err) = self.hooks.post_prepare(gtid, true).await {
            warn!(?err, "post_prepare hook failed");
        }
        Ok(())
    }

    /// Coordinator side: records a READY vote and wakes the waiter once
    /// voting completes (spec's quorum rule: every non-disabled node).
    pub fn handle_ready(&self, gid: &str, participant_csn: Csn) {
        let Some(xid) = self.table.get_by_gid(gid).map(|r| r.xid) else {
            return;
        };
        let _ = self.table.update(xid, |r| r.record_vote(participant_csn));
        self.wake_waiter(gid);
    }

    /// Coordinator side: records an early abort vote, waking the waiter
    /// immediately rather than waiting out the full timeout.
    pub fn handle_aborted(&self, gid: &str) {
        if let Some(pending) = self.pending_votes.get(gid) {
            pending.aborted_early.store(true, Ordering::SeqCst);
            pending.notify.notify_one();
        }
    }

    fn wake_waiter(&self, gid: &str) {
        let complete = self
            .table
            .get_by_gid(gid)
            .map(|r| r.voting_complete)
            .unwrap_or(false);
        if complete {
            if let Some(pending) = self.pending_votes.get(gid) {
                pending.notify.notify_one();
            }
        }
    }

    /// Participant side: applies the coordinator's final decision. A
    /// redelivered COMMIT for an already-committed gid is a no-op.
    pub async fn handle_commit(&self, gid: &str, final_csn: Csn) -> CoreResult<()> {
        self.clock.sync(final_csn);
        let record = self
            .table
            .get_by_gid(gid)
            .ok_or_else(|| CoreError::UnknownGid { gid: gid.to_string() })?;
        if record.status.is_terminal() {
            return Ok(());
        }
        self.table.update(record.xid, |r| r.csn = final_csn)?;
        self.table.set_status(record.xid, TxnStatus::Committed)?;
        if let Err(err) = self.hooks.commit(record.gtid, final_csn).await {
            warn!(?err, gid, "commit hook failed");
        }
        Ok(())
    }

    /// Redelivered ABORT for an already-terminal gid is a no-op.
    pub async fn handle_abort(&self, gid: &str) -> CoreResult<()> {
        let record = self
            .table
            .get_by_gid(gid)
            .ok_or_else(|| CoreError::UnknownGid { gid: gid.to_string() })?;
        if record.status.is_terminal() {
            return Ok(());
        }
        self.table.set_status(record.xid, TxnStatus::Aborted)?;
        if let Err(err) = self.hooks.abort(record.gtid).await {
            warn!(?err, gid, "abort hook failed");
        }
        Ok(())
    }

    /// Pulls the next inbound message off the arbiter transport. Exposed so
    /// a caller that also owns other components needing the same message
    /// stream (the arbiter, for `Heartbeat`) can run a single pump loop and
    /// dispatch non-coordinator messages itself before calling
    /// `handle_message` for the rest.
    pub async fn recv_message(&self) -> CoreResult<Option<(NodeId, ArbiterMessage)>> {
        self.transport.recv().await
    }

    /// Dispatches one inbound message to the matching `handle_*` method.
    /// `Heartbeat` is a no-op here; the caller's pump handles it against
    /// the arbiter instead.
    pub async fn handle_message(&self, from: NodeId, message: ArbiterMessage) -> CoreResult<()> {
        match message {
            ArbiterMessage::Prepare { gid, gtid, commit_csn0 } => {
                self.handle_prepare(from, gid, gtid, commit_csn0).await
            }
            ArbiterMessage::Ready { gid, participant_csn } => {
                self.handle_ready(&gid, participant_csn);
                Ok(())
            }
            ArbiterMessage::Aborted { gid } => {
                self.handle_aborted(&gid);
                Ok(())
            }
            ArbiterMessage::Commit { gid, final_csn } => self.handle_commit(&gid, final_csn).await,
            ArbiterMessage::Abort { gid } => self.handle_abort(&gid).await,
            ArbiterMessage::Heartbeat { .. } => Ok(()),
        }
    }

    /// Non-recoverable local error: logs and marks the node out-of-service
    /// per §7 policy; returns the error so the caller can propagate it.
    pub fn fatal(&self, reason: impl Into<String>) -> CoreError {
        let reason = reason.into();
        error!(reason, "non-recoverable local error, node going out-of-service");
        CoreError::NonRecoverable(reason)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hooks::NullHooks;
    use async_trait::async_trait;
    use std::collections::HashMap as StdHashMap;
    use tokio::sync::mpsc;

    struct LoopbackTransport {
        outboxes: StdHashMap<NodeId, mpsc::UnboundedSender<(NodeId, ArbiterMessage)>>,
        from: NodeId,
    }

    #[async_trait]
    impl ArbiterTransport for LoopbackTransport {
        async fn send(&self, to: NodeId, message: ArbiterMessage) -> CoreResult<()> {
            self.outboxes
                .get(&to)
                .expect("peer registered")
                .send((self.from, message))
                .map_err(|_| CoreError::Internal("peer channel closed".into()))
        }

        async fn recv(&self) -> CoreResult<Option<(NodeId, ArbiterMessage)>> {
            unreachable!("test pumps inbound messages directly")
        }
    }

    fn node(n: u8) -> NodeId {
        NodeId::new(n).unwrap()
    }

    fn make_pair() -> (
        Arc<TwoPhaseCommitCoordinator>,
        Arc<TwoPhaseCommitCoordinator>,
        mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)>,
        mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)>,
    ) {
        let (tx1, rx1) = mpsc::unbounded_channel();
        let (tx2, rx2) = mpsc::unbounded_channel();
        let mut boxes1 = StdHashMap::new();
        boxes1.insert(node(2), tx2.clone());
        let mut boxes2 = StdHashMap::new();
        boxes2.insert(node(1), tx1.clone());

        let config = Arc::new(ClusterConfig::default());
        let c1 = Arc::new(TwoPhaseCommitCoordinator::new(
            node(1),
            Arc::new(CsnClock::new()),
            Arc::new(TransactionTable::new()),
            Arc::new(LoopbackTransport { outboxes: boxes1, from: node(1) }),
            config.clone(),
            Arc::new(NullHooks),
        ));
        let c2 = Arc::new(TwoPhaseCommitCoordinator::new(
            node(2),
            Arc::new(CsnClock::new()),
            Arc::new(TransactionTable::new()),
            Arc::new(LoopbackTransport { outboxes: boxes2, from: node(2) }),
            config,
            Arc::new(NullHooks),
        ));
        (c1, c2, rx1, rx2)
    }

    /// Spawns a pump that feeds every message arriving on `rx` into the
    /// owning coordinator's `handle_*` callbacks, as `NodeContext` would.
    fn spawn_pump(
        coordinator: Arc<TwoPhaseCommitCoordinator>,
        mut rx: mpsc::UnboundedReceiver<(NodeId, ArbiterMessage)>,
    ) {
        tokio::spawn(async move {
            while let Some((from, message)) = rx.recv().await {
                match message {
                    ArbiterMessage::Prepare { gid, gtid, commit_csn0 } => {
                        let _ = coordinator.handle_prepare(from, gid, gtid, commit_csn0).await;
                    }
                    ArbiterMessage::Ready { gid, participant_csn } => {
                        coordinator.handle_ready(&gid, participant_csn);
                    }
                    ArbiterMessage::Aborted { gid } => coordinator.handle_aborted(&gid),
                    ArbiterMessage::Commit { gid, final_csn } => {
                        let _ = coordinator.handle_commit(&gid, final_csn).await;
                    }
                    ArbiterMessage::Abort { gid } => {
                        let _ = coordinator.handle_abort(&gid).await;
                    }
                    ArbiterMessage::Heartbeat { .. } => {}
                }
            }
        });
    }

    #[tokio::test]
    async fn local_only_transaction_commits_without_participants() {
        let (c1, _c2, _rx1, _rx2) = make_pair();
        let (xid, _snapshot) = c1.begin().await;
        let csn = c1.commit(xid, &[], true).await.unwrap();
        assert!(csn > 0);
        assert_eq!(c1.table.get(xid).unwrap().status, TxnStatus::Committed);
    }

    #[tokio::test]
    async fn two_node_prepare_commits_on_both_sides() {
        let (c1, c2, rx1, rx2) = make_pair();
        spawn_pump(c1.clone(), rx1);
        spawn_pump(c2.clone(), rx2);

        let (xid, _snapshot) = c1.begin().await;
        let final_csn = c1.commit(xid, &[node(2)], false).await.unwrap();

        assert_eq!(c1.table.get(xid).unwrap().status, TxnStatus::Committed);
        assert_eq!(c1.table.get(xid).unwrap().csn, final_csn);

        // give the async pump a moment to apply the COMMIT on node 2
        tokio::time::sleep(Duration::from_millis(20)).await;
        let p2_record = c2
            .table
            .get_by_gid(&format!("1_{xid}"))
            .expect("participant applied PREPARE");
        assert_eq!(p2_record.status, TxnStatus::Committed);
        assert_eq!(p2_record.csn, final_csn);
    }

    #[tokio::test]
    async fn participant_abort_vote_aborts_coordinator_side() {
        let (c1, c2, rx1, rx2) = make_pair();
        spawn_pump(c1.clone(), rx1);
        spawn_pump(c2.clone(), rx2);
        c2.inject_fault(Some(InjectedFault::ForceParticipantAbort));

        let (xid, _snapshot) = c1.begin().await;
        let result = c1.commit(xid, &[node(2)], false).await;
        assert!(result.is_err());
        assert_eq!(c1.table.get(xid).unwrap().status, TxnStatus::Aborted);
    }
}
