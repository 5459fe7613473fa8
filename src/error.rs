//! Core error types.
//!
//! This module provides structured error handling for the distributed
//! commit and cluster-membership core using `thiserror` for ergonomic
//! error definitions.
//!
//! # Error Categories
//!
//! - **Network errors**: transient disconnects, watchdog-observed timeouts
//! - **Commit errors**: quorum loss, prepare timeout, apply conflicts
//! - **Node errors**: non-recoverable local failures, unsupported isolation
//! - **Visibility errors**: in-doubt wait exhaustion
//! - **Recovery errors**: donor/slot failures

use thiserror::Error;

use crate::common::{Gtid, NodeId};

/// Result type alias for core operations.
pub type CoreResult<T> = std::result::Result<T, CoreError>;

/// Comprehensive error type for the distributed commit core.
///
/// Each variant captures the context (GTID, node, reason) needed by the
/// caller to decide whether to retry, surface to the user, or transition
/// the node to `out-of-service`.
#[derive(Debug, Error)]
pub enum CoreError {
    // =========================================================================
    // Network / arbiter channel errors
    // =========================================================================
    /// Transient network error talking to a participant; the coordinator
    /// treats the participant as "no vote yet" until the watchdog disables it.
    #[error("transient network error reaching {node}: {reason}")]
    TransientNetwork { node: NodeId, reason: String },

    /// Quorum changed out from under an in-flight commit.
    #[error("quorum lost for transaction {gtid}: cluster configuration changed during commit")]
    QuorumLost { gtid: Gtid },

    // =========================================================================
    // Two-phase commit errors
    // =========================================================================
    /// The PREPARE quorum was not reached within the per-transaction timeout.
    #[error("prepare timeout for transaction {gtid} after {elapsed_ms}ms")]
    PrepareTimeout { gtid: Gtid, elapsed_ms: u64 },

    /// A participant could not apply the transaction's row changes.
    #[error("apply conflict for transaction {gtid} on {node}: {reason}")]
    ApplyConflict {
        gtid: Gtid,
        node: NodeId,
        reason: String,
    },

    /// A participant voted ABORTED during PREPARE.
    #[error("participant {node} voted to abort transaction {gtid}")]
    ParticipantAborted { gtid: Gtid, node: NodeId },

    /// Operation referenced a GID with no matching transaction state.
    #[error("no transaction found for gid '{gid}'")]
    UnknownGid { gid: String },

    /// Operation referenced an XID with no matching transaction state.
    #[error("transaction {0} not found")]
    UnknownXid(crate::common::Xid),

    /// Invalid state transition attempted on a transaction.
    #[error("invalid state transition for transaction {gtid}: {from} -> {to}")]
    InvalidStateTransition {
        gtid: Gtid,
        from: &'static str,
        to: &'static str,
    },

    // =========================================================================
    // Node / cluster errors
    // =========================================================================
    /// Node hit a non-recoverable local error (I/O, corruption, OOM) and must
    /// mark itself out-of-service.
    #[error("non-recoverable local error, node going out-of-service: {0}")]
    NonRecoverable(String),

    /// The local node currently belongs to the minority side of a clique
    /// split and refuses new distributed commits.
    #[error("node is in minority, cannot start distributed commit")]
    InMinority,

    /// BEGIN requested an isolation level the distributed path cannot honor.
    #[error("unsupported isolation level for distributed transaction: {0}")]
    UnsupportedIsolationLevel(String),

    // =========================================================================
    // Visibility errors
    // =========================================================================
    /// The in-doubt wait in the visibility check exceeded its retry cap.
    #[error("failed to get status of xid {0}: in-doubt wait exhausted retries")]
    VisibilityExhausted(crate::common::Xid),

    // =========================================================================
    // Recovery errors
    // =========================================================================
    /// The recovery slot's lag exceeded the configured maximum and was dropped.
    #[error("recovery slot to donor {donor} dropped: lag exceeded max-recovery-lag")]
    RecoverySlotDropped { donor: NodeId },

    /// No reachable donor was available to start recovery.
    #[error("no donor available for recovery")]
    NoDonorAvailable,

    // =========================================================================
    // Shared config store / serialization errors
    // =========================================================================
    /// The shared config store rejected or failed a put/get.
    #[error("shared config store error on key '{key}': {reason}")]
    ConfigStore { key: String, reason: String },

    /// Serialization error encoding a wire message or config-store value.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization error decoding a wire message or config-store value.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// I/O failure underneath the replication transport.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error (should not occur in normal operation).
    #[error("internal error: {0}")]
    Internal(String),
}

impl CoreError {
    pub fn transient_network(node: NodeId, reason: impl Into<String>) -> Self {
        CoreError::TransientNetwork {
            node,
            reason: reason.into(),
        }
    }

    pub fn apply_conflict(gtid: Gtid, node: NodeId, reason: impl Into<String>) -> Self {
        CoreError::ApplyConflict {
            gtid,
            node,
            reason: reason.into(),
        }
    }

    pub fn invalid_state_transition(gtid: Gtid, from: &'static str, to: &'static str) -> Self {
        CoreError::InvalidStateTransition { gtid, from, to }
    }

    pub fn config_store(key: impl Into<String>, reason: impl Into<String>) -> Self {
        CoreError::ConfigStore {
            key: key.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the caller should retry the operation rather than
    /// surface the error, per the §7 policy ("GC errors and watchdog
    /// misfires are logged at warning level and retried").
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            CoreError::TransientNetwork { .. } | CoreError::ConfigStore { .. }
        )
    }

    /// Returns the GTID this error is associated with, if any.
    pub fn gtid(&self) -> Option<Gtid> {
        match self {
            CoreError::QuorumLost { gtid }
            | CoreError::PrepareTimeout { gtid, .. }
            | CoreError::ApplyConflict { gtid, .. }
            | CoreError::ParticipantAborted { gtid, .. }
            | CoreError::InvalidStateTransition { gtid, .. } => Some(*gtid),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for CoreError {
    fn from(err: serde_json::Error) -> Self {
        CoreError::Serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retriable_classification() {
        let n = NodeId::new(1).unwrap();
        assert!(CoreError::transient_network(n, "timeout").is_retriable());
        assert!(!CoreError::InMinority.is_retriable());
    }

    #[test]
    fn gtid_extraction() {
        let n = NodeId::new(2).unwrap();
        let g = Gtid::new(n, 7);
        let err = CoreError::QuorumLost { gtid: g };
        assert_eq!(err.gtid(), Some(g));
        assert!(CoreError::InMinority.gtid().is_none());
    }

    #[test]
    fn display_messages() {
        let n = NodeId::new(3).unwrap();
        let g = Gtid::new(n, 10);
        let err = CoreError::PrepareTimeout {
            gtid: g,
            elapsed_ms: 500,
        };
        assert!(err.to_string().contains("node3:10"));
    }
}
