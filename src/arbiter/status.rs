use serde::{Deserialize, Serialize};

/// Cluster-wide shared state's `status` field (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterStatus {
    Initializing,
    Offline,
    Connected,
    Online,
    Recovery,
    InMinority,
    OutOfService,
}

impl ClusterStatus {
    /// New distributed commits are refused outside these statuses (spec
    /// §4.5: "Losing majority -> in-minority; all new distributed commits
    /// are refused").
    pub fn accepts_distributed_commits(self) -> bool {
        matches!(self, ClusterStatus::Online | ClusterStatus::Connected)
    }
}
