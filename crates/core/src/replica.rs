//! Cache replica lifecycle.
//!
//! A cache replica is one file at one storage location, shared by every
//! task that asks for it. Its status follows a linear staging pipeline
//! with two terminal exits:
//!
//! ```text
//! New -> Waiting -> StageSubmitted -> Staged -> Pinned
//!   \________\____________\______________\
//!                                          -> Failed | Cancelled
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identifier assigned to a cache replica by the metadata store.
pub type ReplicaId = i64;

/// Purpose tag given to replicas created by stage requests.
pub const DEFAULT_REPLICA_TYPE: &str = "Stage";

/// Cache replica status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaStatus {
    /// Requested, physical location not yet resolved.
    New,
    /// Resolved (PFN and size known), waiting to be submitted for staging.
    Waiting,
    /// A stage request has been issued to the storage backend.
    StageSubmitted,
    /// The backend reports the file is on fast storage.
    Staged,
    /// The staged file is pinned.
    Pinned,
    /// Terminal: staging failed, see the replica's reason.
    Failed,
    /// Terminal: cancelled out of band.
    Cancelled,
}

impl ReplicaStatus {
    pub const ALL: [ReplicaStatus; 7] = [
        Self::New,
        Self::Waiting,
        Self::StageSubmitted,
        Self::Staged,
        Self::Pinned,
        Self::Failed,
        Self::Cancelled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::New => "New",
            Self::Waiting => "Waiting",
            Self::StageSubmitted => "StageSubmitted",
            Self::Staged => "Staged",
            Self::Pinned => "Pinned",
            Self::Failed => "Failed",
            Self::Cancelled => "Cancelled",
        }
    }

    /// Check if the replica reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Failed | Self::Cancelled)
    }

    /// Statuses that block a task from being submitted for staging.
    pub fn blocks_submission(&self) -> bool {
        matches!(self, Self::New | Self::Failed)
    }

    /// Statuses for which a stage request may be recorded.
    pub fn accepts_stage_request(&self) -> bool {
        matches!(self, Self::Waiting | Self::StageSubmitted)
    }

    /// Whether a replica in this status holds (or is about to hold) a pin
    /// slot at its storage location.
    pub fn counts_against_pin_quota(&self) -> bool {
        !matches!(self, Self::New | Self::Waiting | Self::Failed)
    }

    /// Check whether `self -> to` is a legal transition.
    ///
    /// `Waiting -> Waiting` is accepted so that a late re-resolution may
    /// refresh the physical location and size before submission.
    pub fn can_transition_to(&self, to: ReplicaStatus) -> bool {
        use ReplicaStatus::*;
        match (self, to) {
            (New, Waiting) | (Waiting, Waiting) => true,
            (Waiting, StageSubmitted) => true,
            (StageSubmitted, Staged) => true,
            (Staged, Pinned) => true,
            (New | Waiting | StageSubmitted | Staged, Failed | Cancelled) => true,
            _ => false,
        }
    }

    /// Statuses from which a replica may legally move to `to`.
    pub fn predecessors(to: ReplicaStatus) -> Vec<ReplicaStatus> {
        Self::ALL
            .into_iter()
            .filter(|from| from.can_transition_to(to))
            .collect()
    }
}

impl fmt::Display for ReplicaStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReplicaStatus {
    type Err = crate::Error;

    fn from_str(s: &str) -> crate::Result<Self> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| crate::Error::UnknownReplicaStatus(s.to_string()))
    }
}

/// Whether a resolved replica was already cached or created by the
/// resolving call.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReplicaOrigin {
    Existing,
    New,
}

impl ReplicaOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Existing => "Existing",
            Self::New => "New",
        }
    }
}

impl fmt::Display for ReplicaOrigin {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
