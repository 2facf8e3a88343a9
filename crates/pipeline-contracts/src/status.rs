//! Node execution status and its transition graph
//!
//! ```text
//! QUEUED -> RUNNING -> { SUCCEEDED, FAILED, ABORTED, EXPIRED, SKIPPED, ERRORED, IGNORE_FAILED }
//!                   |  ASYNC_WAITING | TASK_WAITING | INTERVENTION_WAITING | DISCONTINUING
//! ```
//!
//! Final statuses accept no further transition. Callers treat a rejected
//! transition as an idempotent no-op.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::ContractError;

/// Status of a node or plan execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Queued,
    Running,
    /// Waiting on a child, a barrier or another asynchronous callback
    AsyncWaiting,
    /// Waiting on an external delegate task
    TaskWaiting,
    /// Parked by the manual intervention adviser
    InterventionWaiting,
    Paused,
    /// Abort requested while the node was running
    Discontinuing,
    Succeeded,
    Failed,
    Aborted,
    Expired,
    Skipped,
    Errored,
    IgnoreFailed,
}

impl Status {
    pub const ALL: [Status; 14] = [
        Status::Queued,
        Status::Running,
        Status::AsyncWaiting,
        Status::TaskWaiting,
        Status::InterventionWaiting,
        Status::Paused,
        Status::Discontinuing,
        Status::Succeeded,
        Status::Failed,
        Status::Aborted,
        Status::Expired,
        Status::Skipped,
        Status::Errored,
        Status::IgnoreFailed,
    ];

    /// Terminal statuses. A node in one of these never changes again.
    pub fn is_final(self) -> bool {
        matches!(
            self,
            Status::Succeeded
                | Status::Failed
                | Status::Aborted
                | Status::Expired
                | Status::Skipped
                | Status::Errored
                | Status::IgnoreFailed
        )
    }

    /// Statuses that count as a broken execution for advisers and aggregators.
    pub fn is_broke(self) -> bool {
        matches!(
            self,
            Status::Failed | Status::Errored | Status::Aborted | Status::Expired
        )
    }

    /// Terminal statuses that let the pipeline continue normally.
    pub fn is_positive(self) -> bool {
        matches!(
            self,
            Status::Succeeded | Status::Skipped | Status::IgnoreFailed
        )
    }

    /// Statuses an abort may act on directly, without waiting for the step.
    pub fn is_suspended(self) -> bool {
        matches!(
            self,
            Status::Queued
                | Status::AsyncWaiting
                | Status::TaskWaiting
                | Status::InterventionWaiting
                | Status::Paused
        )
    }

    /// Statuses where work is actively progressing.
    pub fn is_flowing(self) -> bool {
        matches!(
            self,
            Status::Running | Status::AsyncWaiting | Status::TaskWaiting | Status::Discontinuing
        )
    }

    pub fn can_transition_to(self, to: Status) -> bool {
        if self.is_final() || self == to {
            return false;
        }
        match self {
            Status::Queued => matches!(
                to,
                Status::Running
                    | Status::Paused
                    | Status::Discontinuing
                    | Status::Aborted
                    | Status::Skipped
                    | Status::Expired
                    | Status::Errored
            ),
            Status::Running
            | Status::AsyncWaiting
            | Status::TaskWaiting
            | Status::InterventionWaiting => to != Status::Queued,
            Status::Paused => true,
            Status::Discontinuing => to.is_final(),
            _ => false,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Status::Queued => "QUEUED",
            Status::Running => "RUNNING",
            Status::AsyncWaiting => "ASYNC_WAITING",
            Status::TaskWaiting => "TASK_WAITING",
            Status::InterventionWaiting => "INTERVENTION_WAITING",
            Status::Paused => "PAUSED",
            Status::Discontinuing => "DISCONTINUING",
            Status::Succeeded => "SUCCEEDED",
            Status::Failed => "FAILED",
            Status::Aborted => "ABORTED",
            Status::Expired => "EXPIRED",
            Status::Skipped => "SKIPPED",
            Status::Errored => "ERRORED",
            Status::IgnoreFailed => "IGNORE_FAILED",
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = ContractError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Status::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| ContractError::unknown("status", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_final_statuses_reject_every_transition() {
        for from in Status::ALL.into_iter().filter(|s| s.is_final()) {
            for to in Status::ALL {
                assert!(!from.can_transition_to(to), "{} -> {}", from, to);
            }
        }
    }

    #[test]
    fn test_happy_path_transitions() {
        assert!(Status::Queued.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::AsyncWaiting));
        assert!(Status::AsyncWaiting.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::InterventionWaiting));
        assert!(Status::InterventionWaiting.can_transition_to(Status::Succeeded));
        assert!(Status::Running.can_transition_to(Status::Discontinuing));
        assert!(Status::Discontinuing.can_transition_to(Status::Aborted));
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(!Status::Queued.can_transition_to(Status::Succeeded));
        assert!(!Status::Running.can_transition_to(Status::Queued));
        assert!(!Status::Discontinuing.can_transition_to(Status::Running));
        assert!(!Status::Running.can_transition_to(Status::Running));
    }

    #[test]
    fn test_broke_family() {
        assert!(Status::Failed.is_broke());
        assert!(Status::Aborted.is_broke());
        assert!(Status::Expired.is_broke());
        assert!(!Status::Succeeded.is_broke());
        assert!(!Status::IgnoreFailed.is_broke());
    }

    #[test]
    fn test_parse_and_serde_agree() {
        for status in Status::ALL {
            let parsed: Status = status.as_str().parse().unwrap();
            assert_eq!(parsed, status);
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("HALF_DONE".parse::<Status>().is_err());
    }
}
