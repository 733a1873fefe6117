//! Domain models for the release ledger and scheduler.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle state of one release record.
///
/// Transitions are monotonic: `Queued -> Running -> {Success, Failed,
/// Timeout}`. Terminal states never regress.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ReleaseState {
    Queued,
    Running,
    Success,
    Failed,
    Timeout,
}

impl ReleaseState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseState::Queued => "queued",
            ReleaseState::Running => "running",
            ReleaseState::Success => "success",
            ReleaseState::Failed => "failed",
            ReleaseState::Timeout => "timeout",
        }
    }

    pub fn parse(value: &str) -> ReleaseState {
        match value {
            "running" => ReleaseState::Running,
            "success" => ReleaseState::Success,
            "failed" => ReleaseState::Failed,
            "timeout" => ReleaseState::Timeout,
            _ => ReleaseState::Queued,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ReleaseState::Success | ReleaseState::Failed | ReleaseState::Timeout
        )
    }
}

impl std::fmt::Display for ReleaseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One ledger row: a commit SHA and everything known about its release.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReleaseRecord {
    pub commit_sha: String,
    pub state: ReleaseState,
    pub priority: i32,
    pub queued_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ended_at: Option<DateTime<Utc>>,
}

/// Queue snapshot entry, in scheduling order.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueEntry {
    pub commit_sha: String,
    pub queued_at: DateTime<Utc>,
    pub priority: i32,
}

/// Per-state aggregate for the metrics window.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateMetrics {
    pub state: ReleaseState,
    pub count: i64,
    pub avg_duration_minutes: Option<f64>,
}

/// Result of an atomic claim for a commit SHA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// No release was running; the record was created directly in `running`.
    Started,
    /// A release was running; the record was created in `queued`.
    Queued,
    /// A record for this commit already exists; no new work was created.
    AlreadyTracked(ReleaseState),
}

/// Result of a cancellation request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    NotFound,
    /// The record exists but is not `queued`; reports its actual state.
    Conflict(ReleaseState),
}

/// A commit SHA is 7 to 40 hex characters, case-insensitive.
pub fn is_valid_commit_sha(sha: &str) -> bool {
    (7..=40).contains(&sha.len()) && sha.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn state_round_trips_through_strings() {
        for state in [
            ReleaseState::Queued,
            ReleaseState::Running,
            ReleaseState::Success,
            ReleaseState::Failed,
            ReleaseState::Timeout,
        ] {
            assert_eq!(ReleaseState::parse(state.as_str()), state);
        }
        assert_eq!(ReleaseState::parse("garbage"), ReleaseState::Queued);
    }

    #[test]
    fn terminal_states_are_terminal() {
        assert!(!ReleaseState::Queued.is_terminal());
        assert!(!ReleaseState::Running.is_terminal());
        assert!(ReleaseState::Success.is_terminal());
        assert!(ReleaseState::Failed.is_terminal());
        assert!(ReleaseState::Timeout.is_terminal());
    }

    #[test]
    fn commit_sha_validation() {
        assert!(is_valid_commit_sha("6765f2fd3380e0c2e24c5255d96250df8d0b713d"));
        assert!(is_valid_commit_sha("abc1234"));
        assert!(is_valid_commit_sha("ABC1234"));
        assert!(!is_valid_commit_sha("xyz1234"));
        assert!(!is_valid_commit_sha("abc123"));
        assert!(!is_valid_commit_sha(""));
        assert!(!is_valid_commit_sha(
            "6765f2fd3380e0c2e24c5255d96250df8d0b713d0"
        ));
    }
}
