//! Run status values and the transitions between them.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Pending,
    Running,
    Paused,
    Complete,
    Failed,
    Cancelled,
    FailedRetried,
}

impl Status {
    pub const ALL: [Status; 7] = [
        Status::Pending,
        Status::Running,
        Status::Paused,
        Status::Complete,
        Status::Failed,
        Status::Cancelled,
        Status::FailedRetried,
    ];

    /// Marker name as stored under `status/`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Complete => "complete",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
            Self::FailedRetried => "failed_retried",
        }
    }

    /// No further transitions except a retry of a failure.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Complete | Self::Failed | Self::Cancelled | Self::FailedRetried
        )
    }

    /// Pending, running or paused.
    pub fn is_outstanding(&self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }

    pub fn can_transition_to(&self, next: Status) -> bool {
        use Status::*;
        matches!(
            (self, next),
            (Pending, Running | Cancelled)
                | (Running, Complete | Failed | Paused | Cancelled | Pending)
                | (Paused, Running | Pending | Cancelled)
                | (Failed, FailedRetried)
        )
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Status {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("Unknown status '{}'", s))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn marker_names_round_trip() {
        for status in Status::ALL {
            let parsed: Status = status.as_str().parse().expect("parse should succeed");
            assert_eq!(parsed, status);
            let json = serde_json::to_string(&status).expect("serialize should succeed");
            assert_eq!(json, format!("\"{}\"", status.as_str()));
        }
        assert!("done".parse::<Status>().is_err());
    }

    #[test]
    fn transitions() {
        assert!(Status::Pending.can_transition_to(Status::Running));
        assert!(Status::Running.can_transition_to(Status::Paused));
        assert!(Status::Paused.can_transition_to(Status::Pending));
        assert!(Status::Failed.can_transition_to(Status::FailedRetried));
        assert!(!Status::Complete.can_transition_to(Status::Running));
        assert!(!Status::Pending.can_transition_to(Status::Complete));
        assert!(!Status::FailedRetried.can_transition_to(Status::Pending));
    }
}
