/// URL status definitions for the re-crawl state machine
///
/// Every record holds exactly one status. A crawl claims a due record by
/// moving it to `Pending`, and the outcome moves it to one of the terminal
/// states, where it waits out its cool-down.
use serde::{Deserialize, Serialize};
use std::fmt;

/// Represents the current crawl status of a tracked URL
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UrlStatus {
    // ===== Active State =====
    /// Never crawled, or claimed by a crawl that has not finished
    Pending,

    // ===== Terminal States =====
    /// Content was retrieved and extracted
    Success,

    /// Not found, every strategy errored out, or the content was unusable
    Failed,

    /// Every strategy was refused, at least one explicitly
    Blocked,

    /// Throttling persisted through every strategy
    RateLimited,
}

impl UrlStatus {
    /// Returns true if this is a terminal state
    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::Pending)
    }

    /// Returns true if this represents an unsuccessful outcome
    pub fn is_error(&self) -> bool {
        matches!(self, Self::Failed | Self::Blocked | Self::RateLimited)
    }

    /// Whether the state machine allows moving from `self` to `next`
    ///
    /// Pending resolves to any terminal state. Terminal states only return to
    /// Pending. Re-claiming a Pending record (e.g. after a crash mid-crawl) is
    /// allowed.
    pub fn can_transition_to(&self, next: UrlStatus) -> bool {
        match self {
            Self::Pending => true,
            _ => next == Self::Pending,
        }
    }

    /// Converts the status to a database string representation
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Success => "success",
            Self::Failed => "failed",
            Self::Blocked => "blocked",
            Self::RateLimited => "rate_limited",
        }
    }

    /// Parses a status from a database string representation
    ///
    /// Returns None if the string doesn't match any known status.
    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "failed" => Some(Self::Failed),
            "blocked" => Some(Self::Blocked),
            "rate_limited" => Some(Self::RateLimited),
            _ => None,
        }
    }

    /// Returns all possible statuses
    pub fn all() -> [Self; 5] {
        [
            Self::Pending,
            Self::Success,
            Self::Failed,
            Self::Blocked,
            Self::RateLimited,
        ]
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_db_string())
    }
}
