use crate::config::TrackerConfig;
use crate::state::UrlStatus;
use chrono::{DateTime, Duration, Utc};

/// Minimum wait before a URL is eligible again, by last outcome
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CooldownPolicy {
    pub success: Duration,
    pub failed: Duration,
    pub blocked: Duration,
    pub rate_limited: Duration,
}

impl CooldownPolicy {
    pub fn from_config(config: &TrackerConfig) -> Self {
        Self {
            success: Duration::days(config.recrawl_interval_days as i64),
            failed: Duration::days(config.failed_cooldown_days as i64),
            blocked: Duration::days(config.blocked_cooldown_days as i64),
            rate_limited: Duration::days(config.rate_limited_cooldown_days as i64),
        }
    }

    /// Cool-down for a status; Pending records are eligible immediately
    pub fn cooldown_for(&self, status: UrlStatus) -> Duration {
        match status {
            UrlStatus::Pending => Duration::zero(),
            UrlStatus::Success => self.success,
            UrlStatus::Failed => self.failed,
            UrlStatus::Blocked => self.blocked,
            UrlStatus::RateLimited => self.rate_limited,
        }
    }

    /// When a URL crawled at `crawled_at` with outcome `status` is next due
    ///
    /// Saturates at the latest representable instant instead of overflowing.
    pub fn next_eligible(&self, status: UrlStatus, crawled_at: DateTime<Utc>) -> DateTime<Utc> {
        crawled_at
            .checked_add_signed(self.cooldown_for(status))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for CooldownPolicy {
    fn default() -> Self {
        Self::from_config(&TrackerConfig::default())
    }
}
