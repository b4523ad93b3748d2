//! Storage module for persisting crawl state
//!
//! This module handles all database operations for the crawler, including:
//! - SQLite database initialization and schema management
//! - Per-URL record persistence, keyed by normalized URL
//! - Run tracking and aggregate counts

mod schema;
mod sqlite;
mod traits;

pub use sqlite::SqliteStorage;
pub use traits::{Storage, StorageError, StorageResult};

use crate::crawler::StrategyKind;
use crate::state::UrlStatus;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};

/// Storage handle shared between the tracker, orchestrator and statistics
pub type SharedStorage = Arc<Mutex<dyn Storage + Send>>;

/// Opens (or creates) the database at `path` as a shared handle
///
/// # Arguments
///
/// * `path` - Path to the SQLite database file
///
/// # Returns
///
/// * `Ok(SharedStorage)` - Successfully opened storage
/// * `Err(PulseError)` - Failed to open or initialize the database
pub fn open_storage(path: &Path) -> crate::Result<SharedStorage> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }
    Ok(Arc::new(Mutex::new(SqliteStorage::new(path)?)))
}

/// Formats a timestamp so lexical order matches chronological order
pub fn to_db_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Parses a timestamp written by [`to_db_timestamp`]
pub fn from_db_timestamp(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|ts| ts.with_timezone(&Utc))
}

/// Persistent crawl state of one normalized URL
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UrlRecord {
    pub url: String,
    pub domain: String,
    pub status: UrlStatus,
    pub last_crawled_at: Option<DateTime<Utc>>,
    pub next_eligible_at: DateTime<Utc>,
    pub last_strategy: Option<StrategyKind>,
    pub content_fingerprint: Option<String>,
    /// Consecutive non-success crawls
    pub retry_count: u32,
    /// Lifetime crawl attempts
    pub crawl_count: u32,
    pub last_error: Option<String>,
    /// Caller-supplied correlation fields, passed through unmodified
    pub metadata: Map<String, Value>,
    pub created_at: DateTime<Utc>,
}

impl UrlRecord {
    /// A freshly submitted URL, due immediately
    pub fn new(
        url: impl Into<String>,
        domain: impl Into<String>,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            url: url.into(),
            domain: domain.into(),
            status: UrlStatus::Pending,
            last_crawled_at: None,
            next_eligible_at: now,
            last_strategy: None,
            content_fingerprint: None,
            retry_count: 0,
            crawl_count: 0,
            last_error: None,
            metadata,
            created_at: now,
        }
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_eligible_at <= now
    }
}

/// Represents a crawl run
#[derive(Debug, Clone)]
pub struct RunRecord {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub config_hash: String,
    pub status: RunStatus,
    pub counts: RunCounts,
}

/// Per-run outcome tallies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunCounts {
    /// URLs selected as due
    pub total: u32,
    pub successful: u32,
    /// Successful crawls whose content changed and was forwarded
    pub changed: u32,
    pub unchanged: u32,
    pub failed: u32,
    pub blocked: u32,
    pub rate_limited: u32,
    /// Due URLs not crawled (already in flight or stopped before starting)
    pub skipped: u32,
}

impl RunCounts {
    /// Tallies one terminal URL outcome
    pub fn record(&mut self, status: UrlStatus) {
        match status {
            UrlStatus::Success => self.successful += 1,
            UrlStatus::Failed => self.failed += 1,
            UrlStatus::Blocked => self.blocked += 1,
            UrlStatus::RateLimited => self.rate_limited += 1,
            UrlStatus::Pending => self.skipped += 1,
        }
    }
}

/// Status of a crawl run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunStatus {
    Running,
    Completed,
    Interrupted,
    Failed,
}

impl RunStatus {
    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Interrupted => "interrupted",
            Self::Failed => "failed",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "running" => Some(Self::Running),
            "completed" => Some(Self::Completed),
            "interrupted" => Some(Self::Interrupted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}
