//! Storage traits and error types
//!
//! This module defines the trait interface for storage backends and
//! associated error types.

use crate::crawler::StrategyKind;
use crate::state::UrlStatus;
use crate::storage::{RunCounts, RunRecord, RunStatus, UrlRecord};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("URL not found: {0}")]
    UrlNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(i64),

    #[error("Invalid state transition: {from} -> {to}")]
    InvalidTransition { from: UrlStatus, to: UrlStatus },

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Storage lock poisoned")]
    LockPoisoned,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

/// Result type for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Trait for storage backend implementations
///
/// This is the single source of truth for URL state. Every read that decides
/// whether a URL is due goes through here, never through a cached copy.
pub trait Storage {
    // ===== Run Management =====

    /// Creates a new crawl run
    ///
    /// # Arguments
    ///
    /// * `config_hash` - Hash of the configuration file
    /// * `started_at` - Run start time
    ///
    /// # Returns
    ///
    /// The ID of the newly created run
    fn create_run(&mut self, config_hash: &str, started_at: DateTime<Utc>) -> StorageResult<i64>;

    /// Marks a run finished with its final status and tallies
    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        counts: &RunCounts,
        finished_at: DateTime<Utc>,
    ) -> StorageResult<()>;

    /// Gets a run by ID
    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord>;

    /// Gets the most recent run
    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>>;

    // ===== URL Records =====

    /// Inserts a record unless one already exists for its URL
    ///
    /// # Returns
    ///
    /// `true` if the record was inserted, `false` if the URL was already tracked
    fn insert_url(&mut self, record: &UrlRecord) -> StorageResult<bool>;

    /// Gets a record by normalized URL
    fn get_url(&self, url: &str) -> StorageResult<Option<UrlRecord>>;

    /// Overwrites the mutable fields of an existing record
    fn update_url(&mut self, record: &UrlRecord) -> StorageResult<()>;

    /// Deletes a record, returning whether it existed
    fn delete_url(&mut self, url: &str) -> StorageResult<bool>;

    /// Records whose `next_eligible_at` is at or before `now`, oldest first
    fn due_urls(&self, now: DateTime<Utc>) -> StorageResult<Vec<UrlRecord>>;

    /// Every tracked record, ordered by URL
    fn list_urls(&self) -> StorageResult<Vec<UrlRecord>>;

    // ===== Statistics =====

    /// Gets total record count
    fn count_total_urls(&self) -> StorageResult<u64>;

    /// Record counts per status
    fn count_by_status(&self) -> StorageResult<HashMap<UrlStatus, u64>>;

    /// Record counts per domain, largest first
    fn count_by_domain(&self) -> StorageResult<Vec<(String, u64)>>;

    /// Counts of successful records per winning strategy
    fn count_by_strategy(&self) -> StorageResult<HashMap<StrategyKind, u64>>;

    /// Number of records due at `now`, optionally restricted to one status
    fn count_due(&self, now: DateTime<Utc>, status: Option<UrlStatus>) -> StorageResult<u64>;
}
