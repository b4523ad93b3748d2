//! SQLite storage implementation
//!
//! This module provides a SQLite-based implementation of the Storage trait.

use crate::crawler::StrategyKind;
use crate::state::UrlStatus;
use crate::storage::schema::initialize_schema;
use crate::storage::traits::{Storage, StorageError, StorageResult};
use crate::storage::{
    from_db_timestamp, to_db_timestamp, RunCounts, RunRecord, RunStatus, UrlRecord,
};
use crate::PulseError;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::HashMap;
use std::path::Path;

const URL_COLUMNS: &str = "url, domain, status, last_crawled_at, next_eligible_at, last_strategy,
     content_fingerprint, retry_count, crawl_count, last_error, metadata, created_at";

const RUN_COLUMNS: &str = "id, started_at, finished_at, config_hash, status, total, successful,
     changed, unchanged, failed, blocked, rate_limited, skipped";

/// SQLite storage backend
pub struct SqliteStorage {
    conn: Connection,
}

impl SqliteStorage {
    /// Creates a new SqliteStorage instance
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the SQLite database file
    ///
    /// # Returns
    ///
    /// * `Ok(SqliteStorage)` - Successfully opened/created database
    /// * `Err(PulseError)` - Failed to open database
    pub fn new(path: &Path) -> Result<Self, PulseError> {
        let conn = Connection::open(path)?;

        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;
            PRAGMA busy_timeout = 5000;
        ",
        )?;

        initialize_schema(&conn)?;

        Ok(Self { conn })
    }

    /// Creates an in-memory database
    pub fn open_in_memory() -> Result<Self, PulseError> {
        let conn = Connection::open_in_memory()?;
        initialize_schema(&conn)?;
        Ok(Self { conn })
    }
}

fn conversion_error(idx: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, message.into())
}

fn timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    from_db_timestamp(&raw).ok_or_else(|| conversion_error(idx, format!("bad timestamp '{}'", raw)))
}

fn optional_timestamp_at(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        Some(raw) => from_db_timestamp(&raw)
            .map(Some)
            .ok_or_else(|| conversion_error(idx, format!("bad timestamp '{}'", raw))),
        None => Ok(None),
    }
}

fn url_from_row(row: &Row<'_>) -> rusqlite::Result<UrlRecord> {
    let metadata: String = row.get(10)?;

    Ok(UrlRecord {
        url: row.get(0)?,
        domain: row.get(1)?,
        status: UrlStatus::from_db_string(&row.get::<_, String>(2)?).unwrap_or(UrlStatus::Failed),
        last_crawled_at: optional_timestamp_at(row, 3)?,
        next_eligible_at: timestamp_at(row, 4)?,
        last_strategy: row
            .get::<_, Option<String>>(5)?
            .and_then(|s| StrategyKind::from_db_string(&s)),
        content_fingerprint: row.get(6)?,
        retry_count: row.get(7)?,
        crawl_count: row.get(8)?,
        last_error: row.get(9)?,
        metadata: serde_json::from_str(&metadata)
            .map_err(|e| conversion_error(10, format!("bad metadata: {}", e)))?,
        created_at: timestamp_at(row, 11)?,
    })
}

fn run_from_row(row: &Row<'_>) -> rusqlite::Result<RunRecord> {
    Ok(RunRecord {
        id: row.get(0)?,
        started_at: timestamp_at(row, 1)?,
        finished_at: optional_timestamp_at(row, 2)?,
        config_hash: row.get(3)?,
        status: RunStatus::from_db_string(&row.get::<_, String>(4)?)
            .unwrap_or(RunStatus::Running),
        counts: RunCounts {
            total: row.get(5)?,
            successful: row.get(6)?,
            changed: row.get(7)?,
            unchanged: row.get(8)?,
            failed: row.get(9)?,
            blocked: row.get(10)?,
            rate_limited: row.get(11)?,
            skipped: row.get(12)?,
        },
    })
}

fn metadata_json(record: &UrlRecord) -> StorageResult<String> {
    serde_json::to_string(&record.metadata).map_err(|e| StorageError::Serialization(e.to_string()))
}

impl Storage for SqliteStorage {
    // ===== Run Management =====

    fn create_run(&mut self, config_hash: &str, started_at: DateTime<Utc>) -> StorageResult<i64> {
        self.conn.execute(
            "INSERT INTO runs (started_at, config_hash, status) VALUES (?1, ?2, ?3)",
            params![
                to_db_timestamp(&started_at),
                config_hash,
                RunStatus::Running.to_db_string()
            ],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    fn finish_run(
        &mut self,
        run_id: i64,
        status: RunStatus,
        counts: &RunCounts,
        finished_at: DateTime<Utc>,
    ) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE runs SET status = ?1, finished_at = ?2, total = ?3, successful = ?4,
             changed = ?5, unchanged = ?6, failed = ?7, blocked = ?8, rate_limited = ?9,
             skipped = ?10 WHERE id = ?11",
            params![
                status.to_db_string(),
                to_db_timestamp(&finished_at),
                counts.total,
                counts.successful,
                counts.changed,
                counts.unchanged,
                counts.failed,
                counts.blocked,
                counts.rate_limited,
                counts.skipped,
                run_id
            ],
        )?;

        if updated == 0 {
            return Err(StorageError::RunNotFound(run_id));
        }
        Ok(())
    }

    fn get_run(&self, run_id: i64) -> StorageResult<RunRecord> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM runs WHERE id = ?1", RUN_COLUMNS))?;

        stmt.query_row(params![run_id], run_from_row)
            .optional()?
            .ok_or(StorageError::RunNotFound(run_id))
    }

    fn get_latest_run(&self) -> StorageResult<Option<RunRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM runs ORDER BY id DESC LIMIT 1",
            RUN_COLUMNS
        ))?;

        Ok(stmt.query_row([], run_from_row).optional()?)
    }

    // ===== URL Records =====

    fn insert_url(&mut self, record: &UrlRecord) -> StorageResult<bool> {
        let inserted = self.conn.execute(
            &format!(
                "INSERT INTO urls ({}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
                 ON CONFLICT(url) DO NOTHING",
                URL_COLUMNS
            ),
            params![
                record.url,
                record.domain,
                record.status.to_db_string(),
                record.last_crawled_at.as_ref().map(to_db_timestamp),
                to_db_timestamp(&record.next_eligible_at),
                record.last_strategy.map(|s| s.to_db_string()),
                record.content_fingerprint,
                record.retry_count,
                record.crawl_count,
                record.last_error,
                metadata_json(record)?,
                to_db_timestamp(&record.created_at),
            ],
        )?;

        Ok(inserted > 0)
    }

    fn get_url(&self, url: &str) -> StorageResult<Option<UrlRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM urls WHERE url = ?1", URL_COLUMNS))?;

        Ok(stmt.query_row(params![url], url_from_row).optional()?)
    }

    fn update_url(&mut self, record: &UrlRecord) -> StorageResult<()> {
        let updated = self.conn.execute(
            "UPDATE urls SET status = ?1, last_crawled_at = ?2, next_eligible_at = ?3,
             last_strategy = ?4, content_fingerprint = ?5, retry_count = ?6, crawl_count = ?7,
             last_error = ?8, metadata = ?9 WHERE url = ?10",
            params![
                record.status.to_db_string(),
                record.last_crawled_at.as_ref().map(to_db_timestamp),
                to_db_timestamp(&record.next_eligible_at),
                record.last_strategy.map(|s| s.to_db_string()),
                record.content_fingerprint,
                record.retry_count,
                record.crawl_count,
                record.last_error,
                metadata_json(record)?,
                record.url,
            ],
        )?;

        if updated == 0 {
            return Err(StorageError::UrlNotFound(record.url.clone()));
        }
        Ok(())
    }

    fn delete_url(&mut self, url: &str) -> StorageResult<bool> {
        let deleted = self
            .conn
            .execute("DELETE FROM urls WHERE url = ?1", params![url])?;
        Ok(deleted > 0)
    }

    fn due_urls(&self, now: DateTime<Utc>) -> StorageResult<Vec<UrlRecord>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM urls WHERE next_eligible_at <= ?1 ORDER BY next_eligible_at, url",
            URL_COLUMNS
        ))?;

        let records = stmt
            .query_map(params![to_db_timestamp(&now)], url_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    fn list_urls(&self) -> StorageResult<Vec<UrlRecord>> {
        let mut stmt = self
            .conn
            .prepare(&format!("SELECT {} FROM urls ORDER BY url", URL_COLUMNS))?;

        let records = stmt
            .query_map([], url_from_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(records)
    }

    // ===== Statistics =====

    fn count_total_urls(&self) -> StorageResult<u64> {
        let count: i64 = self
            .conn
            .query_row("SELECT COUNT(*) FROM urls", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    fn count_by_status(&self) -> StorageResult<HashMap<UrlStatus, u64>> {
        let mut stmt = self
            .conn
            .prepare("SELECT status, COUNT(*) FROM urls GROUP BY status")?;

        let mut counts = HashMap::new();
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (status_str, count) = row?;
            if let Some(status) = UrlStatus::from_db_string(&status_str) {
                counts.insert(status, count as u64);
            }
        }

        Ok(counts)
    }

    fn count_by_domain(&self) -> StorageResult<Vec<(String, u64)>> {
        let mut stmt = self.conn.prepare(
            "SELECT domain, COUNT(*) AS count FROM urls GROUP BY domain ORDER BY count DESC, domain",
        )?;

        let domains = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get::<_, i64>(1)? as u64)))?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(domains)
    }

    fn count_by_strategy(&self) -> StorageResult<HashMap<StrategyKind, u64>> {
        let mut stmt = self.conn.prepare(
            "SELECT last_strategy, COUNT(*) FROM urls
             WHERE status = ?1 AND last_strategy IS NOT NULL
             GROUP BY last_strategy",
        )?;

        let mut counts = HashMap::new();
        let rows = stmt.query_map(params![UrlStatus::Success.to_db_string()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;

        for row in rows {
            let (strategy_str, count) = row?;
            if let Some(strategy) = StrategyKind::from_db_string(&strategy_str) {
                counts.insert(strategy, count as u64);
            }
        }

        Ok(counts)
    }

    fn count_due(&self, now: DateTime<Utc>, status: Option<UrlStatus>) -> StorageResult<u64> {
        let now = to_db_timestamp(&now);
        let count: i64 = match status {
            Some(status) => self.conn.query_row(
                "SELECT COUNT(*) FROM urls WHERE next_eligible_at <= ?1 AND status = ?2",
                params![now, status.to_db_string()],
                |row| row.get(0),
            )?,
            None => self.conn.query_row(
                "SELECT COUNT(*) FROM urls WHERE next_eligible_at <= ?1",
                params![now],
                |row| row.get(0),
            )?,
        };
        Ok(count as u64)
    }
}
