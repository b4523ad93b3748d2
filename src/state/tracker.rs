//! Per-URL crawl state tracker
//!
//! The tracker is the only writer of URL records. It owns the state machine
//! (claim, success, failure), the cool-down policy and per-URL exclusion, so
//! no two crawls of the same URL ever run at once.

use crate::crawler::StrategyKind;
use crate::state::seeds::{LoadReport, SeedEntry};
use crate::state::{CooldownPolicy, UrlStatus};
use crate::storage::{SharedStorage, Storage, StorageError, StorageResult, UrlRecord};
use crate::url::{normalize_key, normalize_with_domain};
use crate::PulseError;
use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard};

/// SHA-256 hex digest of extracted text
pub fn fingerprint(text: &str) -> String {
    hex::encode(Sha256::digest(text.as_bytes()))
}

/// Whether `fingerprint` differs from the last one stored for the record
pub fn is_changed(record: &UrlRecord, fingerprint: &str) -> bool {
    record.content_fingerprint.as_deref() != Some(fingerprint)
}

/// Result of submitting a URL
#[derive(Debug, Clone)]
pub enum AddOutcome {
    Added(UrlRecord),
    /// The URL was already tracked; its record is returned untouched
    AlreadyPresent(UrlRecord),
}

impl AddOutcome {
    pub fn record(&self) -> &UrlRecord {
        match self {
            Self::Added(r) | Self::AlreadyPresent(r) => r,
        }
    }
}

/// Exclusive ownership of one URL for the duration of a crawl
///
/// Dropping the claim releases the URL, whether or not an outcome was
/// recorded.
#[derive(Debug)]
pub struct CrawlClaim {
    url: String,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl CrawlClaim {
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for CrawlClaim {
    fn drop(&mut self) {
        let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
        in_flight.remove(&self.url);
    }
}

/// Single source of truth for URL crawl state
#[derive(Clone)]
pub struct UrlTracker {
    storage: SharedStorage,
    policy: CooldownPolicy,
    in_flight: Arc<Mutex<HashSet<String>>>,
}

impl UrlTracker {
    pub fn new(storage: SharedStorage, policy: CooldownPolicy) -> Self {
        Self {
            storage,
            policy,
            in_flight: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn storage(&self) -> SharedStorage {
        Arc::clone(&self.storage)
    }

    pub fn policy(&self) -> &CooldownPolicy {
        &self.policy
    }

    fn lock(&self) -> StorageResult<MutexGuard<'_, dyn Storage + Send + 'static>> {
        self.storage.lock().map_err(|_| StorageError::LockPoisoned)
    }

    // ===== Submission =====

    /// Starts tracking a URL, or returns the existing record unchanged
    ///
    /// # Arguments
    ///
    /// * `raw_url` - URL as submitted; it is normalized before use
    /// * `metadata` - Correlation fields stored with a new record
    pub fn add_url(
        &self,
        raw_url: &str,
        metadata: Map<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<AddOutcome, PulseError> {
        let (url, domain) = normalize_with_domain(raw_url)?;
        let record = UrlRecord::new(url.as_str(), domain, metadata, now);

        let mut storage = self.lock()?;
        if storage.insert_url(&record)? {
            tracing::debug!(url = %record.url, "Tracking new URL");
            return Ok(AddOutcome::Added(record));
        }

        let existing = storage
            .get_url(&record.url)?
            .ok_or_else(|| StorageError::UrlNotFound(record.url.clone()))?;
        Ok(AddOutcome::AlreadyPresent(existing))
    }

    /// Bulk-loads seed entries without resetting existing records
    ///
    /// Entries with unusable URLs are reported, not fatal.
    pub fn load_seeds(
        &self,
        entries: Vec<SeedEntry>,
        now: DateTime<Utc>,
    ) -> Result<LoadReport, PulseError> {
        let mut report = LoadReport::default();

        for entry in entries {
            let (url, metadata) = entry.into_parts();
            match self.add_url(&url, metadata, now) {
                Ok(AddOutcome::Added(_)) => report.added += 1,
                Ok(AddOutcome::AlreadyPresent(_)) => report.already_present += 1,
                Err(PulseError::Url(e)) => {
                    tracing::warn!(url = %url, "Skipping seed: {}", e);
                    report.invalid.push((url, e.to_string()));
                }
                Err(e) => return Err(e),
            }
        }

        tracing::info!(
            added = report.added,
            already_present = report.already_present,
            invalid = report.invalid.len(),
            "Seeds loaded"
        );
        Ok(report)
    }

    /// Stops tracking a URL
    pub fn remove_url(&self, raw_url: &str) -> Result<bool, PulseError> {
        let key = normalize_key(raw_url)?;
        Ok(self.lock()?.delete_url(&key)?)
    }

    /// Current persisted record for a URL
    pub fn get(&self, raw_url: &str) -> Result<Option<UrlRecord>, PulseError> {
        let key = normalize_key(raw_url)?;
        Ok(self.lock()?.get_url(&key)?)
    }

    /// Records due at `now`, read from persisted state
    pub fn due_urls(&self, now: DateTime<Utc>) -> StorageResult<Vec<UrlRecord>> {
        self.lock()?.due_urls(now)
    }

    // ===== Crawl Lifecycle =====

    /// Claims a due URL for crawling
    ///
    /// Re-reads the persisted record, so a URL that stopped being due (or was
    /// removed) since selection is not crawled. The claimed record is moved to
    /// Pending and persisted before any fetch starts.
    ///
    /// # Returns
    ///
    /// * `Ok(Some((claim, record)))` - The caller now owns the URL
    /// * `Ok(None)` - Already in flight, no longer due, or no longer tracked
    pub fn begin_crawl(
        &self,
        url: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<(CrawlClaim, UrlRecord)>> {
        {
            let mut in_flight = self.in_flight.lock().map_err(|_| StorageError::LockPoisoned)?;
            if !in_flight.insert(url.to_string()) {
                return Ok(None);
            }
        }
        let claim = CrawlClaim {
            url: url.to_string(),
            in_flight: Arc::clone(&self.in_flight),
        };

        let mut storage = self.lock()?;
        let Some(mut record) = storage.get_url(url)? else {
            return Ok(None);
        };
        if !record.is_due(now) {
            return Ok(None);
        }

        if record.status != UrlStatus::Pending {
            transition(&record, UrlStatus::Pending)?;
            record.status = UrlStatus::Pending;
            storage.update_url(&record)?;
        }

        Ok(Some((claim, record)))
    }

    /// Records a successful crawl
    ///
    /// Resets `retry_count`, stores the fingerprint and winning strategy and
    /// schedules the next crawl after the recrawl interval.
    pub fn record_success(
        &self,
        claim: &CrawlClaim,
        strategy: StrategyKind,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<UrlRecord> {
        let mut storage = self.lock()?;
        let mut record = current(&*storage, claim.url())?;
        transition(&record, UrlStatus::Success)?;

        record.status = UrlStatus::Success;
        record.last_crawled_at = Some(now);
        record.next_eligible_at = self.policy.next_eligible(UrlStatus::Success, now);
        record.last_strategy = Some(strategy);
        record.content_fingerprint = Some(fingerprint.to_string());
        record.retry_count = 0;
        record.crawl_count += 1;
        record.last_error = None;

        storage.update_url(&record)?;
        Ok(record)
    }

    /// Records a failed crawl
    ///
    /// The stored fingerprint and last successful strategy are kept.
    pub fn record_failure(
        &self,
        claim: &CrawlClaim,
        status: UrlStatus,
        message: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<UrlRecord> {
        let mut storage = self.lock()?;
        let mut record = current(&*storage, claim.url())?;
        if !status.is_error() {
            return Err(StorageError::InvalidTransition {
                from: record.status,
                to: status,
            });
        }
        transition(&record, status)?;

        record.status = status;
        record.last_crawled_at = Some(now);
        record.next_eligible_at = self.policy.next_eligible(status, now);
        record.retry_count += 1;
        record.crawl_count += 1;
        record.last_error = Some(message.to_string());

        storage.update_url(&record)?;
        Ok(record)
    }
}

fn current(storage: &(dyn Storage + Send), url: &str) -> StorageResult<UrlRecord> {
    storage
        .get_url(url)?
        .ok_or_else(|| StorageError::UrlNotFound(url.to_string()))
}

fn transition(record: &UrlRecord, to: UrlStatus) -> StorageResult<()> {
    if record.status.can_transition_to(to) {
        Ok(())
    } else {
        Err(StorageError::InvalidTransition {
            from: record.status,
            to,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::SqliteStorage;
    use chrono::{Duration, TimeZone};
    use serde_json::json;

    fn tracker() -> UrlTracker {
        let storage: SharedStorage = Arc::new(Mutex::new(SqliteStorage::open_in_memory().unwrap()));
        UrlTracker::new(storage, CooldownPolicy::default())
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 5, 4, 9, 0, 0).unwrap()
    }

    fn meta(value: &str) -> Map<String, Value> {
        let mut m = Map::new();
        m.insert("department".to_string(), json!(value));
        m
    }

    #[test]
    fn test_fingerprint() {
        assert_eq!(fingerprint("Hello World"), fingerprint("Hello World"));
        assert_ne!(fingerprint("Hello World"), fingerprint("Hello World!"));
        assert_eq!(fingerprint("").len(), 64);
    }

    #[test]
    fn test_add_url_normalizes_and_dedups() {
        let tracker = tracker();

        let first = tracker
            .add_url("https://Example.edu/people/ada/?utm_source=x", meta("Math"), t0())
            .unwrap();
        assert!(matches!(first, AddOutcome::Added(_)));
        assert_eq!(first.record().url, "https://example.edu/people/ada");
        assert_eq!(first.record().domain, "example.edu");

        let second = tracker
            .add_url("https://example.edu/people/ada#bio", meta("Other"), t0())
            .unwrap();
        let AddOutcome::AlreadyPresent(existing) = second else {
            panic!("expected existing record");
        };
        assert_eq!(existing.metadata.get("department"), Some(&json!("Math")));
    }

    #[test]
    fn test_add_invalid_url() {
        let tracker = tracker();
        assert!(matches!(
            tracker.add_url("ftp://example.edu/file", Map::new(), t0()),
            Err(PulseError::Url(_))
        ));
    }

    #[test]
    fn test_load_seeds_keeps_existing_records() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", Map::new(), t0()).unwrap();
        let (claim, _) = tracker.begin_crawl("https://a.test/x", t0()).unwrap().unwrap();
        tracker
            .record_success(&claim, StrategyKind::Direct, "fp", t0())
            .unwrap();
        drop(claim);

        let report = tracker
            .load_seeds(
                vec![
                    SeedEntry::new("https://a.test/x", meta("new")),
                    SeedEntry::new("https://a.test/y", Map::new()),
                    SeedEntry::new("mailto:someone@a.test", Map::new()),
                ],
                t0(),
            )
            .unwrap();

        assert_eq!(report.added, 1);
        assert_eq!(report.already_present, 1);
        assert_eq!(report.invalid.len(), 1);

        let x = tracker.get("https://a.test/x").unwrap().unwrap();
        assert_eq!(x.status, UrlStatus::Success);
        assert_eq!(x.content_fingerprint.as_deref(), Some("fp"));
    }

    #[test]
    fn test_remove_url() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", Map::new(), t0()).unwrap();

        assert!(tracker.remove_url("https://A.test/x/").unwrap());
        assert!(!tracker.remove_url("https://a.test/x").unwrap());
        assert!(tracker.get("https://a.test/x").unwrap().is_none());
    }

    #[test]
    fn test_success_lifecycle() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", meta("Bio"), t0()).unwrap();

        let (claim, record) = tracker.begin_crawl("https://a.test/x", t0()).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Pending);

        let done = tracker
            .record_success(&claim, StrategyKind::Proxied, &fingerprint("Hello"), t0())
            .unwrap();

        assert_eq!(done.status, UrlStatus::Success);
        assert_eq!(done.last_crawled_at, Some(t0()));
        assert_eq!(done.next_eligible_at, t0() + Duration::days(7));
        assert_eq!(done.last_strategy, Some(StrategyKind::Proxied));
        assert_eq!(done.crawl_count, 1);
        assert_eq!(done.retry_count, 0);
        assert_eq!(done.metadata, meta("Bio"));
        assert!(!is_changed(&done, &fingerprint("Hello")));
        assert!(is_changed(&done, &fingerprint("Hello again")));
    }

    #[test]
    fn test_failure_keeps_fingerprint_and_counts_retries() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", Map::new(), t0()).unwrap();

        let (claim, _) = tracker.begin_crawl("https://a.test/x", t0()).unwrap().unwrap();
        tracker
            .record_success(&claim, StrategyKind::Direct, "fp-1", t0())
            .unwrap();
        drop(claim);

        let later = t0() + Duration::days(8);
        let (claim, _) = tracker.begin_crawl("https://a.test/x", later).unwrap().unwrap();
        let failed = tracker
            .record_failure(&claim, UrlStatus::Blocked, "403 via direct", later)
            .unwrap();
        drop(claim);

        assert_eq!(failed.status, UrlStatus::Blocked);
        assert_eq!(failed.retry_count, 1);
        assert_eq!(failed.crawl_count, 2);
        assert_eq!(failed.content_fingerprint.as_deref(), Some("fp-1"));
        assert_eq!(failed.last_strategy, Some(StrategyKind::Direct));
        assert_eq!(failed.next_eligible_at, later + Duration::days(1));

        let much_later = later + Duration::days(1);
        let (claim, _) = tracker
            .begin_crawl("https://a.test/x", much_later)
            .unwrap()
            .unwrap();
        let again = tracker
            .record_failure(&claim, UrlStatus::RateLimited, "429", much_later)
            .unwrap();
        assert_eq!(again.retry_count, 2);
        assert_eq!(again.next_eligible_at, much_later + Duration::days(3));
    }

    #[test]
    fn test_begin_crawl_respects_cooldown() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", Map::new(), t0()).unwrap();

        let (claim, _) = tracker.begin_crawl("https://a.test/x", t0()).unwrap().unwrap();
        tracker
            .record_success(&claim, StrategyKind::Direct, "fp", t0())
            .unwrap();
        drop(claim);

        let soon = t0() + Duration::days(2);
        assert!(tracker.begin_crawl("https://a.test/x", soon).unwrap().is_none());
        assert!(tracker.due_urls(soon).unwrap().is_empty());

        let record = tracker.get("https://a.test/x").unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Success);
    }

    #[test]
    fn test_claim_is_exclusive() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", Map::new(), t0()).unwrap();

        let first = tracker.begin_crawl("https://a.test/x", t0()).unwrap();
        assert!(first.is_some());
        assert!(tracker.begin_crawl("https://a.test/x", t0()).unwrap().is_none());

        drop(first);
        assert!(tracker.begin_crawl("https://a.test/x", t0()).unwrap().is_some());
    }

    #[test]
    fn test_claim_moves_terminal_record_to_pending() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", Map::new(), t0()).unwrap();
        let (claim, _) = tracker.begin_crawl("https://a.test/x", t0()).unwrap().unwrap();
        tracker
            .record_failure(&claim, UrlStatus::Failed, "404", t0())
            .unwrap();
        drop(claim);

        let later = t0() + Duration::days(1);
        let (_claim, record) = tracker.begin_crawl("https://a.test/x", later).unwrap().unwrap();
        assert_eq!(record.status, UrlStatus::Pending);

        let persisted = tracker.get("https://a.test/x").unwrap().unwrap();
        assert_eq!(persisted.status, UrlStatus::Pending);
        assert_eq!(persisted.retry_count, 1);
    }

    #[test]
    fn test_invalid_outcomes_rejected() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", Map::new(), t0()).unwrap();
        let (claim, _) = tracker.begin_crawl("https://a.test/x", t0()).unwrap().unwrap();

        assert!(matches!(
            tracker.record_failure(&claim, UrlStatus::Success, "nope", t0()),
            Err(StorageError::InvalidTransition { .. })
        ));

        tracker
            .record_success(&claim, StrategyKind::Direct, "fp", t0())
            .unwrap();
        // A second outcome for the same claim would skip Pending
        assert!(matches!(
            tracker.record_success(&claim, StrategyKind::Direct, "fp", t0()),
            Err(StorageError::InvalidTransition { .. })
        ));
    }

    #[test]
    fn test_removed_while_claimed() {
        let tracker = tracker();
        tracker.add_url("https://a.test/x", Map::new(), t0()).unwrap();
        let (claim, _) = tracker.begin_crawl("https://a.test/x", t0()).unwrap().unwrap();

        tracker.remove_url("https://a.test/x").unwrap();
        assert!(matches!(
            tracker.record_success(&claim, StrategyKind::Direct, "fp", t0()),
            Err(StorageError::UrlNotFound(_))
        ));
    }
}
