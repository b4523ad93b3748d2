//! Crawl orchestrator - one pass over every due URL
//!
//! This module drives a single run:
//! - Selecting due URLs from persisted tracker state
//! - Fanning crawls out across domains with per-domain and global limits
//! - Escalating, classifying and extracting each URL's content
//! - Forwarding genuine changes downstream and committing outcomes
//! - Recording the run and its tallies

use crate::config::{Config, CrawlerConfig, FetcherConfig};
use crate::crawler::classifier::{ContentTag, ExtractorSet};
use crate::crawler::escalation::{AttemptLimits, BackoffPolicy, EscalationEngine};
use crate::crawler::fetcher::{DirectStrategy, ProxiedStrategy, Strategy};
use crate::output::{build_sink, ContentChange, ContentSink};
use crate::state::{
    fingerprint, is_changed, CooldownPolicy, DomainLimiter, UrlStatus, UrlTracker,
};
use crate::storage::{open_storage, RunCounts, RunStatus, StorageError, UrlRecord};
use crate::PulseError;
use chrono::Utc;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use url::Url;

/// Summary of one `run_once` pass
#[derive(Debug, Clone, Default)]
pub struct RunReport {
    /// Run row id; `None` when nothing was due and no run was recorded
    pub run_id: Option<i64>,
    pub counts: RunCounts,
    /// URLs whose outcome could not be persisted, with the reason
    pub errors: Vec<(String, String)>,
    /// A stop was requested before every due URL started
    pub interrupted: bool,
}

impl RunReport {
    /// True when the pass found nothing due
    pub fn is_idle(&self) -> bool {
        self.run_id.is_none()
    }
}

/// How one due URL ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum UrlOutcome {
    Changed,
    Unchanged,
    Failed(UrlStatus),
    /// Not crawled: already in flight, no longer due, or stopped
    Skipped,
}

struct CrawlContext {
    tracker: UrlTracker,
    engine: EscalationEngine,
    extractors: ExtractorSet,
    sink: Arc<dyn ContentSink>,
    domains: DomainLimiter,
    fetch_slots: Arc<Semaphore>,
    config_hash: String,
    stop: AtomicBool,
}

/// Runs crawl passes over the tracked URL set
pub struct Orchestrator {
    context: Arc<CrawlContext>,
}

impl Orchestrator {
    /// Creates an orchestrator from explicit collaborators
    ///
    /// # Arguments
    ///
    /// * `tracker` - URL state tracker
    /// * `engine` - Strategy escalation engine
    /// * `extractors` - Per-type text extractors
    /// * `sink` - Receiver of changed content
    /// * `limits` - Per-domain and global concurrency caps
    /// * `config_hash` - Recorded with every run
    pub fn new(
        tracker: UrlTracker,
        engine: EscalationEngine,
        extractors: ExtractorSet,
        sink: Arc<dyn ContentSink>,
        limits: &CrawlerConfig,
        config_hash: impl Into<String>,
    ) -> Self {
        let context = CrawlContext {
            tracker,
            engine,
            extractors,
            sink,
            domains: DomainLimiter::new(limits.max_concurrency_per_domain as usize),
            fetch_slots: Arc::new(Semaphore::new(limits.max_concurrent_fetches.max(1) as usize)),
            config_hash: config_hash.into(),
            stop: AtomicBool::new(false),
        };
        Self {
            context: Arc::new(context),
        }
    }

    /// Builds the full production stack from configuration
    ///
    /// Opens the database, assembles the strategy chain and the configured
    /// sink.
    ///
    /// # Returns
    ///
    /// * `Ok(Orchestrator)` - Ready to run
    /// * `Err(PulseError)` - Storage, HTTP client or sink setup failed
    pub fn from_config(
        config: &Config,
        config_hash: impl Into<String>,
    ) -> Result<Self, PulseError> {
        let storage = open_storage(Path::new(&config.tracker.database_path))?;
        let tracker = UrlTracker::new(storage, CooldownPolicy::from_config(&config.tracker));

        let engine = EscalationEngine::new(
            build_strategies(&config.fetcher)?,
            BackoffPolicy::from_config(&config.fetcher),
            AttemptLimits::from_config(&config.fetcher),
        );
        tracing::info!(
            "Strategy chain: {}",
            engine
                .strategy_kinds()
                .iter()
                .map(|k| k.to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        let sink = build_sink(&config.sink)?;

        Ok(Self::new(
            tracker,
            engine,
            ExtractorSet::default(),
            sink,
            &config.crawler,
            config_hash,
        ))
    }

    pub fn tracker(&self) -> &UrlTracker {
        &self.context.tracker
    }

    /// Stops new URLs from starting; in-flight crawls run to completion
    pub fn request_stop(&self) {
        self.context.stop.store(true, Ordering::SeqCst);
    }

    pub fn reset_stop(&self) {
        self.context.stop.store(false, Ordering::SeqCst);
    }

    pub fn is_stopping(&self) -> bool {
        self.context.stop.load(Ordering::SeqCst)
    }

    /// URLs a run started now would select
    pub fn due_urls(&self) -> Result<Vec<UrlRecord>, PulseError> {
        Ok(self.context.tracker.due_urls(Utc::now())?)
    }

    /// Performs one pass over every due URL
    ///
    /// A failure on one URL is logged and recorded against that URL only; the
    /// pass always continues with the rest of the batch. When nothing is due
    /// no fetch is made, no state is touched and no run is recorded.
    ///
    /// # Returns
    ///
    /// * `Ok(RunReport)` - The pass finished (possibly interrupted)
    /// * `Err(PulseError)` - Due selection or run bookkeeping failed
    pub async fn run_once(&self) -> Result<RunReport, PulseError> {
        let started_at = Utc::now();
        let due = self.context.tracker.due_urls(started_at)?;

        if due.is_empty() {
            tracing::info!("No URLs due, nothing to do");
            return Ok(RunReport::default());
        }

        let storage = self.context.tracker.storage();
        let run_id = storage
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .create_run(&self.context.config_hash, started_at)?;

        tracing::info!("Starting run {} with {} due URLs", run_id, due.len());

        let mut report = RunReport {
            run_id: Some(run_id),
            ..RunReport::default()
        };
        report.counts.total = due.len() as u32;

        let mut tasks = JoinSet::new();
        for record in due {
            let context = Arc::clone(&self.context);
            tasks.spawn(async move {
                let url = record.url.clone();
                let outcome = crawl_url(context, record).await;
                (url, outcome)
            });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, Ok(outcome))) => tally(&mut report.counts, outcome),
                Ok((url, Err(e))) => {
                    tracing::error!(url = %url, "Failed to record crawl outcome: {}", e);
                    report.counts.failed += 1;
                    report.errors.push((url, e.to_string()));
                }
                Err(e) => {
                    tracing::error!("Crawl task aborted: {}", e);
                    report.counts.failed += 1;
                    report.errors.push((String::new(), e.to_string()));
                }
            }
        }

        report.interrupted = self.is_stopping();
        let status = if report.interrupted {
            RunStatus::Interrupted
        } else {
            RunStatus::Completed
        };

        storage
            .lock()
            .map_err(|_| StorageError::LockPoisoned)?
            .finish_run(run_id, status, &report.counts, Utc::now())?;

        let counts = &report.counts;
        tracing::info!(
            run_id,
            successful = counts.successful,
            changed = counts.changed,
            failed = counts.failed,
            blocked = counts.blocked,
            rate_limited = counts.rate_limited,
            skipped = counts.skipped,
            "Run {} {}",
            run_id,
            status.to_db_string()
        );

        Ok(report)
    }
}

/// Assembles the strategy chain enabled by configuration
fn build_strategies(config: &FetcherConfig) -> Result<Vec<Arc<dyn Strategy>>, PulseError> {
    let mut strategies: Vec<Arc<dyn Strategy>> = vec![Arc::new(DirectStrategy::new()?)];

    if config.proxies_enabled() {
        strategies.push(Arc::new(ProxiedStrategy::new(&config.proxy_list)?));
    }

    #[cfg(feature = "browser")]
    if config.enable_rendered {
        strategies.push(Arc::new(crate::crawler::RenderedStrategy::new(
            config.render_settle(),
        )));
    }

    Ok(strategies)
}

fn tally(counts: &mut RunCounts, outcome: UrlOutcome) {
    match outcome {
        UrlOutcome::Changed => {
            counts.record(UrlStatus::Success);
            counts.changed += 1;
        }
        UrlOutcome::Unchanged => {
            counts.record(UrlStatus::Success);
            counts.unchanged += 1;
        }
        UrlOutcome::Failed(status) => counts.record(status),
        UrlOutcome::Skipped => counts.skipped += 1,
    }
}

/// Crawls one due URL end to end
async fn crawl_url(context: Arc<CrawlContext>, due: UrlRecord) -> Result<UrlOutcome, PulseError> {
    if context.stop.load(Ordering::SeqCst) {
        return Ok(UrlOutcome::Skipped);
    }

    // Domain slot first: a worker slot is only taken once this URL can run
    let Ok(_domain_slot) = context.domains.acquire(&due.domain).await else {
        return Ok(UrlOutcome::Skipped);
    };
    let Ok(_fetch_slot) = Arc::clone(&context.fetch_slots).acquire_owned().await else {
        return Ok(UrlOutcome::Skipped);
    };

    if context.stop.load(Ordering::SeqCst) {
        return Ok(UrlOutcome::Skipped);
    }

    let Some((claim, record)) = context.tracker.begin_crawl(&due.url, Utc::now())? else {
        tracing::debug!(url = %due.url, "Skipping URL no longer available to crawl");
        return Ok(UrlOutcome::Skipped);
    };

    let url = match Url::parse(&record.url) {
        Ok(url) => url,
        Err(e) => {
            let message = format!("stored URL does not parse: {}", e);
            context
                .tracker
                .record_failure(&claim, UrlStatus::Failed, &message, Utc::now())?;
            return Ok(UrlOutcome::Failed(UrlStatus::Failed));
        }
    };

    let result = context.engine.resolve(&url, record.last_strategy).await;
    let finished_at = Utc::now();

    let strategy = match (result.success, result.final_strategy) {
        (true, Some(strategy)) => strategy,
        _ => {
            let (status, message) = match &result.terminal_error {
                Some(error) => (error.status(), error.to_string()),
                None => (UrlStatus::Failed, "no fetch strategy available".to_string()),
            };
            tracing::warn!(url = %record.url, status = %status, "Crawl failed: {}", message);
            context
                .tracker
                .record_failure(&claim, status, &message, finished_at)?;
            return Ok(UrlOutcome::Failed(status));
        }
    };

    let tag = result.content_tag.unwrap_or(ContentTag::Unknown);
    let text = match extract(&context, tag, result.raw_content).await {
        Ok(text) => text,
        Err(message) => {
            tracing::warn!(url = %record.url, content_type = %tag, "Extraction failed: {}", message);
            context
                .tracker
                .record_failure(&claim, UrlStatus::Failed, &message, finished_at)?;
            return Ok(UrlOutcome::Failed(UrlStatus::Failed));
        }
    };

    let fp = fingerprint(&text);
    if !is_changed(&record, &fp) {
        tracing::debug!(url = %record.url, strategy = %strategy, "Content unchanged");
        context
            .tracker
            .record_success(&claim, strategy, &fp, finished_at)?;
        return Ok(UrlOutcome::Unchanged);
    }

    let change = ContentChange {
        url: record.url.clone(),
        text,
        content_type: tag,
        metadata: record.metadata.clone(),
        fingerprint: fp,
        fetched_at: finished_at,
    };

    if let Err(e) = context.sink.on_content_changed(&change).await {
        let message = format!("sink rejected change: {}", e);
        tracing::warn!(url = %record.url, "{}", message);
        context
            .tracker
            .record_failure(&claim, UrlStatus::Failed, &message, finished_at)?;
        return Ok(UrlOutcome::Failed(UrlStatus::Failed));
    }

    context
        .tracker
        .record_success(&claim, strategy, &change.fingerprint, finished_at)?;
    tracing::info!(url = %record.url, strategy = %strategy, content_type = %tag, "Content changed");
    Ok(UrlOutcome::Changed)
}

/// Runs the extractor for `tag` off the async workers
async fn extract(
    context: &Arc<CrawlContext>,
    tag: ContentTag,
    raw: Vec<u8>,
) -> Result<String, String> {
    let context = Arc::clone(context);
    match tokio::task::spawn_blocking(move || context.extractors.extract(tag, &raw)).await {
        Ok(Ok(text)) => Ok(text),
        Ok(Err(e)) => Err(e.to_string()),
        Err(e) => Err(format!("extractor task failed: {}", e)),
    }
}
