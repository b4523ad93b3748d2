//! Statistics generation from the crawl database
//!
//! This module provides functionality for extracting and displaying
//! aggregate URL state from the storage layer.

use crate::crawler::StrategyKind;
use crate::state::UrlStatus;
use crate::storage::{RunRecord, Storage};
use crate::PulseError;
use chrono::{DateTime, Utc};
use std::collections::HashMap;

/// Aggregate view of tracked URLs
#[derive(Debug, Clone)]
pub struct CrawlStatistics {
    /// Total number of tracked URLs
    pub total_urls: u64,

    /// Count of URLs by status
    pub by_status: HashMap<UrlStatus, u64>,

    /// Count of URLs by domain, largest first
    pub by_domain: Vec<(String, u64)>,

    /// Successful URLs by the strategy that last retrieved them
    pub by_strategy: HashMap<StrategyKind, u64>,

    /// URLs eligible for crawling right now
    pub due_now: u64,

    /// Successful URLs whose recrawl interval has elapsed
    pub needs_recrawl: u64,

    /// Most recent run, if any
    pub last_run: Option<RunRecord>,
}

impl CrawlStatistics {
    pub fn status_count(&self, status: UrlStatus) -> u64 {
        self.by_status.get(&status).copied().unwrap_or(0)
    }
}

/// Loads statistics from storage
///
/// # Arguments
///
/// * `storage` - The storage backend to query
/// * `now` - Reference time for due counts
///
/// # Returns
///
/// * `Ok(CrawlStatistics)` - Successfully loaded statistics
/// * `Err(PulseError)` - Failed to query statistics
pub fn load_statistics(
    storage: &dyn Storage,
    now: DateTime<Utc>,
) -> Result<CrawlStatistics, PulseError> {
    Ok(CrawlStatistics {
        total_urls: storage.count_total_urls()?,
        by_status: storage.count_by_status()?,
        by_domain: storage.count_by_domain()?,
        by_strategy: storage.count_by_strategy()?,
        due_now: storage.count_due(now, None)?,
        needs_recrawl: storage.count_due(now, Some(UrlStatus::Success))?,
        last_run: storage.get_latest_run()?,
    })
}

/// Prints statistics to stdout in a formatted manner
///
/// # Arguments
///
/// * `stats` - The statistics to display
/// * `max_domains` - How many of the largest domains to list
pub fn print_statistics(stats: &CrawlStatistics, max_domains: usize) {
    println!("=== URL Tracker Statistics ===\n");

    println!("Total URLs tracked: {}", stats.total_urls);
    for status in UrlStatus::all() {
        let count = stats.status_count(status);
        let percentage = if stats.total_urls > 0 {
            (count as f64 / stats.total_urls as f64) * 100.0
        } else {
            0.0
        };
        println!("  {:<13} {} ({:.1}%)", status, count, percentage);
    }
    println!();

    println!("Due now: {}", stats.due_now);
    println!("Needing recrawl: {}", stats.needs_recrawl);
    println!();

    if !stats.by_strategy.is_empty() {
        println!("Successful Strategies:");
        for strategy in StrategyKind::PRIORITY {
            if let Some(count) = stats.by_strategy.get(&strategy) {
                println!("  {}: {}", strategy, count);
            }
        }
        println!();
    }

    if !stats.by_domain.is_empty() {
        println!("Domains ({}):", stats.by_domain.len());
        for (domain, count) in stats.by_domain.iter().take(max_domains) {
            println!("  {}: {}", domain, count);
        }
        if stats.by_domain.len() > max_domains {
            println!("  ... and {} more", stats.by_domain.len() - max_domains);
        }
        println!();
    }

    match &stats.last_run {
        Some(run) => {
            println!(
                "Last run: #{} {} at {}",
                run.id,
                run.status.to_db_string(),
                run.started_at.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!(
                "  {} due, {} ok ({} changed, {} unchanged), {} failed, {} blocked, {} rate limited, {} skipped",
                run.counts.total,
                run.counts.successful,
                run.counts.changed,
                run.counts.unchanged,
                run.counts.failed,
                run.counts.blocked,
                run.counts.rate_limited,
                run.counts.skipped
            );
        }
        None => println!("No runs recorded yet"),
    }
}
