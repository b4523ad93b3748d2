//! State module for tracking per-URL crawl progress
//!
//! # Components
//!
//! - `UrlStatus`: The state machine a tracked URL moves through
//! - `CooldownPolicy`: How long each outcome keeps a URL out of rotation
//! - `DomainLimiter`: Per-domain concurrency slots for politeness
//! - `UrlTracker`: The single writer of URL records
//! - Seed file parsing

mod cooldown;
mod domain_state;
mod seeds;
mod tracker;
mod url_status;

pub use cooldown::CooldownPolicy;
pub use domain_state::DomainLimiter;
pub use seeds::{parse_seeds, read_seeds, LoadReport, SeedEntry};
pub use tracker::{fingerprint, is_changed, AddOutcome, CrawlClaim, UrlTracker};
pub use url_status::UrlStatus;
