//! Configuration module for Pulse
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use pulse_crawler::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("pulse.toml")).unwrap();
//! println!("Per-domain concurrency: {}", config.crawler.max_concurrency_per_domain);
//! ```

mod parser;
mod types;
mod validation;

pub use types::{
    Config, CrawlerConfig, FetcherConfig, Frequency, ScheduleConfig, SinkConfig, SinkKind,
    TrackerConfig,
};

pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
pub use validation::parse_time_of_day;
