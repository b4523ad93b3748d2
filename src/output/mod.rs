//! Output module for changed content and crawl reporting
//!
//! This module handles:
//! - Delivering changed content to downstream sinks
//! - Recording and displaying aggregate crawl statistics

mod sink;
pub mod stats;

pub use sink::{build_sink, ContentChange, ContentSink, JsonlSink, LogSink, SinkError};
pub use stats::{load_statistics, print_statistics, CrawlStatistics};
