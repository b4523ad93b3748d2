//! Crawler module for content retrieval and change detection
//!
//! This module contains the core crawling logic, including:
//! - Single-attempt fetch strategies (direct, proxied, rendered)
//! - Strategy escalation with retry and backoff
//! - Content classification and text extraction
//! - Run orchestration and periodic scheduling

mod classifier;
mod coordinator;
mod escalation;
mod fetcher;
#[cfg(feature = "browser")]
mod rendered;
mod scheduler;

pub use classifier::{
    classify, collapse_whitespace, sniff, ClassifyError, ContentTag, ExtractError, Extractor,
    ExtractorSet, HtmlExtractor, PdfExtractor, PlainTextExtractor, Signature,
};
pub use coordinator::{Orchestrator, RunReport};
pub use escalation::{
    Action, AttemptLimits, BackoffPolicy, EscalationEngine, FetchResult, TerminalError,
};
pub use fetcher::{
    build_http_client, classify_status, random_user_agent, DirectStrategy, ErrorKind,
    FetchAttempt, ProxiedStrategy, Strategy, StrategyKind,
};
#[cfg(feature = "browser")]
pub use rendered::RenderedStrategy;
pub use scheduler::{ScheduleSpec, Scheduler, TriggerOutcome};
