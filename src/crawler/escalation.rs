//! Strategy escalation
//!
//! The engine walks the configured strategies in priority order for one URL,
//! retrying retryable failures with exponential backoff, escalating on
//! blocking responses and stopping outright on a definitive not-found.

use crate::config::FetcherConfig;
use crate::crawler::classifier::{classify, ContentTag};
use crate::crawler::fetcher::{ErrorKind, FetchAttempt, Strategy, StrategyKind};
use crate::state::UrlStatus;
use rand::Rng;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use url::Url;

/// What the engine does after a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    RetrySameStrategy,
    EscalateNextStrategy,
    Terminal,
}

impl ErrorKind {
    /// Escalation table
    pub fn action(self) -> Action {
        match self {
            ErrorKind::Network | ErrorKind::Timeout => Action::RetrySameStrategy,
            ErrorKind::Blocked | ErrorKind::RateLimited | ErrorKind::MalformedContent => {
                Action::EscalateNextStrategy
            }
            ErrorKind::NotFound => Action::Terminal,
        }
    }

    /// How informative a failure is when every strategy has been exhausted
    fn precedence(self) -> u8 {
        match self {
            ErrorKind::Blocked => 5,
            ErrorKind::RateLimited => 4,
            ErrorKind::MalformedContent => 3,
            ErrorKind::Network => 2,
            ErrorKind::Timeout => 1,
            ErrorKind::NotFound => 0,
        }
    }
}

/// Retry timing shared by every strategy
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
    /// Uniform jitter in seconds, added to every pause
    pub jitter: (f64, f64),
    /// Attempts per strategy, including the first
    pub max_attempts: u32,
}

impl BackoffPolicy {
    pub fn from_config(config: &FetcherConfig) -> Self {
        Self {
            base_delay: Duration::from_millis(config.backoff_base_ms),
            multiplier: config.backoff_multiplier,
            max_delay: Duration::from_millis(config.backoff_max_ms),
            jitter: (config.delay_range[0], config.delay_range[1]),
            max_attempts: config.max_retries_per_strategy.max(1),
        }
    }

    /// A policy with no pauses at all
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            base_delay: Duration::ZERO,
            multiplier: 1.0,
            max_delay: Duration::ZERO,
            jitter: (0.0, 0.0),
            max_attempts: max_attempts.max(1),
        }
    }

    /// Exponential part of the delay before retry `retry` (1-based), capped
    pub fn backoff(&self, retry: u32) -> Duration {
        let exponent = retry.saturating_sub(1).min(i32::MAX as u32) as i32;
        let millis = self.base_delay.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped = millis.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped.max(0.0) as u64)
    }

    pub fn jitter(&self) -> Duration {
        let (min, max) = self.jitter;
        let secs = if max > min {
            rand::thread_rng().gen_range(min..=max)
        } else {
            min
        };
        Duration::from_secs_f64(secs.max(0.0))
    }

    /// Full pause before retry `retry`: backoff plus jitter
    pub fn retry_delay(&self, retry: u32) -> Duration {
        self.backoff(retry) + self.jitter()
    }
}

/// Per-attempt bounds applied by the engine
#[derive(Debug, Clone)]
pub struct AttemptLimits {
    pub per_attempt_timeout: Duration,
    /// Pause after a throttling response before the next strategy
    pub rate_limit_delay: Duration,
    pub min_content_bytes: usize,
}

impl AttemptLimits {
    pub fn from_config(config: &FetcherConfig) -> Self {
        Self {
            per_attempt_timeout: config.per_attempt_timeout(),
            rate_limit_delay: config.rate_limit_delay(),
            min_content_bytes: config.min_content_bytes,
        }
    }
}

/// Why a URL-crawl ended without content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalError {
    pub kind: ErrorKind,
    /// Every strategy was tried (or the budget ran out) without success
    pub exhausted: bool,
    pub message: String,
}

impl TerminalError {
    /// Tracker state this failure lands the URL in
    pub fn status(&self) -> UrlStatus {
        match self.kind {
            ErrorKind::Blocked => UrlStatus::Blocked,
            ErrorKind::RateLimited => UrlStatus::RateLimited,
            _ => UrlStatus::Failed,
        }
    }
}

impl fmt::Display for TerminalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.exhausted {
            write!(f, "strategies exhausted, last {}: {}", self.kind, self.message)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

/// Aggregate outcome of one URL-crawl across the escalation chain
#[derive(Debug, Clone)]
pub struct FetchResult {
    pub final_strategy: Option<StrategyKind>,
    pub success: bool,
    pub raw_content: Vec<u8>,
    pub content_tag: Option<ContentTag>,
    pub terminal_error: Option<TerminalError>,
    pub attempts: Vec<FetchAttempt>,
}

impl FetchResult {
    /// Number of attempts made with one strategy
    pub fn attempts_with(&self, kind: StrategyKind) -> usize {
        self.attempts.iter().filter(|a| a.strategy == kind).count()
    }

    fn failure(attempts: Vec<FetchAttempt>, error: TerminalError) -> Self {
        Self {
            final_strategy: attempts.last().map(|a| a.strategy),
            success: false,
            raw_content: Vec::new(),
            content_tag: None,
            terminal_error: Some(error),
            attempts,
        }
    }
}

/// Drives strategies in order for one URL
pub struct EscalationEngine {
    strategies: Vec<Arc<dyn Strategy>>,
    policy: BackoffPolicy,
    limits: AttemptLimits,
}

impl EscalationEngine {
    /// Creates an engine over the given strategies
    ///
    /// Strategies are kept in fixed priority order regardless of the order
    /// they are passed in.
    pub fn new(
        mut strategies: Vec<Arc<dyn Strategy>>,
        policy: BackoffPolicy,
        limits: AttemptLimits,
    ) -> Self {
        strategies.sort_by_key(|s| s.kind());
        Self {
            strategies,
            policy,
            limits,
        }
    }

    pub fn strategy_kinds(&self) -> Vec<StrategyKind> {
        self.strategies.iter().map(|s| s.kind()).collect()
    }

    /// Upper bound on one URL-crawl: every strategy using every attempt
    pub fn budget(&self) -> Duration {
        self.limits.per_attempt_timeout * self.policy.max_attempts * self.strategies.len() as u32
    }

    /// Strategy order for a URL, previously successful strategy first
    fn ordered(&self, affinity: Option<StrategyKind>) -> Vec<&Arc<dyn Strategy>> {
        let mut ordered: Vec<&Arc<dyn Strategy>> = Vec::with_capacity(self.strategies.len());
        if let Some(preferred) = affinity {
            ordered.extend(self.strategies.iter().filter(|s| s.kind() == preferred));
        }
        ordered.extend(
            self.strategies
                .iter()
                .filter(|s| Some(s.kind()) != affinity),
        );
        ordered
    }

    /// Resolves one URL to content or a terminal error
    ///
    /// # Arguments
    ///
    /// * `url` - The URL to fetch
    /// * `affinity` - Strategy that last succeeded for this URL, tried first
    pub async fn resolve(&self, url: &Url, affinity: Option<StrategyKind>) -> FetchResult {
        let deadline = Instant::now() + self.budget();
        let mut attempts: Vec<FetchAttempt> = Vec::new();
        let mut worst: Option<TerminalError> = None;

        'strategies: for (index, strategy) in self.ordered(affinity).into_iter().enumerate() {
            if index > 0 {
                let throttled = attempts
                    .last()
                    .map_or(false, |a| a.error_kind == Some(ErrorKind::RateLimited));
                let pause = if throttled {
                    self.limits.rate_limit_delay + self.policy.jitter()
                } else {
                    self.policy.jitter()
                };
                sleep_within(pause, deadline).await;
            }

            for attempt_no in 1..=self.policy.max_attempts {
                if attempt_no > 1 {
                    sleep_within(self.policy.retry_delay(attempt_no - 1), deadline).await;
                }

                let now = Instant::now();
                if now >= deadline {
                    tracing::warn!(url = %url, "URL crawl budget exhausted");
                    break 'strategies;
                }
                let timeout = self.limits.per_attempt_timeout.min(deadline - now);

                let attempt = self.attempt(strategy.as_ref(), url, timeout).await;

                if attempt.success {
                    match self.validate(&attempt) {
                        Ok(tag) => {
                            tracing::debug!(
                                url = %url,
                                strategy = %attempt.strategy,
                                status = ?attempt.status_code,
                                latency_ms = attempt.latency.as_millis() as u64,
                                content = %tag,
                                "Attempt succeeded"
                            );
                            return self.success(attempts, attempt, tag);
                        }
                        Err(reason) => {
                            let attempt = attempt.into_malformed(reason);
                            self.record_failure(url, &attempt, &mut worst);
                            attempts.push(attempt);
                            continue 'strategies;
                        }
                    }
                }

                let action = self.record_failure(url, &attempt, &mut worst);
                attempts.push(attempt);

                match action {
                    Action::Terminal => {
                        let error = worst.take().map(|mut e| {
                            e.exhausted = false;
                            e
                        });
                        return FetchResult::failure(
                            attempts,
                            error.unwrap_or_else(|| TerminalError {
                                kind: ErrorKind::NotFound,
                                exhausted: false,
                                message: "not found".to_string(),
                            }),
                        );
                    }
                    Action::EscalateNextStrategy => continue 'strategies,
                    Action::RetrySameStrategy => {}
                }
            }

            tracing::debug!(url = %url, strategy = %strategy.kind(), "Strategy exhausted, escalating");
        }

        let error = worst.unwrap_or_else(|| TerminalError {
            kind: ErrorKind::Timeout,
            exhausted: true,
            message: "no attempt completed within the crawl budget".to_string(),
        });
        tracing::info!(url = %url, error = %error, "All strategies failed");
        FetchResult::failure(attempts, error)
    }

    async fn attempt(&self, strategy: &dyn Strategy, url: &Url, timeout: Duration) -> FetchAttempt {
        match tokio::time::timeout(timeout, strategy.fetch(url, timeout)).await {
            Ok(attempt) => attempt,
            Err(_) => FetchAttempt::failed(
                strategy.kind(),
                ErrorKind::Timeout,
                None,
                format!("attempt exceeded {:?}", timeout),
                timeout,
            ),
        }
    }

    /// Checks a reported success before it is accepted
    fn validate(&self, attempt: &FetchAttempt) -> Result<ContentTag, String> {
        if attempt.raw_content.len() < self.limits.min_content_bytes {
            return Err(format!(
                "body of {} bytes is below the {} byte minimum",
                attempt.raw_content.len(),
                self.limits.min_content_bytes
            ));
        }

        classify(&attempt.raw_content, attempt.content_type.as_deref()).map_err(|e| e.to_string())
    }

    /// Logs a failed attempt and keeps the most informative error seen
    fn record_failure(
        &self,
        url: &Url,
        attempt: &FetchAttempt,
        worst: &mut Option<TerminalError>,
    ) -> Action {
        let kind = attempt.error_kind.unwrap_or(ErrorKind::Network);
        let message = attempt
            .error_message
            .clone()
            .unwrap_or_else(|| kind.to_string());

        tracing::debug!(
            url = %url,
            strategy = %attempt.strategy,
            status = ?attempt.status_code,
            latency_ms = attempt.latency.as_millis() as u64,
            kind = %kind,
            "Attempt failed: {}",
            message
        );

        let replace = match worst {
            Some(current) => kind.precedence() >= current.kind.precedence(),
            None => true,
        };
        if replace {
            *worst = Some(TerminalError {
                kind,
                exhausted: true,
                message: format!("{} via {}", message, attempt.strategy),
            });
        }

        kind.action()
    }

    fn success(
        &self,
        mut attempts: Vec<FetchAttempt>,
        mut attempt: FetchAttempt,
        tag: ContentTag,
    ) -> FetchResult {
        let raw_content = std::mem::take(&mut attempt.raw_content);
        let strategy = attempt.strategy;
        attempts.push(attempt);

        FetchResult {
            final_strategy: Some(strategy),
            success: true,
            raw_content,
            content_tag: Some(tag),
            terminal_error: None,
            attempts,
        }
    }
}

async fn sleep_within(delay: Duration, deadline: Instant) {
    if delay.is_zero() {
        return;
    }
    let remaining = deadline.saturating_duration_since(Instant::now());
    tokio::time::sleep(delay.min(remaining)).await;
}
