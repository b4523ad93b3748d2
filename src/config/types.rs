use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Pulse
///
/// Every section has defaults, so an empty file is a valid configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub fetcher: FetcherConfig,
    pub tracker: TrackerConfig,
    pub crawler: CrawlerConfig,
    pub schedule: ScheduleConfig,
    pub sink: SinkConfig,
}

/// Fetch strategies, retry and backoff behaviour
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    /// Include the proxied strategy in the escalation chain
    #[serde(rename = "use-proxies")]
    pub use_proxies: bool,

    /// Upstream proxies, rotated per attempt
    #[serde(rename = "proxy-list")]
    pub proxy_list: Vec<String>,

    /// Jitter range in seconds, `[min, max]`
    #[serde(rename = "delay-range")]
    pub delay_range: [f64; 2],

    /// Attempts allowed per strategy for retryable errors
    #[serde(rename = "max-retries-per-strategy")]
    pub max_retries_per_strategy: u32,

    /// Hard limit for a single attempt (seconds)
    #[serde(rename = "per-attempt-timeout")]
    pub per_attempt_timeout: u64,

    #[serde(rename = "backoff-base-ms")]
    pub backoff_base_ms: u64,

    #[serde(rename = "backoff-multiplier")]
    pub backoff_multiplier: f64,

    #[serde(rename = "backoff-max-ms")]
    pub backoff_max_ms: u64,

    /// Pause after a throttling response before escalating (seconds)
    #[serde(rename = "rate-limit-delay")]
    pub rate_limit_delay: u64,

    /// Bodies shorter than this are treated as malformed
    #[serde(rename = "min-content-bytes")]
    pub min_content_bytes: usize,

    /// Use the headless browser strategy when it is compiled in
    #[serde(rename = "enable-rendered")]
    pub enable_rendered: bool,

    /// Extra wait after the rendered page reports network idle (milliseconds)
    #[serde(rename = "render-settle-ms")]
    pub render_settle_ms: u64,
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            use_proxies: false,
            proxy_list: Vec::new(),
            delay_range: [1.0, 3.0],
            max_retries_per_strategy: 3,
            per_attempt_timeout: 30,
            backoff_base_ms: 1000,
            backoff_multiplier: 2.0,
            backoff_max_ms: 60_000,
            rate_limit_delay: 30,
            min_content_bytes: 0,
            enable_rendered: true,
            render_settle_ms: 2000,
        }
    }
}

impl FetcherConfig {
    pub fn per_attempt_timeout(&self) -> Duration {
        Duration::from_secs(self.per_attempt_timeout)
    }

    pub fn rate_limit_delay(&self) -> Duration {
        Duration::from_secs(self.rate_limit_delay)
    }

    pub fn render_settle(&self) -> Duration {
        Duration::from_millis(self.render_settle_ms)
    }

    /// True when the proxied strategy has something to route through
    pub fn proxies_enabled(&self) -> bool {
        self.use_proxies && !self.proxy_list.is_empty()
    }
}

/// Per-URL state store and cool-down policy
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Path to the SQLite database file
    #[serde(rename = "database-path")]
    pub database_path: String,

    /// Days before a successfully crawled URL is due again
    #[serde(rename = "recrawl-interval-days")]
    pub recrawl_interval_days: u32,

    #[serde(rename = "failed-cooldown-days")]
    pub failed_cooldown_days: u32,

    #[serde(rename = "blocked-cooldown-days")]
    pub blocked_cooldown_days: u32,

    #[serde(rename = "rate-limited-cooldown-days")]
    pub rate_limited_cooldown_days: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            database_path: "./pulse-crawler.db".to_string(),
            recrawl_interval_days: 7,
            failed_cooldown_days: 1,
            blocked_cooldown_days: 1,
            rate_limited_cooldown_days: 3,
        }
    }
}

/// Worker pool limits
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CrawlerConfig {
    /// Maximum in-flight fetches against one domain
    #[serde(rename = "max-concurrency-per-domain")]
    pub max_concurrency_per_domain: u32,

    /// Maximum in-flight fetches overall
    #[serde(rename = "max-concurrent-fetches")]
    pub max_concurrent_fetches: u32,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_concurrency_per_domain: 1,
            max_concurrent_fetches: 8,
        }
    }
}

/// How often scheduled runs fire
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Frequency {
    Hourly,
    Daily,
    Weekly,
}

impl Frequency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Weekly => "weekly",
        }
    }
}

impl std::str::FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "hourly" => Ok(Self::Hourly),
            "daily" => Ok(Self::Daily),
            "weekly" => Ok(Self::Weekly),
            other => Err(format!("unknown frequency '{}'", other)),
        }
    }
}

/// Periodic run settings
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ScheduleConfig {
    pub enabled: bool,
    pub frequency: Frequency,
    /// Local wall-clock time, "HH:MM"
    pub time: String,
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            frequency: Frequency::Daily,
            time: "02:00".to_string(),
        }
    }
}

/// Where changed content is delivered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    Jsonl,
    Log,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    pub kind: SinkKind,
    pub path: Option<String>,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            kind: SinkKind::Jsonl,
            path: Some("./changes.jsonl".to_string()),
        }
    }
}
