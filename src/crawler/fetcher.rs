//! Single-attempt fetch strategies
//!
//! A strategy performs exactly one attempt against a URL and reports the
//! outcome as a [`FetchAttempt`]. Remote failures are classified into an
//! [`ErrorKind`] here and never surface as `Err`; retry and escalation
//! decisions belong to the escalation engine.

use async_trait::async_trait;
use rand::seq::SliceRandom;
use reqwest::header::{HeaderMap, ACCEPT, ACCEPT_LANGUAGE, CONTENT_TYPE, USER_AGENT};
use reqwest::{redirect::Policy, Client, Proxy, StatusCode};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};
use url::Url;

/// Real browser identities rotated across attempts
const BROWSER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/130.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10.15; rv:132.0) Gecko/20100101 Firefox/132.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36 Edg/131.0.0.0",
];

const BROWSER_ACCEPT: &str =
    "text/html,application/xhtml+xml,application/xml;q=0.9,application/pdf;q=0.9,*/*;q=0.8";

/// Header some CDNs attach to challenge and block pages
const MITIGATION_HEADER: &str = "cf-mitigated";

/// Picks a browser user agent at random
pub fn random_user_agent() -> &'static str {
    BROWSER_USER_AGENTS
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or(BROWSER_USER_AGENTS[0])
}

/// The retrieval methods, in escalation priority order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StrategyKind {
    Direct,
    Proxied,
    Rendered,
}

impl StrategyKind {
    /// Fixed escalation order, cheapest first
    pub const PRIORITY: [StrategyKind; 3] = [Self::Direct, Self::Proxied, Self::Rendered];

    pub fn to_db_string(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Proxied => "proxied",
            Self::Rendered => "rendered",
        }
    }

    pub fn from_db_string(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(Self::Direct),
            "proxied" => Some(Self::Proxied),
            "rendered" => Some(Self::Rendered),
            _ => None,
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.to_db_string())
    }
}

/// Attempt-level failure taxonomy
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Connection refused or reset, TLS failure, 5xx, broken body
    Network,
    /// The attempt did not finish in time
    Timeout,
    /// Explicit bot detection or forbidden response
    Blocked,
    /// Explicit throttling response
    RateLimited,
    /// Reported success but the body failed type validation
    MalformedContent,
    /// The resource definitively does not exist
    NotFound,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Blocked => "blocked",
            Self::RateLimited => "rate_limited",
            Self::MalformedContent => "malformed_content",
            Self::NotFound => "not_found",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one attempt by one strategy
#[derive(Debug, Clone)]
pub struct FetchAttempt {
    pub strategy: StrategyKind,
    pub success: bool,
    pub status_code: Option<u16>,
    pub raw_content: Vec<u8>,
    /// Declared `Content-Type`, when the strategy saw one
    pub content_type: Option<String>,
    pub latency: Duration,
    pub error_kind: Option<ErrorKind>,
    pub error_message: Option<String>,
}

impl FetchAttempt {
    pub fn succeeded(
        strategy: StrategyKind,
        status_code: Option<u16>,
        raw_content: Vec<u8>,
        content_type: Option<String>,
        latency: Duration,
    ) -> Self {
        Self {
            strategy,
            success: true,
            status_code,
            raw_content,
            content_type,
            latency,
            error_kind: None,
            error_message: None,
        }
    }

    pub fn failed(
        strategy: StrategyKind,
        kind: ErrorKind,
        status_code: Option<u16>,
        message: impl Into<String>,
        latency: Duration,
    ) -> Self {
        Self {
            strategy,
            success: false,
            status_code,
            raw_content: Vec::new(),
            content_type: None,
            latency,
            error_kind: Some(kind),
            error_message: Some(message.into()),
        }
    }

    /// Downgrades a reported success that failed content validation
    pub fn into_malformed(mut self, message: impl Into<String>) -> Self {
        self.success = false;
        self.raw_content.clear();
        self.error_kind = Some(ErrorKind::MalformedContent);
        self.error_message = Some(message.into());
        self
    }
}

/// One way of retrieving a URL
///
/// Implementations hold no per-URL state between calls and must release any
/// scoped resource on every exit path, including when the returned future is
/// dropped by the caller's timeout.
#[async_trait]
pub trait Strategy: Send + Sync {
    fn kind(&self) -> StrategyKind;

    async fn fetch(&self, url: &Url, timeout: Duration) -> FetchAttempt;
}

/// Builds an HTTP client, optionally routed through a proxy
///
/// # Arguments
///
/// * `proxy` - Proxy URI (`http://`, `https://`, `socks5://`)
///
/// # Returns
///
/// * `Ok(Client)` - Successfully built HTTP client
/// * `Err(reqwest::Error)` - Invalid proxy or TLS backend failure
pub fn build_http_client(proxy: Option<&str>) -> Result<Client, reqwest::Error> {
    let mut builder = Client::builder()
        .connect_timeout(Duration::from_secs(10))
        .redirect(Policy::limited(10))
        .gzip(true)
        .brotli(true);

    if let Some(proxy) = proxy {
        builder = builder.proxy(Proxy::all(proxy)?);
    }

    builder.build()
}

/// Maps a response status to an attempt failure, or `None` for success
///
/// | Response | Kind |
/// |----------|------|
/// | any status with a CDN mitigation header | Blocked |
/// | 2xx | success |
/// | 404, 410 | NotFound |
/// | 429 | RateLimited |
/// | 408 | Timeout |
/// | 401, 403, 407, 451, other 4xx | Blocked |
/// | 5xx and anything else | Network |
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<ErrorKind> {
    if headers.contains_key(MITIGATION_HEADER) {
        return Some(ErrorKind::Blocked);
    }

    if status.is_success() {
        return None;
    }

    Some(match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => ErrorKind::NotFound,
        StatusCode::TOO_MANY_REQUESTS => ErrorKind::RateLimited,
        StatusCode::REQUEST_TIMEOUT => ErrorKind::Timeout,
        s if s.is_client_error() => ErrorKind::Blocked,
        _ => ErrorKind::Network,
    })
}

fn classify_transport_error(error: &reqwest::Error) -> ErrorKind {
    if error.is_timeout() {
        ErrorKind::Timeout
    } else {
        ErrorKind::Network
    }
}

/// Sends one GET with a fresh browser identity and classifies the outcome
async fn http_attempt(
    client: &Client,
    strategy: StrategyKind,
    url: &Url,
    timeout: Duration,
) -> FetchAttempt {
    let started = Instant::now();

    let response = match client
        .get(url.clone())
        .timeout(timeout)
        .header(USER_AGENT, random_user_agent())
        .header(ACCEPT, BROWSER_ACCEPT)
        .header(ACCEPT_LANGUAGE, "en-US,en;q=0.9")
        .send()
        .await
    {
        Ok(response) => response,
        Err(e) => {
            return FetchAttempt::failed(
                strategy,
                classify_transport_error(&e),
                None,
                e.to_string(),
                started.elapsed(),
            )
        }
    };

    let status = response.status();
    if let Some(kind) = classify_status(status, response.headers()) {
        return FetchAttempt::failed(
            strategy,
            kind,
            Some(status.as_u16()),
            format!("HTTP {}", status),
            started.elapsed(),
        );
    }

    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    match response.bytes().await {
        Ok(body) => FetchAttempt::succeeded(
            strategy,
            Some(status.as_u16()),
            body.to_vec(),
            content_type,
            started.elapsed(),
        ),
        Err(e) => FetchAttempt::failed(
            strategy,
            classify_transport_error(&e),
            Some(status.as_u16()),
            format!("failed reading body: {}", e),
            started.elapsed(),
        ),
    }
}

/// Plain request from this host
pub struct DirectStrategy {
    client: Client,
}

impl DirectStrategy {
    pub fn new() -> Result<Self, reqwest::Error> {
        Ok(Self {
            client: build_http_client(None)?,
        })
    }
}

#[async_trait]
impl Strategy for DirectStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Direct
    }

    async fn fetch(&self, url: &Url, timeout: Duration) -> FetchAttempt {
        http_attempt(&self.client, StrategyKind::Direct, url, timeout).await
    }
}

/// Same request as [`DirectStrategy`], routed through a rotating proxy pool
pub struct ProxiedStrategy {
    clients: Vec<(String, Client)>,
    next: AtomicUsize,
}

impl ProxiedStrategy {
    /// Builds one client per proxy
    ///
    /// # Returns
    ///
    /// * `Err(reqwest::Error)` - A proxy URI was rejected by the client builder
    pub fn new(proxies: &[String]) -> Result<Self, reqwest::Error> {
        let clients = proxies
            .iter()
            .map(|p| build_http_client(Some(p)).map(|c| (p.clone(), c)))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            clients,
            next: AtomicUsize::new(0),
        })
    }

    fn next_client(&self) -> Option<&(String, Client)> {
        if self.clients.is_empty() {
            return None;
        }
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.clients.len();
        self.clients.get(idx)
    }
}

#[async_trait]
impl Strategy for ProxiedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Proxied
    }

    async fn fetch(&self, url: &Url, timeout: Duration) -> FetchAttempt {
        let Some((proxy, client)) = self.next_client() else {
            return FetchAttempt::failed(
                StrategyKind::Proxied,
                ErrorKind::Network,
                None,
                "no proxies configured",
                Duration::ZERO,
            );
        };

        tracing::trace!(url = %url, proxy = %proxy, "Proxied attempt");
        http_attempt(client, StrategyKind::Proxied, url, timeout).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn page_url(server: &MockServer, p: &str) -> Url {
        Url::parse(&format!("{}{}", server.uri(), p)).unwrap()
    }

    #[test]
    fn test_classify_status_table() {
        let empty = HeaderMap::new();
        assert_eq!(classify_status(StatusCode::OK, &empty), None);
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND, &empty),
            Some(ErrorKind::NotFound)
        );
        assert_eq!(
            classify_status(StatusCode::GONE, &empty),
            Some(ErrorKind::NotFound)
        );
        assert_eq!(
            classify_status(StatusCode::FORBIDDEN, &empty),
            Some(ErrorKind::Blocked)
        );
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, &empty),
            Some(ErrorKind::RateLimited)
        );
        assert_eq!(
            classify_status(StatusCode::REQUEST_TIMEOUT, &empty),
            Some(ErrorKind::Timeout)
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY, &empty),
            Some(ErrorKind::Network)
        );
    }

    #[test]
    fn test_mitigation_header_means_blocked() {
        let mut headers = HeaderMap::new();
        headers.insert(MITIGATION_HEADER, HeaderValue::from_static("challenge"));
        assert_eq!(
            classify_status(StatusCode::OK, &headers),
            Some(ErrorKind::Blocked)
        );
    }

    #[test]
    fn test_strategy_priority_order() {
        let mut kinds = vec![
            StrategyKind::Rendered,
            StrategyKind::Direct,
            StrategyKind::Proxied,
        ];
        kinds.sort();
        assert_eq!(kinds, StrategyKind::PRIORITY.to_vec());
    }

    #[test]
    fn test_strategy_kind_db_roundtrip() {
        for kind in StrategyKind::PRIORITY {
            assert_eq!(StrategyKind::from_db_string(kind.to_db_string()), Some(kind));
        }
        assert_eq!(StrategyKind::from_db_string("playwright"), None);
    }

    #[test]
    fn test_random_user_agent_is_a_browser() {
        assert!(random_user_agent().starts_with("Mozilla/5.0"));
    }

    #[test]
    fn test_proxied_rejects_bad_proxy() {
        assert!(ProxiedStrategy::new(&["ftp://10.0.0.1:21".to_string()]).is_err());
    }

    #[tokio::test]
    async fn test_direct_success_keeps_body_and_type() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/faculty"))
            .and(header_exists("user-agent"))
            .respond_with(
                ResponseTemplate::new(200).set_body_raw(
                    "<html><body>Dr. Ada</body></html>",
                    "text/html; charset=utf-8",
                ),
            )
            .mount(&server)
            .await;

        let strategy = DirectStrategy::new().unwrap();
        let attempt = strategy
            .fetch(&page_url(&server, "/faculty"), Duration::from_secs(5))
            .await;

        assert!(attempt.success);
        assert_eq!(attempt.strategy, StrategyKind::Direct);
        assert_eq!(attempt.status_code, Some(200));
        assert_eq!(
            attempt.content_type.as_deref(),
            Some("text/html; charset=utf-8")
        );
        assert_eq!(attempt.raw_content, b"<html><body>Dr. Ada</body></html>");
    }

    #[tokio::test]
    async fn test_direct_forbidden_is_blocked() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .mount(&server)
            .await;

        let attempt = DirectStrategy::new()
            .unwrap()
            .fetch(&page_url(&server, "/"), Duration::from_secs(5))
            .await;

        assert!(!attempt.success);
        assert_eq!(attempt.error_kind, Some(ErrorKind::Blocked));
        assert_eq!(attempt.status_code, Some(403));
        assert!(attempt.raw_content.is_empty());
    }

    #[tokio::test]
    async fn test_direct_slow_response_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(3)))
            .mount(&server)
            .await;

        let attempt = DirectStrategy::new()
            .unwrap()
            .fetch(&page_url(&server, "/slow"), Duration::from_millis(200))
            .await;

        assert_eq!(attempt.error_kind, Some(ErrorKind::Timeout));
    }

    #[tokio::test]
    async fn test_connection_refused_is_network() {
        // Port 9 (discard) is not listening in test environments
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let attempt = DirectStrategy::new()
            .unwrap()
            .fetch(&url, Duration::from_secs(2))
            .await;

        assert!(matches!(
            attempt.error_kind,
            Some(ErrorKind::Network) | Some(ErrorKind::Timeout)
        ));
    }
}
