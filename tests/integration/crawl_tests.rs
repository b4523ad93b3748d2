//! Integration tests for the crawler
//!
//! These tests drive full `run_once` passes over in-memory storage, with
//! scripted strategies for the escalation chain and wiremock servers for
//! real HTTP fetches.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use pulse_crawler::config::{Config, CrawlerConfig, SinkConfig, SinkKind};
use pulse_crawler::crawler::{
    AttemptLimits, BackoffPolicy, DirectStrategy, ErrorKind, EscalationEngine, ExtractorSet,
    FetchAttempt, Orchestrator, Strategy, StrategyKind,
};
use pulse_crawler::output::{ContentChange, ContentSink, SinkError};
use pulse_crawler::state::{fingerprint, parse_seeds, CooldownPolicy, UrlTracker};
use pulse_crawler::storage::{SharedStorage, SqliteStorage, Storage};
use pulse_crawler::{ContentTag, UrlStatus};
use serde_json::{json, Map};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use url::Url;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Canned result for one scripted fetch
#[derive(Clone)]
enum Reply {
    Html(&'static str),
    Fail(ErrorKind),
    Hang,
}

/// Strategy that replays replies in order, repeating the last one
struct Scripted {
    kind: StrategyKind,
    replies: Mutex<VecDeque<Reply>>,
    calls: AtomicUsize,
}

impl Scripted {
    fn new(kind: StrategyKind, replies: Vec<Reply>) -> Arc<Self> {
        Arc::new(Self {
            kind,
            replies: Mutex::new(replies.into()),
            calls: AtomicUsize::new(0),
        })
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Strategy for Scripted {
    fn kind(&self) -> StrategyKind {
        self.kind
    }

    async fn fetch(&self, _url: &Url, _timeout: Duration) -> FetchAttempt {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let reply = {
            let mut replies = self.replies.lock().unwrap();
            if replies.len() > 1 {
                replies.pop_front().unwrap()
            } else {
                replies.front().cloned().unwrap()
            }
        };

        match reply {
            Reply::Html(body) => FetchAttempt::succeeded(
                self.kind,
                Some(200),
                body.as_bytes().to_vec(),
                Some("text/html; charset=utf-8".to_string()),
                Duration::from_millis(1),
            ),
            Reply::Fail(kind) => {
                FetchAttempt::failed(self.kind, kind, None, kind.to_string(), Duration::ZERO)
            }
            Reply::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                FetchAttempt::failed(self.kind, ErrorKind::Network, None, "woke", Duration::ZERO)
            }
        }
    }
}

/// Sink that remembers every change it acknowledges
#[derive(Default)]
struct RecordingSink {
    changes: Mutex<Vec<ContentChange>>,
}

impl RecordingSink {
    fn count(&self) -> usize {
        self.changes.lock().unwrap().len()
    }

    fn last(&self) -> ContentChange {
        self.changes.lock().unwrap().last().cloned().unwrap()
    }
}

#[async_trait]
impl ContentSink for RecordingSink {
    async fn on_content_changed(&self, change: &ContentChange) -> Result<(), SinkError> {
        self.changes.lock().unwrap().push(change.clone());
        Ok(())
    }
}

struct Harness {
    orchestrator: Orchestrator,
    sink: Arc<RecordingSink>,
}

impl Harness {
    fn new(strategies: Vec<Arc<dyn Strategy>>) -> Self {
        Self::with_options(strategies, CooldownPolicy::default(), Duration::from_secs(5))
    }

    fn with_options(
        strategies: Vec<Arc<dyn Strategy>>,
        policy: CooldownPolicy,
        per_attempt_timeout: Duration,
    ) -> Self {
        let storage: SharedStorage = Arc::new(Mutex::new(SqliteStorage::open_in_memory().unwrap()));
        let tracker = UrlTracker::new(storage, policy);
        let engine = EscalationEngine::new(
            strategies,
            BackoffPolicy::immediate(1),
            AttemptLimits {
                per_attempt_timeout,
                rate_limit_delay: Duration::ZERO,
                min_content_bytes: 0,
            },
        );
        let sink = Arc::new(RecordingSink::default());
        let orchestrator = Orchestrator::new(
            tracker,
            engine,
            ExtractorSet::default(),
            Arc::clone(&sink) as Arc<dyn ContentSink>,
            &CrawlerConfig::default(),
            "test",
        );
        Self { orchestrator, sink }
    }

    fn add(&self, url: &str) {
        self.orchestrator
            .tracker()
            .add_url(url, Map::new(), Utc::now())
            .unwrap();
    }

    fn record(&self, url: &str) -> pulse_crawler::UrlRecord {
        self.orchestrator.tracker().get(url).unwrap().unwrap()
    }
}

fn chain(strategies: &[&Arc<Scripted>]) -> Vec<Arc<dyn Strategy>> {
    strategies
        .iter()
        .map(|s| Arc::clone(*s) as Arc<dyn Strategy>)
        .collect()
}

fn immediate_recrawl() -> CooldownPolicy {
    CooldownPolicy {
        success: ChronoDuration::zero(),
        ..CooldownPolicy::default()
    }
}

#[tokio::test]
async fn test_blocked_direct_escalates_to_proxied() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/people/x"))
        .respond_with(ResponseTemplate::new(403))
        .expect(1)
        .mount(&server)
        .await;

    let direct: Arc<dyn Strategy> = Arc::new(DirectStrategy::new().unwrap());
    let proxied = Scripted::new(
        StrategyKind::Proxied,
        vec![Reply::Html("<html><body><p>Hello World</p></body></html>")],
    );
    let rendered = Scripted::new(StrategyKind::Rendered, vec![Reply::Html("<p>never</p>")]);

    let mut strategies = chain(&[&proxied, &rendered]);
    strategies.push(direct);
    let harness = Harness::new(strategies);

    let url = format!("{}/people/x", server.uri());
    harness.add(&url);

    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.counts.successful, 1);
    assert_eq!(report.counts.changed, 1);

    let record = harness.record(&url);
    assert_eq!(record.status, UrlStatus::Success);
    assert_eq!(record.last_strategy, Some(StrategyKind::Proxied));

    assert_eq!(proxied.calls(), 1);
    assert_eq!(rendered.calls(), 0);
    assert_eq!(harness.sink.count(), 1);
    assert_eq!(harness.sink.last().text, "Hello World");
}

#[tokio::test]
async fn test_not_found_is_terminal() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/gone"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;

    let direct: Arc<dyn Strategy> = Arc::new(DirectStrategy::new().unwrap());
    let proxied = Scripted::new(StrategyKind::Proxied, vec![Reply::Html("<p>x</p>")]);
    let rendered = Scripted::new(StrategyKind::Rendered, vec![Reply::Html("<p>x</p>")]);

    let mut strategies = chain(&[&proxied, &rendered]);
    strategies.push(direct);
    let harness = Harness::new(strategies);

    let url = format!("{}/gone", server.uri());
    harness.add(&url);
    let before = harness.record(&url);

    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.counts.failed, 1);

    let record = harness.record(&url);
    assert_eq!(record.status, UrlStatus::Failed);
    assert_eq!(record.retry_count, before.retry_count + 1);
    assert_eq!(proxied.calls(), 0);
    assert_eq!(rendered.calls(), 0);
    assert_eq!(harness.sink.count(), 0);
}

#[tokio::test]
async fn test_all_strategies_time_out() {
    let direct = Scripted::new(StrategyKind::Direct, vec![Reply::Hang]);
    let proxied = Scripted::new(StrategyKind::Proxied, vec![Reply::Hang]);
    let rendered = Scripted::new(StrategyKind::Rendered, vec![Reply::Hang]);

    let harness = Harness::with_options(
        chain(&[&direct, &proxied, &rendered]),
        CooldownPolicy::default(),
        Duration::from_millis(100),
    );
    harness.add("https://slow.test/z");

    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.counts.failed, 1);

    let record = harness.record("https://slow.test/z");
    assert_eq!(record.status, UrlStatus::Failed);
    assert_eq!(direct.calls(), 1);
    assert!(proxied.calls() >= 1);

    let crawled_at = record.last_crawled_at.unwrap();
    assert_eq!(record.next_eligible_at, crawled_at + ChronoDuration::days(1));
    assert!(record.last_error.unwrap().contains("timeout"));
}

#[tokio::test]
async fn test_cooldown_prevents_refetch() {
    let direct = Scripted::new(StrategyKind::Direct, vec![Reply::Html("<p>W</p>")]);
    let harness = Harness::new(chain(&[&direct]));
    harness.add("https://w.test/");

    let first = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(first.counts.successful, 1);
    let after_first = harness.record("https://w.test/");

    let second = harness.orchestrator.run_once().await.unwrap();
    assert!(second.is_idle());
    assert_eq!(direct.calls(), 1);
    assert_eq!(harness.record("https://w.test/"), after_first);
}

#[tokio::test]
async fn test_nothing_due_makes_no_attempts() {
    let direct = Scripted::new(StrategyKind::Direct, vec![Reply::Html("<p>x</p>")]);
    let harness = Harness::new(chain(&[&direct]));

    let report = harness.orchestrator.run_once().await.unwrap();

    assert!(report.is_idle());
    assert_eq!(report.counts.total, 0);
    assert_eq!(direct.calls(), 0);
}

#[tokio::test]
async fn test_unchanged_content_forwarded_once() {
    let direct = Scripted::new(
        StrategyKind::Direct,
        vec![Reply::Html("<html><body>Same text</body></html>")],
    );
    let harness = Harness::with_options(
        chain(&[&direct]),
        immediate_recrawl(),
        Duration::from_secs(5),
    );
    harness.add("https://a.test/page");

    let first = harness.orchestrator.run_once().await.unwrap();
    let first_record = harness.record("https://a.test/page");
    let second = harness.orchestrator.run_once().await.unwrap();
    let second_record = harness.record("https://a.test/page");

    assert_eq!(first.counts.changed, 1);
    assert_eq!(second.counts.unchanged, 1);
    assert_eq!(harness.sink.count(), 1);

    assert_eq!(second_record.crawl_count, 2);
    assert_eq!(
        second_record.content_fingerprint,
        first_record.content_fingerprint
    );
    assert!(second_record.last_crawled_at >= first_record.last_crawled_at);
}

#[tokio::test]
async fn test_changed_content_forwarded_again() {
    let direct = Scripted::new(
        StrategyKind::Direct,
        vec![
            Reply::Html("<html><body>Version one</body></html>"),
            Reply::Html("<html><body>Version two</body></html>"),
        ],
    );
    let harness = Harness::with_options(
        chain(&[&direct]),
        immediate_recrawl(),
        Duration::from_secs(5),
    );
    harness.add("https://a.test/page");

    harness.orchestrator.run_once().await.unwrap();
    let second = harness.orchestrator.run_once().await.unwrap();

    assert_eq!(second.counts.changed, 1);
    assert_eq!(harness.sink.count(), 2);
    assert_eq!(harness.sink.last().text, "Version two");

    let record = harness.record("https://a.test/page");
    assert_eq!(
        record.content_fingerprint,
        Some(fingerprint("Version two"))
    );
}

#[tokio::test]
async fn test_escalation_order() {
    let direct = Scripted::new(StrategyKind::Direct, vec![Reply::Fail(ErrorKind::Blocked)]);
    let proxied = Scripted::new(StrategyKind::Proxied, vec![Reply::Html("<p>ok</p>")]);
    let rendered = Scripted::new(StrategyKind::Rendered, vec![Reply::Html("<p>ok</p>")]);

    let harness = Harness::new(chain(&[&rendered, &direct, &proxied]));
    harness.add("https://a.test/x");

    harness.orchestrator.run_once().await.unwrap();

    assert_eq!(direct.calls(), 1);
    assert_eq!(proxied.calls(), 1);
    assert_eq!(rendered.calls(), 0);
}

#[tokio::test]
async fn test_affinity_tries_last_successful_strategy_first() {
    let direct = Scripted::new(
        StrategyKind::Direct,
        vec![Reply::Fail(ErrorKind::Blocked)],
    );
    let proxied = Scripted::new(
        StrategyKind::Proxied,
        vec![
            Reply::Html("<p>first</p>"),
            Reply::Html("<p>second</p>"),
        ],
    );

    let harness = Harness::with_options(
        chain(&[&direct, &proxied]),
        immediate_recrawl(),
        Duration::from_secs(5),
    );
    harness.add("https://a.test/x");

    harness.orchestrator.run_once().await.unwrap();
    harness.orchestrator.run_once().await.unwrap();

    assert_eq!(direct.calls(), 1);
    assert_eq!(proxied.calls(), 2);
}

#[tokio::test]
async fn test_rate_limited_everywhere() {
    let direct = Scripted::new(
        StrategyKind::Direct,
        vec![Reply::Fail(ErrorKind::RateLimited)],
    );
    let proxied = Scripted::new(StrategyKind::Proxied, vec![Reply::Fail(ErrorKind::Network)]);

    let harness = Harness::new(chain(&[&direct, &proxied]));
    harness.add("https://busy.test/");

    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.counts.rate_limited, 1);

    let record = harness.record("https://busy.test/");
    assert_eq!(record.status, UrlStatus::RateLimited);
    let crawled_at = record.last_crawled_at.unwrap();
    assert_eq!(record.next_eligible_at, crawled_at + ChronoDuration::days(3));
}

#[tokio::test]
async fn test_seed_metadata_reaches_sink() {
    let direct = Scripted::new(StrategyKind::Direct, vec![Reply::Html("<p>Bio</p>")]);
    let harness = Harness::new(chain(&[&direct]));

    let seeds = parse_seeds(
        r#"[
            {"url": "https://uni.test/people/hopper", "faculty_name": "Grace Hopper", "department": "CS"},
            "https://uni.test/people/lovelace"
        ]"#,
    )
    .unwrap();
    let loaded = harness
        .orchestrator
        .tracker()
        .load_seeds(seeds, Utc::now())
        .unwrap();
    assert_eq!(loaded.added, 2);

    let report = harness.orchestrator.run_once().await.unwrap();
    assert_eq!(report.counts.changed, 2);

    let changes = harness.sink.changes.lock().unwrap();
    let hopper = changes
        .iter()
        .find(|c| c.url == "https://uni.test/people/hopper")
        .unwrap();
    assert_eq!(hopper.metadata.get("faculty_name"), Some(&json!("Grace Hopper")));
    assert_eq!(hopper.metadata.get("department"), Some(&json!("CS")));
    assert_eq!(hopper.content_type, ContentTag::Html);
}

#[tokio::test]
async fn test_from_config_writes_jsonl() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/faculty/ada"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_string("<html><head><title>Ada</title></head><body><main>Ada Lovelace</main></body></html>")
                .insert_header("content-type", "text/html"),
        )
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let sink_path = dir.path().join("changes.jsonl");

    let mut config = Config::default();
    config.tracker.database_path = dir.path().join("pulse.db").display().to_string();
    config.fetcher.delay_range = [0.0, 0.0];
    config.fetcher.max_retries_per_strategy = 1;
    config.fetcher.rate_limit_delay = 0;
    config.fetcher.enable_rendered = false;
    config.sink = SinkConfig {
        kind: SinkKind::Jsonl,
        path: Some(sink_path.display().to_string()),
    };

    let orchestrator = Orchestrator::from_config(&config, "hash").unwrap();
    let url = format!("{}/faculty/ada", server.uri());
    orchestrator
        .tracker()
        .add_url(&url, Map::new(), Utc::now())
        .unwrap();

    let report = orchestrator.run_once().await.unwrap();
    assert_eq!(report.counts.changed, 1);

    let lines = std::fs::read_to_string(&sink_path).unwrap();
    let change: serde_json::Value = serde_json::from_str(lines.lines().next().unwrap()).unwrap();
    assert_eq!(change["url"], url);
    assert_eq!(change["content_type"], "html");
    assert!(change["text"].as_str().unwrap().contains("Ada Lovelace"));

    let storage = orchestrator.tracker().storage();
    let run = storage.lock().unwrap().get_latest_run().unwrap().unwrap();
    assert_eq!(run.config_hash, "hash");
    assert_eq!(run.counts.successful, 1);
}
