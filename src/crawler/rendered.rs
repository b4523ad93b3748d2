//! Headless-browser strategy
//!
//! Launches one Chromium instance per attempt, loads the page, waits for the
//! network to go quiet and captures the rendered DOM. The browser process and
//! page are released on every exit path, including when the attempt future
//! is dropped by the escalation engine's timeout.

use crate::crawler::fetcher::{random_user_agent, ErrorKind, FetchAttempt, Strategy, StrategyKind};
use async_trait::async_trait;
use chromiumoxide::browser::{Browser, BrowserConfig};
use chromiumoxide::Page;
use futures::StreamExt;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;
use url::Url;

/// Owns the browser process and its CDP event loop
struct BrowserSession {
    browser: Option<Browser>,
    handler: JoinHandle<()>,
}

impl BrowserSession {
    async fn launch(user_agent: &str) -> Result<Self, String> {
        let config = BrowserConfig::builder()
            .arg(format!("--user-agent={}", user_agent))
            .arg("--disable-gpu")
            .arg("--no-first-run")
            .build()?;

        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| format!("failed to launch browser: {}", e))?;

        let handler = tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(Self {
            browser: Some(browser),
            handler,
        })
    }

    async fn open(&self, url: &Url) -> Result<PageGuard, String> {
        let browser = self
            .browser
            .as_ref()
            .ok_or_else(|| "browser already closed".to_string())?;
        let page = browser
            .new_page(url.as_str())
            .await
            .map_err(|e| format!("failed to open page: {}", e))?;
        Ok(PageGuard::new(page, url.to_string()))
    }

    async fn shutdown(mut self) {
        if let Some(mut browser) = self.browser.take() {
            if let Err(e) = browser.close().await {
                tracing::debug!("Browser close failed: {}", e);
            }
            let _ = browser.wait().await;
        }
        self.handler.abort();
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        // Dropping Browser kills the child process
        self.browser.take();
        self.handler.abort();
    }
}

/// Closes the page when an attempt ends without reaching the explicit close
struct PageGuard {
    page: Option<Page>,
    url: String,
}

impl PageGuard {
    fn new(page: Page, url: String) -> Self {
        Self {
            page: Some(page),
            url,
        }
    }

    fn page(&self) -> Option<&Page> {
        self.page.as_ref()
    }

    async fn close(mut self) {
        if let Some(page) = self.page.take() {
            if let Err(e) = page.close().await {
                tracing::debug!("Failed to close page for {}: {}", self.url, e);
            }
        }
    }
}

impl Drop for PageGuard {
    fn drop(&mut self) {
        if let Some(page) = self.page.take() {
            let url = std::mem::take(&mut self.url);
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = page.close().await {
                        tracing::debug!("Failed to close page for {} on drop: {}", url, e);
                    }
                });
            }
        }
    }
}

const IDLE_POLL: Duration = Duration::from_millis(250);
const IDLE_QUIET_POLLS: u32 = 2;

/// Readiness probe: document state plus resource requests issued so far
const NETWORK_PROBE: &str =
    "[document.readyState, performance.getEntriesByType('resource').length]";

/// Tracks successive readiness probes until the page stops loading
///
/// The page counts as idle once the document is complete and no new
/// resource request has been issued for `IDLE_QUIET_POLLS` polls.
#[derive(Debug, Default)]
struct QuietWindow {
    last_resources: Option<u64>,
    quiet_polls: u32,
}

impl QuietWindow {
    fn observe(&mut self, ready_state: &str, resources: u64) -> bool {
        if ready_state != "complete" {
            self.last_resources = None;
            self.quiet_polls = 0;
            return false;
        }
        if self.last_resources == Some(resources) {
            self.quiet_polls += 1;
        } else {
            self.quiet_polls = 0;
        }
        self.last_resources = Some(resources);
        self.quiet_polls >= IDLE_QUIET_POLLS
    }
}

/// Polls the page until its network is idle or `limit` elapses
async fn wait_for_network_idle(page: &Page, limit: Duration) {
    let deadline = Instant::now() + limit;
    let mut window = QuietWindow::default();

    while Instant::now() < deadline {
        let probe = match page.evaluate(NETWORK_PROBE).await {
            Ok(result) => result.into_value::<(String, u64)>().ok(),
            Err(e) => {
                tracing::debug!("Readiness probe failed: {}", e);
                None
            }
        };
        if let Some((state, resources)) = probe {
            if window.observe(&state, resources) {
                return;
            }
        }
        tokio::time::sleep(IDLE_POLL).await;
    }
    tracing::debug!("Network still busy after {:?}, capturing DOM anyway", limit);
}

/// Full browser rendering for pages that need client-side scripts
pub struct RenderedStrategy {
    settle: Duration,
}

impl RenderedStrategy {
    /// # Arguments
    ///
    /// * `settle` - Extra wait once the page's network has gone idle
    pub fn new(settle: Duration) -> Self {
        Self { settle }
    }

    async fn render(&self, url: &Url, timeout: Duration) -> Result<String, String> {
        let session = BrowserSession::launch(random_user_agent()).await?;

        let rendered = async {
            let guard = session.open(url).await?;
            let page = guard.page().ok_or_else(|| "page already closed".to_string())?;

            page.wait_for_navigation()
                .await
                .map_err(|e| format!("navigation failed: {}", e))?;
            // Half the attempt budget, leaving room to capture a busy page
            wait_for_network_idle(page, timeout / 2).await;
            tokio::time::sleep(self.settle).await;
            let html = page
                .content()
                .await
                .map_err(|e| format!("failed to read DOM: {}", e))?;

            guard.close().await;
            Ok::<String, String>(html)
        }
        .await;

        session.shutdown().await;
        rendered
    }
}

#[async_trait]
impl Strategy for RenderedStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Rendered
    }

    async fn fetch(&self, url: &Url, timeout: Duration) -> FetchAttempt {
        let started = Instant::now();

        match self.render(url, timeout).await {
            Ok(html) => FetchAttempt::succeeded(
                StrategyKind::Rendered,
                None,
                html.into_bytes(),
                Some("text/html".to_string()),
                started.elapsed(),
            ),
            Err(message) => {
                tracing::debug!(url = %url, "Rendered attempt failed: {}", message);
                FetchAttempt::failed(
                    StrategyKind::Rendered,
                    ErrorKind::Network,
                    None,
                    message,
                    started.elapsed(),
                )
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_quiet_window_needs_complete_document() {
        let mut window = QuietWindow::default();
        assert!(!window.observe("loading", 3));
        assert!(!window.observe("interactive", 3));
        assert!(!window.observe("interactive", 3));
        assert!(!window.observe("complete", 3));
        assert!(!window.observe("complete", 3));
        assert!(window.observe("complete", 3));
    }

    #[test]
    fn test_quiet_window_resets_on_new_requests() {
        let mut window = QuietWindow::default();
        window.observe("complete", 4);
        window.observe("complete", 4);
        assert!(!window.observe("complete", 6));
        assert!(!window.observe("complete", 6));
        assert!(window.observe("complete", 6));
    }
}
