//! Downstream sinks for changed content
//!
//! The orchestrator calls a sink once per genuine content change, before the
//! new fingerprint is committed. A sink error leaves the old fingerprint in
//! place, so the change is detected and delivered again on the next crawl.

use crate::config::{SinkConfig, SinkKind};
use crate::crawler::ContentTag;
use crate::PulseError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Errors a sink can report back to the orchestrator
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("Change rejected: {0}")]
    Rejected(String),
}

/// One changed document, as handed downstream
#[derive(Debug, Clone, Serialize)]
pub struct ContentChange {
    pub url: String,
    pub text: String,
    pub content_type: ContentTag,
    /// Correlation fields from the URL record, unmodified
    pub metadata: Map<String, Value>,
    pub fingerprint: String,
    pub fetched_at: DateTime<Utc>,
}

/// Consumer of changed content
#[async_trait]
pub trait ContentSink: Send + Sync {
    /// Delivers one change; `Ok` acknowledges it
    async fn on_content_changed(&self, change: &ContentChange) -> Result<(), SinkError>;
}

/// Appends one JSON object per change to a file
pub struct JsonlSink {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonlSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl ContentSink for JsonlSink {
    async fn on_content_changed(&self, change: &ContentChange) -> Result<(), SinkError> {
        let mut line = serde_json::to_vec(change)?;
        line.push(b'\n');

        let mut guard = self.file.lock().await;
        if guard.is_none() {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(&self.path)
                .await?;
            *guard = Some(file);
        }

        if let Some(file) = guard.as_mut() {
            file.write_all(&line).await?;
            file.flush().await?;
        }

        Ok(())
    }
}

/// Logs changes and discards them
pub struct LogSink;

#[async_trait]
impl ContentSink for LogSink {
    async fn on_content_changed(&self, change: &ContentChange) -> Result<(), SinkError> {
        tracing::info!(
            url = %change.url,
            content_type = %change.content_type,
            chars = change.text.chars().count(),
            fingerprint = %change.fingerprint,
            "Content changed"
        );
        Ok(())
    }
}

/// Builds the sink named in the configuration
pub fn build_sink(config: &SinkConfig) -> Result<Arc<dyn ContentSink>, PulseError> {
    match config.kind {
        SinkKind::Jsonl => {
            let path = config
                .path
                .as_deref()
                .filter(|p| !p.is_empty())
                .ok_or_else(|| {
                    PulseError::Config(crate::ConfigError::Validation(
                        "jsonl sink requires a path".to_string(),
                    ))
                })?;
            Ok(Arc::new(JsonlSink::new(path)))
        }
        SinkKind::Log => Ok(Arc::new(LogSink)),
    }
}
