//! Seed input parsing
//!
//! A seed file is a JSON array of entries (or a single entry). Each entry
//! names a `url` and optionally a `metadata` object; any other top-level
//! fields are folded into the metadata, so files in the flat
//! `{url, faculty_name, department, ...}` layout load unchanged.

use crate::PulseError;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::path::Path;

/// One seed URL and the correlation fields that travel with it
#[derive(Debug, Clone, Deserialize)]
pub struct SeedEntry {
    pub url: String,

    #[serde(
        default,
        alias = "correlation_metadata",
        alias = "correlationMetadata"
    )]
    pub metadata: Map<String, Value>,

    #[serde(flatten)]
    extra: Map<String, Value>,
}

impl SeedEntry {
    pub fn new(url: impl Into<String>, metadata: Map<String, Value>) -> Self {
        Self {
            url: url.into(),
            metadata,
            extra: Map::new(),
        }
    }

    /// Splits into the URL and merged metadata
    ///
    /// Fields inside `metadata` win over top-level fields of the same name.
    pub fn into_parts(self) -> (String, Map<String, Value>) {
        let mut merged = self.extra;
        merged.extend(self.metadata);
        (self.url, merged)
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedItem {
    Bare(String),
    Entry(SeedEntry),
}

impl From<SeedItem> for SeedEntry {
    fn from(item: SeedItem) -> Self {
        match item {
            SeedItem::Bare(url) => SeedEntry::new(url, Map::new()),
            SeedItem::Entry(entry) => entry,
        }
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum SeedDocument {
    Many(Vec<SeedItem>),
    One(SeedEntry),
}

/// Parses a seed document, preserving entry order
pub fn parse_seeds(json: &str) -> Result<Vec<SeedEntry>, PulseError> {
    let document: SeedDocument = serde_json::from_str(json)
        .map_err(|e| PulseError::Seeds(format!("invalid seed document: {}", e)))?;

    Ok(match document {
        SeedDocument::Many(items) => items.into_iter().map(SeedEntry::from).collect(),
        SeedDocument::One(entry) => vec![entry],
    })
}

/// Reads and parses a seed file
pub fn read_seeds(path: &Path) -> Result<Vec<SeedEntry>, PulseError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| PulseError::Seeds(format!("cannot read {}: {}", path.display(), e)))?;
    parse_seeds(&content)
}

/// Outcome of a bulk seed load
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LoadReport {
    pub added: usize,
    pub already_present: usize,
    /// Entries rejected by URL normalization, with the reason
    pub invalid: Vec<(String, String)>,
}
