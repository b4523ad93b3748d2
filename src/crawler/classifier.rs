//! Content classification and text extraction
//!
//! The type of a response is decided from its leading bytes, reconciled with
//! the declared `Content-Type`. The URL's extension is never consulted: a
//! `.pdf` link that answers with an HTML error page is an HTML page.

use scraper::{Html, Node};
use serde::Serialize;
use std::fmt;
use std::io::Write;
use std::process::Command;
use thiserror::Error;

/// How many leading bytes the sniffer looks at
const SNIFF_WINDOW: usize = 1024;

/// Elements whose text never reaches the extracted output
const SKIPPED_ELEMENTS: &[&str] = &[
    "script", "style", "noscript", "nav", "header", "footer", "aside", "iframe", "template",
];

/// Closed set of content types the crawler forwards
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentTag {
    Html,
    Pdf,
    Unknown,
}

impl ContentTag {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Html => "html",
            Self::Pdf => "pdf",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for ContentTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the leading bytes look like
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Signature {
    Empty,
    Pdf,
    Html,
    /// Binary payload with a recognised magic number
    Binary(&'static str),
    Text,
}

impl Signature {
    fn describe(&self) -> &'static str {
        match self {
            Self::Empty => "empty body",
            Self::Pdf => "pdf",
            Self::Html => "html",
            Self::Binary(mime) => mime,
            Self::Text => "text",
        }
    }
}

/// Declared and detected types disagree
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ClassifyError {
    #[error("response body is empty")]
    Empty,

    #[error("declared {declared} but content looks like {detected}")]
    Mismatch {
        declared: String,
        detected: &'static str,
    },
}

/// Inspects leading bytes to decide what a body actually is
pub fn sniff(raw: &[u8]) -> Signature {
    let head = &raw[..raw.len().min(SNIFF_WINDOW)];
    let trimmed = trim_leading(head);

    if trimmed.is_empty() {
        return Signature::Empty;
    }

    if trimmed.starts_with(b"%PDF-") {
        return Signature::Pdf;
    }

    if looks_like_html(trimmed) {
        return Signature::Html;
    }

    // Some PDFs carry junk before the header
    if head.windows(5).any(|w| w == b"%PDF-") {
        return Signature::Pdf;
    }

    if let Some(kind) = infer::get(raw) {
        let mime = kind.mime_type();
        if !mime.starts_with("text/") && mime != "application/xml" {
            return Signature::Binary(mime);
        }
    }

    if head.contains(&0) {
        return Signature::Binary("application/octet-stream");
    }

    Signature::Text
}

/// Classifies a fetched body, given its declared `Content-Type`
///
/// # Rules
///
/// | Detected | Declared html | Declared pdf | Other / none |
/// |----------|---------------|--------------|--------------|
/// | pdf      | mismatch      | Pdf          | Pdf          |
/// | html     | Html          | mismatch     | Html         |
/// | binary   | mismatch      | mismatch     | Unknown      |
/// | text     | Html          | mismatch     | Unknown      |
///
/// An empty body is always an error.
pub fn classify(raw: &[u8], declared: Option<&str>) -> Result<ContentTag, ClassifyError> {
    let declared_mime = declared.map(media_type);
    let declared_html = declared_mime.as_deref().map_or(false, is_html_mime);
    let declared_pdf = declared_mime.as_deref().map_or(false, is_pdf_mime);

    let signature = sniff(raw);
    let mismatch = || ClassifyError::Mismatch {
        declared: declared_mime.clone().unwrap_or_default(),
        detected: signature.describe(),
    };

    match signature {
        Signature::Empty => Err(ClassifyError::Empty),
        Signature::Pdf if declared_html => Err(mismatch()),
        Signature::Pdf => Ok(ContentTag::Pdf),
        Signature::Html if declared_pdf => Err(mismatch()),
        Signature::Html => Ok(ContentTag::Html),
        Signature::Binary(_) if declared_html || declared_pdf => Err(mismatch()),
        Signature::Binary(_) => Ok(ContentTag::Unknown),
        Signature::Text if declared_pdf => Err(mismatch()),
        Signature::Text if declared_html => Ok(ContentTag::Html),
        Signature::Text => Ok(ContentTag::Unknown),
    }
}

fn media_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

fn is_html_mime(mime: &str) -> bool {
    matches!(mime, "text/html" | "application/xhtml+xml")
}

fn is_pdf_mime(mime: &str) -> bool {
    matches!(mime, "application/pdf" | "application/x-pdf")
}

fn trim_leading(bytes: &[u8]) -> &[u8] {
    let bytes = bytes.strip_prefix(b"\xEF\xBB\xBF").unwrap_or(bytes);
    let start = bytes
        .iter()
        .position(|b| !b.is_ascii_whitespace())
        .unwrap_or(bytes.len());
    &bytes[start..]
}

fn looks_like_html(trimmed: &[u8]) -> bool {
    let lower = trimmed.to_ascii_lowercase();
    const OPENERS: &[&[u8]] = &[b"<!doctype html", b"<html", b"<head", b"<body"];

    if OPENERS.iter().any(|o| lower.starts_with(o)) {
        return true;
    }

    // Comments or an XML prolog may precede the root element
    (lower.starts_with(b"<!--") || lower.starts_with(b"<?xml"))
        && lower.windows(5).any(|w| w == b"<html")
}

/// Errors raised while turning raw content into plain text
#[derive(Debug, Error)]
pub enum ExtractError {
    #[error("External tool not found: {0}")]
    ToolNotFound(String),

    #[error("Extraction failed: {0}")]
    Failed(String),

    #[error("Content is not valid UTF-8 text")]
    Undecodable,

    #[error("No text could be extracted")]
    Empty,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Converts raw content of one type into plain text
pub trait Extractor: Send + Sync {
    fn extract(&self, raw: &[u8]) -> Result<String, ExtractError>;
}

/// Collapses all whitespace runs into single spaces
pub fn collapse_whitespace(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Visible text of an HTML document, chrome and scripts removed
pub struct HtmlExtractor;

impl Extractor for HtmlExtractor {
    fn extract(&self, raw: &[u8]) -> Result<String, ExtractError> {
        let html = String::from_utf8_lossy(raw);
        let document = Html::parse_document(&html);

        let mut text = String::new();
        for node in document.tree.root().descendants() {
            let Node::Text(fragment) = node.value() else {
                continue;
            };

            let hidden = node.ancestors().any(|ancestor| {
                ancestor
                    .value()
                    .as_element()
                    .map_or(false, |el| SKIPPED_ELEMENTS.contains(&el.name()))
            });

            if !hidden {
                text.push_str(fragment);
                text.push(' ');
            }
        }

        non_empty(collapse_whitespace(&text))
    }
}

/// Treats the body as UTF-8 text
pub struct PlainTextExtractor;

impl Extractor for PlainTextExtractor {
    fn extract(&self, raw: &[u8]) -> Result<String, ExtractError> {
        let text = std::str::from_utf8(raw).map_err(|_| ExtractError::Undecodable)?;
        non_empty(collapse_whitespace(text))
    }
}

/// Runs poppler's `pdftotext` over a scratch copy of the document
pub struct PdfExtractor {
    binary: String,
}

impl PdfExtractor {
    pub fn new() -> Self {
        Self::with_binary("pdftotext")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

impl Default for PdfExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl Extractor for PdfExtractor {
    fn extract(&self, raw: &[u8]) -> Result<String, ExtractError> {
        let mut scratch = tempfile::Builder::new().suffix(".pdf").tempfile()?;
        scratch.write_all(raw)?;
        scratch.flush()?;

        let output = Command::new(&self.binary)
            .args(["-layout", "-enc", "UTF-8"])
            .arg(scratch.path())
            .arg("-")
            .output();

        let text = handle_cmd_output(output, &self.binary)?;
        non_empty(collapse_whitespace(&text))
    }
}

fn handle_cmd_output(
    result: std::io::Result<std::process::Output>,
    tool_name: &str,
) -> Result<String, ExtractError> {
    match result {
        Ok(output) if output.status.success() => {
            Ok(String::from_utf8_lossy(&output.stdout).into_owned())
        }
        Ok(output) => Err(ExtractError::Failed(format!(
            "{} exited with {}: {}",
            tool_name,
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(ExtractError::ToolNotFound(tool_name.to_string()))
        }
        Err(e) => Err(ExtractError::Io(e)),
    }
}

fn non_empty(text: String) -> Result<String, ExtractError> {
    if text.is_empty() {
        Err(ExtractError::Empty)
    } else {
        Ok(text)
    }
}

/// One extractor per content tag
pub struct ExtractorSet {
    html: Box<dyn Extractor>,
    pdf: Box<dyn Extractor>,
    unknown: Box<dyn Extractor>,
}

impl ExtractorSet {
    pub fn new(
        html: Box<dyn Extractor>,
        pdf: Box<dyn Extractor>,
        unknown: Box<dyn Extractor>,
    ) -> Self {
        Self { html, pdf, unknown }
    }

    pub fn extract(&self, tag: ContentTag, raw: &[u8]) -> Result<String, ExtractError> {
        match tag {
            ContentTag::Html => self.html.extract(raw),
            ContentTag::Pdf => self.pdf.extract(raw),
            ContentTag::Unknown => self.unknown.extract(raw),
        }
    }
}

impl Default for ExtractorSet {
    fn default() -> Self {
        Self::new(
            Box::new(HtmlExtractor),
            Box::new(PdfExtractor::new()),
            Box::new(PlainTextExtractor),
        )
    }
}
