//! URL handling module
//!
//! Tracked records are keyed by normalized URL and grouped by domain for
//! per-domain concurrency limits.

mod domain;
mod normalize;

pub use domain::extract_domain;
pub use normalize::{normalize_key, normalize_url};

use crate::UrlError;
use url::Url;

/// Normalizes a URL and extracts its domain in one step
///
/// # Returns
///
/// * `Ok((Url, String))` - The normalized URL and its domain
/// * `Err(UrlError)` - The URL could not be parsed or has no host
pub fn normalize_with_domain(url_str: &str) -> Result<(Url, String), UrlError> {
    let url = normalize_url(url_str)?;
    let domain = extract_domain(&url).ok_or(UrlError::MissingDomain)?;
    Ok((url, domain))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_with_domain() {
        let (url, domain) = normalize_with_domain("https://Docs.Example.org/a/").unwrap();
        assert_eq!(url.as_str(), "https://docs.example.org/a");
        assert_eq!(domain, "docs.example.org");
    }

    #[test]
    fn test_normalize_with_domain_rejects_mailto() {
        assert!(normalize_with_domain("mailto:someone@example.org").is_err());
    }
}
