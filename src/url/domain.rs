use url::Url;

/// Extracts the domain a URL is grouped under for per-domain politeness
///
/// The host is lowercased. A non-default port is kept, since two services on
/// different ports of one host are throttled independently.
///
/// # Examples
///
/// ```
/// use url::Url;
/// use pulse_crawler::url::extract_domain;
///
/// let url = Url::parse("https://EXAMPLE.com/path").unwrap();
/// assert_eq!(extract_domain(&url), Some("example.com".to_string()));
///
/// let url = Url::parse("http://127.0.0.1:8080/").unwrap();
/// assert_eq!(extract_domain(&url), Some("127.0.0.1:8080".to_string()));
/// ```
pub fn extract_domain(url: &Url) -> Option<String> {
    let host = url.host_str()?.to_lowercase();
    match url.port() {
        Some(port) => Some(format!("{}:{}", host, port)),
        None => Some(host),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_subdomain() {
        let url = Url::parse("https://physics.example.edu/people").unwrap();
        assert_eq!(extract_domain(&url), Some("physics.example.edu".to_string()));
    }

    #[test]
    fn test_default_port_dropped() {
        let url = Url::parse("https://example.com:443/").unwrap();
        assert_eq!(extract_domain(&url), Some("example.com".to_string()));
    }

    #[test]
    fn test_explicit_port_kept() {
        let url = Url::parse("https://example.com:8443/").unwrap();
        assert_eq!(extract_domain(&url), Some("example.com:8443".to_string()));
    }

    #[test]
    fn test_mixed_case() {
        let url = Url::parse("https://Example.COM/").unwrap();
        assert_eq!(extract_domain(&url), Some("example.com".to_string()));
    }
}
