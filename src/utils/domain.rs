//! Domain normalization.

use url::Url;

/// Extract the lowercased host from a URL.
pub fn extract_domain(url: &str) -> Option<String> {
    Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|s| s.to_ascii_lowercase()))
}

/// Key for per-domain state: the host without a leading `www.`.
///
/// Accepts either a URL or a bare host name.
pub fn domain_key(url_or_host: &str) -> String {
    let host = extract_domain(url_or_host)
        .unwrap_or_else(|| url_or_host.trim().trim_end_matches('/').to_ascii_lowercase());
    host.strip_prefix("www.").map(str::to_string).unwrap_or(host)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_domain() {
        assert_eq!(
            extract_domain("https://Careers.Example.com/jobs?id=1"),
            Some("careers.example.com".to_string())
        );
        assert_eq!(extract_domain("not a url"), None);
    }

    #[test]
    fn test_domain_key_strips_www() {
        assert_eq!(domain_key("https://www.example.com/about"), "example.com");
        assert_eq!(domain_key("WWW.Example.com"), "example.com");
        assert_eq!(domain_key("example.com/"), "example.com");
    }
}
