//! Fetch transports.
//!
//! The controller only sees the `FetchTransport` trait. Strategies map onto
//! a closed set of transport configurations, so an invalid strategy/config
//! pairing cannot be constructed.

mod http;
mod user_agent;

#[cfg(feature = "browser")]
mod browser;
#[cfg(feature = "browser")]
mod stealth;

pub use http::HttpTransport;
pub use user_agent::{browser_user_agent, UserAgentMode, CRAWLER_USER_AGENT};

#[cfg(feature = "browser")]
pub use browser::{BrowserSettings, BrowserTransport};

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::access::Strategy;

/// Rendering knobs for browser-backed strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrowserProfile {
    pub headless: bool,
    /// Inject anti-fingerprinting patches before reading the page.
    pub stealth: bool,
    /// Extra wait after load for late scripts and challenge redirects.
    pub settle: Duration,
}

/// How a strategy is executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportConfig {
    /// Plain HTTP client.
    Http,
    /// Browser render with the given profile.
    Browser(BrowserProfile),
}

impl TransportConfig {
    /// Closed mapping from ladder step to transport behaviour.
    pub fn for_strategy(strategy: Strategy) -> Self {
        match strategy {
            Strategy::Requests => Self::Http,
            Strategy::Js => Self::Browser(BrowserProfile {
                headless: true,
                stealth: false,
                settle: Duration::from_millis(500),
            }),
            Strategy::Stealth => Self::Browser(BrowserProfile {
                headless: true,
                stealth: true,
                settle: Duration::from_secs(2),
            }),
            Strategy::StealthPatient => Self::Browser(BrowserProfile {
                headless: true,
                stealth: true,
                settle: Duration::from_secs(8),
            }),
            Strategy::Visible => Self::Browser(BrowserProfile {
                headless: false,
                stealth: false,
                settle: Duration::from_secs(5),
            }),
        }
    }

    pub fn is_browser(&self) -> bool {
        matches!(self, Self::Browser(_))
    }
}

/// Raw result of one fetch, before classification.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchResponse {
    /// HTTP status, when the transport exposes one.
    pub status: Option<u16>,
    /// Response headers with lowercased names.
    pub headers: BTreeMap<String, String>,
    pub body: Vec<u8>,
    pub final_url: Option<String>,
    pub duration_ms: u64,
}

impl FetchResponse {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    pub fn content_type(&self) -> Option<&str> {
        self.header("content-type")
    }

    pub fn body_text(&self) -> std::borrow::Cow<'_, str> {
        String::from_utf8_lossy(&self.body)
    }
}

/// Transport-level failures. Never escape the access controller.
#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum TransportError {
    #[error("timed out after {0:?}")]
    Timeout(Duration),
    #[error("connection failed: {0}")]
    Connect(String),
    #[error("dns resolution failed: {0}")]
    Dns(String),
    #[error("tls failure: {0}")]
    Tls(String),
    #[error("navigation failed: {0}")]
    Navigation(String),
    #[error("transport not available: {0}")]
    Unsupported(String),
    #[error("{0}")]
    Other(String),
}

impl TransportError {
    /// Whether this is a network-level failure (as opposed to a timeout or a bug).
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            Self::Connect(_) | Self::Dns(_) | Self::Tls(_) | Self::Navigation(_)
        )
    }

    /// Sort an opaque error message into a variant by its wording.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lower = message.to_lowercase();
        if lower.contains("timed out") || lower.contains("timeout") {
            Self::Timeout(Duration::ZERO)
        } else if lower.contains("dns") || lower.contains("failed to lookup address") {
            Self::Dns(message)
        } else if lower.contains("certificate") || lower.contains("tls") || lower.contains("ssl") {
            Self::Tls(message)
        } else if lower.contains("connection refused")
            || lower.contains("connection reset")
            || lower.contains("error sending request")
        {
            Self::Connect(message)
        } else if lower.contains("net::err_") || lower.contains("navigat") {
            Self::Navigation(message)
        } else {
            Self::Other(message)
        }
    }
}

/// Executes one fetch for one strategy's transport configuration.
#[async_trait]
pub trait FetchTransport: Send + Sync {
    async fn fetch(
        &self,
        url: &str,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError>;

    /// Whether `config` can run at all. Unsupported strategies are left out of the plan.
    fn supports(&self, _config: &TransportConfig) -> bool {
        true
    }
}

/// Dispatches to the HTTP client or the browser by configuration.
pub struct Transports {
    http: HttpTransport,
    #[cfg(feature = "browser")]
    browser: Option<BrowserTransport>,
}

impl Transports {
    pub fn new(http: HttpTransport) -> Self {
        Self {
            http,
            #[cfg(feature = "browser")]
            browser: None,
        }
    }

    #[cfg(feature = "browser")]
    pub fn with_browser(mut self, browser: BrowserTransport) -> Self {
        self.browser = Some(browser);
        self
    }

    /// Release browser processes, if any were started.
    pub async fn shutdown(&self) {
        #[cfg(feature = "browser")]
        if let Some(browser) = &self.browser {
            browser.close().await;
        }
    }
}

#[async_trait]
impl FetchTransport for Transports {
    fn supports(&self, config: &TransportConfig) -> bool {
        match config {
            TransportConfig::Http => true,
            #[cfg(feature = "browser")]
            TransportConfig::Browser(_) => self.browser.is_some(),
            #[cfg(not(feature = "browser"))]
            TransportConfig::Browser(_) => false,
        }
    }

    async fn fetch(
        &self,
        url: &str,
        config: &TransportConfig,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError> {
        match config {
            TransportConfig::Http => self.http.get(url, timeout).await,
            #[cfg(feature = "browser")]
            TransportConfig::Browser(profile) => match &self.browser {
                Some(browser) => browser.render(url, profile, timeout).await,
                None => Err(TransportError::Unsupported(
                    "browser transport not configured".to_string(),
                )),
            },
            #[cfg(not(feature = "browser"))]
            TransportConfig::Browser(_) => Err(TransportError::Unsupported(
                "built without the `browser` feature".to_string(),
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_http_only_transports_support_requests_only() {
        let http = HttpTransport::new(None, None).unwrap();
        let transports = Transports::new(http);
        assert!(transports.supports(&TransportConfig::for_strategy(Strategy::Requests)));
        for strategy in Strategy::LADDER.into_iter().skip(1) {
            assert!(!transports.supports(&TransportConfig::for_strategy(strategy)));
        }
    }

    #[test]
    fn test_strategy_mapping_is_closed() {
        assert_eq!(
            TransportConfig::for_strategy(Strategy::Requests),
            TransportConfig::Http
        );
        for strategy in Strategy::LADDER.into_iter().skip(1) {
            assert!(TransportConfig::for_strategy(strategy).is_browser());
        }
        match TransportConfig::for_strategy(Strategy::Visible) {
            TransportConfig::Browser(profile) => assert!(!profile.headless),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_patient_settles_longer_than_stealth() {
        let settle = |s| match TransportConfig::for_strategy(s) {
            TransportConfig::Browser(p) => p.settle,
            TransportConfig::Http => Duration::ZERO,
        };
        assert!(settle(Strategy::StealthPatient) > settle(Strategy::Stealth));
    }

    #[test]
    fn test_error_from_message() {
        assert!(matches!(
            TransportError::from_message("operation timed out"),
            TransportError::Timeout(_)
        ));
        assert!(matches!(
            TransportError::from_message("failed to lookup address information"),
            TransportError::Dns(_)
        ));
        assert!(matches!(
            TransportError::from_message("net::ERR_CONNECTION_CLOSED"),
            TransportError::Navigation(_)
        ));
        assert!(TransportError::from_message("invalid certificate").is_network());
        assert!(!TransportError::from_message("boom").is_network());
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let mut response = FetchResponse::default();
        response
            .headers
            .insert("content-type".to_string(), "text/html".to_string());
        assert_eq!(response.header("Content-Type"), Some("text/html"));
    }
}
