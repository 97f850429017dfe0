//! Plain HTTP transport for the `requests` strategy.

use std::collections::BTreeMap;
use std::error::Error as _;
use std::time::{Duration, Instant};

use reqwest::Client;
use tracing::debug;

use super::user_agent::UserAgentMode;
use super::{FetchResponse, TransportError};

/// HTTP client with a per-run cookie jar.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    /// Create a client.
    /// - `user_agent`: see [`UserAgentMode::from_setting`]
    /// - `proxy`: optional proxy URL (http, https or socks5)
    pub fn new(user_agent: Option<&str>, proxy: Option<&str>) -> Result<Self, TransportError> {
        let mut builder = Client::builder()
            .user_agent(UserAgentMode::from_setting(user_agent).header_value(&mut rand::thread_rng()))
            .cookie_store(true)
            .gzip(true)
            .brotli(true)
            .redirect(reqwest::redirect::Policy::limited(10));

        if let Some(proxy) = proxy {
            let proxy = reqwest::Proxy::all(proxy)
                .map_err(|e| TransportError::Other(format!("invalid proxy {}: {}", proxy, e)))?;
            builder = builder.proxy(proxy);
        }

        let client = builder
            .build()
            .map_err(|e| TransportError::Other(format!("failed to create HTTP client: {}", e)))?;
        Ok(Self { client })
    }

    /// GET `url`, reading the whole body within `timeout`.
    pub async fn get(&self, url: &str, timeout: Duration) -> Result<FetchResponse, TransportError> {
        let start = Instant::now();
        let response = self
            .client
            .get(url)
            .header("Accept", "text/html,application/xhtml+xml;q=0.9,*/*;q=0.8")
            .header("Accept-Language", "en-US,en;q=0.9")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?;

        let status = response.status().as_u16();
        let final_url = response.url().to_string();
        let mut headers = BTreeMap::new();
        for (name, value) in response.headers() {
            if let Ok(v) = value.to_str() {
                headers
                    .entry(name.as_str().to_ascii_lowercase())
                    .and_modify(|existing: &mut String| {
                        existing.push_str(", ");
                        existing.push_str(v);
                    })
                    .or_insert_with(|| v.to_string());
            }
        }

        let body = response
            .bytes()
            .await
            .map_err(|e| map_reqwest_error(e, timeout))?
            .to_vec();

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(url, status, bytes = body.len(), duration_ms, "HTTP fetch complete");

        Ok(FetchResponse {
            status: Some(status),
            headers,
            body,
            final_url: Some(final_url),
            duration_ms,
        })
    }
}

fn map_reqwest_error(error: reqwest::Error, timeout: Duration) -> TransportError {
    if error.is_timeout() {
        return TransportError::Timeout(timeout);
    }

    // reqwest wraps the interesting cause (hyper, rustls, resolver) a few levels down.
    let mut chain = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        chain.push_str(": ");
        chain.push_str(&cause.to_string());
        source = cause.source();
    }

    match TransportError::from_message(chain.clone()) {
        TransportError::Other(_) if error.is_connect() => TransportError::Connect(chain),
        TransportError::Other(_) if error.is_request() => TransportError::Connect(chain),
        classified => classified,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_builds_with_defaults() {
        assert!(HttpTransport::new(None, None).is_ok());
        assert!(HttpTransport::new(Some("impersonate"), None).is_ok());
    }

    #[test]
    fn test_invalid_proxy_rejected() {
        assert!(HttpTransport::new(None, Some("not a url")).is_err());
    }

    #[tokio::test]
    async fn test_unreachable_host_is_network_error() {
        let transport = HttpTransport::new(None, None).unwrap();
        // Port 9 on localhost (discard) is closed in test environments.
        let err = transport
            .get("http://127.0.0.1:9/", Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.is_network() || matches!(err, TransportError::Timeout(_)));
    }
}
