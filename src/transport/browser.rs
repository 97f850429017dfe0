//! Browser transport for the `js`, `stealth`, `stealth_patient` and `visible`
//! strategies.
//!
//! Uses chromiumoxide (CDP). Headless and headed renders use separate
//! browser processes, launched on first use.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use chromiumoxide::cdp::browser_protocol::network::SetUserAgentOverrideParams;
use chromiumoxide::cdp::browser_protocol::page::NavigateParams;
use chromiumoxide::{Browser, BrowserConfig, Page};
use futures::StreamExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::stealth::{READY_STATE_SCRIPT, STEALTH_PATCHES};
use super::user_agent::browser_user_agent;
use super::{BrowserProfile, FetchResponse, TransportError};

/// Common Chrome executable paths to check.
const CHROME_PATHS: &[&str] = &[
    "/usr/bin/google-chrome",
    "/usr/bin/google-chrome-stable",
    "/usr/bin/chromium",
    "/usr/bin/chromium-browser",
    "/snap/bin/chromium",
    "/Applications/Google Chrome.app/Contents/MacOS/Google Chrome",
    "/Applications/Chromium.app/Contents/MacOS/Chromium",
];

const CHROME_COMMANDS: &[&str] = &[
    "google-chrome",
    "google-chrome-stable",
    "chromium",
    "chromium-browser",
];

/// Chrome launch settings.
#[derive(Debug, Clone, Default)]
pub struct BrowserSettings {
    /// Remote DevTools endpoint (e.g. "ws://localhost:9222"). Used for headless renders.
    pub remote_url: Option<String>,
    /// Proxy server URL.
    pub proxy: Option<String>,
    /// Additional Chrome arguments.
    pub chrome_args: Vec<String>,
}

pub struct BrowserTransport {
    settings: BrowserSettings,
    headless: Mutex<Option<Browser>>,
    headed: Mutex<Option<Browser>>,
}

impl BrowserTransport {
    pub fn new(settings: BrowserSettings) -> Self {
        Self {
            settings,
            headless: Mutex::new(None),
            headed: Mutex::new(None),
        }
    }

    /// Render `url` with `profile`, bounded by `timeout`.
    pub async fn render(
        &self,
        url: &str,
        profile: &BrowserProfile,
        timeout: Duration,
    ) -> Result<FetchResponse, TransportError> {
        let slot = if profile.headless {
            &self.headless
        } else {
            &self.headed
        };
        let mut guard = slot.lock().await;
        if guard.is_none() {
            *guard = Some(self.start(profile.headless).await?);
        }
        let browser = guard
            .as_ref()
            .ok_or_else(|| TransportError::Other("browser slot empty after launch".into()))?;

        let start = Instant::now();
        let page = browser
            .new_page("about:blank")
            .await
            .map_err(|e| TransportError::Other(format!("failed to open page: {}", e)))?;

        let result = tokio::time::timeout(timeout, render_page(&page, url, profile)).await;
        let _ = page.close().await;

        match result {
            Ok(Ok(mut response)) => {
                response.duration_ms = start.elapsed().as_millis() as u64;
                Ok(response)
            }
            Ok(Err(e)) => Err(e),
            Err(_) => Err(TransportError::Timeout(timeout)),
        }
    }

    /// Close any launched browsers.
    pub async fn close(&self) {
        for slot in [&self.headless, &self.headed] {
            if let Some(mut browser) = slot.lock().await.take() {
                if let Err(e) = browser.close().await {
                    debug!("Browser close failed: {}", e);
                }
            }
        }
    }

    async fn start(&self, headless: bool) -> Result<Browser, TransportError> {
        if headless {
            if let Some(remote) = self.settings.remote_url.clone() {
                return connect_remote(&remote).await;
            }
        }

        info!("Launching browser (headless={})", headless);
        let chrome = find_chrome()?;
        let mut builder = BrowserConfig::builder().chrome_executable(chrome);
        if !headless {
            builder = builder.with_head();
        }
        if let Some(ref proxy) = self.settings.proxy {
            builder = builder.arg(format!("--proxy-server={}", proxy));
        }
        builder = builder
            .arg("--disable-blink-features=AutomationControlled")
            .arg("--disable-infobars")
            .arg("--disable-dev-shm-usage")
            .arg("--no-first-run")
            .arg("--no-default-browser-check")
            .arg("--no-sandbox");
        for arg in &self.settings.chrome_args {
            builder = builder.arg(arg);
        }

        let config = builder
            .build()
            .map_err(|e| TransportError::Unsupported(format!("invalid browser config: {}", e)))?;
        let (browser, mut handler) = Browser::launch(config)
            .await
            .map_err(|e| TransportError::Unsupported(format!("failed to launch browser: {}", e)))?;

        tokio::spawn(async move {
            while let Some(event) = handler.next().await {
                if event.is_err() {
                    break;
                }
            }
        });

        Ok(browser)
    }
}

async fn render_page(
    page: &Page,
    url: &str,
    profile: &BrowserProfile,
) -> Result<FetchResponse, TransportError> {
    let user_agent = browser_user_agent(profile.stealth, &mut rand::thread_rng()).to_string();
    page.execute(SetUserAgentOverrideParams::new(user_agent))
        .await
        .map_err(|e| TransportError::Other(format!("user agent override failed: {}", e)))?;

    debug!(url, stealth = profile.stealth, "Navigating");
    let navigate = NavigateParams::builder()
        .url(url)
        .build()
        .map_err(|e| TransportError::Navigation(format!("invalid URL: {}", e)))?;
    let navigation = page
        .execute(navigate)
        .await
        .map_err(|e| TransportError::from_message(e.to_string()))?;
    if let Some(error_text) = navigation.result.error_text.clone() {
        return Err(TransportError::from_message(error_text));
    }

    let main_response = page.wait_for_navigation_response().await.ok().flatten();

    if let Err(e) = page.evaluate(READY_STATE_SCRIPT.to_string()).await {
        debug!("Could not check ready state (possibly non-HTML page): {}", e);
    }

    if profile.stealth {
        for (name, script) in STEALTH_PATCHES {
            if let Err(e) = page.evaluate(script.to_string()).await {
                debug!(patch = name, "Stealth patch skipped: {}", e);
            }
        }
    }

    tokio::time::sleep(profile.settle).await;

    let final_url = page
        .url()
        .await
        .ok()
        .flatten()
        .map(|u| u.to_string())
        .or_else(|| Some(url.to_string()));
    let content = page
        .content()
        .await
        .map_err(|e| TransportError::Other(format!("failed to read page content: {}", e)))?;

    let mut headers = BTreeMap::new();
    let mut status = None;
    if let Some(response) = main_response.as_ref().and_then(|req| req.response.as_ref()) {
        status = u16::try_from(response.status).ok();
        headers.insert("content-type".to_string(), response.mime_type.clone());
    }

    Ok(FetchResponse {
        status,
        headers,
        body: content.into_bytes(),
        final_url,
        duration_ms: 0,
    })
}

fn find_chrome() -> Result<PathBuf, TransportError> {
    for path in CHROME_PATHS {
        let candidate = PathBuf::from(path);
        if candidate.exists() {
            return Ok(candidate);
        }
    }
    for command in CHROME_COMMANDS {
        if let Ok(path) = which::which(command) {
            return Ok(path);
        }
    }
    Err(TransportError::Unsupported(
        "Chrome/Chromium not found; install it or set BROWSER_URL".to_string(),
    ))
}

async fn connect_remote(url: &str) -> Result<Browser, TransportError> {
    info!("Connecting to remote browser at {}", url);
    let http_url = url.replace("ws://", "http://").replace("wss://", "https://");
    let version_url = format!("{}/json/version", http_url.trim_end_matches('/'));

    let version: serde_json::Value = reqwest::get(&version_url)
        .await
        .map_err(|e| TransportError::Connect(format!("remote browser unreachable: {}", e)))?
        .json()
        .await
        .map_err(|e| TransportError::Other(format!("bad browser version info: {}", e)))?;

    let ws_url = version
        .get("webSocketDebuggerUrl")
        .and_then(|v| v.as_str())
        .ok_or_else(|| TransportError::Other("no webSocketDebuggerUrl in response".into()))?;

    let (browser, mut handler) = Browser::connect(ws_url)
        .await
        .map_err(|e| TransportError::Connect(format!("failed to connect to browser: {}", e)))?;
    tokio::spawn(async move {
        while let Some(event) = handler.next().await {
            if event.is_err() {
                warn!("Remote browser handler stopped");
                break;
            }
        }
    });
    Ok(browser)
}
