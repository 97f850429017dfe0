//! User-agent selection.
//!
//! The HTTP transport announces itself honestly unless configured to
//! impersonate; browser strategies always present a Chromium desktop UA so
//! the header agrees with the engine fingerprint.

use rand::seq::SliceRandom;
use rand::Rng;

pub const CRAWLER_USER_AGENT: &str =
    "crawl-access/0.4 (careers research crawler; +https://github.com/monokrome)";

/// Chromium desktop builds. Browser-backed strategies pick from these only.
const CHROMIUM_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
    "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/131.0.0.0 Safari/537.36",
];

/// Non-Chromium desktop builds, only used by the plain HTTP client.
const OTHER_USER_AGENTS: &[&str] = &[
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:133.0) Gecko/20100101 Firefox/133.0",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/18.1 Safari/605.1.15",
];

/// How the HTTP transport identifies itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAgentMode {
    Crawler,
    Impersonate,
    Custom(String),
}

impl UserAgentMode {
    /// `None` or empty means the crawler UA; `"impersonate"` picks a desktop browser UA.
    pub fn from_setting(value: Option<&str>) -> Self {
        match value.map(str::trim) {
            None | Some("") => Self::Crawler,
            Some(v) if v.eq_ignore_ascii_case("impersonate") => Self::Impersonate,
            Some(custom) => Self::Custom(custom.to_string()),
        }
    }

    /// Header value for one client instance.
    pub fn header_value<R: Rng + ?Sized>(&self, rng: &mut R) -> String {
        match self {
            Self::Crawler => CRAWLER_USER_AGENT.to_string(),
            Self::Impersonate => {
                let pool: Vec<&str> = CHROMIUM_USER_AGENTS
                    .iter()
                    .chain(OTHER_USER_AGENTS)
                    .copied()
                    .collect();
                pool.choose(rng)
                    .copied()
                    .unwrap_or(CHROMIUM_USER_AGENTS[0])
                    .to_string()
            }
            Self::Custom(ua) => ua.clone(),
        }
    }
}

/// UA for a browser page. Stealth pages rotate; plain JS rendering stays fixed.
pub fn browser_user_agent<R: Rng + ?Sized>(stealth: bool, rng: &mut R) -> &'static str {
    if stealth {
        CHROMIUM_USER_AGENTS
            .choose(rng)
            .copied()
            .unwrap_or(CHROMIUM_USER_AGENTS[0])
    } else {
        CHROMIUM_USER_AGENTS[0]
    }
}
