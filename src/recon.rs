//! Reconnaissance hints.
//!
//! Recon data is advisory and read-only here: hints come from a recon cache
//! file written by a separate recon pass, plus the strategy cache. Nothing in
//! this module fetches.

use std::collections::{BTreeMap, HashMap};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::access::Strategy;
use crate::utils::domain_key;

/// Per-domain hints consumed by the plan builder and the classifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconHints {
    pub cdn: Option<String>,
    #[serde(alias = "waf")]
    pub waf_detected: Option<String>,
    pub likely_bot_defended: bool,
    pub challenge_detected: bool,
    pub js_required: bool,
    /// Robots policy denies the target path; the loop must not fetch it.
    pub robots_disallowed: bool,
    /// Strategy that last succeeded for this domain (from the strategy cache).
    #[serde(skip)]
    pub cached_strategy: Option<Strategy>,
}

/// Detect a CDN/WAF vendor from response headers (lowercased names).
pub fn detect_waf_from_headers(headers: &BTreeMap<String, String>) -> Option<&'static str> {
    let has = |name: &str| headers.contains_key(name);
    let has_prefix = |prefix: &str| headers.keys().any(|k| k.starts_with(prefix));
    let server = headers
        .get("server")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();
    let cookies = headers
        .get("set-cookie")
        .map(|s| s.to_ascii_lowercase())
        .unwrap_or_default();

    if has("cf-ray") || has("cf-cache-status") || server == "cloudflare" {
        Some("cloudflare")
    } else if has("x-iinfo") || cookies.contains("incap_ses") {
        Some("incapsula")
    } else if has_prefix("x-akamai") || server.contains("akamaighost") {
        Some("akamai")
    } else if has("x-sucuri-id") {
        Some("sucuri")
    } else if has_prefix("x-fastly") || server.contains("fastly") {
        Some("fastly")
    } else if has_prefix("x-amzn-waf") {
        Some("aws_waf")
    } else if has("x-datadome") || cookies.contains("datadome=") {
        Some("datadome")
    } else {
        None
    }
}

/// Read-only view of the recon cache file (`{ domain: ReconHints }`).
#[derive(Debug, Clone, Default)]
pub struct ReconCache {
    entries: HashMap<String, ReconHints>,
}

impl ReconCache {
    /// Load the cache. A missing or unreadable file yields an empty cache.
    pub fn load(path: &Path) -> Self {
        let contents = match std::fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(_) => return Self::default(),
        };
        match serde_json::from_str::<HashMap<String, ReconHints>>(&contents) {
            Ok(raw) => Self {
                entries: raw
                    .into_iter()
                    .map(|(domain, hints)| (domain_key(&domain), hints))
                    .collect(),
            },
            Err(e) => {
                warn!("Ignoring unreadable recon cache {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn hints_for(&self, domain: &str) -> Option<&ReconHints> {
        self.entries.get(&domain_key(domain))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
