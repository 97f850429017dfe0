//! Domain playbooks.
//!
//! A YAML map of domain -> overrides, loaded once per run and read-only after
//! that:
//!
//! ```yaml
//! careers.example.com:
//!   strategy: playwright_stealth
//!   max_strategy: stealth_patient
//!   patient: true
//!   notes: "Akamai; needs a warm session"
//! sparse.example.org:
//!   thin_content: terminal
//! ```

use std::collections::HashMap;
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::access::plan::{normalize_strategy, PlanLayer};
use crate::access::{DomainOverride, Strategy};

#[derive(Debug, thiserror::Error)]
pub enum PlaybookError {
    #[error("failed to read playbooks {path}: {source}")]
    Read {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to parse playbooks {path}: {source}")]
    Parse {
        path: String,
        source: serde_yaml::Error,
    },
}

/// How a domain's thin pages are handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ThinContentPolicy {
    #[default]
    Escalate,
    /// The domain is genuinely sparse; thin pages are final.
    Terminal,
}

/// Per-domain overrides.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Playbook {
    /// Initial strategy, by ladder name or alias.
    pub strategy: Option<String>,
    /// Highest ladder step this domain may reach.
    pub max_strategy: Option<String>,
    pub patient: Option<bool>,
    pub delay: Option<f64>,
    pub max_attempts: Option<u32>,
    pub max_escalations: Option<u32>,
    pub allow_stealth: Option<bool>,
    pub allow_visible: Option<bool>,
    pub cookie_profile: Option<String>,
    pub notes: Option<String>,
    pub thin_content: ThinContentPolicy,
}

impl Playbook {
    /// The playbook as a plan layer.
    pub fn to_layer(&self) -> PlanLayer {
        let manual = self
            .strategy
            .as_deref()
            .is_some_and(|s| s.trim().eq_ignore_ascii_case("manual"));

        PlanLayer {
            initial_strategy: self.strategy.as_deref().map(normalize_strategy),
            max_attempts: self.max_attempts,
            max_escalations: self.max_escalations,
            patient_mode: self.patient,
            delay_seconds: self.delay,
            allow_stealth: self.allow_stealth,
            allow_visible: if manual { Some(true) } else { self.allow_visible },
            escalation_mode: None,
        }
    }

    /// Policy overrides for this domain.
    pub fn override_for(&self) -> DomainOverride {
        DomainOverride {
            max_strategy: self.max_strategy.as_deref().and_then(|raw| {
                let parsed = Strategy::from_alias(raw);
                if parsed.is_none() {
                    warn!("Ignoring unknown max_strategy '{}'", raw);
                }
                parsed
            }),
            thin_content_terminal: self.thin_content == ThinContentPolicy::Terminal,
        }
    }
}

/// All playbooks for a run.
#[derive(Debug, Clone, Default)]
pub struct Playbooks {
    entries: HashMap<String, Playbook>,
}

impl Playbooks {
    /// Load playbooks from a YAML file. A missing file means no playbooks.
    pub fn load(path: &Path) -> Result<Self, PlaybookError> {
        if !path.exists() {
            debug!("No playbooks at {}", path.display());
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| PlaybookError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&contents).map_err(|source| PlaybookError::Parse {
            path: path.display().to_string(),
            source,
        })
    }

    pub fn from_yaml(contents: &str) -> Result<Self, serde_yaml::Error> {
        let raw: Option<HashMap<String, serde_yaml::Value>> = serde_yaml::from_str(contents)?;
        let mut entries = HashMap::new();
        for (domain, value) in raw.unwrap_or_default() {
            // Non-mapping entries (comments turned into strings, anchors) are skipped.
            if !value.is_mapping() {
                continue;
            }
            let playbook: Playbook = serde_yaml::from_value(value)?;
            entries.insert(domain.trim().to_ascii_lowercase(), playbook);
        }
        Ok(Self { entries })
    }

    /// Look up a domain: exact match first, then without a leading `www.`.
    pub fn get(&self, domain: &str) -> Option<&Playbook> {
        let domain = domain.trim().to_ascii_lowercase();
        self.entries.get(&domain).or_else(|| {
            domain
                .strip_prefix("www.")
                .and_then(|bare| self.entries.get(bare))
        })
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
