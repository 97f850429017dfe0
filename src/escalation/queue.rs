//! Human-review queue state and its durable stores.
//!
//! All mutation goes through `QueueState` methods; the router actor is the
//! only caller in a running crawl, which makes the perpetual-manual
//! check-then-append atomic.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;

use crate::access::{OutcomeKind, Strategy};
use crate::utils::{domain_key, write_atomic};

pub const DEFAULT_LOOKBACK_DAYS: i64 = 90;
pub const DEFAULT_PERPETUAL_THRESHOLD: usize = 3;

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("queue store I/O error on {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },
    #[error("queue file {path} is not valid JSON: {source}")]
    Parse {
        path: String,
        source: serde_json::Error,
    },
    #[error("failed to serialize queue: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("escalation router is not running")]
    RouterGone,
}

/// Queue tuning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueSettings {
    pub lookback_days: i64,
    pub perpetual_threshold: usize,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            lookback_days: DEFAULT_LOOKBACK_DAYS,
            perpetual_threshold: DEFAULT_PERPETUAL_THRESHOLD,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    pub fn for_tier(tier: Option<u8>) -> Self {
        if tier == Some(1) {
            Self::High
        } else {
            Self::Normal
        }
    }
}

/// Diagnostics a human needs to see why automation failed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Diagnostics {
    pub url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub outcome: Option<OutcomeKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub terminal_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detected_markers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waf_hint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
}

/// One terminal failure handed to the router.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureReport {
    pub domain: String,
    /// Machine-readable reason code.
    pub reason: String,
    pub tier: Option<u8>,
    pub attempted_strategies: Vec<Strategy>,
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueueEntry {
    pub domain: String,
    pub added: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub attempted_strategies: Vec<Strategy>,
    #[serde(default)]
    pub priority: Priority,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tier: Option<u8>,
    /// Times this domain was re-queued while already waiting.
    #[serde(default)]
    pub requeue_count: u32,
    #[serde(default)]
    pub perpetual_manual: bool,
    #[serde(default)]
    pub diagnostics: Diagnostics,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletedEntry {
    pub domain: String,
    pub completed: DateTime<Utc>,
    pub pages: u64,
    pub words: u64,
}

/// One appearance of a domain in the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub domain: String,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Result of routing one failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RouteOutcome {
    /// The domain was already waiting in the queue.
    pub merged: bool,
    /// The domain hit the perpetual-manual threshold before this append.
    pub perpetual_manual: bool,
    /// Prior appearances inside the lookback window.
    pub prior_appearances: usize,
}

/// Whole persisted queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct QueueState {
    #[serde(default)]
    pub queue: Vec<QueueEntry>,
    #[serde(default)]
    pub completed: Vec<CompletedEntry>,
    #[serde(default)]
    pub history: Vec<HistoryEvent>,
}

impl QueueState {
    /// Appearances of `domain` in history after `now - lookback`.
    pub fn appearances(&self, domain: &str, now: DateTime<Utc>, settings: &QueueSettings) -> usize {
        let domain = domain_key(domain);
        let cutoff = now - Duration::days(settings.lookback_days);
        self.history
            .iter()
            .filter(|event| event.domain == domain && event.at > cutoff)
            .count()
    }

    /// Whether `domain` should skip the automated ladder.
    pub fn is_perpetual_manual(
        &self,
        domain: &str,
        now: DateTime<Utc>,
        settings: &QueueSettings,
    ) -> bool {
        self.appearances(domain, now, settings) >= settings.perpetual_threshold
    }

    /// Check history, then append the failure.
    pub fn route(
        &mut self,
        report: FailureReport,
        now: DateTime<Utc>,
        settings: &QueueSettings,
    ) -> RouteOutcome {
        let domain = domain_key(&report.domain);
        let prior = self.appearances(&domain, now, settings);
        let perpetual = prior >= settings.perpetual_threshold;

        self.history.push(HistoryEvent {
            domain: domain.clone(),
            at: now,
            reason: report.reason.clone(),
        });
        self.prune_history(now, settings);

        let merged = match self.queue.iter_mut().find(|e| e.domain == domain) {
            Some(existing) => {
                existing.requeue_count += 1;
                existing.reason = report.reason;
                for strategy in report.attempted_strategies {
                    if !existing.attempted_strategies.contains(&strategy) {
                        existing.attempted_strategies.push(strategy);
                    }
                }
                existing.attempted_strategies.sort();
                existing.perpetual_manual |= perpetual;
                existing.diagnostics = report.diagnostics;
                if report.tier.is_some() {
                    existing.tier = report.tier;
                    existing.priority = existing.priority.min(Priority::for_tier(report.tier));
                }
                true
            }
            None => {
                self.queue.push(QueueEntry {
                    domain,
                    added: now,
                    reason: report.reason,
                    attempted_strategies: report.attempted_strategies,
                    priority: Priority::for_tier(report.tier),
                    tier: report.tier,
                    requeue_count: 0,
                    perpetual_manual: perpetual,
                    diagnostics: report.diagnostics,
                });
                false
            }
        };

        RouteOutcome {
            merged,
            perpetual_manual: perpetual,
            prior_appearances: prior,
        }
    }

    /// Move a domain from the queue to completed. Returns whether it was queued.
    pub fn complete(&mut self, domain: &str, pages: u64, words: u64, now: DateTime<Utc>) -> bool {
        let domain = domain_key(domain);
        let before = self.queue.len();
        self.queue.retain(|e| e.domain != domain);
        self.completed.push(CompletedEntry {
            domain,
            completed: now,
            pages,
            words,
        });
        self.queue.len() != before
    }

    /// Next entry for a human: high priority first, then oldest.
    pub fn next(&self) -> Option<&QueueEntry> {
        self.queue.iter().min_by_key(|e| (e.priority, e.added))
    }

    /// Remove every waiting entry. History and completions are kept.
    pub fn clear(&mut self) -> usize {
        let count = self.queue.len();
        self.queue.clear();
        count
    }

    fn prune_history(&mut self, now: DateTime<Utc>, settings: &QueueSettings) {
        let cutoff = now - Duration::days(settings.lookback_days);
        self.history.retain(|event| event.at > cutoff);
    }
}

/// Durable backing for `QueueState`.
#[async_trait]
pub trait QueueStore: Send + Sync {
    async fn load(&self) -> Result<QueueState, QueueError>;
    async fn save(&self, state: &QueueState) -> Result<(), QueueError>;
}

/// JSON file store, replaced atomically on every save.
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl QueueStore for JsonFileStore {
    async fn load(&self) -> Result<QueueState, QueueError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(QueueState::default()),
            Err(source) => {
                return Err(QueueError::Io {
                    path: self.path.display().to_string(),
                    source,
                })
            }
        };
        serde_json::from_str(&contents).map_err(|source| QueueError::Parse {
            path: self.path.display().to_string(),
            source,
        })
    }

    async fn save(&self, state: &QueueState) -> Result<(), QueueError> {
        let json = serde_json::to_vec_pretty(state)?;
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || write_atomic(&path, &json))
            .await
            .map_err(|e| QueueError::Io {
                path: self.path.display().to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, e),
            })?
            .map_err(|source| QueueError::Io {
                path: self.path.display().to_string(),
                source,
            })
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<QueueState>,
}

impl MemoryStore {
    pub fn new(state: QueueState) -> Self {
        Self {
            state: Mutex::new(state),
        }
    }

    pub async fn snapshot(&self) -> QueueState {
        self.state.lock().await.clone()
    }
}

#[async_trait]
impl QueueStore for MemoryStore {
    async fn load(&self) -> Result<QueueState, QueueError> {
        Ok(self.state.lock().await.clone())
    }

    async fn save(&self, state: &QueueState) -> Result<(), QueueError> {
        *self.state.lock().await = state.clone();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(domain: &str, tier: Option<u8>) -> FailureReport {
        FailureReport {
            domain: domain.to_string(),
            reason: "soft_block_markers_detected".to_string(),
            tier,
            attempted_strategies: vec![Strategy::Requests, Strategy::Js],
            diagnostics: Diagnostics {
                url: format!("https://{}/", domain),
                ..Diagnostics::default()
            },
        }
    }

    fn history(domain: &str, days_ago: &[i64], now: DateTime<Utc>) -> QueueState {
        QueueState {
            history: days_ago
                .iter()
                .map(|d| HistoryEvent {
                    domain: domain.to_string(),
                    at: now - Duration::days(*d),
                    reason: "soft_block".to_string(),
                })
                .collect(),
            ..QueueState::default()
        }
    }

    #[test]
    fn test_three_recent_appearances_flag_perpetual() {
        let now = Utc::now();
        let settings = QueueSettings::default();
        let state = history("example.com", &[5, 30, 60], now);
        assert!(state.is_perpetual_manual("example.com", now, &settings));

        let mut state = state;
        let outcome = state.route(report("example.com", None), now, &settings);
        assert!(outcome.perpetual_manual);
        assert!(state.queue[0].perpetual_manual);
    }

    #[test]
    fn test_two_appearances_not_perpetual() {
        let now = Utc::now();
        let settings = QueueSettings::default();
        let mut state = history("example.com", &[5, 30], now);
        assert!(!state.is_perpetual_manual("example.com", now, &settings));

        let outcome = state.route(report("example.com", None), now, &settings);
        assert!(!outcome.perpetual_manual);
        assert_eq!(outcome.prior_appearances, 2);
    }

    #[test]
    fn test_old_appearances_ignored() {
        let now = Utc::now();
        let settings = QueueSettings::default();
        let state = history("example.com", &[5, 100, 200], now);
        assert!(!state.is_perpetual_manual("example.com", now, &settings));
    }

    #[test]
    fn test_route_merges_existing_entry() {
        let now = Utc::now();
        let settings = QueueSettings::default();
        let mut state = QueueState::default();
        state.route(report("www.example.com", Some(2)), now, &settings);
        let mut second = report("example.com", Some(1));
        second.attempted_strategies = vec![Strategy::Stealth];
        let outcome = state.route(second, now, &settings);

        assert!(outcome.merged);
        assert_eq!(state.queue.len(), 1);
        let entry = &state.queue[0];
        assert_eq!(entry.requeue_count, 1);
        assert_eq!(entry.priority, Priority::High);
        assert_eq!(
            entry.attempted_strategies,
            vec![Strategy::Requests, Strategy::Js, Strategy::Stealth]
        );
        assert_eq!(state.history.len(), 2);
    }

    #[test]
    fn test_next_prefers_high_priority_then_oldest() {
        let now = Utc::now();
        let settings = QueueSettings::default();
        let mut state = QueueState::default();
        state.route(report("old.example.com", None), now - Duration::hours(3), &settings);
        state.route(report("new.example.com", None), now - Duration::hours(1), &settings);
        assert_eq!(state.next().unwrap().domain, "old.example.com");

        state.route(report("carrier.example.com", Some(1)), now, &settings);
        assert_eq!(state.next().unwrap().domain, "carrier.example.com");
    }

    #[test]
    fn test_complete_and_clear() {
        let now = Utc::now();
        let settings = QueueSettings::default();
        let mut state = QueueState::default();
        state.route(report("a.example.com", None), now, &settings);
        state.route(report("b.example.com", None), now, &settings);

        assert!(state.complete("a.example.com", 12, 4800, now));
        assert!(!state.complete("zzz.example.com", 0, 0, now));
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.completed.len(), 2);

        assert_eq!(state.clear(), 1);
        assert!(state.queue.is_empty());
        assert_eq!(state.history.len(), 2);
    }

    #[tokio::test]
    async fn test_json_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("queue.json"));
        assert_eq!(store.load().await.unwrap(), QueueState::default());

        let mut state = QueueState::default();
        state.route(report("example.com", Some(1)), Utc::now(), &QueueSettings::default());
        store.save(&state).await.unwrap();
        assert_eq!(store.load().await.unwrap(), state);
    }

    #[tokio::test]
    async fn test_json_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("queue.json");
        std::fs::write(&path, "not json").unwrap();
        let store = JsonFileStore::new(&path);
        assert!(matches!(store.load().await, Err(QueueError::Parse { .. })));
    }
}
