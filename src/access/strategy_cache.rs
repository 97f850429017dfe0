//! Persistent per-domain strategy cache.
//!
//! Remembers which strategy last worked (and last failed) for a domain so the
//! next run can start there instead of re-climbing the ladder.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use super::policy::Strategy;
use crate::utils::{domain_key, write_atomic};

/// Entries older than this are ignored.
pub const DEFAULT_MAX_AGE_DAYS: i64 = 30;

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("failed to write strategy cache {path}: {source}")]
    Write {
        path: String,
        source: std::io::Error,
    },
    #[error("failed to serialize strategy cache: {0}")]
    Serialize(#[from] serde_json::Error),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(default, alias = "last_success_method", skip_serializing_if = "Option::is_none")]
    pub last_success_strategy: Option<Strategy>,
    #[serde(default, alias = "last_fail_method", skip_serializing_if = "Option::is_none")]
    pub last_fail_strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub last_seen_block: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct StrategyCache {
    path: PathBuf,
    max_age: Duration,
    entries: BTreeMap<String, CacheEntry>,
}

impl StrategyCache {
    /// Load the cache file. Missing or corrupt files start an empty cache.
    pub fn load(path: &Path) -> Self {
        let entries = match std::fs::read_to_string(path) {
            Ok(contents) => serde_json::from_str(&contents).unwrap_or_else(|e| {
                warn!("Ignoring corrupt strategy cache {}: {}", path.display(), e);
                BTreeMap::new()
            }),
            Err(_) => BTreeMap::new(),
        };
        Self {
            path: path.to_path_buf(),
            max_age: Duration::days(DEFAULT_MAX_AGE_DAYS),
            entries,
        }
    }

    pub fn with_max_age_days(mut self, days: i64) -> Self {
        self.max_age = Duration::days(days);
        self
    }

    /// Fresh entry for a domain, if any.
    pub fn entry(&self, domain: &str, now: DateTime<Utc>) -> Option<&CacheEntry> {
        self.entries
            .get(&domain_key(domain))
            .filter(|entry| now - entry.updated_at <= self.max_age)
    }

    /// Strategy that last succeeded for a domain, if still fresh.
    pub fn cached_strategy(&self, domain: &str, now: DateTime<Utc>) -> Option<Strategy> {
        self.entry(domain, now)
            .and_then(|entry| entry.last_success_strategy)
    }

    /// Record the result of one URL.
    pub fn record(
        &mut self,
        domain: &str,
        strategy: Option<Strategy>,
        success: bool,
        block_markers: &[String],
        now: DateTime<Utc>,
    ) {
        let entry = self
            .entries
            .entry(domain_key(domain))
            .or_insert_with(|| CacheEntry {
                last_success_strategy: None,
                last_fail_strategy: None,
                last_seen_block: Vec::new(),
                updated_at: now,
            });

        if let Some(strategy) = strategy {
            if success {
                entry.last_success_strategy = Some(strategy);
            } else {
                entry.last_fail_strategy = Some(strategy);
            }
        }
        if !block_markers.is_empty() {
            let mut markers = block_markers.to_vec();
            markers.sort();
            markers.dedup();
            entry.last_seen_block = markers;
        }
        entry.updated_at = now;
    }

    pub fn save(&self) -> Result<(), CacheError> {
        let json = serde_json::to_vec_pretty(&self.entries)?;
        write_atomic(&self.path, &json).map_err(|source| CacheError::Write {
            path: self.path.display().to_string(),
            source,
        })
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &CacheEntry)> {
        self.entries.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("strategy_cache.json");
        let now = Utc::now();

        let mut cache = StrategyCache::load(&path);
        cache.record(
            "www.example.com",
            Some(Strategy::Stealth),
            true,
            &["access denied".to_string()],
            now,
        );
        cache.save().unwrap();

        let reloaded = StrategyCache::load(&path);
        assert_eq!(
            reloaded.cached_strategy("example.com", now),
            Some(Strategy::Stealth)
        );
        assert_eq!(
            reloaded.entry("example.com", now).unwrap().last_seen_block,
            vec!["access denied".to_string()]
        );
    }

    #[test]
    fn test_stale_entries_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = StrategyCache::load(&dir.path().join("c.json"));
        let then = Utc::now() - Duration::days(45);
        cache.record("example.com", Some(Strategy::Js), true, &[], then);
        assert_eq!(cache.cached_strategy("example.com", Utc::now()), None);
    }

    #[test]
    fn test_failure_keeps_last_success() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = StrategyCache::load(&dir.path().join("c.json"));
        let now = Utc::now();
        cache.record("example.com", Some(Strategy::Js), true, &[], now);
        cache.record("example.com", Some(Strategy::Stealth), false, &[], now);
        let entry = cache.entry("example.com", now).unwrap();
        assert_eq!(entry.last_success_strategy, Some(Strategy::Js));
        assert_eq!(entry.last_fail_strategy, Some(Strategy::Stealth));
    }

    #[test]
    fn test_reads_legacy_method_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("legacy.json");
        let now = Utc::now();
        std::fs::write(
            &path,
            format!(
                r#"{{"example.com": {{"last_success_method": "js", "updated_at": "{}"}}}}"#,
                now.to_rfc3339()
            ),
        )
        .unwrap();
        let cache = StrategyCache::load(&path);
        assert_eq!(cache.cached_strategy("example.com", now), Some(Strategy::Js));
    }
}
