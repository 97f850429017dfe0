//! Per-run aggregate summary.

use std::collections::BTreeMap;
use std::path::Path;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::access::{ClassifierRules, OutcomeKind};
use crate::record::AccessRecord;
use crate::utils::write_atomic;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSummary {
    pub generated_at: DateTime<Utc>,
    pub urls: usize,
    pub succeeded: usize,
    pub success_rate: f64,
    pub queued: usize,
    pub total_attempts: usize,
    /// Final outcome kind per URL.
    pub outcome_distribution: BTreeMap<String, usize>,
    /// Number of distinct strategies a URL needed.
    pub escalation_distribution: BTreeMap<usize, usize>,
    /// Strategy the URL finished on.
    pub final_strategy_distribution: BTreeMap<String, usize>,
    /// Outcome kind across every attempt, not just final ones.
    pub attempt_outcomes: BTreeMap<String, usize>,
    pub rules_version: String,
    pub rules_fingerprint: String,
}

impl RunSummary {
    pub fn from_records(records: &[AccessRecord], rules: &ClassifierRules) -> Self {
        let mut outcome_distribution = BTreeMap::new();
        let mut escalation_distribution = BTreeMap::new();
        let mut final_strategy_distribution = BTreeMap::new();
        let mut attempt_outcomes = BTreeMap::new();

        for record in records {
            let final_kind = record
                .final_outcome
                .as_ref()
                .map(|o| o.outcome.as_str())
                .unwrap_or("none");
            *outcome_distribution.entry(final_kind.to_string()).or_insert(0) += 1;
            *escalation_distribution
                .entry(record.strategies_used().len())
                .or_insert(0) += 1;
            if let Some(strategy) = record.final_strategy {
                *final_strategy_distribution
                    .entry(strategy.to_string())
                    .or_insert(0) += 1;
            }
            for attempt in &record.attempts {
                *attempt_outcomes
                    .entry(attempt.outcome.outcome.to_string())
                    .or_insert(0) += 1;
            }
        }

        let succeeded = records.iter().filter(|r| r.success).count();
        let success_rate = if records.is_empty() {
            0.0
        } else {
            succeeded as f64 / records.len() as f64
        };

        Self {
            generated_at: Utc::now(),
            urls: records.len(),
            succeeded,
            success_rate,
            queued: records.iter().filter(|r| r.queued).count(),
            total_attempts: records.iter().map(|r| r.attempts.len()).sum(),
            outcome_distribution,
            escalation_distribution,
            final_strategy_distribution,
            attempt_outcomes,
            rules_version: rules.version.clone(),
            rules_fingerprint: rules.fingerprint(),
        }
    }

    /// Count of URLs whose final outcome was `kind`.
    pub fn count(&self, kind: OutcomeKind) -> usize {
        self.outcome_distribution
            .get(kind.as_str())
            .copied()
            .unwrap_or(0)
    }

    pub fn write(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        write_atomic(path, &json)?;
        Ok(())
    }
}
