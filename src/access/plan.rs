//! Access plan construction from layered configuration.
//!
//! Precedence, lowest to highest: system defaults, domain playbook, per-run
//! fetch spec, command-line overrides. Each layer is a `PlanLayer` of
//! optional fields folded left-to-right onto the defaults. Recon hints only
//! pick the initial strategy when no layer set one explicitly.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::policy::{DomainOverride, Strategy};
use crate::playbook::Playbook;
use crate::recon::ReconHints;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;
pub const DEFAULT_MAX_ESCALATIONS: u32 = 3;
pub const DEFAULT_DELAY_SECONDS: f64 = 3.0;

/// Whether the loop may climb the ladder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum EscalationMode {
    /// Escalate through the ladder on recoverable failures.
    #[default]
    Adaptive,
    /// Keep the initial strategy; retry once on transient errors only.
    Static,
}

/// Effective access plan for one URL/domain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessPlan {
    pub initial_strategy: Strategy,
    pub max_attempts: u32,
    pub max_escalations: u32,
    pub patient_mode: bool,
    pub delay_seconds: f64,
    pub allow_stealth: bool,
    pub allow_visible: bool,
    pub escalation_mode: EscalationMode,
    /// Domain is perpetual manual: route straight to the human queue.
    #[serde(default)]
    pub skip_auto_ladder: bool,
    /// Strategies with no transport in this run.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub unavailable: BTreeSet<Strategy>,
}

impl Default for AccessPlan {
    fn default() -> Self {
        Self {
            initial_strategy: Strategy::Requests,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            max_escalations: DEFAULT_MAX_ESCALATIONS,
            patient_mode: false,
            delay_seconds: DEFAULT_DELAY_SECONDS,
            allow_stealth: true,
            allow_visible: false,
            escalation_mode: EscalationMode::Adaptive,
            skip_auto_ladder: false,
            unavailable: BTreeSet::new(),
        }
    }
}

impl AccessPlan {
    /// Whether the plan permits using `strategy` at all.
    pub fn allows(&self, strategy: Strategy) -> bool {
        if self.unavailable.contains(&strategy) {
            return false;
        }
        if strategy.is_stealth() && !self.allow_stealth {
            return false;
        }
        if strategy == Strategy::Visible && !self.allow_visible {
            return false;
        }
        true
    }

    /// Drop strategies that cannot run. A start on a dropped strategy moves to
    /// the next usable step up the ladder, else the highest usable one below.
    pub fn restrict_to(&mut self, usable: impl Fn(Strategy) -> bool) {
        self.unavailable = Strategy::LADDER
            .into_iter()
            .filter(|s| !usable(*s))
            .collect();
        if self.unavailable.contains(&self.initial_strategy) {
            let start = self.initial_strategy;
            let above = Strategy::LADDER
                .into_iter()
                .find(|s| *s > start && self.allows(*s));
            let below = Strategy::LADDER
                .into_iter()
                .rev()
                .find(|s| *s < start && self.allows(*s));
            if let Some(fallback) = above.or(below) {
                debug!(from = %start, to = %fallback, "Initial strategy has no transport");
                self.initial_strategy = fallback;
            }
        }
    }

    /// Flag the plan so the controller skips automated attempts.
    pub fn mark_perpetual_manual(&mut self) {
        self.skip_auto_ladder = true;
    }

    fn apply(&mut self, layer: &PlanLayer) {
        if let Some(strategy) = layer.initial_strategy {
            self.initial_strategy = strategy;
        }
        if let Some(max_attempts) = layer.max_attempts {
            self.max_attempts = max_attempts;
        }
        if let Some(max_escalations) = layer.max_escalations {
            self.max_escalations = max_escalations;
        }
        if let Some(patient) = layer.patient_mode {
            self.patient_mode = patient;
        }
        if let Some(delay) = layer.delay_seconds {
            self.delay_seconds = delay;
        }
        if let Some(allow) = layer.allow_stealth {
            self.allow_stealth = allow;
        }
        if let Some(allow) = layer.allow_visible {
            self.allow_visible = allow;
        }
        if let Some(mode) = layer.escalation_mode {
            self.escalation_mode = mode;
        }
    }
}

/// Partial override of an `AccessPlan`. `None` leaves the field alone.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PlanLayer {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub initial_strategy: Option<Strategy>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_escalations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patient_mode: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_stealth: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allow_visible: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation_mode: Option<EscalationMode>,
}

/// Per-run fetch settings, as written in run files.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FetchSpec {
    #[serde(default)]
    pub method: Option<String>,
    #[serde(default)]
    pub patient: bool,
    #[serde(default)]
    pub slow_drip: bool,
    #[serde(default)]
    pub patient_on_block: Option<bool>,
    #[serde(default)]
    pub delay: Option<f64>,
    #[serde(default)]
    pub allow_stealth: Option<bool>,
    #[serde(default)]
    pub allow_visible: Option<bool>,
}

impl FetchSpec {
    pub fn to_layer(&self) -> PlanLayer {
        let mut layer = PlanLayer {
            initial_strategy: self.method.as_deref().map(normalize_strategy),
            delay_seconds: self.delay,
            allow_stealth: self.allow_stealth,
            allow_visible: self.allow_visible,
            ..PlanLayer::default()
        };
        if self.patient || self.slow_drip {
            layer.patient_mode = Some(true);
        }
        if let Some(patient) = self.patient_on_block {
            layer.patient_mode = Some(patient);
        }
        layer
    }
}

/// Command-line overrides (`--access-max-attempts`, `--access-escalation-mode`).
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CliOverrides {
    pub access_max_attempts: Option<u32>,
    pub access_escalation_mode: Option<EscalationMode>,
    pub initial_strategy: Option<Strategy>,
}

impl CliOverrides {
    pub fn to_layer(&self) -> PlanLayer {
        PlanLayer {
            initial_strategy: self.initial_strategy,
            max_attempts: self.access_max_attempts,
            escalation_mode: self.access_escalation_mode,
            ..PlanLayer::default()
        }
    }
}

/// Plan construction errors. These are setup bugs, not access failures.
#[derive(Debug, thiserror::Error, PartialEq)]
pub enum PlanError {
    #[error("max_attempts must be at least 1 (got {0})")]
    InvalidMaxAttempts(u32),
    #[error("delay_seconds must be a finite, non-negative number (got {0})")]
    InvalidDelay(f64),
    #[error("initial strategy {0} is disallowed by the same plan")]
    StrategyNotAllowed(Strategy),
}

/// Map playbook/run-spec method names to ladder names.
///
/// Unknown names fall back to `requests`.
pub fn normalize_strategy(raw: &str) -> Strategy {
    Strategy::from_alias(raw).unwrap_or_else(|| {
        warn!("Unknown strategy name '{}', using requests", raw);
        Strategy::Requests
    })
}

/// Build the effective plan for `domain`.
///
/// `defaults` is the system-defaults layer (from configuration).
pub fn build_plan(
    domain: &str,
    defaults: &PlanLayer,
    fetch_spec: &PlanLayer,
    cli_overrides: &PlanLayer,
    recon: Option<&ReconHints>,
    playbook: Option<&Playbook>,
) -> Result<AccessPlan, PlanError> {
    let playbook_layer = playbook.map(Playbook::to_layer).unwrap_or_default();

    let mut plan = AccessPlan::default();
    for layer in [defaults, &playbook_layer, fetch_spec, cli_overrides] {
        plan.apply(layer);
    }

    let explicit_strategy = [&playbook_layer, fetch_spec, cli_overrides]
        .iter()
        .any(|layer| layer.initial_strategy.is_some());

    if !explicit_strategy {
        if let Some(hints) = recon {
            apply_recon(&mut plan, hints);
        }
    } else if !plan.allows(plan.initial_strategy) {
        return Err(PlanError::StrategyNotAllowed(plan.initial_strategy));
    }

    if let Some(ceiling) = playbook.and_then(|p| p.override_for().max_strategy) {
        if plan.initial_strategy > ceiling {
            warn!(
                domain,
                "Initial strategy {} above playbook ceiling {}, clamping",
                plan.initial_strategy,
                ceiling
            );
            plan.initial_strategy = ceiling;
        }
    }

    validate(&plan)?;
    debug!(domain, ?plan, "Built access plan");
    Ok(plan)
}

/// Domain override for the policy, taken from the playbook.
pub fn domain_override(playbook: Option<&Playbook>) -> Option<DomainOverride> {
    playbook.map(Playbook::override_for)
}

fn apply_recon(plan: &mut AccessPlan, hints: &ReconHints) {
    if let Some(cached) = hints.cached_strategy.filter(|s| plan.allows(*s)) {
        plan.initial_strategy = cached;
        return;
    }

    if hints.challenge_detected || hints.waf_detected.is_some() || hints.likely_bot_defended {
        if plan.allow_stealth {
            plan.initial_strategy = Strategy::Stealth;
            plan.patient_mode = true;
        } else {
            plan.initial_strategy = Strategy::Js;
        }
    } else if hints.js_required {
        plan.initial_strategy = Strategy::Js;
    }
}

fn validate(plan: &AccessPlan) -> Result<(), PlanError> {
    if plan.max_attempts == 0 {
        return Err(PlanError::InvalidMaxAttempts(plan.max_attempts));
    }
    if !plan.delay_seconds.is_finite() || plan.delay_seconds < 0.0 {
        return Err(PlanError::InvalidDelay(plan.delay_seconds));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(
        fetch_spec: &PlanLayer,
        cli: &PlanLayer,
        recon: Option<&ReconHints>,
        playbook: Option<&Playbook>,
    ) -> Result<AccessPlan, PlanError> {
        build_plan(
            "example.com",
            &PlanLayer::default(),
            fetch_spec,
            cli,
            recon,
            playbook,
        )
    }

    #[test]
    fn test_defaults() {
        let plan = build(&PlanLayer::default(), &PlanLayer::default(), None, None).unwrap();
        assert_eq!(plan.initial_strategy, Strategy::Requests);
        assert_eq!(plan.max_attempts, 3);
        assert_eq!(plan.max_escalations, 3);
        assert_eq!(plan.delay_seconds, 3.0);
        assert!(!plan.patient_mode);
        assert!(plan.allow_stealth);
        assert!(!plan.allow_visible);
    }

    #[test]
    fn test_restrict_to_http_only() {
        let mut plan = AccessPlan {
            initial_strategy: Strategy::Stealth,
            ..AccessPlan::default()
        };
        plan.restrict_to(|s| s == Strategy::Requests);

        assert_eq!(plan.initial_strategy, Strategy::Requests);
        assert!(plan.allows(Strategy::Requests));
        assert!(!plan.allows(Strategy::Js));
        assert!(!plan.allows(Strategy::Stealth));
    }

    #[test]
    fn test_restrict_to_moves_start_up_the_ladder() {
        let mut plan = AccessPlan {
            initial_strategy: Strategy::Js,
            ..AccessPlan::default()
        };
        plan.restrict_to(|s| s != Strategy::Js);
        assert_eq!(plan.initial_strategy, Strategy::Stealth);
    }

    #[test]
    fn test_later_layers_win() {
        let playbook = Playbook {
            strategy: Some("js".to_string()),
            max_attempts: Some(5),
            delay: Some(10.0),
            ..Playbook::default()
        };
        let spec = FetchSpec {
            method: Some("stealth".to_string()),
            delay: Some(6.0),
            ..FetchSpec::default()
        };
        let cli = CliOverrides {
            access_max_attempts: Some(4),
            ..CliOverrides::default()
        };
        let plan = build(&spec.to_layer(), &cli.to_layer(), None, Some(&playbook)).unwrap();
        assert_eq!(plan.initial_strategy, Strategy::Stealth);
        assert_eq!(plan.max_attempts, 4);
        assert_eq!(plan.delay_seconds, 6.0);
    }

    #[test]
    fn test_recon_picks_js_when_no_explicit_strategy() {
        let hints = ReconHints {
            js_required: true,
            ..ReconHints::default()
        };
        let plan = build(&PlanLayer::default(), &PlanLayer::default(), Some(&hints), None).unwrap();
        assert_eq!(plan.initial_strategy, Strategy::Js);
    }

    #[test]
    fn test_recon_challenge_starts_patient_stealth() {
        let hints = ReconHints {
            challenge_detected: true,
            ..ReconHints::default()
        };
        let plan = build(&PlanLayer::default(), &PlanLayer::default(), Some(&hints), None).unwrap();
        assert_eq!(plan.initial_strategy, Strategy::Stealth);
        assert!(plan.patient_mode);
    }

    #[test]
    fn test_recon_ignored_when_strategy_explicit() {
        let hints = ReconHints {
            challenge_detected: true,
            ..ReconHints::default()
        };
        let cli = CliOverrides {
            initial_strategy: Some(Strategy::Requests),
            ..CliOverrides::default()
        };
        let plan = build(&PlanLayer::default(), &cli.to_layer(), Some(&hints), None).unwrap();
        assert_eq!(plan.initial_strategy, Strategy::Requests);
        assert!(!plan.patient_mode);
    }

    #[test]
    fn test_cached_strategy_preferred_over_recon() {
        let hints = ReconHints {
            js_required: true,
            cached_strategy: Some(Strategy::Stealth),
            ..ReconHints::default()
        };
        let plan = build(&PlanLayer::default(), &PlanLayer::default(), Some(&hints), None).unwrap();
        assert_eq!(plan.initial_strategy, Strategy::Stealth);
    }

    #[test]
    fn test_static_mode_from_cli() {
        let cli = CliOverrides {
            access_escalation_mode: Some(EscalationMode::Static),
            ..CliOverrides::default()
        };
        let plan = build(&PlanLayer::default(), &cli.to_layer(), None, None).unwrap();
        assert_eq!(plan.escalation_mode, EscalationMode::Static);
    }

    #[test]
    fn test_zero_attempts_rejected() {
        let cli = CliOverrides {
            access_max_attempts: Some(0),
            ..CliOverrides::default()
        };
        let err = build(&PlanLayer::default(), &cli.to_layer(), None, None).unwrap_err();
        assert_eq!(err, PlanError::InvalidMaxAttempts(0));
    }

    #[test]
    fn test_negative_delay_rejected() {
        let spec = FetchSpec {
            delay: Some(-1.0),
            ..FetchSpec::default()
        };
        let err = build(&spec.to_layer(), &PlanLayer::default(), None, None).unwrap_err();
        assert_eq!(err, PlanError::InvalidDelay(-1.0));
    }

    #[test]
    fn test_explicit_disallowed_strategy_rejected() {
        let spec = FetchSpec {
            method: Some("stealth".to_string()),
            allow_stealth: Some(false),
            ..FetchSpec::default()
        };
        let err = build(&spec.to_layer(), &PlanLayer::default(), None, None).unwrap_err();
        assert_eq!(err, PlanError::StrategyNotAllowed(Strategy::Stealth));
    }

    #[test]
    fn test_manual_playbook_allows_visible() {
        let playbook = Playbook {
            strategy: Some("manual".to_string()),
            ..Playbook::default()
        };
        let plan = build(&PlanLayer::default(), &PlanLayer::default(), None, Some(&playbook)).unwrap();
        assert_eq!(plan.initial_strategy, Strategy::Visible);
        assert!(plan.allow_visible);
    }

    #[test]
    fn test_initial_strategy_clamped_to_ceiling() {
        let playbook = Playbook {
            max_strategy: Some("js".to_string()),
            ..Playbook::default()
        };
        let spec = FetchSpec {
            method: Some("stealth".to_string()),
            ..FetchSpec::default()
        };
        let plan = build(&spec.to_layer(), &PlanLayer::default(), None, Some(&playbook)).unwrap();
        assert_eq!(plan.initial_strategy, Strategy::Js);
    }

    #[test]
    fn test_slow_drip_is_patient() {
        let spec = FetchSpec {
            slow_drip: true,
            ..FetchSpec::default()
        };
        let plan = build(&spec.to_layer(), &PlanLayer::default(), None, None).unwrap();
        assert!(plan.patient_mode);
    }
}
