//! Escalation policy.
//!
//! Pure decision function over the fixed escalation ladder. No I/O, no
//! sleeping, no mutation: given the current strategy, the classified outcome
//! and the budgets in the plan, say what happens next.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use super::outcome::{AccessAttempt, OutcomeKind, Recovery};
use super::plan::{AccessPlan, EscalationMode};

/// Fetch strategies, ordered from cheapest to most capable.
///
/// The derived `Ord` follows the ladder order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    Requests,
    Js,
    Stealth,
    StealthPatient,
    Visible,
}

impl Strategy {
    /// The escalation ladder.
    pub const LADDER: [Strategy; 5] = [
        Self::Requests,
        Self::Js,
        Self::Stealth,
        Self::StealthPatient,
        Self::Visible,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Requests => "requests",
            Self::Js => "js",
            Self::Stealth => "stealth",
            Self::StealthPatient => "stealth_patient",
            Self::Visible => "visible",
        }
    }

    /// Parse a ladder name or one of the accepted aliases.
    pub fn from_alias(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "requests" | "request" | "http" => Some(Self::Requests),
            "js" | "playwright" | "browser" => Some(Self::Js),
            "stealth" | "playwright_stealth" => Some(Self::Stealth),
            "stealth_patient" | "patient" => Some(Self::StealthPatient),
            "visible" | "headed" | "no-headless" | "manual" => Some(Self::Visible),
            _ => None,
        }
    }

    /// Whether this step needs anti-fingerprinting (gated by `allow_stealth`).
    pub fn is_stealth(&self) -> bool {
        matches!(self, Self::Stealth | Self::StealthPatient)
    }
}

impl std::fmt::Display for Strategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Strategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_alias(s).ok_or_else(|| format!("unknown strategy: {}", s))
    }
}

/// Per-domain overrides consulted by the policy.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DomainOverride {
    /// Highest ladder step this domain may climb to.
    pub max_strategy: Option<Strategy>,
    /// Treat `thin_content` as terminal for sparse-but-real domains.
    pub thin_content_terminal: bool,
}

/// What the loop has done so far, as far as the policy cares.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LadderProgress {
    /// Consecutive retries at the current strategy (0 on first use).
    pub same_strategy_retries: u32,
    /// Number of distinct strategies used so far.
    pub distinct_strategies: u32,
}

impl LadderProgress {
    /// Derive progress from an attempt log.
    pub fn from_attempts(attempts: &[AccessAttempt]) -> Self {
        let distinct: BTreeSet<Strategy> = attempts.iter().map(|a| a.strategy).collect();
        let trailing = match attempts.last() {
            Some(last) => attempts
                .iter()
                .rev()
                .take_while(|a| a.strategy == last.strategy)
                .count() as u32,
            None => 0,
        };
        Self {
            same_strategy_retries: trailing.saturating_sub(1),
            distinct_strategies: distinct.len() as u32,
        }
    }
}

/// Why the loop stopped without success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "detail")]
pub enum TerminalReason {
    /// Outcome class is never retried.
    NonRecoverable(OutcomeKind),
    AttemptBudgetExhausted,
    EscalationBudgetExhausted,
    LadderExhausted,
    StrategyCeiling(Strategy),
    /// Static mode does not escalate.
    StaticMode,
    /// Domain is flagged perpetual manual; nothing was attempted.
    ManualOnly,
    /// Shutdown was requested between attempts.
    Cancelled,
}

impl TerminalReason {
    pub fn as_code(&self) -> &'static str {
        match self {
            Self::NonRecoverable(_) => "non_recoverable_outcome",
            Self::AttemptBudgetExhausted => "attempt_budget_exhausted",
            Self::EscalationBudgetExhausted => "escalation_budget_exhausted",
            Self::LadderExhausted => "ladder_exhausted",
            Self::StrategyCeiling(_) => "strategy_ceiling",
            Self::StaticMode => "static_mode",
            Self::ManualOnly => "perpetual_manual",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for TerminalReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NonRecoverable(kind) => write!(f, "non-recoverable outcome {}", kind),
            Self::StrategyCeiling(ceiling) => write!(f, "strategy ceiling {}", ceiling),
            other => f.write_str(other.as_code()),
        }
    }
}

/// Next action after a classified attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    Success,
    RetrySame(Strategy),
    Escalate(Strategy),
    Fail(TerminalReason),
}

impl Decision {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Success | Self::Fail(_))
    }

    /// Strategy for the next attempt, if any.
    pub fn next_strategy(&self) -> Option<Strategy> {
        match self {
            Self::RetrySame(s) | Self::Escalate(s) => Some(*s),
            _ => None,
        }
    }
}

/// Decide what to do after `outcome` was observed on attempt `attempt_index`
/// using `current`.
pub fn decide_next(
    current: Strategy,
    outcome: OutcomeKind,
    attempt_index: u32,
    progress: &LadderProgress,
    plan: &AccessPlan,
    domain_override: Option<&DomainOverride>,
) -> Decision {
    let recovery = match outcome {
        OutcomeKind::ThinContent if domain_override.is_some_and(|o| o.thin_content_terminal) => {
            Recovery::Terminal
        }
        other => other.recovery(),
    };

    match recovery {
        Recovery::Success => return Decision::Success,
        Recovery::Terminal => return Decision::Fail(TerminalReason::NonRecoverable(outcome)),
        Recovery::RetrySame | Recovery::Escalate => {}
    }

    if attempt_index + 1 >= plan.max_attempts {
        return Decision::Fail(TerminalReason::AttemptBudgetExhausted);
    }

    if recovery == Recovery::RetrySame && progress.same_strategy_retries < 1 {
        return Decision::RetrySame(current);
    }

    if plan.escalation_mode == EscalationMode::Static {
        return Decision::Fail(TerminalReason::StaticMode);
    }

    let ceiling = domain_override.and_then(|o| o.max_strategy);
    if let Some(ceiling) = ceiling {
        if current >= ceiling {
            return Decision::Fail(TerminalReason::StrategyCeiling(ceiling));
        }
    }

    if progress.distinct_strategies >= plan.max_escalations {
        return Decision::Fail(TerminalReason::EscalationBudgetExhausted);
    }

    match next_on_ladder(current, plan) {
        Some(next) => match ceiling {
            Some(ceiling) if next > ceiling => {
                Decision::Fail(TerminalReason::StrategyCeiling(ceiling))
            }
            _ => Decision::Escalate(next),
        },
        None => Decision::Fail(TerminalReason::LadderExhausted),
    }
}

/// First ladder step above `current` that the plan allows.
pub fn next_on_ladder(current: Strategy, plan: &AccessPlan) -> Option<Strategy> {
    Strategy::LADDER
        .iter()
        .copied()
        .find(|candidate| *candidate > current && plan.allows(*candidate))
}
