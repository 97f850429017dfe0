//! Adaptive access control.
//!
//! A URL starts at the cheapest strategy in the plan and climbs the ladder
//! (`requests` → `js` → `stealth` → `stealth_patient` → `visible`) only when
//! the classifier says the page was not really served. Every attempt is
//! recorded, and URLs that exhaust their budget go to the manual-review
//! queue instead of being marked done.

pub mod backoff;
pub mod classifier;
pub mod controller;
pub mod outcome;
pub mod plan;
pub mod policy;
pub mod rules;
pub mod strategy_cache;

pub use backoff::backoff_delay;
pub use classifier::{classify, AttemptReport};
pub use controller::{AccessController, ControllerSettings};
pub use outcome::{reason, AccessAttempt, AccessOutcome, OutcomeKind, Recovery};
pub use plan::{
    build_plan, domain_override, AccessPlan, CliOverrides, EscalationMode, FetchSpec, PlanError,
    PlanLayer,
};
pub use policy::{decide_next, Decision, DomainOverride, LadderProgress, Strategy, TerminalReason};
pub use rules::{ClassifierRules, RulesError};
pub use strategy_cache::{CacheError, StrategyCache};
