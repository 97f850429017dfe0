//! Shared helper functions for CLI commands.

use console::style;

use crate::access::OutcomeKind;

/// Truncate to `max` characters, marking the cut with "...".
pub fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

/// Outcome name colored by severity.
pub fn styled_outcome(kind: OutcomeKind) -> String {
    let name = kind.as_str();
    match kind {
        OutcomeKind::SuccessRealContent => style(name).green().to_string(),
        OutcomeKind::HardBlock | OutcomeKind::RobotsDenied | OutcomeKind::NonHtml => {
            style(name).red().to_string()
        }
        _ => style(name).yellow().to_string(),
    }
}
