//! Access outcome model.
//!
//! One `AccessOutcome` is produced per fetch attempt by the classifier and
//! embedded in an append-only `AccessAttempt` log record.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::policy::Strategy;

/// Closed set of outcome classes for a single access attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeKind {
    SuccessRealContent,
    SoftBlock,
    HardBlock,
    ChallengeNotCleared,
    ThinContent,
    NetworkError,
    NonHtml,
    RobotsDenied,
    Timeout,
    UnknownFailure,
}

/// How the policy treats an outcome class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recovery {
    /// Usable page, stop.
    Success,
    /// Never retried or escalated.
    Terminal,
    /// Retry the same strategy once, then escalate.
    RetrySame,
    /// Escalate to the next ladder step.
    Escalate,
}

impl OutcomeKind {
    pub const ALL: [OutcomeKind; 10] = [
        Self::SuccessRealContent,
        Self::SoftBlock,
        Self::HardBlock,
        Self::ChallengeNotCleared,
        Self::ThinContent,
        Self::NetworkError,
        Self::NonHtml,
        Self::RobotsDenied,
        Self::Timeout,
        Self::UnknownFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SuccessRealContent => "success_real_content",
            Self::SoftBlock => "soft_block",
            Self::HardBlock => "hard_block",
            Self::ChallengeNotCleared => "challenge_not_cleared",
            Self::ThinContent => "thin_content",
            Self::NetworkError => "network_error",
            Self::NonHtml => "non_html",
            Self::RobotsDenied => "robots_denied",
            Self::Timeout => "timeout",
            Self::UnknownFailure => "unknown_failure",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|k| k.as_str() == s)
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::SuccessRealContent)
    }

    pub fn recovery(&self) -> Recovery {
        match self {
            Self::SuccessRealContent => Recovery::Success,
            Self::HardBlock | Self::NonHtml | Self::RobotsDenied => Recovery::Terminal,
            Self::NetworkError | Self::Timeout => Recovery::RetrySame,
            Self::SoftBlock | Self::ChallengeNotCleared | Self::ThinContent | Self::UnknownFailure => {
                Recovery::Escalate
            }
        }
    }
}

impl std::fmt::Display for OutcomeKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Machine-readable reason codes attached to outcomes.
pub mod reason {
    pub const CAPTURE_TIMEOUT: &str = "capture_timeout";
    pub const ATTEMPT_DEADLINE: &str = "attempt_deadline_exceeded";
    pub const NETWORK_ERROR: &str = "network_or_navigation_error";
    pub const CAPTURE_ERROR: &str = "capture_error";
    pub const NON_HTML: &str = "non_html_response";
    pub const HARD_BLOCK: &str = "hard_block_signature";
    pub const ROBOTS_DENIED: &str = "robots_disallowed";
    pub const CHALLENGE: &str = "challenge_markers_detected";
    pub const SOFT_BLOCK: &str = "soft_block_markers_detected";
    pub const BLOCK_STATUS_UNSIGNED: &str = "block_status_unsigned";
    pub const SERVER_ERROR: &str = "server_error_status";
    pub const CLIENT_ERROR: &str = "http_client_error";
    pub const UNEXPECTED_STATUS: &str = "unexpected_status";
    pub const INVALID_INPUT: &str = "invalid_attempt_result";
    pub const CLASSIFIER_PANIC: &str = "classifier_panic";
    pub const EMPTY_BODY: &str = "empty_body";
    pub const THIN_CONTENT: &str = "very_low_extracted_words";
    pub const CONTENT_CAPTURED: &str = "content_captured";
    pub const MANUAL_ONLY: &str = "perpetual_manual";
    pub const CANCELLED: &str = "cancelled";
}

/// Classification of one access attempt. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessOutcome {
    pub outcome: OutcomeKind,
    pub reason: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub detected_markers: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub waf_hint: Option<String>,
    #[serde(default)]
    pub challenge_detected: bool,
    #[serde(default)]
    pub word_count_estimate: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub link_density_estimate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub final_url: Option<String>,
}

impl AccessOutcome {
    /// Create an outcome with only a class and a reason.
    pub fn new(outcome: OutcomeKind, reason: impl Into<String>) -> Self {
        Self {
            outcome,
            reason: reason.into(),
            http_status: None,
            detected_markers: Vec::new(),
            waf_hint: None,
            challenge_detected: false,
            word_count_estimate: 0,
            link_density_estimate: None,
            final_url: None,
        }
    }

    pub fn with_status(mut self, status: Option<u16>) -> Self {
        self.http_status = status;
        self
    }

    pub fn with_final_url(mut self, final_url: Option<String>) -> Self {
        self.final_url = final_url;
        self
    }

    pub fn is_success(&self) -> bool {
        self.outcome.is_success()
    }
}

/// Append-only record of one fetch attempt for one URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AccessAttempt {
    pub attempt_index: u32,
    pub strategy: Strategy,
    pub started_at: DateTime<Utc>,
    pub duration_ms: u64,
    pub outcome: AccessOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub capture_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub html_size_bytes: Option<u64>,
}
