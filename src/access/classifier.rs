//! Outcome classifier.
//!
//! Turns one attempt's raw result into exactly one `AccessOutcome`. Rules are
//! checked in a fixed order and the first match wins:
//!
//! 1. transport failure, deadline or robots skip (no response to inspect)
//! 2. non-HTML payload
//! 3. blocking status with a deny or WAF signature (hard block)
//! 4. challenge markers without real content
//! 5. soft-block phrases on a nominally successful response
//! 6. remaining non-2xx statuses
//! 7. empty or thin content
//! 8. success
//!
//! Classification is pure. Malformed input and internal panics degrade to
//! `unknown_failure` instead of propagating.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::time::Duration;

use tracing::warn;

use super::outcome::{reason, AccessOutcome, OutcomeKind};
use super::rules::{marker_hits, ClassifierRules};
use crate::content::ContentEstimate;
use crate::recon::{detect_waf_from_headers, ReconHints};
use crate::transport::{FetchResponse, TransportError};
use crate::utils::{is_html_content_type, sniff_binary};

/// Statuses that servers use to refuse bots.
pub const BLOCK_STATUSES: [u16; 3] = [403, 429, 451];

/// Raw result of one attempt, as handed to the classifier.
#[derive(Debug, Clone)]
pub enum AttemptReport {
    /// The transport returned a response.
    Fetched(FetchResponse),
    /// The transport failed before producing a response.
    TransportFailed {
        error: TransportError,
        final_url: Option<String>,
    },
    /// The controller's per-attempt deadline fired before the transport returned.
    DeadlineExceeded(Duration),
    /// Robots policy denied the URL, so nothing was fetched.
    RobotsSkipped,
}

impl AttemptReport {
    pub fn capture_error(&self) -> Option<String> {
        match self {
            Self::TransportFailed { error, .. } => Some(error.to_string()),
            Self::DeadlineExceeded(limit) => Some(format!("attempt exceeded {:?}", limit)),
            Self::Fetched(_) | Self::RobotsSkipped => None,
        }
    }

    pub fn html_size_bytes(&self) -> Option<u64> {
        match self {
            Self::Fetched(response) => Some(response.body.len() as u64),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
enum ClassifyError {
    #[error("status {0} is not a valid HTTP status")]
    InvalidStatus(u16),
    #[error("classifier panicked: {0}")]
    Panicked(String),
}

/// Classify one attempt.
///
/// `estimate` is an optional precomputed word-count/link-density estimate;
/// when absent it is computed from the body. `recon` contributes WAF hints.
pub fn classify(
    report: &AttemptReport,
    estimate: Option<&ContentEstimate>,
    recon: Option<&ReconHints>,
    rules: &ClassifierRules,
) -> AccessOutcome {
    let result = catch_unwind(AssertUnwindSafe(|| {
        classify_report(report, estimate, recon, rules)
    }))
    .unwrap_or_else(|payload| {
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        Err(ClassifyError::Panicked(message))
    });

    match result {
        Ok(outcome) => outcome,
        Err(e) => {
            warn!("Classification degraded to unknown_failure: {}", e);
            let code = match e {
                ClassifyError::InvalidStatus(_) => reason::INVALID_INPUT,
                ClassifyError::Panicked(_) => reason::CLASSIFIER_PANIC,
            };
            let mut outcome = AccessOutcome::new(OutcomeKind::UnknownFailure, code);
            if let AttemptReport::Fetched(response) = report {
                outcome.final_url = response.final_url.clone();
            }
            outcome
        }
    }
}

fn classify_report(
    report: &AttemptReport,
    estimate: Option<&ContentEstimate>,
    recon: Option<&ReconHints>,
    rules: &ClassifierRules,
) -> Result<AccessOutcome, ClassifyError> {
    match report {
        AttemptReport::TransportFailed { error, final_url } => {
            Ok(classify_transport_error(error).with_final_url(final_url.clone()))
        }
        AttemptReport::DeadlineExceeded(_) => Ok(AccessOutcome::new(
            OutcomeKind::Timeout,
            reason::ATTEMPT_DEADLINE,
        )),
        AttemptReport::RobotsSkipped => Ok(AccessOutcome::new(
            OutcomeKind::RobotsDenied,
            reason::ROBOTS_DENIED,
        )),
        AttemptReport::Fetched(response) => classify_response(response, estimate, recon, rules),
    }
}

fn classify_transport_error(error: &TransportError) -> AccessOutcome {
    match error {
        TransportError::Timeout(_) => AccessOutcome::new(OutcomeKind::Timeout, reason::CAPTURE_TIMEOUT),
        e if e.is_network() => AccessOutcome::new(OutcomeKind::NetworkError, reason::NETWORK_ERROR),
        _ => AccessOutcome::new(OutcomeKind::UnknownFailure, reason::CAPTURE_ERROR),
    }
}

fn classify_response(
    response: &FetchResponse,
    estimate: Option<&ContentEstimate>,
    recon: Option<&ReconHints>,
    rules: &ClassifierRules,
) -> Result<AccessOutcome, ClassifyError> {
    let status = response.status;
    if let Some(code) = status {
        if !(100..=599).contains(&code) {
            return Err(ClassifyError::InvalidStatus(code));
        }
    }

    // Markers anywhere in the body count.
    let lower = response.body_text().to_lowercase();

    let body_waf = rules.waf_from_body(&lower);
    let waf_hint = detect_waf_from_headers(&response.headers)
        .map(str::to_string)
        .or_else(|| body_waf.map(|(vendor, _)| vendor.to_string()))
        .or_else(|| recon.and_then(|r| r.waf_detected.clone()));

    let base = |kind: OutcomeKind, code: &str| {
        let mut outcome = AccessOutcome::new(kind, code)
            .with_status(status)
            .with_final_url(response.final_url.clone());
        outcome.waf_hint = waf_hint.clone();
        outcome
    };

    // 2. Non-HTML payload.
    if !is_html_content_type(response.content_type()) || sniff_binary(&response.body).is_some() {
        return Ok(base(OutcomeKind::NonHtml, reason::NON_HTML));
    }

    let computed;
    let estimate = match estimate {
        Some(e) => e,
        None => {
            computed = ContentEstimate::from_html(&response.body_text());
            &computed
        }
    };
    let with_estimate = |mut outcome: AccessOutcome| {
        outcome.word_count_estimate = estimate.word_count;
        outcome.link_density_estimate = estimate.link_density;
        outcome
    };

    // 3. Hard block: blocking status plus a deny or vendor signature.
    let blocking_status = status.is_some_and(|s| BLOCK_STATUSES.contains(&s));
    if blocking_status {
        let mut markers = marker_hits(&lower, &rules.hard_block_markers);
        if let Some((_, signature)) = body_waf {
            if !markers.iter().any(|m| m == signature) {
                markers.push(signature.to_string());
            }
        }
        if !markers.is_empty() {
            let mut outcome = with_estimate(base(OutcomeKind::HardBlock, reason::HARD_BLOCK));
            outcome.detected_markers = markers;
            return Ok(outcome);
        }
    }

    // 4. Challenge interstitial without real content behind it.
    let challenge_hits = marker_hits(&lower, &rules.challenge_markers);
    let challenge_detected =
        !challenge_hits.is_empty() || recon.is_some_and(|r| r.challenge_detected && blocking_status);
    let real_content = estimate.word_count >= rules.real_content_min_words;
    if !challenge_hits.is_empty() && !real_content {
        let mut outcome = with_estimate(base(OutcomeKind::ChallengeNotCleared, reason::CHALLENGE));
        outcome.detected_markers = challenge_hits;
        outcome.challenge_detected = true;
        return Ok(outcome);
    }

    // 5. Soft block: a nominal success carrying a denial page.
    let nominal_success = status.map_or(true, |s| (200..300).contains(&s));
    let soft_hits = marker_hits(&lower, &rules.soft_block_markers);
    if nominal_success && !soft_hits.is_empty() {
        let mut outcome = with_estimate(base(OutcomeKind::SoftBlock, reason::SOFT_BLOCK));
        outcome.detected_markers = soft_hits;
        outcome.challenge_detected = challenge_detected;
        return Ok(outcome);
    }

    // 6. Any other non-2xx status is never success.
    if let Some(code) = status.filter(|_| !nominal_success) {
        let (kind, code_reason) = match code {
            s if BLOCK_STATUSES.contains(&s) => (OutcomeKind::SoftBlock, reason::BLOCK_STATUS_UNSIGNED),
            500..=599 => (OutcomeKind::NetworkError, reason::SERVER_ERROR),
            400..=499 => (OutcomeKind::UnknownFailure, reason::CLIENT_ERROR),
            _ => (OutcomeKind::UnknownFailure, reason::UNEXPECTED_STATUS),
        };
        let mut outcome = with_estimate(base(kind, code_reason));
        outcome.detected_markers = soft_hits;
        outcome.challenge_detected = challenge_detected;
        return Ok(outcome);
    }

    // 7. Thin content.
    if response.body.iter().all(u8::is_ascii_whitespace) {
        return Ok(with_estimate(base(OutcomeKind::ThinContent, reason::EMPTY_BODY)));
    }
    let boilerplate = match estimate.link_density {
        Some(density) => density >= rules.max_link_density,
        None => response.body.len() > rules.thin_min_html_bytes,
    };
    if estimate.word_count < rules.min_words && boilerplate {
        let mut outcome = with_estimate(base(OutcomeKind::ThinContent, reason::THIN_CONTENT));
        outcome.challenge_detected = challenge_detected;
        return Ok(outcome);
    }

    // 8. Success. Markers stay empty on success.
    let mut outcome = with_estimate(base(OutcomeKind::SuccessRealContent, reason::CONTENT_CAPTURED));
    outcome.challenge_detected = challenge_detected;
    Ok(outcome)
}
