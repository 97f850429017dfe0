//! Inter-attempt delay.

use std::time::Duration;

use rand::Rng;

use super::outcome::OutcomeKind;

/// Hard ceiling on any single backoff.
pub const MAX_BACKOFF_SECS: f64 = 120.0;
/// Lower bound so retries never hammer.
pub const MIN_BACKOFF_SECS: f64 = 1.0;
/// Base range used in patient mode and after block/challenge outcomes.
pub const PATIENT_BASE_SECS: (f64, f64) = (8.0, 20.0);
/// Relative jitter applied to every delay.
pub const JITTER_FRACTION: f64 = 0.2;

/// Delay before the attempt after `attempt_index`.
///
/// `base_secs` is the plan's `delay_seconds`. Patient mode, `soft_block` and
/// `challenge_not_cleared` swap it for a base drawn from `PATIENT_BASE_SECS`.
/// The result is `base * 2^attempt_index` with ±20% jitter, kept within
/// `[MIN_BACKOFF_SECS, MAX_BACKOFF_SECS]`.
pub fn backoff_delay<R: Rng + ?Sized>(
    attempt_index: u32,
    outcome: OutcomeKind,
    patient_mode: bool,
    base_secs: f64,
    rng: &mut R,
) -> Duration {
    let patient = patient_mode
        || matches!(
            outcome,
            OutcomeKind::SoftBlock | OutcomeKind::ChallengeNotCleared
        );
    let base = if patient {
        rng.gen_range(PATIENT_BASE_SECS.0..=PATIENT_BASE_SECS.1)
    } else {
        base_secs.max(0.0)
    };

    let exponential = base * 2f64.powi(attempt_index.min(16) as i32);
    let capped = exponential.min(MAX_BACKOFF_SECS);
    let jitter = capped * rng.gen_range(-JITTER_FRACTION..=JITTER_FRACTION);

    Duration::from_secs_f64((capped + jitter).clamp(MIN_BACKOFF_SECS, MAX_BACKOFF_SECS))
}
