//! Adaptive attempt loop.
//!
//! Drives one URL through the escalation ladder:
//! fetch, classify, append the attempt, ask the policy, back off, repeat.
//! Transport failures never leave this module; they become classified
//! attempts. Terminal failures are handed to the escalation router.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use rand::rngs::StdRng;
use rand::SeedableRng;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::backoff_delay;
use super::classifier::{classify, AttemptReport};
use super::outcome::{reason, AccessAttempt, OutcomeKind};
use super::plan::AccessPlan;
use super::policy::{decide_next, Decision, DomainOverride, LadderProgress, Strategy, TerminalReason};
use super::rules::ClassifierRules;
use crate::escalation::{Diagnostics, EscalationRouter, FailureReport};
use crate::recon::ReconHints;
use crate::record::{AccessRecord, AttemptSink};
use crate::transport::{FetchTransport, TransportConfig};
use crate::utils::domain_key;

pub const DEFAULT_ATTEMPT_TIMEOUT: Duration = Duration::from_secs(30);
/// Slack on top of the transport timeout before the loop gives up waiting.
pub const DEFAULT_DEADLINE_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct ControllerSettings {
    /// Timeout handed to the transport for each attempt.
    pub attempt_timeout: Duration,
    pub deadline_grace: Duration,
    /// Domain tier, copied onto queue entries.
    pub tier: Option<u8>,
    /// Fixed seed for backoff jitter.
    pub rng_seed: Option<u64>,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            attempt_timeout: DEFAULT_ATTEMPT_TIMEOUT,
            deadline_grace: DEFAULT_DEADLINE_GRACE,
            tier: None,
            rng_seed: None,
        }
    }
}

/// Runs the attempt loop for URLs. Shared across workers.
pub struct AccessController {
    transport: Arc<dyn FetchTransport>,
    sink: Arc<dyn AttemptSink>,
    router: Option<EscalationRouter>,
    rules: Arc<ClassifierRules>,
    settings: ControllerSettings,
    shutdown: watch::Receiver<bool>,
    rng: Mutex<StdRng>,
}

impl AccessController {
    pub fn new(
        transport: Arc<dyn FetchTransport>,
        sink: Arc<dyn AttemptSink>,
        rules: Arc<ClassifierRules>,
        settings: ControllerSettings,
    ) -> Self {
        let rng = match settings.rng_seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let (_, shutdown) = watch::channel(false);
        Self {
            transport,
            sink,
            router: None,
            rules,
            settings,
            shutdown,
            rng: Mutex::new(rng),
        }
    }

    /// Route terminal failures to the manual-review queue.
    pub fn with_router(mut self, router: EscalationRouter) -> Self {
        self.router = Some(router);
        self
    }

    /// Stop starting new attempts once the flag turns true.
    pub fn with_shutdown(mut self, shutdown: watch::Receiver<bool>) -> Self {
        self.shutdown = shutdown;
        self
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    /// Run the loop for one URL and return its record.
    pub async fn run(
        &self,
        url: &str,
        plan: &AccessPlan,
        domain_override: Option<&DomainOverride>,
        recon: Option<&ReconHints>,
    ) -> AccessRecord {
        let domain = domain_key(url);
        let mut attempts: Vec<AccessAttempt> = Vec::new();

        let mut plan = plan.clone();
        plan.restrict_to(|s| self.transport.supports(&TransportConfig::for_strategy(s)));
        let plan = &plan;

        if plan.skip_auto_ladder {
            info!(url, domain = %domain, "Perpetual manual domain, skipping automated attempts");
            return self
                .finish(url, domain, plan, attempts, Some(TerminalReason::ManualOnly))
                .await;
        }

        if recon.is_some_and(|r| r.robots_disallowed) {
            let attempt = self
                .record_attempt(
                    url,
                    0,
                    plan.initial_strategy,
                    &AttemptReport::RobotsSkipped,
                    recon,
                    Utc::now(),
                    Instant::now(),
                )
                .await;
            attempts.push(attempt);
            return self
                .finish(
                    url,
                    domain,
                    plan,
                    attempts,
                    Some(TerminalReason::NonRecoverable(OutcomeKind::RobotsDenied)),
                )
                .await;
        }

        let mut current = plan.initial_strategy;
        let terminal = loop {
            if self.is_cancelled() {
                break Some(TerminalReason::Cancelled);
            }

            let index = attempts.len() as u32;
            let started_at = Utc::now();
            let started = Instant::now();
            let report = self.fetch(url, current).await;
            let attempt = self
                .record_attempt(url, index, current, &report, recon, started_at, started)
                .await;
            let kind = attempt.outcome.outcome;
            attempts.push(attempt);

            let progress = LadderProgress::from_attempts(&attempts);
            match decide_next(current, kind, index, &progress, plan, domain_override) {
                Decision::Success => break None,
                Decision::Fail(terminal) => break Some(terminal),
                Decision::RetrySame(next) | Decision::Escalate(next) => {
                    let patient = plan.patient_mode || next == Strategy::StealthPatient;
                    let delay = {
                        let mut rng = self.rng.lock().unwrap_or_else(|e| e.into_inner());
                        backoff_delay(index, kind, patient, plan.delay_seconds, &mut *rng)
                    };
                    if next != current {
                        info!(url, from = %current, to = %next, "Escalating after {}", kind);
                    }
                    debug!(url, delay_ms = delay.as_millis() as u64, "Backing off");
                    if !self.sleep_unless_cancelled(delay).await {
                        break Some(TerminalReason::Cancelled);
                    }
                    current = next;
                }
            }
        };

        self.finish(url, domain, plan, attempts, terminal).await
    }

    async fn fetch(&self, url: &str, strategy: Strategy) -> AttemptReport {
        let config = TransportConfig::for_strategy(strategy);
        let deadline = self.settings.attempt_timeout + self.settings.deadline_grace;
        let call = self
            .transport
            .fetch(url, &config, self.settings.attempt_timeout);
        match tokio::time::timeout(deadline, call).await {
            Ok(Ok(response)) => AttemptReport::Fetched(response),
            Ok(Err(error)) => AttemptReport::TransportFailed {
                error,
                final_url: None,
            },
            Err(_) => AttemptReport::DeadlineExceeded(deadline),
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_attempt(
        &self,
        url: &str,
        index: u32,
        strategy: Strategy,
        report: &AttemptReport,
        recon: Option<&ReconHints>,
        started_at: chrono::DateTime<Utc>,
        started: Instant,
    ) -> AccessAttempt {
        let outcome = classify(report, None, recon, &self.rules);
        let attempt = AccessAttempt {
            attempt_index: index,
            strategy,
            started_at,
            duration_ms: started.elapsed().as_millis() as u64,
            capture_error: report.capture_error(),
            html_size_bytes: report.html_size_bytes(),
            outcome,
        };

        info!(
            url,
            attempt = index,
            strategy = %strategy,
            outcome = %attempt.outcome.outcome,
            reason = %attempt.outcome.reason,
            "Attempt classified"
        );
        if let Err(e) = self.sink.append(url, &attempt).await {
            warn!(url, "Failed to append attempt {}: {}", index, e);
        }
        attempt
    }

    async fn finish(
        &self,
        url: &str,
        domain: String,
        plan: &AccessPlan,
        attempts: Vec<AccessAttempt>,
        terminal: Option<TerminalReason>,
    ) -> AccessRecord {
        let last = attempts.last();
        let success = terminal.is_none() && last.is_some_and(|a| a.outcome.is_success());
        let final_outcome = last.map(|a| a.outcome.clone());
        let final_strategy = last.map(|a| a.strategy);

        let mut record = AccessRecord {
            url: url.to_string(),
            domain,
            plan: plan.clone(),
            attempts,
            final_outcome,
            final_strategy,
            success,
            terminal_reason: terminal,
            queued: false,
            perpetual_manual: plan.skip_auto_ladder,
            completed_at: Utc::now(),
        };

        match terminal {
            None => info!(url, strategy = ?record.final_strategy, "Access succeeded"),
            Some(reason) => {
                warn!(url, attempts = record.attempts.len(), "Access failed: {}", reason);
                if routes_to_queue(reason) {
                    self.route(&mut record, reason).await;
                }
            }
        }
        record
    }

    async fn route(&self, record: &mut AccessRecord, terminal: TerminalReason) {
        let Some(router) = &self.router else {
            return;
        };
        let outcome = record.final_outcome.as_ref();
        let report = FailureReport {
            domain: record.domain.clone(),
            reason: outcome
                .map(|o| o.reason.clone())
                .unwrap_or_else(|| reason::MANUAL_ONLY.to_string()),
            tier: self.settings.tier,
            attempted_strategies: record.strategies_used(),
            diagnostics: Diagnostics {
                url: record.url.clone(),
                outcome: outcome.map(|o| o.outcome),
                terminal_reason: Some(terminal.as_code().to_string()),
                detected_markers: outcome.map(|o| o.detected_markers.clone()).unwrap_or_default(),
                waf_hint: outcome.and_then(|o| o.waf_hint.clone()),
                http_status: outcome.and_then(|o| o.http_status),
                final_url: outcome.and_then(|o| o.final_url.clone()),
            },
        };
        match router.route_terminal_failure(report).await {
            Ok(routed) => {
                record.queued = true;
                record.perpetual_manual |= routed.perpetual_manual;
            }
            Err(e) => warn!(url = %record.url, "Failed to queue for manual review: {}", e),
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.shutdown.borrow()
    }

    /// Sleep for `delay`. Returns false if shutdown was requested first.
    async fn sleep_unless_cancelled(&self, delay: Duration) -> bool {
        let mut shutdown = self.shutdown.clone();
        if *shutdown.borrow() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(delay) => true,
            Ok(_) = shutdown.wait_for(|stop| *stop) => false,
        }
    }
}

/// Robots denials and shutdowns are nothing a human can act on.
fn routes_to_queue(reason: TerminalReason) -> bool {
    !matches!(
        reason,
        TerminalReason::NonRecoverable(OutcomeKind::RobotsDenied) | TerminalReason::Cancelled
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::escalation::{MemoryStore, QueueSettings};
    use crate::record::MemoryAttemptLog;
    use crate::transport::{FetchResponse, TransportError};
    use async_trait::async_trait;
    use std::collections::VecDeque;

    /// Returns canned results in order, then repeats the last one.
    struct Scripted {
        steps: tokio::sync::Mutex<VecDeque<Result<FetchResponse, TransportError>>>,
        seen: tokio::sync::Mutex<Vec<TransportConfig>>,
    }

    impl Scripted {
        fn new(steps: Vec<Result<FetchResponse, TransportError>>) -> Self {
            Self {
                steps: tokio::sync::Mutex::new(steps.into()),
                seen: tokio::sync::Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl FetchTransport for Scripted {
        async fn fetch(
            &self,
            _url: &str,
            config: &TransportConfig,
            _timeout: Duration,
        ) -> Result<FetchResponse, TransportError> {
            self.seen.lock().await.push(*config);
            let mut steps = self.steps.lock().await;
            if steps.len() > 1 {
                steps.pop_front().unwrap()
            } else {
                steps.front().cloned().unwrap()
            }
        }
    }

    fn html(status: u16, body: &str) -> Result<FetchResponse, TransportError> {
        let mut response = FetchResponse {
            status: Some(status),
            body: body.as_bytes().to_vec(),
            ..FetchResponse::default()
        };
        response
            .headers
            .insert("content-type".into(), "text/html; charset=utf-8".into());
        Ok(response)
    }

    fn article() -> String {
        let words = "the quarterly report describes open positions across engineering teams ".repeat(30);
        format!("<html><body><article><p>{}</p></article></body></html>", words)
    }

    fn controller(transport: Arc<dyn FetchTransport>, log: Arc<MemoryAttemptLog>) -> AccessController {
        AccessController::new(
            transport,
            log,
            Arc::new(ClassifierRules::default()),
            ControllerSettings {
                rng_seed: Some(1),
                ..ControllerSettings::default()
            },
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_soft_block_then_success() {
        let transport = Arc::new(Scripted::new(vec![
            html(200, "<html><body>Your request has been blocked</body></html>"),
            html(200, &article()),
        ]));
        let log = Arc::new(MemoryAttemptLog::new());
        let ctl = controller(transport.clone(), log.clone());

        let record = ctl
            .run("https://example.com/jobs", &AccessPlan::default(), None, None)
            .await;

        assert!(record.success);
        assert_eq!(record.final_strategy, Some(Strategy::Js));
        assert_eq!(record.attempts.len(), 2);
        assert_eq!(record.attempts[0].outcome.outcome, OutcomeKind::SoftBlock);
        assert_eq!(log.for_url("https://example.com/jobs").await.len(), 2);
        let seen = transport.seen.lock().await;
        assert_eq!(seen[0], TransportConfig::Http);
        assert!(seen[1].is_browser());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_errors_are_captured() {
        let transport = Arc::new(Scripted::new(vec![Err(TransportError::Connect(
            "connection refused".into(),
        ))]));
        let log = Arc::new(MemoryAttemptLog::new());
        let record = controller(transport, log)
            .run("https://example.com/", &AccessPlan::default(), None, None)
            .await;

        assert!(!record.success);
        assert_eq!(record.attempts.len(), 3);
        assert!(record
            .attempts
            .iter()
            .all(|a| a.capture_error.as_deref() == Some("connection failed: connection refused")));
        assert_eq!(
            record.terminal_reason,
            Some(TerminalReason::AttemptBudgetExhausted)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_hard_block_is_queued_immediately() {
        let transport = Arc::new(Scripted::new(vec![html(403, "Access Denied - Incapsula")]));
        let store = Arc::new(MemoryStore::default());
        let (router, _handle) = EscalationRouter::spawn(store.clone(), QueueSettings::default());
        let record = controller(transport, Arc::new(MemoryAttemptLog::new()))
            .with_router(router)
            .run("https://blocked.example.com/", &AccessPlan::default(), None, None)
            .await;

        assert_eq!(record.attempts.len(), 1);
        assert!(record.queued);
        let state = store.snapshot().await;
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].domain, "blocked.example.com");
        assert_eq!(state.queue[0].diagnostics.http_status, Some(403));
        assert_eq!(state.queue[0].diagnostics.outcome, Some(OutcomeKind::HardBlock));
    }

    /// Scripted transport with no browser behind it.
    struct HttpOnly(Scripted);

    #[async_trait]
    impl FetchTransport for HttpOnly {
        async fn fetch(
            &self,
            url: &str,
            config: &TransportConfig,
            timeout: Duration,
        ) -> Result<FetchResponse, TransportError> {
            self.0.fetch(url, config, timeout).await
        }

        fn supports(&self, config: &TransportConfig) -> bool {
            !config.is_browser()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_http_only_stops_at_real_block() {
        let transport = Arc::new(HttpOnly(Scripted::new(vec![html(
            200,
            "<html><body>Your request has been blocked</body></html>",
        )])));
        let store = Arc::new(MemoryStore::default());
        let (router, _handle) = EscalationRouter::spawn(store.clone(), QueueSettings::default());
        let record = controller(transport.clone(), Arc::new(MemoryAttemptLog::new()))
            .with_router(router)
            .run("https://nobrowser.example.com/", &AccessPlan::default(), None, None)
            .await;

        assert_eq!(record.attempts.len(), 1);
        assert_eq!(transport.0.seen.lock().await.as_slice(), &[TransportConfig::Http]);
        assert_eq!(record.terminal_reason, Some(TerminalReason::LadderExhausted));
        let outcome = record.final_outcome.as_ref().unwrap();
        assert_eq!(outcome.outcome, OutcomeKind::SoftBlock);
        assert!(record.attempts[0].capture_error.is_none());

        let state = store.snapshot().await;
        let diagnostics = &state.queue[0].diagnostics;
        assert_eq!(diagnostics.outcome, Some(OutcomeKind::SoftBlock));
        assert!(!diagnostics.detected_markers.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_robots_denial_not_queued() {
        let transport = Arc::new(Scripted::new(vec![html(200, &article())]));
        let store = Arc::new(MemoryStore::default());
        let (router, _handle) = EscalationRouter::spawn(store.clone(), QueueSettings::default());
        let recon = ReconHints {
            robots_disallowed: true,
            ..ReconHints::default()
        };
        let record = controller(transport.clone(), Arc::new(MemoryAttemptLog::new()))
            .with_router(router)
            .run("https://example.com/", &AccessPlan::default(), None, Some(&recon))
            .await;

        assert_eq!(record.attempts.len(), 1);
        assert_eq!(
            record.attempts[0].outcome.outcome,
            OutcomeKind::RobotsDenied
        );
        assert!(!record.queued);
        assert!(transport.seen.lock().await.is_empty());
        assert!(store.snapshot().await.queue.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_slow_transport_hits_deadline() {
        struct Hang;
        #[async_trait]
        impl FetchTransport for Hang {
            async fn fetch(
                &self,
                _url: &str,
                _config: &TransportConfig,
                _timeout: Duration,
            ) -> Result<FetchResponse, TransportError> {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(TransportError::Other("unreachable".into()))
            }
        }

        let plan = AccessPlan {
            max_attempts: 1,
            ..AccessPlan::default()
        };
        let record = controller(Arc::new(Hang), Arc::new(MemoryAttemptLog::new()))
            .run("https://example.com/", &plan, None, None)
            .await;
        assert_eq!(record.attempts[0].outcome.outcome, OutcomeKind::Timeout);
        assert_eq!(record.attempts[0].outcome.reason, reason::ATTEMPT_DEADLINE);
    }

    #[tokio::test(start_paused = true)]
    async fn test_perpetual_manual_skips_fetch() {
        let transport = Arc::new(Scripted::new(vec![html(200, &article())]));
        let store = Arc::new(MemoryStore::default());
        let (router, _handle) = EscalationRouter::spawn(store.clone(), QueueSettings::default());
        let mut plan = AccessPlan::default();
        plan.mark_perpetual_manual();

        let record = controller(transport.clone(), Arc::new(MemoryAttemptLog::new()))
            .with_router(router)
            .run("https://manual.example.com/", &plan, None, None)
            .await;

        assert!(record.attempts.is_empty());
        assert_eq!(record.terminal_reason, Some(TerminalReason::ManualOnly));
        assert!(record.queued);
        assert!(transport.seen.lock().await.is_empty());
        assert_eq!(store.snapshot().await.queue[0].reason, reason::MANUAL_ONLY);
    }
}
