//! Single-writer router in front of the queue store.
//!
//! Concurrent URL workers send commands over a channel; one task owns the
//! store and applies them in order, so the perpetual-manual check and the
//! append never interleave.

use std::sync::Arc;

use chrono::Utc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::queue::{
    FailureReport, QueueEntry, QueueError, QueueSettings, QueueState, QueueStore, RouteOutcome,
};

const CHANNEL_CAPACITY: usize = 64;

type Reply<T> = oneshot::Sender<Result<T, QueueError>>;

enum Command {
    Route(Box<FailureReport>, Reply<RouteOutcome>),
    Complete {
        domain: String,
        pages: u64,
        words: u64,
        reply: Reply<bool>,
    },
    Next(Reply<Option<QueueEntry>>),
    List(Reply<Vec<QueueEntry>>),
    Clear(Reply<usize>),
    IsPerpetual(String, Reply<bool>),
}

/// Handle to the router task. Cheap to clone.
#[derive(Clone)]
pub struct EscalationRouter {
    tx: mpsc::Sender<Command>,
}

impl EscalationRouter {
    /// Start the router task over `store`.
    ///
    /// The task exits once every handle is dropped.
    pub fn spawn(store: Arc<dyn QueueStore>, settings: QueueSettings) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let handle = tokio::spawn(run(store, settings, rx));
        (Self { tx }, handle)
    }

    /// Append a terminal failure, flagging the domain if it keeps coming back.
    pub async fn route_terminal_failure(
        &self,
        report: FailureReport,
    ) -> Result<RouteOutcome, QueueError> {
        self.request(|reply| Command::Route(Box::new(report), reply))
            .await
    }

    /// Mark a queued domain as handled by a human.
    pub async fn complete(&self, domain: &str, pages: u64, words: u64) -> Result<bool, QueueError> {
        let domain = domain.to_string();
        self.request(|reply| Command::Complete {
            domain,
            pages,
            words,
            reply,
        })
        .await
    }

    pub async fn next(&self) -> Result<Option<QueueEntry>, QueueError> {
        self.request(Command::Next).await
    }

    pub async fn list(&self) -> Result<Vec<QueueEntry>, QueueError> {
        self.request(Command::List).await
    }

    pub async fn clear(&self) -> Result<usize, QueueError> {
        self.request(Command::Clear).await
    }

    pub async fn is_perpetual_manual(&self, domain: &str) -> Result<bool, QueueError> {
        let domain = domain.to_string();
        self.request(|reply| Command::IsPerpetual(domain, reply))
            .await
    }

    async fn request<T>(&self, build: impl FnOnce(Reply<T>) -> Command) -> Result<T, QueueError> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(build(reply))
            .await
            .map_err(|_| QueueError::RouterGone)?;
        rx.await.map_err(|_| QueueError::RouterGone)?
    }
}

async fn run(store: Arc<dyn QueueStore>, settings: QueueSettings, mut rx: mpsc::Receiver<Command>) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Route(report, reply) => {
                let result = mutate(store.as_ref(), |state| {
                    let domain = report.domain.clone();
                    let outcome = state.route(*report, Utc::now(), &settings);
                    if outcome.perpetual_manual {
                        warn!(
                            "{} queued for manual review again ({} recent appearances); flagged perpetual manual",
                            domain, outcome.prior_appearances
                        );
                    } else {
                        info!("Queued {} for manual review", domain);
                    }
                    outcome
                })
                .await;
                let _ = reply.send(result);
            }
            Command::Complete {
                domain,
                pages,
                words,
                reply,
            } => {
                let result = mutate(store.as_ref(), |state| {
                    state.complete(&domain, pages, words, Utc::now())
                })
                .await;
                let _ = reply.send(result);
            }
            Command::Next(reply) => {
                let result = store.load().await.map(|state| state.next().cloned());
                let _ = reply.send(result);
            }
            Command::List(reply) => {
                let result = store.load().await.map(|state| state.queue);
                let _ = reply.send(result);
            }
            Command::Clear(reply) => {
                let result = mutate(store.as_ref(), QueueState::clear).await;
                let _ = reply.send(result);
            }
            Command::IsPerpetual(domain, reply) => {
                let result = store
                    .load()
                    .await
                    .map(|state| state.is_perpetual_manual(&domain, Utc::now(), &settings));
                let _ = reply.send(result);
            }
        }
    }
    debug!("Escalation router stopped");
}

async fn mutate<T>(
    store: &dyn QueueStore,
    apply: impl FnOnce(&mut QueueState) -> T,
) -> Result<T, QueueError> {
    let mut state = store.load().await?;
    let value = apply(&mut state);
    store.save(&state).await?;
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::Strategy;
    use crate::escalation::queue::{Diagnostics, MemoryStore};

    fn report(domain: &str) -> FailureReport {
        FailureReport {
            domain: domain.to_string(),
            reason: "attempt_budget_exhausted".to_string(),
            tier: None,
            attempted_strategies: vec![Strategy::Requests],
            diagnostics: Diagnostics {
                url: format!("https://{}/jobs", domain),
                ..Diagnostics::default()
            },
        }
    }

    #[tokio::test]
    async fn test_concurrent_routes_are_serialized() {
        let store = Arc::new(MemoryStore::default());
        let (router, handle) = EscalationRouter::spawn(store.clone(), QueueSettings::default());

        let mut tasks = Vec::new();
        for _ in 0..5 {
            let router = router.clone();
            tasks.push(tokio::spawn(async move {
                router.route_terminal_failure(report("example.com")).await
            }));
        }
        let mut flagged = 0;
        for task in tasks {
            if task.await.unwrap().unwrap().perpetual_manual {
                flagged += 1;
            }
        }
        // Appearances 4 and 5 see at least three prior ones.
        assert_eq!(flagged, 2);

        let state = store.snapshot().await;
        assert_eq!(state.queue.len(), 1);
        assert_eq!(state.queue[0].requeue_count, 4);
        assert_eq!(state.history.len(), 5);
        assert!(router.is_perpetual_manual("www.example.com").await.unwrap());

        drop(router);
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_queue_lifecycle() {
        let store = Arc::new(MemoryStore::default());
        let (router, _handle) = EscalationRouter::spawn(store, QueueSettings::default());

        router.route_terminal_failure(report("a.example.com")).await.unwrap();
        router.route_terminal_failure(report("b.example.com")).await.unwrap();
        assert_eq!(router.list().await.unwrap().len(), 2);
        assert_eq!(
            router.next().await.unwrap().map(|e| e.domain),
            Some("a.example.com".to_string())
        );

        assert!(router.complete("a.example.com", 3, 900).await.unwrap());
        assert_eq!(router.clear().await.unwrap(), 1);
        assert!(router.next().await.unwrap().is_none());
        assert!(!router.is_perpetual_manual("a.example.com").await.unwrap());
    }
}
