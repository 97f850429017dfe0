//! Manual-review escalation queue.

mod queue;
mod router;

pub use queue::{
    CompletedEntry, Diagnostics, FailureReport, HistoryEvent, JsonFileStore, MemoryStore, Priority,
    QueueEntry, QueueError, QueueSettings, QueueState, QueueStore, RouteOutcome,
    DEFAULT_LOOKBACK_DAYS, DEFAULT_PERPETUAL_THRESHOLD,
};
pub use router::EscalationRouter;
