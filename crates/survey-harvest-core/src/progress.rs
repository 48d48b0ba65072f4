//! Progress events emitted by the scheduler.
//!
//! Rendering is up to the caller; the binary prints them on stderr so
//! stdout stays parseable.

/// A single progress event for a harvest run.
#[derive(Clone, Debug, PartialEq)]
pub enum ProgressEvent {
    /// The backlog is known. `resumed` is set when it came from a
    /// checkpoint.
    Enumerated { total: u64, resumed: bool },
    /// One item reached a terminal resolution or was requeued.
    ItemResolved {
        item: String,
        outcome: &'static str,
        done: u64,
        total: u64,
    },
    Checkpointed { pending: u64 },
    /// The run stopped in `phase` (`drained` or `suspended`).
    Stopped {
        phase: &'static str,
        done: u64,
        total: u64,
    },
}

/// Receives progress events. Called from the scheduler's driver loop, so
/// implementations should return quickly.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}
