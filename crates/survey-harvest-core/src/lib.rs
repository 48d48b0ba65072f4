//! # Survey Harvest Core
//!
//! The fetch-and-land engine behind Survey Harvest: pacing, retry,
//! validation, content-addressed landing and the checkpointed scheduler
//! that drives them.
//!
//! This crate performs no network or filesystem I/O of its own. The
//! upstream is reached through the [`fetch::Transport`] trait and all
//! persistence goes through [`store::ObjectStore`], so the whole engine
//! can run against in-memory collaborators in tests.
//!
//! ```text
//! ┌──────────────┐   ┌──────────────┐   ┌─────────────┐   ┌──────────────┐
//! │  Scheduler   │──▶│ FetchClient  │──▶│ QualityGate │──▶│ ContentStore │
//! │ backlog+ckpt │   │ rate+retry   │   │ size/shape/ │   │ dedup, land, │
//! └──────┬───────┘   └──────────────┘   │ anomaly     │   │ quarantine   │
//!        │                              └─────────────┘   └──────────────┘
//!        ▼
//!   MetricsRecorder / Notifier
//! ```

pub mod backlog;
pub mod checkpoint;
pub mod config;
pub mod content;
pub mod error;
pub mod fetch;
pub mod metrics;
pub mod models;
pub mod notify;
pub mod progress;
pub mod quality;
pub mod rate_limit;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod tabular;
