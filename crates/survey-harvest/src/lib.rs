//! # Survey Harvest
//!
//! **A resumable, rate-governed harvester for public surveillance tables.**
//!
//! The engine lives in `survey-harvest-core`. This crate configures it
//! from a TOML file and gives it a real upstream and a real disk:
//!
//! ```text
//! harvest.toml ──▶ Config ──▶ ExecutionScheduler (core)
//!                                 │
//!            ┌────────────────────┼───────────────────┐
//!            ▼                    ▼                   ▼
//!     HttpTransport         FsObjectStore      OutboxNotifier
//!     (reqwest, HTTPS)      (atomic writes)    (log + JSONL outbox)
//! ```
//!
//! ## Commands
//!
//! | Command | Module |
//! |---------|--------|
//! | `harvest run` | [`harvest`] |
//! | `harvest status` | [`harvest`] |
//! | `harvest missing` | [`missing`] |
//! | `harvest continuity` | [`continuity`] |
//! | `harvest verify` | [`verify`] |
//! | `harvest stats` | [`stats`] |

pub mod config;
pub mod continuity;
pub mod fs_store;
pub mod harvest;
pub mod logging;
pub mod missing;
pub mod notify;
pub mod progress;
pub mod stats;
pub mod transport;
pub mod verify;
