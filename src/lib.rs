//! In-process performance observability engine.
//!
//! Instrumented components push timestamped metric samples and trace spans
//! into the engine; a periodic tick aggregates rolling windows, evaluates
//! threshold and trend rules, ranks remediation recommendations, and
//! broadcasts immutable [`snapshot::DashboardSnapshot`] values to connected
//! dashboard clients with per-client backpressure.

pub mod analysis;
pub mod broadcast;
pub mod config;
pub mod engine;
pub mod error;
pub mod metrics;
pub mod snapshot;
pub mod trace;
