//! Ingestion scheduler and worker pool.
//!
//! A run probes its dependencies, enumerates tracked (entity, period) pairs,
//! enqueues the stale ones and drains the queue with a fixed number of
//! workers. Each job owns one browser session and runs resolve -> wait ->
//! persist serially.

mod preflight;
mod runner;
mod types;

pub use preflight::{probe_store, probe_tcp, ProbePolicy};
pub use runner::IngestScheduler;
pub use types::*;
