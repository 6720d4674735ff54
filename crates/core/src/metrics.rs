//! Prometheus metrics for ingestion, interception and realtime sync.
//!
//! Metrics are process-global. The runner renders them with
//! [`encode_metrics`] and, when configured, writes them to a textfile for the
//! node exporter after each run.

use std::path::Path;

use once_cell::sync::Lazy;
use prometheus::{
    core::Collector, Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, Opts,
    Registry, TextEncoder,
};

/// Global metrics registry.
pub static REGISTRY: Lazy<Registry> = Lazy::new(|| {
    let registry = Registry::new();
    register_metrics(&registry);
    registry
});

// =============================================================================
// Scheduler
// =============================================================================

/// Finished ingestion jobs by outcome.
pub static JOBS_TOTAL: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new("yieldsync_jobs_total", "Ingestion jobs by outcome"),
        &["status"], // "ingested", "up_to_date", "resolution_failed", "no_artifact", "persist_failed", "crashed"
    )
    .unwrap()
});

/// Candidate page attempts by result.
pub static RESOLUTION_ATTEMPTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "yieldsync_resolution_attempts_total",
            "Candidate URL attempts during identifier resolution",
        ),
        &["result"], // "resolved", "no_element", "bad_payload", "browser_error"
    )
    .unwrap()
});

/// Time spent waiting for the rendezvous artifact.
pub static ARTIFACT_WAIT: Lazy<HistogramVec> = Lazy::new(|| {
    HistogramVec::new(
        HistogramOpts::new(
            "yieldsync_artifact_wait_seconds",
            "Time until the rendezvous artifact reached a terminal state",
        )
        .buckets(vec![0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0, 120.0]),
        &["outcome"], // "ready", "empty", "not_found"
    )
    .unwrap()
});

/// Observations written to the store.
pub static ROWS_PERSISTED: Lazy<IntCounter> = Lazy::new(|| {
    IntCounter::new(
        "yieldsync_rows_persisted_total",
        "Daily observations upserted",
    )
    .unwrap()
});

// =============================================================================
// Interceptor
// =============================================================================

/// Interceptor decisions by kind.
pub static INTERCEPTOR_EVENTS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "yieldsync_interceptor_events_total",
            "Interceptor hook decisions",
        ),
        &["event"], // "forwarded", "no_content", "dropped", "empty", "replay", "completed"
    )
    .unwrap()
});

// =============================================================================
// Realtime
// =============================================================================

/// Realtime rows by action taken.
pub static REALTIME_ROWS: Lazy<IntCounterVec> = Lazy::new(|| {
    IntCounterVec::new(
        Opts::new(
            "yieldsync_realtime_rows_total",
            "Realtime snapshot rows by action",
        ),
        &["action"], // "inserted", "closed", "skipped"
    )
    .unwrap()
});

fn register_metrics(registry: &Registry) {
    let collectors: Vec<Box<dyn Collector>> = vec![
        Box::new(JOBS_TOTAL.clone()),
        Box::new(RESOLUTION_ATTEMPTS.clone()),
        Box::new(ARTIFACT_WAIT.clone()),
        Box::new(ROWS_PERSISTED.clone()),
        Box::new(INTERCEPTOR_EVENTS.clone()),
        Box::new(REALTIME_ROWS.clone()),
    ];

    for collector in collectors {
        if let Err(e) = registry.register(collector) {
            tracing::warn!(error = %e, "Failed to register metric");
        }
    }
}

/// Render all metrics in the Prometheus text format.
pub fn encode_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
        return String::new();
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

/// Write the rendered metrics to `path`, replacing it atomically.
pub async fn write_textfile(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }
    let tmp = path.with_extension("prom.tmp");
    tokio::fs::write(&tmp, encode_metrics()).await?;
    tokio::fs::rename(&tmp, path).await
}
