//! Types for the ingestion scheduler.

use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;

use crate::store::{EntityKey, StoreError};

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// A dependency was unreachable before any job was scheduled.
    #[error("Preflight failed: {0}")]
    Preflight(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// One stale (entity, period) pair to ingest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestJob {
    pub key: EntityKey,
    /// Watermark when the job was planned.
    pub watermark: Option<NaiveDate>,
}

/// Terminal status of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum JobStatus {
    /// New rows written.
    Ingested { identifier: String, rows: usize },
    /// The interceptor found nothing new.
    UpToDate { identifier: String },
    /// Every candidate URL failed.
    ResolutionFailed { candidates_tried: usize },
    /// No COMPLETE artifact within the wait budget.
    NoArtifact { identifier: String },
    /// The artifact could not be written to the store.
    PersistFailed { identifier: String, reason: String },
    /// The browser session could not be started.
    BrowserFailed { reason: String },
    /// The job panicked.
    Crashed { reason: String },
}

impl JobStatus {
    pub fn label(&self) -> &'static str {
        match self {
            JobStatus::Ingested { .. } => "ingested",
            JobStatus::UpToDate { .. } => "up_to_date",
            JobStatus::ResolutionFailed { .. } => "resolution_failed",
            JobStatus::NoArtifact { .. } => "no_artifact",
            JobStatus::PersistFailed { .. } => "persist_failed",
            JobStatus::BrowserFailed { .. } => "browser_failed",
            JobStatus::Crashed { .. } => "crashed",
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Ingested { .. } | JobStatus::UpToDate { .. })
    }
}

/// Outcome of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobOutcome {
    pub entity: EntityKey,
    pub worker: usize,
    #[serde(flatten)]
    pub status: JobStatus,
    pub duration_ms: u64,
}

/// Summary of one ingestion run.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Tracked pairs that were already current and not enqueued.
    pub fresh: usize,
    pub outcomes: Vec<JobOutcome>,
}

impl RunReport {
    pub fn count(&self, label: &str) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.status.label() == label)
            .count()
    }

    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| !o.status.is_success()).count()
    }

    pub fn rows_ingested(&self) -> usize {
        self.outcomes
            .iter()
            .map(|o| match &o.status {
                JobStatus::Ingested { rows, .. } => *rows,
                _ => 0,
            })
            .sum()
    }

    pub fn outcome_for(&self, entity: &EntityKey) -> Option<&JobOutcome> {
        self.outcomes.iter().find(|o| &o.entity == entity)
    }
}

/// A pair is stale unless its watermark is yesterday or later.
pub fn is_stale(watermark: Option<NaiveDate>, today: NaiveDate) -> bool {
    match watermark.and_then(|d| d.succ_opt()) {
        Some(next) => next < today,
        None => true,
    }
}
