use std::sync::Arc;

use chrono::NaiveDate;
use thiserror::Error;
use tracing::{info, warn};

use crate::diagnostics::DiagnosticLog;
use crate::metrics::ROWS_PERSISTED;
use crate::rendezvous::{ArtifactStore, PagePayload};
use crate::store::{EntityKey, NewObservation, ObservationStore, StoreError};

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("Invalid artifact: {0}")]
    Parse(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Result of persisting one artifact.
#[derive(Debug, Clone, PartialEq)]
pub struct PersistReport {
    /// `None` when the artifact held no rows and no entity was touched.
    pub entity_id: Option<i64>,
    pub rows: usize,
    /// New watermark.
    pub latest: Option<NaiveDate>,
}

/// Writes COMPLETE artifacts into the store and discards them.
pub struct PersistenceWriter {
    store: Arc<dyn ObservationStore>,
    artifacts: ArtifactStore,
    diagnostics: Arc<DiagnosticLog>,
}

impl PersistenceWriter {
    pub fn new(
        store: Arc<dyn ObservationStore>,
        artifacts: ArtifactStore,
        diagnostics: Arc<DiagnosticLog>,
    ) -> Self {
        Self {
            store,
            artifacts,
            diagnostics,
        }
    }

    /// Parse `payload`, upsert its rows for `key` and remove the artifact.
    ///
    /// The artifact is removed whether or not the write succeeds.
    pub async fn persist(
        &self,
        key: &EntityKey,
        identifier: &str,
        payload: &str,
    ) -> Result<PersistReport, PersistError> {
        let result = self.write(key, identifier, payload);

        if let Err(e) = self.artifacts.remove_complete(identifier).await {
            warn!(identifier, error = %e, "Failed to remove consumed artifact");
        }

        match &result {
            Ok(report) => {
                ROWS_PERSISTED.inc_by(report.rows as u64);
                info!(entity = %key, identifier, rows = report.rows, "Persisted observations");
                if report.rows > 0 {
                    self.diagnostics
                        .info(identifier, &format!("Persisted {} rows for {}", report.rows, key))
                        .await;
                }
            }
            Err(e) => {
                self.diagnostics
                    .error(identifier, &format!("Failed to persist {}: {}", key, e))
                    .await;
            }
        }

        result
    }

    fn write(
        &self,
        key: &EntityKey,
        identifier: &str,
        payload: &str,
    ) -> Result<PersistReport, PersistError> {
        let rows = parse_observations(payload)?;
        if rows.is_empty() {
            return Ok(PersistReport {
                entity_id: None,
                rows: 0,
                latest: None,
            });
        }

        let entity = self.store.ensure_entity(key)?;
        let written = self
            .store
            .upsert_observations(entity.id, identifier, &rows)?;

        Ok(PersistReport {
            entity_id: Some(entity.id),
            rows: written,
            latest: rows.last().map(|r| r.date),
        })
    }
}

/// Parse an artifact into observations sorted by date.
pub(crate) fn parse_observations(payload: &str) -> Result<Vec<NewObservation>, PersistError> {
    let page: PagePayload =
        serde_json::from_str(payload).map_err(|e| PersistError::Parse(e.to_string()))?;

    let mut rows = page
        .rows()
        .iter()
        .map(|row| {
            row.date()
                .map(|date| NewObservation {
                    date,
                    value: row.last_close,
                })
                .ok_or_else(|| {
                    PersistError::Parse(format!("bad rowDateTimestamp '{}'", row.row_date_timestamp))
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    // Stable sort of the reversed rows puts the last occurrence of a date
    // first, which dedup keeps.
    rows.reverse();
    rows.sort_by_key(|r| r.date);
    rows.dedup_by_key(|r| r.date);
    Ok(rows)
}
