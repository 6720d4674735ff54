//! In-memory stand-in for the source's data API.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::NaiveDate;
use tokio::sync::RwLock;

use crate::rendezvous::{PagePayload, PriceRow};

/// Serves daily series per identifier the way the source does: rows inside
/// the requested window, the oldest `page_size` of them, newest first.
#[derive(Debug)]
pub struct SyntheticSource {
    series: Arc<RwLock<HashMap<String, BTreeMap<NaiveDate, f64>>>>,
    /// Forced HTTP status per identifier.
    failures: Arc<RwLock<HashMap<String, u16>>>,
    page_size: usize,
}

/// A response as the upstream would send it.
#[derive(Debug, Clone, PartialEq)]
pub struct SourceResponse {
    pub status: u16,
    pub body: String,
}

impl SyntheticSource {
    pub fn new(page_size: usize) -> Self {
        Self {
            series: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(RwLock::new(HashMap::new())),
            page_size,
        }
    }

    /// Add (or replace) points for an identifier.
    pub async fn insert_series(&self, identifier: &str, points: impl IntoIterator<Item = (NaiveDate, f64)>) {
        self.series
            .write()
            .await
            .entry(identifier.to_string())
            .or_default()
            .extend(points);
    }

    /// Answer every request for `identifier` with `status`.
    pub async fn fail_with(&self, identifier: &str, status: u16) {
        self.failures
            .write()
            .await
            .insert(identifier.to_string(), status);
    }

    /// Rows in `[start, end]`, oldest page first, returned newest first.
    pub async fn page(&self, identifier: &str, start: NaiveDate, end: NaiveDate) -> Vec<PriceRow> {
        let series = self.series.read().await;
        let Some(points) = series.get(identifier) else {
            return Vec::new();
        };

        let mut rows: Vec<PriceRow> = points
            .range(start..=end)
            .take(self.page_size)
            .map(|(date, value)| PriceRow::new(format!("{}T00:00:00Z", date), *value))
            .collect();
        rows.reverse();
        rows
    }

    pub async fn respond(&self, identifier: &str, start: NaiveDate, end: NaiveDate) -> SourceResponse {
        if let Some(status) = self.failures.read().await.get(identifier) {
            return SourceResponse {
                status: *status,
                body: r#"{"error":"upstream"}"#.to_string(),
            };
        }

        let rows = self.page(identifier, start, end).await;
        let payload = PagePayload::new(200, rows);
        SourceResponse {
            status: 200,
            body: serde_json::to_string(&payload).unwrap_or_default(),
        }
    }
}
