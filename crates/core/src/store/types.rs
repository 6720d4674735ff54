//! Types for the yield store.

use std::fmt;

use chrono::{NaiveDate, NaiveDateTime};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A tracked (entity, period) pair, e.g. ("germany", 2).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EntityKey {
    /// Normalized entity name (lowercase, dash-separated).
    pub name: String,
    /// Tracked span in years.
    pub period: u32,
}

impl EntityKey {
    pub fn new(name: impl Into<String>, period: u32) -> Self {
        Self {
            name: name.into(),
            period,
        }
    }

    /// Key used by the URL cache side file.
    pub fn cache_key(&self) -> String {
        format!("{}_{}", self.name, self.period)
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}Y", self.name, self.period)
    }
}

/// A stored entity row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: i64,
    pub name: String,
    pub period: u32,
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(self.name.clone(), self.period)
    }
}

/// A daily observation ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct NewObservation {
    pub date: NaiveDate,
    pub value: f64,
}

/// A stored daily observation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Observation {
    pub date: NaiveDate,
    pub entity_id: i64,
    pub value: f64,
    /// Source identifier that produced the row.
    pub source_ref: String,
}

/// A stored realtime snapshot row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeObservation {
    /// Capture time floored to the minute, market local time.
    pub captured_at: NaiveDateTime,
    pub entity_id: i64,
    pub value: f64,
    /// Largest bucket (minutes) dividing minutes-since-midnight.
    pub timeframe: u32,
    /// First row after a close.
    pub is_open: bool,
    /// Last row before a close.
    pub is_close: bool,
}

/// Errors for store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Corrupt row: {0}")]
    Corrupt(String),
}

impl From<rusqlite::Error> for StoreError {
    fn from(e: rusqlite::Error) -> Self {
        StoreError::Database(e.to_string())
    }
}
