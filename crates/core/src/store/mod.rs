//! Relational store for entities, daily observations and realtime snapshots.
//!
//! The daily observation table doubles as the watermark source: the latest
//! persisted date per entity decides both staleness and the next fetch window.

mod sqlite;
mod types;

pub use sqlite::SqliteStore;
pub use types::*;

use chrono::{NaiveDate, NaiveDateTime};

/// Read access to the "latest known date" per entity.
pub trait WatermarkStore: Send + Sync {
    /// Latest persisted observation date for the entity, or None when the
    /// entity has no rows or does not exist.
    fn latest_date(&self, key: &EntityKey) -> Result<Option<NaiveDate>, StoreError>;

    /// Latest persisted observation date among rows produced by `source_ref`.
    fn latest_date_for_source(&self, source_ref: &str) -> Result<Option<NaiveDate>, StoreError>;
}

/// Daily observation storage.
pub trait ObservationStore: WatermarkStore {
    /// Cheap round trip used by the preflight check.
    fn ping(&self) -> Result<(), StoreError>;

    /// Get the entity, creating it if needed.
    fn ensure_entity(&self, key: &EntityKey) -> Result<Entity, StoreError>;

    /// Look up an entity without creating it.
    fn find_entity(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError>;

    /// All known entities ordered by name and period.
    fn entities(&self) -> Result<Vec<Entity>, StoreError>;

    /// Upsert observations keyed by (date, entity_id) in one transaction.
    ///
    /// Returns the number of rows written.
    fn upsert_observations(
        &self,
        entity_id: i64,
        source_ref: &str,
        rows: &[NewObservation],
    ) -> Result<usize, StoreError>;

    /// Observations for the given entities with `from <= date <= to`,
    /// ordered by date.
    fn observations_between(
        &self,
        keys: &[EntityKey],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Observation>, StoreError>;
}

/// Realtime snapshot storage.
pub trait RealtimeStore: Send + Sync {
    fn ensure_entity(&self, key: &EntityKey) -> Result<Entity, StoreError>;

    /// Most recent realtime row for the entity.
    fn latest_realtime(&self, entity_id: i64) -> Result<Option<RealtimeObservation>, StoreError>;

    /// Insert a realtime row; an existing row for the same minute is replaced.
    fn insert_realtime(&self, row: &RealtimeObservation) -> Result<(), StoreError>;

    /// Set the close flag on an existing row.
    fn mark_closed(&self, entity_id: i64, captured_at: NaiveDateTime) -> Result<(), StoreError>;

    /// Latest `limit` rows that are valid instants of `timeframe`, newest first.
    fn realtime_rows(
        &self,
        timeframe: u32,
        limit: u32,
    ) -> Result<Vec<RealtimeObservation>, StoreError>;
}
