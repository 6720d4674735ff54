//! SQLite-backed store implementation.

use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use chrono::{NaiveDate, NaiveDateTime};
use rusqlite::{params, Connection, OptionalExtension};

use super::{
    Entity, EntityKey, NewObservation, Observation, ObservationStore, RealtimeObservation,
    RealtimeStore, StoreError, WatermarkStore,
};

const DATE_FORMAT: &str = "%Y-%m-%d";
const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// SQLite-backed store for entities, observations and realtime rows.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open the database file, creating it and the tables if needed.
    pub fn new(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| StoreError::Database(e.to_string()))?;
        }
        let conn = Connection::open(path)?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Create an in-memory store (useful for testing).
    pub fn in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::initialize_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn initialize_schema(conn: &Connection) -> Result<(), StoreError> {
        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;
            PRAGMA busy_timeout = 5000;

            -- Tracked (name, period) pairs
            CREATE TABLE IF NOT EXISTS entity (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                name TEXT NOT NULL,
                period INTEGER NOT NULL,
                UNIQUE(name, period)
            );

            -- Daily closing yields, one row per (date, entity)
            CREATE TABLE IF NOT EXISTS observation (
                date TEXT NOT NULL,
                entity_id INTEGER NOT NULL REFERENCES entity(id),
                value REAL NOT NULL,
                source_ref TEXT NOT NULL,
                PRIMARY KEY (date, entity_id)
            );

            CREATE INDEX IF NOT EXISTS idx_observation_entity_date ON observation(entity_id, date);
            CREATE INDEX IF NOT EXISTS idx_observation_source_date ON observation(source_ref, date);

            -- Minute snapshots from the live table
            CREATE TABLE IF NOT EXISTS realtime_observation (
                captured_at TEXT NOT NULL,
                entity_id INTEGER NOT NULL REFERENCES entity(id),
                value REAL NOT NULL,
                timeframe INTEGER NOT NULL,
                is_open INTEGER NOT NULL DEFAULT 0,
                is_close INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (captured_at, entity_id)
            );

            CREATE INDEX IF NOT EXISTS idx_realtime_entity_time ON realtime_observation(entity_id, captured_at);
            CREATE INDEX IF NOT EXISTS idx_realtime_timeframe ON realtime_observation(timeframe, captured_at);
            "#,
        )?;

        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, StoreError> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("connection lock poisoned".to_string()))
    }

    fn parse_date(s: &str) -> Result<NaiveDate, StoreError> {
        NaiveDate::parse_from_str(s, DATE_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("date '{}': {}", s, e)))
    }

    fn parse_datetime(s: &str) -> Result<NaiveDateTime, StoreError> {
        NaiveDateTime::parse_from_str(s, DATETIME_FORMAT)
            .map_err(|e| StoreError::Corrupt(format!("datetime '{}': {}", s, e)))
    }

    fn find_entity_in(conn: &Connection, key: &EntityKey) -> Result<Option<Entity>, StoreError> {
        let entity = conn
            .query_row(
                "SELECT id, name, period FROM entity WHERE name = ? AND period = ?",
                params![&key.name, key.period],
                Self::row_to_entity,
            )
            .optional()?;
        Ok(entity)
    }

    fn ensure_entity_in(conn: &Connection, key: &EntityKey) -> Result<Entity, StoreError> {
        if let Some(entity) = Self::find_entity_in(conn, key)? {
            return Ok(entity);
        }

        conn.execute(
            "INSERT INTO entity (name, period) VALUES (?, ?)",
            params![&key.name, key.period],
        )?;
        tracing::info!(entity = %key, "Created entity");

        Ok(Entity {
            id: conn.last_insert_rowid(),
            name: key.name.clone(),
            period: key.period,
        })
    }

    fn row_to_entity(row: &rusqlite::Row) -> rusqlite::Result<Entity> {
        Ok(Entity {
            id: row.get(0)?,
            name: row.get(1)?,
            period: row.get(2)?,
        })
    }

    fn latest_date_query(
        conn: &Connection,
        sql: &str,
        param: &dyn rusqlite::ToSql,
    ) -> Result<Option<NaiveDate>, StoreError> {
        let latest: Option<String> = conn.query_row(sql, [param], |row| row.get(0))?;
        latest.as_deref().map(Self::parse_date).transpose()
    }

    fn load_realtime(
        conn: &Connection,
        sql: &str,
        params: impl rusqlite::Params,
    ) -> Result<Vec<RealtimeObservation>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(params, |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, f64>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, bool>(4)?,
                row.get::<_, bool>(5)?,
            ))
        })?;

        let mut results = Vec::new();
        for row in rows {
            let (captured_at, entity_id, value, timeframe, is_open, is_close) = row?;
            results.push(RealtimeObservation {
                captured_at: Self::parse_datetime(&captured_at)?,
                entity_id,
                value,
                timeframe,
                is_open,
                is_close,
            });
        }
        Ok(results)
    }
}

impl WatermarkStore for SqliteStore {
    fn latest_date(&self, key: &EntityKey) -> Result<Option<NaiveDate>, StoreError> {
        let conn = self.conn()?;
        let Some(entity) = Self::find_entity_in(&conn, key)? else {
            return Ok(None);
        };
        Self::latest_date_query(
            &conn,
            "SELECT MAX(date) FROM observation WHERE entity_id = ?",
            &entity.id,
        )
    }

    fn latest_date_for_source(&self, source_ref: &str) -> Result<Option<NaiveDate>, StoreError> {
        let conn = self.conn()?;
        Self::latest_date_query(
            &conn,
            "SELECT MAX(date) FROM observation WHERE source_ref = ?",
            &source_ref,
        )
    }
}

impl ObservationStore for SqliteStore {
    fn ping(&self) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.query_row("SELECT 1", [], |_| Ok(()))?;
        Ok(())
    }

    fn ensure_entity(&self, key: &EntityKey) -> Result<Entity, StoreError> {
        let conn = self.conn()?;
        Self::ensure_entity_in(&conn, key)
    }

    fn find_entity(&self, key: &EntityKey) -> Result<Option<Entity>, StoreError> {
        let conn = self.conn()?;
        Self::find_entity_in(&conn, key)
    }

    fn entities(&self) -> Result<Vec<Entity>, StoreError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare("SELECT id, name, period FROM entity ORDER BY name, period")?;
        let rows = stmt.query_map([], Self::row_to_entity)?;

        let mut entities = Vec::new();
        for row in rows {
            entities.push(row?);
        }
        Ok(entities)
    }

    fn upsert_observations(
        &self,
        entity_id: i64,
        source_ref: &str,
        rows: &[NewObservation],
    ) -> Result<usize, StoreError> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;

        {
            let mut stmt = tx.prepare(
                "INSERT INTO observation (date, entity_id, value, source_ref)
                 VALUES (?, ?, ?, ?)
                 ON CONFLICT(date, entity_id) DO UPDATE SET
                    value = excluded.value,
                    source_ref = excluded.source_ref",
            )?;
            for row in rows {
                stmt.execute(params![
                    row.date.format(DATE_FORMAT).to_string(),
                    entity_id,
                    row.value,
                    source_ref,
                ])?;
            }
        }

        tx.commit()?;
        Ok(rows.len())
    }

    fn observations_between(
        &self,
        keys: &[EntityKey],
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<Observation>, StoreError> {
        let conn = self.conn()?;
        let from = from.format(DATE_FORMAT).to_string();
        let to = to.format(DATE_FORMAT).to_string();

        let mut results = Vec::new();
        for key in keys {
            let Some(entity) = Self::find_entity_in(&conn, key)? else {
                continue;
            };

            let mut stmt = conn.prepare(
                "SELECT date, entity_id, value, source_ref FROM observation
                 WHERE entity_id = ? AND date >= ? AND date <= ?
                 ORDER BY date",
            )?;
            let rows = stmt.query_map(params![entity.id, &from, &to], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, f64>(2)?,
                    row.get::<_, String>(3)?,
                ))
            })?;

            for row in rows {
                let (date, entity_id, value, source_ref) = row?;
                results.push(Observation {
                    date: Self::parse_date(&date)?,
                    entity_id,
                    value,
                    source_ref,
                });
            }
        }

        results.sort_by(|a, b| a.date.cmp(&b.date).then(a.entity_id.cmp(&b.entity_id)));
        Ok(results)
    }
}

impl RealtimeStore for SqliteStore {
    fn ensure_entity(&self, key: &EntityKey) -> Result<Entity, StoreError> {
        let conn = self.conn()?;
        Self::ensure_entity_in(&conn, key)
    }

    fn latest_realtime(&self, entity_id: i64) -> Result<Option<RealtimeObservation>, StoreError> {
        let conn = self.conn()?;
        let rows = Self::load_realtime(
            &conn,
            "SELECT captured_at, entity_id, value, timeframe, is_open, is_close
             FROM realtime_observation WHERE entity_id = ?
             ORDER BY captured_at DESC LIMIT 1",
            params![entity_id],
        )?;
        Ok(rows.into_iter().next())
    }

    fn insert_realtime(&self, row: &RealtimeObservation) -> Result<(), StoreError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO realtime_observation
                (captured_at, entity_id, value, timeframe, is_open, is_close)
             VALUES (?, ?, ?, ?, ?, ?)",
            params![
                row.captured_at.format(DATETIME_FORMAT).to_string(),
                row.entity_id,
                row.value,
                row.timeframe,
                row.is_open,
                row.is_close,
            ],
        )?;
        Ok(())
    }

    fn mark_closed(&self, entity_id: i64, captured_at: NaiveDateTime) -> Result<(), StoreError> {
        let conn = self.conn()?;
        let captured_at = captured_at.format(DATETIME_FORMAT).to_string();
        let rows_affected = conn.execute(
            "UPDATE realtime_observation SET is_close = 1 WHERE entity_id = ? AND captured_at = ?",
            params![entity_id, &captured_at],
        )?;

        if rows_affected == 0 {
            return Err(StoreError::NotFound(format!(
                "realtime row {} at {}",
                entity_id, captured_at
            )));
        }
        Ok(())
    }

    fn realtime_rows(
        &self,
        timeframe: u32,
        limit: u32,
    ) -> Result<Vec<RealtimeObservation>, StoreError> {
        let conn = self.conn()?;
        // Buckets nest (each divides the next), so a coarse row is also a
        // valid instant of every finer timeframe.
        Self::load_realtime(
            &conn,
            "SELECT captured_at, entity_id, value, timeframe, is_open, is_close
             FROM realtime_observation WHERE timeframe % ?1 = 0
             ORDER BY captured_at DESC, entity_id LIMIT ?2",
            params![timeframe.max(1), limit],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_store() -> SqliteStore {
        SqliteStore::in_memory().unwrap()
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn obs(d: NaiveDate, value: f64) -> NewObservation {
        NewObservation { date: d, value }
    }

    #[test]
    fn test_ensure_entity_is_idempotent() {
        let store = create_test_store();
        let key = EntityKey::new("germany", 2);

        let first = ObservationStore::ensure_entity(&store, &key).unwrap();
        let second = ObservationStore::ensure_entity(&store, &key).unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(store.entities().unwrap().len(), 1);
    }

    #[test]
    fn test_same_name_different_period_are_distinct() {
        let store = create_test_store();
        let two = ObservationStore::ensure_entity(&store, &EntityKey::new("germany", 2)).unwrap();
        let five = ObservationStore::ensure_entity(&store, &EntityKey::new("germany", 5)).unwrap();
        assert_ne!(two.id, five.id);
    }

    #[test]
    fn test_latest_date_unknown_entity_is_none() {
        let store = create_test_store();
        let latest = store.latest_date(&EntityKey::new("atlantis", 2)).unwrap();
        assert!(latest.is_none());
    }

    #[test]
    fn test_latest_date_entity_without_rows_is_none() {
        let store = create_test_store();
        let key = EntityKey::new("germany", 2);
        ObservationStore::ensure_entity(&store, &key).unwrap();
        assert!(store.latest_date(&key).unwrap().is_none());
    }

    #[test]
    fn test_latest_date_is_max_date() {
        let store = create_test_store();
        let key = EntityKey::new("germany", 2);
        let entity = ObservationStore::ensure_entity(&store, &key).unwrap();

        store
            .upsert_observations(
                entity.id,
                "23703",
                &[
                    obs(date(2024, 1, 3), 2.9),
                    obs(date(2024, 1, 5), 3.1),
                    obs(date(2024, 1, 4), 3.0),
                ],
            )
            .unwrap();

        assert_eq!(store.latest_date(&key).unwrap(), Some(date(2024, 1, 5)));
        assert_eq!(
            store.latest_date_for_source("23703").unwrap(),
            Some(date(2024, 1, 5))
        );
        assert!(store.latest_date_for_source("99999").unwrap().is_none());
    }

    #[test]
    fn test_upsert_overwrites_same_date() {
        let store = create_test_store();
        let key = EntityKey::new("france", 5);
        let entity = ObservationStore::ensure_entity(&store, &key).unwrap();

        store
            .upsert_observations(entity.id, "1", &[obs(date(2024, 2, 1), 1.0)])
            .unwrap();
        store
            .upsert_observations(entity.id, "2", &[obs(date(2024, 2, 1), 1.5)])
            .unwrap();

        let rows = store
            .observations_between(&[key], date(2024, 1, 1), date(2024, 12, 31))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].value, 1.5);
        assert_eq!(rows[0].source_ref, "2");
    }

    #[test]
    fn test_observations_between_filters_range_and_entities() {
        let store = create_test_store();
        let de = EntityKey::new("germany", 2);
        let fr = EntityKey::new("france", 2);
        let de_id = ObservationStore::ensure_entity(&store, &de).unwrap().id;
        let fr_id = ObservationStore::ensure_entity(&store, &fr).unwrap().id;

        store
            .upsert_observations(
                de_id,
                "1",
                &[obs(date(2024, 1, 1), 1.0), obs(date(2024, 1, 10), 1.1)],
            )
            .unwrap();
        store
            .upsert_observations(fr_id, "2", &[obs(date(2024, 1, 2), 2.0)])
            .unwrap();

        let rows = store
            .observations_between(&[de.clone()], date(2024, 1, 1), date(2024, 1, 5))
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].date, date(2024, 1, 1));

        let rows = store
            .observations_between(&[de, fr], date(2024, 1, 1), date(2024, 1, 31))
            .unwrap();
        assert_eq!(rows.len(), 3);
        assert_eq!(rows[1].entity_id, fr_id);
    }

    #[test]
    fn test_ping() {
        let store = create_test_store();
        assert!(store.ping().is_ok());
    }

    fn realtime(entity_id: i64, minute: u32, timeframe: u32) -> RealtimeObservation {
        RealtimeObservation {
            captured_at: date(2024, 3, 1).and_hms_opt(9, minute, 0).unwrap(),
            entity_id,
            value: 3.0 + minute as f64 / 100.0,
            timeframe,
            is_open: false,
            is_close: false,
        }
    }

    #[test]
    fn test_latest_realtime_and_mark_closed() {
        let store = create_test_store();
        let entity = RealtimeStore::ensure_entity(&store, &EntityKey::new("italy", 2)).unwrap();

        assert!(store.latest_realtime(entity.id).unwrap().is_none());

        store.insert_realtime(&realtime(entity.id, 0, 60)).unwrap();
        store.insert_realtime(&realtime(entity.id, 1, 1)).unwrap();

        let latest = store.latest_realtime(entity.id).unwrap().unwrap();
        assert_eq!(latest.timeframe, 1);
        assert!(!latest.is_close);

        store.mark_closed(entity.id, latest.captured_at).unwrap();
        let latest = store.latest_realtime(entity.id).unwrap().unwrap();
        assert!(latest.is_close);
    }

    #[test]
    fn test_mark_closed_missing_row() {
        let store = create_test_store();
        let at = date(2024, 3, 1).and_hms_opt(9, 0, 0).unwrap();
        let result = store.mark_closed(42, at);
        assert!(matches!(result, Err(StoreError::NotFound(_))));
    }

    #[test]
    fn test_realtime_rows_by_timeframe() {
        let store = create_test_store();
        let entity = RealtimeStore::ensure_entity(&store, &EntityKey::new("spain", 5)).unwrap();

        store.insert_realtime(&realtime(entity.id, 0, 60)).unwrap();
        store.insert_realtime(&realtime(entity.id, 15, 15)).unwrap();
        store.insert_realtime(&realtime(entity.id, 17, 1)).unwrap();

        assert_eq!(store.realtime_rows(1, 10).unwrap().len(), 3);
        assert_eq!(store.realtime_rows(15, 10).unwrap().len(), 2);
        assert_eq!(store.realtime_rows(60, 10).unwrap().len(), 1);
        assert_eq!(store.realtime_rows(1, 2).unwrap().len(), 2);

        let newest = &store.realtime_rows(1, 1).unwrap()[0];
        assert_eq!(newest.timeframe, 1);
    }
}
