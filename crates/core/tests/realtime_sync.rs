//! Realtime snapshot integration tests.
//!
//! The live table is read through the browser adapter against the mock
//! browser, and snapshots are applied to an in-memory store.

use std::sync::Arc;
use std::time::Duration;

use chrono::{TimeZone, Utc};
use tempfile::TempDir;

use yieldsync_core::{
    config::Config,
    realtime::{BrowserLiveTable, LiveRow, LiveTableSource, RealtimeSync},
    store::{EntityKey, RealtimeStore, SqliteStore},
    testing::{fixtures, FixedClock, MockBrowserLauncher, MockPage},
};

struct TestHarness {
    config: Config,
    launcher: MockBrowserLauncher,
    store: Arc<SqliteStore>,
    clock: Arc<FixedClock>,
    sync: RealtimeSync,
    _temp_dir: TempDir,
}

impl TestHarness {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let config = fixtures::test_config(temp_dir.path());

        let launcher = MockBrowserLauncher::new();
        let table = BrowserLiveTable::new(
            Arc::new(launcher.clone()),
            config.realtime.clone(),
            Duration::from_millis(1),
        );
        let store = Arc::new(SqliteStore::in_memory().expect("Failed to create store"));
        let clock = Arc::new(FixedClock::new(
            Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap(),
        ));

        let sync = RealtimeSync::new(
            Arc::new(table),
            store.clone(),
            clock.clone(),
            config.realtime.clone(),
            config.tracked.periods.clone(),
        );

        Self {
            config,
            launcher,
            store,
            clock,
            sync,
            _temp_dir: temp_dir,
        }
    }

    async fn show(&self, rows: Vec<LiveRow>) {
        let page = MockPage::new()
            .with_element(self.config.realtime.table_element_id.clone(), "")
            .with_live_rows(rows);
        self.launcher.add_page(&self.config.realtime.url, page).await;
    }
}

fn table(closed: bool) -> Vec<LiveRow> {
    vec![
        LiveRow::new("Testland 2Y", "4.120", closed),
        LiveRow::new("Otherland 2Y", "1.050", closed),
        LiveRow::new("Otherland 10Y", "2.200", closed),
    ]
}

#[tokio::test]
async fn test_browser_live_table_reads_rows() {
    let harness = TestHarness::new();
    harness.show(table(false)).await;

    let table = BrowserLiveTable::new(
        Arc::new(harness.launcher.clone()),
        harness.config.realtime.clone(),
        Duration::from_millis(1),
    );
    let rows = table.fetch().await.unwrap();

    assert_eq!(rows.len(), 3);
    assert_eq!(rows[0], LiveRow::new("Testland 2Y", "4.120", false));
    // Live table sessions bypass the interceptor and are always closed.
    assert_eq!(harness.launcher.launches().await, vec![false]);
    assert_eq!(harness.launcher.quit_count().await, 1);
}

#[tokio::test]
async fn test_missing_table_fails_snapshot() {
    let harness = TestHarness::new();
    harness
        .launcher
        .add_page(&harness.config.realtime.url, MockPage::new())
        .await;

    assert!(harness.sync.run_once().await.is_err());
    assert_eq!(harness.launcher.quit_count().await, 1);
}

#[tokio::test]
async fn test_open_closed_closed_sequence() {
    let harness = TestHarness::new();
    let key = EntityKey::new("testland", 2);

    harness.show(table(false)).await;
    let first = harness.sync.run_once().await.unwrap();
    assert_eq!(first.inserted, 2);

    harness.clock.advance(chrono::Duration::minutes(1));
    harness.show(table(true)).await;
    let second = harness.sync.run_once().await.unwrap();
    assert_eq!(second.closed, 2);
    assert_eq!(second.inserted, 0);

    harness.clock.advance(chrono::Duration::minutes(1));
    let third = harness.sync.run_once().await.unwrap();
    assert_eq!(third.skipped, 2);

    let entity = RealtimeStore::ensure_entity(&*harness.store, &key).unwrap();
    let latest = harness.store.latest_realtime(entity.id).unwrap().unwrap();
    assert_eq!(latest.captured_at.to_string(), "2024-03-01 00:00:00");
    assert_eq!(latest.value, 4.12);
    assert!(latest.is_close);
    assert!(!latest.is_open);

    // One row per tracked entity; the 10Y quote is not tracked.
    assert_eq!(harness.store.realtime_rows(1, 10).unwrap().len(), 2);
}

#[tokio::test]
async fn test_snapshots_are_bucketed_by_minute_of_day() {
    let harness = TestHarness::new();
    harness.show(table(false)).await;

    // 00:00 -> 240, 00:30 -> 30, 00:45 -> 15
    let midnight = harness.sync.run_once().await.unwrap();
    assert_eq!(midnight.timeframe, 240);

    harness.clock.advance(chrono::Duration::minutes(30));
    let half = harness.sync.run_once().await.unwrap();
    assert_eq!(half.timeframe, 30);

    harness.clock.advance(chrono::Duration::seconds(15 * 60 + 42));
    let quarter = harness.sync.run_once().await.unwrap();
    assert_eq!(quarter.timeframe, 15);
    assert_eq!(quarter.captured_at.to_string(), "2024-03-01 00:45:00");

    assert_eq!(harness.store.realtime_rows(240, 10).unwrap().len(), 2);
    assert_eq!(harness.store.realtime_rows(30, 10).unwrap().len(), 4);
    assert_eq!(harness.store.realtime_rows(15, 10).unwrap().len(), 6);

    let newest = harness.store.realtime_rows(15, 1).unwrap();
    assert_eq!(newest[0].captured_at.to_string(), "2024-03-01 00:45:00");
}
