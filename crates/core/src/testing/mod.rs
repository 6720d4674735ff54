//! Testing utilities and mock implementations for end-to-end tests.
//!
//! The mocks stand in for the browser, the upstream data API and the live
//! table, so a whole ingestion run can be exercised against a temp directory
//! and an in-memory store.
//!
//! # Example
//!
//! ```rust,ignore
//! use yieldsync_core::testing::{fixtures, MockBrowserLauncher, MockPage};
//!
//! let launcher = MockBrowserLauncher::new();
//! launcher
//!     .add_page(url, MockPage::new()
//!         .with_element("__NEXT_DATA__", fixtures::embedded_state("999"))
//!         .with_data_request("999"))
//!     .await;
//! ```

mod fixed_clock;
mod mock_browser;
mod mock_live_table;
mod simulated_proxy;
mod synthetic_source;

pub use fixed_clock::FixedClock;
pub use mock_browser::{MockBrowserLauncher, MockPage};
pub use mock_live_table::MockLiveTable;
pub use simulated_proxy::SimulatedProxy;
pub use synthetic_source::{SourceResponse, SyntheticSource};

/// Test fixtures and helper functions.
pub mod fixtures {
    use std::path::Path;

    use chrono::{Days, NaiveDate};
    use serde_json::json;

    use crate::config::Config;

    pub const TEST_API_PREFIX: &str = "https://api.bonds.test/historical/";

    /// Embedded page state carrying `identifier`, as the historical pages ship it.
    pub fn embedded_state(identifier: &str) -> String {
        let state = json!({
            "dataStore": {
                "pageInfoStore": {
                    "identifiers": { "instrument_id": identifier }
                }
            }
        });
        json!({
            "props": {
                "pageProps": { "state": state.to_string() }
            }
        })
        .to_string()
    }

    /// `days` consecutive daily points starting at `start`.
    pub fn daily_series(start: NaiveDate, days: u64, base: f64) -> Vec<(NaiveDate, f64)> {
        (0..days)
            .filter_map(|i| {
                start
                    .checked_add_days(Days::new(i))
                    .map(|date| (date, base + i as f64 / 100.0))
            })
            .collect()
    }

    /// Config rooted at `dir` with fast polling and a small page size.
    pub fn test_config(dir: &Path) -> Config {
        let mut config = Config::default();

        config.database.path = dir.join("yields.db");
        config.staging.artifact_dir = dir.join("data");
        config.staging.url_cache_path = dir.join("logs").join("url_list.json");
        config.staging.diagnostics_dir = dir.join("logs").join("identifiers");

        config.source.url_templates = vec![
            "https://bonds.test/{name}-{period}-year-bond-yield".to_string(),
            "https://bonds.test/{name}-{period}-years-bond-yield".to_string(),
            "https://bonds.test/{name}-{period}-year".to_string(),
        ];
        config.source.api_prefix = TEST_API_PREFIX.to_string();
        config.source.page_size_limit = 3;
        config.source.epoch_floor = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap_or_default();

        config.browser.element_retries = 1;
        config.browser.element_timeout_secs = 0;
        config.browser.proxy = None;

        config.scheduler.workers = 2;
        config.scheduler.poll_interval_ms = 10;
        config.scheduler.max_polls = 3;
        config.scheduler.probe_retries = 1;
        config.scheduler.probe_delay_secs = 0;
        config.scheduler.probe_timeout_secs = 1;

        config.tracked.entities = Vec::new();
        config.tracked.periods = vec![2];
        config.tracked.discover_from_live_table = false;

        config.realtime.url = "https://bonds.test/live".to_string();
        config.realtime.table_element_id = "bonds_table".to_string();
        config.realtime.utc_offset_minutes = 0;
        config.realtime.element_retries = 1;

        config
    }

}
