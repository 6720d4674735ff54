//! The live yields table: fetching and interpreting its rows.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::browser::{BrowserLauncher, BrowserSession};
use crate::config::RealtimeConfig;
use crate::store::EntityKey;

use super::RealtimeError;

const ROW_XPATH: &str = "//tr[contains(@id,'pair_')]";
const LABEL_XPATH: &str = ".//td/a";
const VALUE_XPATH: &str = ".//td[3]";
const CLOSED_XPATH: &str = ".//span[contains(@class,'redClockIcon')]";

/// A raw table row.
#[derive(Debug, Clone, PartialEq)]
pub struct LiveRow {
    /// Instrument label, e.g. "Germany 2Y".
    pub label: String,
    /// Displayed yield.
    pub value: String,
    /// Market closed marker present.
    pub closed: bool,
}

impl LiveRow {
    pub fn new(label: impl Into<String>, value: impl Into<String>, closed: bool) -> Self {
        Self {
            label: label.into(),
            value: value.into(),
            closed,
        }
    }
}

/// A parsed quote for a tracked (entity, period).
#[derive(Debug, Clone, PartialEq)]
pub struct LiveQuote {
    pub key: EntityKey,
    pub value: f64,
    pub closed: bool,
}

/// Source of live table snapshots.
#[async_trait]
pub trait LiveTableSource: Send + Sync {
    async fn fetch(&self) -> Result<Vec<LiveRow>, RealtimeError>;
}

/// Reads the live table through a browser session (no interceptor).
pub struct BrowserLiveTable {
    launcher: Arc<dyn BrowserLauncher>,
    config: RealtimeConfig,
    element_timeout: std::time::Duration,
}

impl BrowserLiveTable {
    pub fn new(
        launcher: Arc<dyn BrowserLauncher>,
        config: RealtimeConfig,
        element_timeout: std::time::Duration,
    ) -> Self {
        Self {
            launcher,
            config,
            element_timeout,
        }
    }

    async fn read_table(&self, session: &dyn BrowserSession) -> Result<Vec<LiveRow>, RealtimeError> {
        match session.navigate(&self.config.url).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => debug!("Live table page load timed out, continuing"),
            Err(e) => return Err(e.into()),
        }

        let mut found = false;
        for attempt in 1..=self.config.element_retries.max(1) {
            if session
                .wait_for_element(&self.config.table_element_id, self.element_timeout)
                .await?
                .is_some()
            {
                found = true;
                break;
            }
            debug!(attempt, "Live table not rendered yet");
        }
        if !found {
            return Err(RealtimeError::TableNotFound(
                self.config.table_element_id.clone(),
            ));
        }

        let mut rows = Vec::new();
        for row in session.find_elements(ROW_XPATH, None).await? {
            let mut label = String::new();
            for link in session.find_elements(LABEL_XPATH, Some(&row)).await? {
                let text = session.visible_text(&link).await?;
                if !text.trim().is_empty() {
                    label = text.trim().to_string();
                    break;
                }
            }
            if label.is_empty() {
                continue;
            }

            let value = match session.find_elements(VALUE_XPATH, Some(&row)).await?.first() {
                Some(cell) => session.visible_text(cell).await?,
                None => String::new(),
            };
            let closed = !session
                .find_elements(CLOSED_XPATH, Some(&row))
                .await?
                .is_empty();

            rows.push(LiveRow::new(label, value.trim(), closed));
        }

        Ok(rows)
    }
}

#[async_trait]
impl LiveTableSource for BrowserLiveTable {
    async fn fetch(&self) -> Result<Vec<LiveRow>, RealtimeError> {
        let session = self.launcher.launch(false).await?;
        let result = self.read_table(session.as_ref()).await;
        if let Err(e) = session.quit().await {
            warn!(error = %e, "Failed to quit live table session");
        }
        result
    }
}

/// Entity name from a label without its period suffix: lowercase, spaces
/// replaced by dashes.
pub fn normalize_entity_name(label: &str) -> String {
    label.trim().to_lowercase().split_whitespace().collect::<Vec<_>>().join("-")
}

/// Keep rows labelled with a tracked period, drop entities that are missing
/// any tracked period, and parse values.
pub fn parse_live_rows(rows: &[LiveRow], periods: &[u32]) -> Vec<LiveQuote> {
    let mut by_entity: BTreeMap<String, Vec<LiveQuote>> = BTreeMap::new();

    for row in rows {
        let label = row.label.trim();
        let Some((name, period)) = periods.iter().find_map(|p| {
            label
                .strip_suffix(&format!(" {}Y", p))
                .map(|name| (normalize_entity_name(name), *p))
        }) else {
            continue;
        };

        let value = match row.value.trim().replace(',', "").parse::<f64>() {
            Ok(value) => value,
            Err(_) => {
                warn!(label, value = %row.value, "Skipping unparsable live value");
                continue;
            }
        };

        by_entity.entry(name.clone()).or_default().push(LiveQuote {
            key: EntityKey::new(name, period),
            value,
            closed: row.closed,
        });
    }

    by_entity
        .into_iter()
        .filter(|(name, quotes)| {
            let seen: BTreeSet<u32> = quotes.iter().map(|q| q.key.period).collect();
            let complete = periods.iter().all(|p| seen.contains(p));
            if !complete {
                debug!(entity = %name, "Dropping entity without every tracked period");
            }
            complete
        })
        .flat_map(|(_, quotes)| quotes)
        .collect()
}

/// Distinct entity names in a snapshot.
pub fn discover_entities(rows: &[LiveRow], periods: &[u32]) -> Vec<String> {
    parse_live_rows(rows, periods)
        .into_iter()
        .map(|q| q.key.name)
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
