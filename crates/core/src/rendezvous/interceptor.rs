//! Interceptor decisions for the source's data API traffic.
//!
//! The interceptor runs inside the proxy host's process. It rewrites the
//! page's data request so only rows after the watermark are fetched, captures
//! the response into the staging artifact, and asks the host to replay the
//! request while pages come back full.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{Days, NaiveDate};
use regex_lite::Regex;
use reqwest::Url;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::config::SourceConfig;
use crate::diagnostics::DiagnosticLog;
use crate::metrics::INTERCEPTOR_EVENTS;
use crate::store::{StoreError, WatermarkStore};

use super::artifact::{ArtifactError, ArtifactStore};
use super::payload::{latest_date, PagePayload};

const NO_CONTENT: u16 = 204;
const QUERY_DATE_FORMAT: &str = "%Y-%m-%d";

#[derive(Debug, Error)]
pub enum InterceptError {
    #[error("Invalid identifier pattern: {0}")]
    InvalidPattern(String),

    #[error("Invalid request URL: {0}")]
    InvalidUrl(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Artifact error: {0}")]
    Artifact(#[from] ArtifactError),
}

/// A request seen by the proxy host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptedRequest {
    pub url: String,
    /// Set when the host is replaying a flow on our behalf.
    #[serde(default)]
    pub is_replay: bool,
}

/// A response seen by the proxy host, with the URL of its request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InterceptedResponse {
    pub url: String,
    pub status: u16,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub is_replay: bool,
}

/// What the host should do with a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RequestAction {
    /// Not ours, or a replay: forward unchanged.
    Pass,
    /// Forward with the query replaced and the headers set.
    Forward {
        query: Vec<(String, String)>,
        headers: BTreeMap<String, String>,
    },
    /// Answer locally without contacting the upstream.
    Respond { status: u16, body: String },
}

/// What happened to a response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ResponseAction {
    /// Not ours.
    Pass,
    /// Upstream failure; nothing staged.
    Dropped { status: u16 },
    /// COMPLETE artifact published with this many rows.
    Completed { rows: usize },
    /// Empty COMPLETE artifact published.
    Empty,
    /// Page was full: replay the flow with this query.
    Replay { query: Vec<(String, String)> },
}

/// Fetch window `[start, today]` for a watermark, or `None` when there is
/// nothing new to fetch.
pub fn fetch_window(
    watermark: Option<NaiveDate>,
    epoch_floor: NaiveDate,
    today: NaiveDate,
) -> Option<(NaiveDate, NaiveDate)> {
    let start = match watermark {
        Some(date) => date.checked_add_days(Days::new(1))?,
        None => epoch_floor,
    };
    (start < today).then_some((start, today))
}

pub struct Interceptor {
    source: SourceConfig,
    pattern: Regex,
    watermarks: Arc<dyn WatermarkStore>,
    artifacts: ArtifactStore,
    diagnostics: Arc<DiagnosticLog>,
    clock: Arc<dyn Clock>,
}

impl Interceptor {
    pub fn new(
        source: SourceConfig,
        watermarks: Arc<dyn WatermarkStore>,
        artifacts: ArtifactStore,
        diagnostics: Arc<DiagnosticLog>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, InterceptError> {
        let pattern = Regex::new(&source.identifier_pattern)
            .map_err(|e| InterceptError::InvalidPattern(e.to_string()))?;

        Ok(Self {
            source,
            pattern,
            watermarks,
            artifacts,
            diagnostics,
            clock,
        })
    }

    pub fn artifacts(&self) -> &ArtifactStore {
        &self.artifacts
    }

    /// Identifier carried by a data API URL, or `None` for other traffic.
    pub fn identifier_for(&self, url: &str) -> Option<String> {
        if !url.starts_with(&self.source.api_prefix) {
            return None;
        }
        self.pattern
            .captures(url)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().to_string())
    }

    pub async fn on_request(
        &self,
        request: &InterceptedRequest,
    ) -> Result<RequestAction, InterceptError> {
        let Some(identifier) = self.identifier_for(&request.url) else {
            return Ok(RequestAction::Pass);
        };
        if request.is_replay {
            debug!(identifier = %identifier, "Forwarding replay unchanged");
            return Ok(RequestAction::Pass);
        }

        let today = self.clock.today();
        let watermark = self.watermarks.latest_date_for_source(&identifier)?;

        let Some((start, end)) = fetch_window(watermark, self.source.epoch_floor, today) else {
            self.artifacts.complete_empty(&identifier).await?;
            self.diagnostics
                .info(&identifier, "Up to date, answered 204 locally")
                .await;
            INTERCEPTOR_EVENTS.with_label_values(&["no_content"]).inc();
            return Ok(RequestAction::Respond {
                status: NO_CONTENT,
                body: String::new(),
            });
        };

        let query = self.window_query(&request.url, start, end)?;
        let headers = BTreeMap::from([("User-Agent".to_string(), self.source.user_agent.clone())]);

        self.diagnostics
            .info(&identifier, &format!("Requesting {} to {}", start, end))
            .await;
        INTERCEPTOR_EVENTS.with_label_values(&["forwarded"]).inc();

        Ok(RequestAction::Forward { query, headers })
    }

    pub async fn on_response(
        &self,
        response: &InterceptedResponse,
    ) -> Result<ResponseAction, InterceptError> {
        let Some(identifier) = self.identifier_for(&response.url) else {
            return Ok(ResponseAction::Pass);
        };

        if response.status != 200 && response.status != NO_CONTENT {
            self.diagnostics
                .error(
                    &identifier,
                    &format!("Upstream answered HTTP {}, dropping response", response.status),
                )
                .await;
            INTERCEPTOR_EVENTS.with_label_values(&["dropped"]).inc();
            return Ok(ResponseAction::Dropped {
                status: response.status,
            });
        }

        if response.status == NO_CONTENT {
            return self.complete_empty(&identifier).await;
        }

        let page: PagePayload = match serde_json::from_str(&response.body) {
            Ok(page) => page,
            Err(e) => {
                self.diagnostics
                    .error(&identifier, &format!("Unparsable response body: {}", e))
                    .await;
                INTERCEPTOR_EVENTS.with_label_values(&["dropped"]).inc();
                return Ok(ResponseAction::Dropped {
                    status: response.status,
                });
            }
        };

        let Some(rows) = page.data else {
            return self.complete_empty(&identifier).await;
        };
        if rows.is_empty() && !response.is_replay {
            return self.complete_empty(&identifier).await;
        }

        let page_len = rows.len();
        let page_latest = latest_date(&rows);
        let merged = if response.is_replay {
            self.artifacts
                .merge_pending(&identifier, response.status, rows)
                .await?
        } else {
            self.artifacts
                .write_pending(&identifier, response.status, rows)
                .await?
        };

        if page_len >= self.source.page_size_limit {
            let today = self.clock.today();
            let next = page_latest.and_then(|latest| fetch_window(Some(latest), latest, today));

            if let Some((start, end)) = next {
                let query = self.window_query(&response.url, start, end)?;
                self.diagnostics
                    .info(
                        &identifier,
                        &format!("Page of {} rows is full, replaying from {}", page_len, start),
                    )
                    .await;
                INTERCEPTOR_EVENTS.with_label_values(&["replay"]).inc();
                return Ok(ResponseAction::Replay { query });
            }
        }

        self.artifacts.promote(&identifier).await?;
        info!(identifier = %identifier, rows = merged, "Artifact complete");
        self.diagnostics
            .info(&identifier, &format!("Captured {} rows", merged))
            .await;
        INTERCEPTOR_EVENTS.with_label_values(&["completed"]).inc();

        Ok(ResponseAction::Completed { rows: merged })
    }

    async fn complete_empty(&self, identifier: &str) -> Result<ResponseAction, InterceptError> {
        self.artifacts.complete_empty(identifier).await?;
        self.diagnostics.info(identifier, "No new rows").await;
        INTERCEPTOR_EVENTS.with_label_values(&["empty"]).inc();
        Ok(ResponseAction::Empty)
    }

    /// Query pairs of `url` with the window parameters set.
    fn window_query(
        &self,
        url: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> Result<Vec<(String, String)>, InterceptError> {
        let parsed = Url::parse(url).map_err(|e| InterceptError::InvalidUrl(e.to_string()))?;
        let start = start.format(QUERY_DATE_FORMAT).to_string();
        let end = end.format(QUERY_DATE_FORMAT).to_string();

        let mut query: Vec<(String, String)> = parsed
            .query_pairs()
            .filter(|(k, _)| k != &self.source.start_param && k != &self.source.end_param)
            .map(|(k, v)| (k.into_owned(), v.into_owned()))
            .collect();
        query.push((self.source.start_param.clone(), start));
        query.push((self.source.end_param.clone(), end));

        Ok(query)
    }
}

/// Render query pairs as a URL query string.
pub fn encode_query(query: &[(String, String)]) -> String {
    query
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rendezvous::payload::PriceRow;
    use crate::rendezvous::ArtifactState;
    use crate::store::{EntityKey, NewObservation, ObservationStore, SqliteStore};
    use crate::testing::FixedClock;
    use tempfile::TempDir;

    const API: &str = "https://api.investing.com/api/financialdata/historical/23703?start-date=2024-01-01&end-date=2024-02-01&time-frame=Daily&add-missing-rows=false";

    struct Fixture {
        _temp: TempDir,
        store: Arc<SqliteStore>,
        interceptor: Interceptor,
    }

    fn fixture(page_size_limit: usize) -> Fixture {
        let temp = TempDir::new().unwrap();
        let store = Arc::new(SqliteStore::in_memory().unwrap());
        let source = SourceConfig {
            page_size_limit,
            ..Default::default()
        };
        let interceptor = Interceptor::new(
            source,
            store.clone(),
            ArtifactStore::new(temp.path().join("data"), "txt"),
            Arc::new(DiagnosticLog::new(temp.path().join("logs"))),
            Arc::new(FixedClock::on_date(2024, 3, 1)),
        )
        .unwrap();

        Fixture {
            _temp: temp,
            store,
            interceptor,
        }
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn request(is_replay: bool) -> InterceptedRequest {
        InterceptedRequest {
            url: API.to_string(),
            is_replay,
        }
    }

    fn response(body: serde_json::Value, is_replay: bool) -> InterceptedResponse {
        InterceptedResponse {
            url: API.to_string(),
            status: 200,
            body: body.to_string(),
            is_replay,
        }
    }

    fn rows_json(dates: &[&str]) -> serde_json::Value {
        let rows: Vec<serde_json::Value> = dates
            .iter()
            .map(|d| serde_json::json!({"rowDateTimestamp": format!("{}T00:00:00Z", d), "last_close": 1.5}))
            .collect();
        serde_json::json!({"status_code": 200, "data": rows})
    }

    fn query_value<'a>(query: &'a [(String, String)], key: &str) -> Option<&'a str> {
        query.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_fetch_window() {
        let floor = date(2000, 1, 1);
        let today = date(2024, 3, 1);

        assert_eq!(fetch_window(None, floor, today), Some((floor, today)));
        assert_eq!(
            fetch_window(Some(date(2024, 2, 10)), floor, today),
            Some((date(2024, 2, 11), today))
        );
        assert_eq!(fetch_window(Some(date(2024, 2, 29)), floor, today), None);
        assert_eq!(fetch_window(Some(today), floor, today), None);
    }

    #[test]
    fn test_identifier_for() {
        let f = fixture(5000);
        assert_eq!(f.interceptor.identifier_for(API).as_deref(), Some("23703"));
        assert!(f
            .interceptor
            .identifier_for("https://www.investing.com/historical/1")
            .is_none());
    }

    #[tokio::test]
    async fn test_unrelated_request_passes() {
        let f = fixture(5000);
        let action = f
            .interceptor
            .on_request(&InterceptedRequest {
                url: "https://www.investing.com/static/app.js".to_string(),
                is_replay: false,
            })
            .await
            .unwrap();
        assert_eq!(action, RequestAction::Pass);
    }

    #[tokio::test]
    async fn test_request_without_watermark_starts_at_floor() {
        let f = fixture(5000);
        let action = f.interceptor.on_request(&request(false)).await.unwrap();

        match action {
            RequestAction::Forward { query, headers } => {
                assert_eq!(query_value(&query, "start-date"), Some("2000-01-01"));
                assert_eq!(query_value(&query, "end-date"), Some("2024-03-01"));
                assert_eq!(query_value(&query, "time-frame"), Some("Daily"));
                assert_eq!(query_value(&query, "add-missing-rows"), Some("false"));
                assert!(headers["User-Agent"].starts_with("Mozilla/5.0"));
            }
            other => panic!("expected forward, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_request_with_watermark_starts_next_day() {
        let f = fixture(5000);
        let entity = f.store.ensure_entity(&EntityKey::new("germany", 2)).unwrap();
        f.store
            .upsert_observations(
                entity.id,
                "23703",
                &[NewObservation {
                    date: date(2024, 2, 20),
                    value: 2.5,
                }],
            )
            .unwrap();

        let action = f.interceptor.on_request(&request(false)).await.unwrap();
        let RequestAction::Forward { query, .. } = action else {
            panic!("expected forward");
        };
        assert_eq!(query_value(&query, "start-date"), Some("2024-02-21"));
    }

    #[tokio::test]
    async fn test_request_up_to_date_answers_locally() {
        let f = fixture(5000);
        let entity = f.store.ensure_entity(&EntityKey::new("germany", 2)).unwrap();
        f.store
            .upsert_observations(
                entity.id,
                "23703",
                &[NewObservation {
                    date: date(2024, 2, 29),
                    value: 2.5,
                }],
            )
            .unwrap();

        let action = f.interceptor.on_request(&request(false)).await.unwrap();
        assert_eq!(
            action,
            RequestAction::Respond {
                status: 204,
                body: String::new()
            }
        );
        let artifacts = f.interceptor.artifacts();
        assert_eq!(artifacts.state("23703").await.unwrap(), ArtifactState::Complete);
        assert_eq!(artifacts.read_complete("23703").await.unwrap().unwrap(), "");
    }

    #[tokio::test]
    async fn test_replay_request_passes_unchanged() {
        let f = fixture(5000);
        let action = f.interceptor.on_request(&request(true)).await.unwrap();
        assert_eq!(action, RequestAction::Pass);
    }

    #[tokio::test]
    async fn test_error_status_is_dropped() {
        let f = fixture(5000);
        let mut resp = response(rows_json(&["2024-01-02"]), false);
        resp.status = 503;

        let action = f.interceptor.on_response(&resp).await.unwrap();
        assert_eq!(action, ResponseAction::Dropped { status: 503 });
        assert_eq!(
            f.interceptor.artifacts().state("23703").await.unwrap(),
            ArtifactState::Absent
        );
    }

    #[tokio::test]
    async fn test_null_data_completes_empty() {
        let f = fixture(5000);
        let resp = response(serde_json::json!({"status_code": 200, "data": null}), false);

        let action = f.interceptor.on_response(&resp).await.unwrap();
        assert_eq!(action, ResponseAction::Empty);
        assert_eq!(
            f.interceptor.artifacts().state("23703").await.unwrap(),
            ArtifactState::Complete
        );
    }

    #[tokio::test]
    async fn test_no_content_completes_empty() {
        let f = fixture(5000);
        let mut resp = response(serde_json::json!({}), false);
        resp.status = 204;
        resp.body.clear();

        let action = f.interceptor.on_response(&resp).await.unwrap();
        assert_eq!(action, ResponseAction::Empty);
    }

    #[tokio::test]
    async fn test_short_page_completes() {
        let f = fixture(5000);
        let resp = response(rows_json(&["2024-01-03", "2024-01-02"]), false);

        let action = f.interceptor.on_response(&resp).await.unwrap();
        assert_eq!(action, ResponseAction::Completed { rows: 2 });

        let body = f
            .interceptor
            .artifacts()
            .read_complete("23703")
            .await
            .unwrap()
            .unwrap();
        let payload: PagePayload = serde_json::from_str(&body).unwrap();
        assert_eq!(payload.rows()[0], PriceRow::new("2024-01-02T00:00:00Z", 1.5));
    }

    #[tokio::test]
    async fn test_full_page_requests_replay_then_merges() {
        let f = fixture(2);
        let first = response(rows_json(&["2024-01-03", "2024-01-02"]), false);

        let action = f.interceptor.on_response(&first).await.unwrap();
        let ResponseAction::Replay { query } = action else {
            panic!("expected replay");
        };
        assert_eq!(query_value(&query, "start-date"), Some("2024-01-04"));
        assert_eq!(query_value(&query, "end-date"), Some("2024-03-01"));
        assert_eq!(
            f.interceptor.artifacts().state("23703").await.unwrap(),
            ArtifactState::Pending
        );

        let second = response(rows_json(&["2024-01-04"]), true);
        let action = f.interceptor.on_response(&second).await.unwrap();
        assert_eq!(action, ResponseAction::Completed { rows: 3 });
    }

    #[tokio::test]
    async fn test_unparsable_body_is_dropped() {
        let f = fixture(5000);
        let mut resp = response(serde_json::json!({}), false);
        resp.body = "<html>blocked</html>".to_string();

        let action = f.interceptor.on_response(&resp).await.unwrap();
        assert_eq!(action, ResponseAction::Dropped { status: 200 });
    }

    #[test]
    fn test_encode_query() {
        let query = vec![
            ("start-date".to_string(), "2024-01-01".to_string()),
            ("q".to_string(), "a b".to_string()),
        ];
        assert_eq!(encode_query(&query), "start-date=2024-01-01&q=a%20b");
    }
}
