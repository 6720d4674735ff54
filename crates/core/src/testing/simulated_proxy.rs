//! Drives an [`Interceptor`] the way a proxy host would.

use std::sync::Arc;

use chrono::{Days, NaiveDate};
use tokio::sync::RwLock;
use tracing::warn;

use crate::clock::Clock;
use crate::config::SourceConfig;
use crate::rendezvous::{
    encode_query, InterceptedRequest, InterceptedResponse, Interceptor, RequestAction,
    ResponseAction,
};

use super::synthetic_source::SyntheticSource;

const MAX_REPLAYS: usize = 100;

/// Proxy host stand-in: runs the request hook, fetches from a
/// [`SyntheticSource`], runs the response hook and follows replays.
pub struct SimulatedProxy {
    interceptor: Arc<Interceptor>,
    source: Arc<SyntheticSource>,
    config: SourceConfig,
    clock: Arc<dyn Clock>,
    /// Query pairs of every request sent upstream.
    upstream_queries: Arc<RwLock<Vec<Vec<(String, String)>>>>,
    request_actions: Arc<RwLock<Vec<RequestAction>>>,
    response_actions: Arc<RwLock<Vec<ResponseAction>>>,
}

impl SimulatedProxy {
    pub fn new(
        interceptor: Arc<Interceptor>,
        source: Arc<SyntheticSource>,
        config: SourceConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            interceptor,
            source,
            config,
            clock,
            upstream_queries: Arc::new(RwLock::new(Vec::new())),
            request_actions: Arc::new(RwLock::new(Vec::new())),
            response_actions: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub async fn upstream_queries(&self) -> Vec<Vec<(String, String)>> {
        self.upstream_queries.read().await.clone()
    }

    pub async fn request_actions(&self) -> Vec<RequestAction> {
        self.request_actions.read().await.clone()
    }

    pub async fn response_actions(&self) -> Vec<ResponseAction> {
        self.response_actions.read().await.clone()
    }

    /// The page's own data request: the last month, as a browser would ask.
    fn page_query(&self) -> Vec<(String, String)> {
        let today = self.clock.today();
        let month_ago = today.checked_sub_days(Days::new(30)).unwrap_or(today);
        vec![
            (self.config.start_param.clone(), month_ago.to_string()),
            (self.config.end_param.clone(), today.to_string()),
            ("time-frame".to_string(), "Daily".to_string()),
            ("add-missing-rows".to_string(), "false".to_string()),
        ]
    }

    fn url(&self, identifier: &str, query: &[(String, String)]) -> String {
        format!("{}{}?{}", self.config.api_prefix, identifier, encode_query(query))
    }

    fn window(&self, query: &[(String, String)]) -> Option<(NaiveDate, NaiveDate)> {
        let get = |key: &str| {
            query
                .iter()
                .find(|(k, _)| k == key)
                .and_then(|(_, v)| NaiveDate::parse_from_str(v, "%Y-%m-%d").ok())
        };
        Some((get(&self.config.start_param)?, get(&self.config.end_param)?))
    }

    /// Simulate a page load that issues the data request for `identifier`.
    pub async fn load(&self, identifier: &str) {
        let mut query = self.page_query();
        let request = InterceptedRequest {
            url: self.url(identifier, &query),
            is_replay: false,
        };

        let action = match self.interceptor.on_request(&request).await {
            Ok(action) => action,
            Err(e) => {
                warn!(identifier, error = %e, "Request hook failed, forwarding unchanged");
                RequestAction::Pass
            }
        };
        self.request_actions.write().await.push(action.clone());

        match action {
            RequestAction::Respond { .. } => return,
            RequestAction::Forward { query: rewritten, .. } => query = rewritten,
            RequestAction::Pass => {}
        }

        let mut is_replay = false;
        for _ in 0..MAX_REPLAYS {
            self.upstream_queries.write().await.push(query.clone());

            let Some((start, end)) = self.window(&query) else {
                warn!(identifier, "Request without a date window");
                return;
            };
            let upstream = self.source.respond(identifier, start, end).await;

            let response = InterceptedResponse {
                url: self.url(identifier, &query),
                status: upstream.status,
                body: upstream.body,
                is_replay,
            };
            let action = match self.interceptor.on_response(&response).await {
                Ok(action) => action,
                Err(e) => {
                    warn!(identifier, error = %e, "Response hook failed");
                    return;
                }
            };
            self.response_actions.write().await.push(action.clone());

            match action {
                ResponseAction::Replay { query: next } => {
                    query = next;
                    is_replay = true;
                }
                _ => return,
            }
        }
    }
}
