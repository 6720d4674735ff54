//! Identifier resolution through the candidate URL cascade.

use std::sync::Arc;

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::browser::BrowserSession;
use crate::config::{BrowserConfig, SourceConfig};
use crate::diagnostics::{DiagnosticLog, FAILED_IDS_LOG};
use crate::metrics::RESOLUTION_ATTEMPTS;
use crate::store::EntityKey;

use super::candidates::{candidate_urls, promote_cached};
use super::payload::extract_instrument_id;
use super::url_cache::UrlCache;

#[derive(Debug, Error)]
pub enum ResolveError {
    #[error("No candidate URL yielded an identifier for {entity} ({tried} tried)")]
    Exhausted { entity: String, tried: usize },
}

/// A successfully resolved identifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub identifier: String,
    /// Candidate URL that produced the identifier.
    pub url: String,
    /// 1-based position of `url` in the tried order.
    pub attempts: usize,
}

enum Attempt {
    Resolved(String),
    NoElement,
    BadPayload,
    BrowserError,
}

impl Attempt {
    fn label(&self) -> &'static str {
        match self {
            Attempt::Resolved(_) => "resolved",
            Attempt::NoElement => "no_element",
            Attempt::BadPayload => "bad_payload",
            Attempt::BrowserError => "browser_error",
        }
    }
}

/// Resolves (entity, period) pairs to the source's instrument identifier.
pub struct IdentifierResolver {
    source: SourceConfig,
    browser: BrowserConfig,
    cache: Arc<UrlCache>,
    diagnostics: Arc<DiagnosticLog>,
}

impl IdentifierResolver {
    pub fn new(
        source: SourceConfig,
        browser: BrowserConfig,
        cache: Arc<UrlCache>,
        diagnostics: Arc<DiagnosticLog>,
    ) -> Self {
        Self {
            source,
            browser,
            cache,
            diagnostics,
        }
    }

    /// Ordered candidate list, with the cached URL promoted when applicable.
    pub async fn candidates(&self, key: &EntityKey) -> Vec<String> {
        let mut candidates = candidate_urls(&self.source, key);

        if let Some(cached) = self.cache.get(key).await {
            if promote_cached(&mut candidates, &cached.url) {
                debug!(entity = %key, url = %cached.url, "Trying cached URL first");
            } else {
                info!(entity = %key, url = %cached.url, "Cached URL is not a current candidate, ignoring");
            }
        }

        candidates
    }

    /// Try candidates in order until one yields an identifier.
    ///
    /// Navigating a candidate also lets the page issue its data request, which
    /// the interceptor picks up on its own.
    pub async fn resolve(
        &self,
        session: &dyn BrowserSession,
        key: &EntityKey,
    ) -> Result<Resolution, ResolveError> {
        let candidates = self.candidates(key).await;

        for (index, url) in candidates.iter().enumerate() {
            let attempt = self.try_candidate(session, key, url).await;
            RESOLUTION_ATTEMPTS
                .with_label_values(&[attempt.label()])
                .inc();

            if let Attempt::Resolved(identifier) = attempt {
                info!(entity = %key, identifier = %identifier, url = %url, "Resolved identifier");

                if let Err(e) = self.cache.record(key, url, &identifier).await {
                    warn!(entity = %key, error = %e, "Failed to update URL cache");
                }

                return Ok(Resolution {
                    identifier,
                    url: url.clone(),
                    attempts: index + 1,
                });
            }
        }

        self.diagnostics
            .error(
                FAILED_IDS_LOG,
                &format!(
                    "Failed to resolve identifier for {} after {} candidate(s)",
                    key,
                    candidates.len()
                ),
            )
            .await;

        Err(ResolveError::Exhausted {
            entity: key.to_string(),
            tried: candidates.len(),
        })
    }

    async fn try_candidate(&self, session: &dyn BrowserSession, key: &EntityKey, url: &str) -> Attempt {
        debug!(entity = %key, url, "Navigating to candidate");

        // The page may have rendered enough to carry the element either way.
        match session.navigate(url).await {
            Ok(()) => {}
            Err(e) if e.is_timeout() => {
                debug!(entity = %key, url, "Page load timed out, continuing");
            }
            Err(e) => {
                warn!(entity = %key, url, error = %e, "Navigation failed, checking page anyway");
            }
        }

        let element_id = &self.source.embedded_element_id;
        for attempt in 1..=self.browser.element_retries.max(1) {
            let element = match session
                .wait_for_element(element_id, self.browser.element_timeout())
                .await
            {
                Ok(Some(element)) => element,
                Ok(None) => {
                    debug!(entity = %key, url, attempt, "Embedded data element not found yet");
                    continue;
                }
                Err(e) => {
                    warn!(entity = %key, url, error = %e, "Element lookup failed");
                    return Attempt::BrowserError;
                }
            };

            let text = match session.text_content(&element).await {
                Ok(text) => text,
                Err(e) => {
                    warn!(entity = %key, url, error = %e, "Failed to read embedded data");
                    return Attempt::BrowserError;
                }
            };

            return match extract_instrument_id(&text) {
                Ok(identifier) => Attempt::Resolved(identifier),
                Err(e) => {
                    warn!(entity = %key, url, error = %e, "Embedded data rejected");
                    Attempt::BadPayload
                }
            };
        }

        Attempt::NoElement
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::browser::BrowserLauncher;
    use crate::testing::{fixtures, MockBrowserLauncher, MockPage};
    use tempfile::TempDir;

    struct Fixture {
        temp: TempDir,
        launcher: MockBrowserLauncher,
        cache: Arc<UrlCache>,
        resolver: IdentifierResolver,
    }

    async fn fixture() -> Fixture {
        let temp = TempDir::new().unwrap();
        let config = fixtures::test_config(temp.path());
        let cache = Arc::new(UrlCache::load(config.staging.url_cache_path.clone()).await);
        let diagnostics = Arc::new(DiagnosticLog::new(config.staging.diagnostics_dir.clone()));
        let resolver = IdentifierResolver::new(
            config.source.clone(),
            config.browser.clone(),
            cache.clone(),
            diagnostics,
        );

        Fixture {
            temp,
            launcher: MockBrowserLauncher::new(),
            cache,
            resolver,
        }
    }

    fn embedded(identifier: &str) -> MockPage {
        MockPage::new().with_element("__NEXT_DATA__", fixtures::embedded_state(identifier))
    }

    #[tokio::test]
    async fn test_resolves_at_second_candidate() {
        let f = fixture().await;
        let key = EntityKey::new("testland", 2);
        let candidates = f.resolver.candidates(&key).await;
        f.launcher.add_page(&candidates[1], embedded("999")).await;

        let session = f.launcher.launch(true).await.unwrap();
        let resolution = f.resolver.resolve(session.as_ref(), &key).await.unwrap();

        assert_eq!(resolution.identifier, "999");
        assert_eq!(resolution.url, candidates[1]);
        assert_eq!(resolution.attempts, 2);
        assert_eq!(f.launcher.navigations().await, candidates[..2].to_vec());

        let cached = f.cache.get(&key).await.unwrap();
        assert_eq!(cached.url, candidates[1]);
        assert_eq!(cached.id, "999");
    }

    #[tokio::test]
    async fn test_cached_url_is_tried_first() {
        let f = fixture().await;
        let key = EntityKey::new("testland", 2);
        let candidates = f.resolver.candidates(&key).await;
        f.cache.record(&key, &candidates[2], "42").await.unwrap();
        f.launcher.add_page(&candidates[2], embedded("42")).await;

        let session = f.launcher.launch(true).await.unwrap();
        let resolution = f.resolver.resolve(session.as_ref(), &key).await.unwrap();

        assert_eq!(resolution.attempts, 1);
        assert_eq!(f.launcher.navigations().await, vec![candidates[2].clone()]);
    }

    #[tokio::test]
    async fn test_stale_cached_url_is_ignored() {
        let f = fixture().await;
        let key = EntityKey::new("testland", 2);
        f.cache
            .record(&key, "https://bonds.test/retired-page", "1")
            .await
            .unwrap();

        let candidates = f.resolver.candidates(&key).await;
        assert_eq!(candidates[0], "https://bonds.test/testland-2-year-bond-yield");
        assert_eq!(candidates.len(), 3);
    }

    #[tokio::test]
    async fn test_page_load_timeout_still_reads_element() {
        let f = fixture().await;
        let key = EntityKey::new("testland", 5);
        let candidates = f.resolver.candidates(&key).await;
        f.launcher.add_page(&candidates[0], embedded("7").slow()).await;

        let session = f.launcher.launch(true).await.unwrap();
        let resolution = f.resolver.resolve(session.as_ref(), &key).await.unwrap();
        assert_eq!(resolution.identifier, "7");
    }

    #[tokio::test]
    async fn test_navigation_error_still_reads_element() {
        let f = fixture().await;
        let key = EntityKey::new("testland", 2);
        let candidates = f.resolver.candidates(&key).await;
        f.launcher.add_page(&candidates[0], embedded("31").failing_load()).await;

        let session = f.launcher.launch(true).await.unwrap();
        let resolution = f.resolver.resolve(session.as_ref(), &key).await.unwrap();
        assert_eq!(resolution.identifier, "31");
        assert_eq!(resolution.attempts, 1);
    }

    #[tokio::test]
    async fn test_bad_payload_moves_to_next_candidate() {
        let f = fixture().await;
        let key = EntityKey::new("testland", 2);
        let candidates = f.resolver.candidates(&key).await;
        f.launcher
            .add_page(&candidates[0], MockPage::new().with_element("__NEXT_DATA__", "{not json"))
            .await;
        f.launcher.add_page(&candidates[2], embedded("55")).await;

        let session = f.launcher.launch(true).await.unwrap();
        let resolution = f.resolver.resolve(session.as_ref(), &key).await.unwrap();
        assert_eq!(resolution.identifier, "55");
        assert_eq!(resolution.attempts, 3);
    }

    #[tokio::test]
    async fn test_exhausted_logs_failed_ids() {
        let f = fixture().await;
        let key = EntityKey::new("nowhere", 2);

        let session = f.launcher.launch(true).await.unwrap();
        let err = f.resolver.resolve(session.as_ref(), &key).await.unwrap_err();
        let ResolveError::Exhausted { tried, .. } = err;
        assert_eq!(tried, 3);
        assert!(f.cache.is_empty().await);

        let log = f
            .temp
            .path()
            .join("logs")
            .join("identifiers")
            .join("failed_ids.log");
        let contents = tokio::fs::read_to_string(log).await.unwrap();
        assert!(contents.contains("nowhere 2Y"));
        assert!(contents.contains(" - ERROR - "));
    }
}
