//! Mock browser implementation for testing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

use crate::browser::{BrowserError, BrowserLauncher, BrowserSession, ElementRef};
use crate::realtime::LiveRow;

use super::simulated_proxy::SimulatedProxy;

/// Content served for one URL.
#[derive(Debug, Clone, Default)]
pub struct MockPage {
    /// Element id -> text content.
    pub elements: HashMap<String, String>,
    /// Identifier whose data request the page issues on load.
    pub data_request: Option<String>,
    /// Rows of the live table, if the page has one.
    pub live_rows: Vec<LiveRow>,
    /// Report a page-load timeout after the page has rendered.
    pub slow_load: bool,
    /// Report a navigation error after the page has rendered.
    pub load_fails: bool,
    /// Panic on navigation.
    pub panics: bool,
}

impl MockPage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_element(mut self, id: impl Into<String>, text: impl Into<String>) -> Self {
        self.elements.insert(id.into(), text.into());
        self
    }

    pub fn with_data_request(mut self, identifier: impl Into<String>) -> Self {
        self.data_request = Some(identifier.into());
        self
    }

    pub fn with_live_rows(mut self, rows: Vec<LiveRow>) -> Self {
        self.live_rows = rows;
        self
    }

    pub fn slow(mut self) -> Self {
        self.slow_load = true;
        self
    }

    pub fn failing_load(mut self) -> Self {
        self.load_fails = true;
        self
    }

    pub fn panicking(mut self) -> Self {
        self.panics = true;
        self
    }
}

#[derive(Default)]
struct BrowserState {
    pages: HashMap<String, MockPage>,
    navigations: Vec<String>,
    /// `use_proxy` of every launch.
    launches: Vec<bool>,
    quits: usize,
    next_error: Option<BrowserError>,
}

/// Mock launcher serving canned pages.
///
/// Sessions launched with the proxy enabled hand every page's data request
/// to the attached [`SimulatedProxy`], as a real browser behind the
/// interceptor would.
#[derive(Clone, Default)]
pub struct MockBrowserLauncher {
    state: Arc<RwLock<BrowserState>>,
    proxy: Arc<RwLock<Option<Arc<SimulatedProxy>>>>,
}

impl MockBrowserLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn add_page(&self, url: impl Into<String>, page: MockPage) {
        self.state.write().await.pages.insert(url.into(), page);
    }

    pub async fn set_proxy(&self, proxy: Arc<SimulatedProxy>) {
        *self.proxy.write().await = Some(proxy);
    }

    /// Make the next launch fail.
    pub async fn set_next_error(&self, error: BrowserError) {
        self.state.write().await.next_error = Some(error);
    }

    pub async fn navigations(&self) -> Vec<String> {
        self.state.read().await.navigations.clone()
    }

    pub async fn launches(&self) -> Vec<bool> {
        self.state.read().await.launches.clone()
    }

    pub async fn quit_count(&self) -> usize {
        self.state.read().await.quits
    }
}

#[async_trait]
impl BrowserLauncher for MockBrowserLauncher {
    fn name(&self) -> &str {
        "mock"
    }

    async fn launch(&self, use_proxy: bool) -> Result<Box<dyn BrowserSession>, BrowserError> {
        {
            let mut state = self.state.write().await;
            if let Some(error) = state.next_error.take() {
                return Err(error);
            }
            state.launches.push(use_proxy);
        }

        let proxy = if use_proxy {
            self.proxy.read().await.clone()
        } else {
            None
        };

        Ok(Box::new(MockBrowser {
            state: Arc::clone(&self.state),
            proxy,
            current: Mutex::new(None),
        }))
    }
}

struct MockBrowser {
    state: Arc<RwLock<BrowserState>>,
    proxy: Option<Arc<SimulatedProxy>>,
    current: Mutex<Option<MockPage>>,
}

impl MockBrowser {
    async fn page(&self) -> MockPage {
        self.current.lock().await.clone().unwrap_or_default()
    }
}

/// Element handles encode what they point at: `id:<id>`, `row:<i>`,
/// `label:<i>`, `value:<i>` or `closed:<i>`.
fn row_index(element: &ElementRef, prefix: &str) -> Option<usize> {
    element
        .as_str()
        .strip_prefix(prefix)
        .and_then(|rest| rest.parse().ok())
}

#[async_trait]
impl BrowserSession for MockBrowser {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        let page = {
            let mut state = self.state.write().await;
            state.navigations.push(url.to_string());
            state.pages.get(url).cloned()
        };

        let Some(page) = page else {
            *self.current.lock().await = None;
            return Ok(());
        };

        if page.panics {
            panic!("renderer crashed on {}", url);
        }

        if let (Some(identifier), Some(proxy)) = (&page.data_request, &self.proxy) {
            proxy.load(identifier).await;
        }

        let (slow, fails) = (page.slow_load, page.load_fails);
        *self.current.lock().await = Some(page);
        if slow {
            return Err(BrowserError::Timeout);
        }
        if fails {
            return Err(BrowserError::Command {
                error: "unknown error".to_string(),
                message: format!("Reached error page for {}", url),
            });
        }
        Ok(())
    }

    async fn wait_for_element(
        &self,
        id: &str,
        _timeout: Duration,
    ) -> Result<Option<ElementRef>, BrowserError> {
        let page = self.page().await;
        Ok(page
            .elements
            .contains_key(id)
            .then(|| ElementRef::new(format!("id:{}", id))))
    }

    async fn text_content(&self, element: &ElementRef) -> Result<String, BrowserError> {
        let page = self.page().await;
        element
            .as_str()
            .strip_prefix("id:")
            .and_then(|id| page.elements.get(id).cloned())
            .ok_or_else(|| BrowserError::Command {
                error: "stale element reference".to_string(),
                message: element.as_str().to_string(),
            })
    }

    async fn visible_text(&self, element: &ElementRef) -> Result<String, BrowserError> {
        let page = self.page().await;
        if let Some(row) = row_index(element, "label:").and_then(|i| page.live_rows.get(i)) {
            return Ok(row.label.clone());
        }
        if let Some(row) = row_index(element, "value:").and_then(|i| page.live_rows.get(i)) {
            return Ok(row.value.clone());
        }
        self.text_content(element).await
    }

    async fn find_elements(
        &self,
        xpath: &str,
        within: Option<&ElementRef>,
    ) -> Result<Vec<ElementRef>, BrowserError> {
        let page = self.page().await;

        let Some(row) = within.and_then(|el| row_index(el, "row:")) else {
            if xpath.contains("pair_") {
                return Ok((0..page.live_rows.len())
                    .map(|i| ElementRef::new(format!("row:{}", i)))
                    .collect());
            }
            return Ok(Vec::new());
        };

        let Some(live_row) = page.live_rows.get(row) else {
            return Ok(Vec::new());
        };

        let found = if xpath.contains("td/a") {
            Some(format!("label:{}", row))
        } else if xpath.contains("td[3]") {
            Some(format!("value:{}", row))
        } else if xpath.contains("redClockIcon") && live_row.closed {
            Some(format!("closed:{}", row))
        } else {
            None
        };
        Ok(found.into_iter().map(ElementRef::new).collect())
    }

    async fn quit(&self) -> Result<(), BrowserError> {
        self.state.write().await.quits += 1;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unknown_page_has_no_elements() {
        let launcher = MockBrowserLauncher::new();
        let session = launcher.launch(false).await.unwrap();
        session.navigate("https://nowhere.test/").await.unwrap();

        let found = session
            .wait_for_element("__NEXT_DATA__", Duration::from_millis(1))
            .await
            .unwrap();
        assert!(found.is_none());
        assert_eq!(launcher.navigations().await, vec!["https://nowhere.test/"]);
    }

    #[tokio::test]
    async fn test_element_text_and_slow_load() {
        let launcher = MockBrowserLauncher::new();
        launcher
            .add_page("https://a.test/", MockPage::new().with_element("x", "hello").slow())
            .await;
        let session = launcher.launch(true).await.unwrap();

        let err = session.navigate("https://a.test/").await.unwrap_err();
        assert!(err.is_timeout());

        let element = session
            .wait_for_element("x", Duration::from_millis(1))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(session.text_content(&element).await.unwrap(), "hello");

        session.quit().await.unwrap();
        assert_eq!(launcher.quit_count().await, 1);
        assert_eq!(launcher.launches().await, vec![true]);
    }

    #[tokio::test]
    async fn test_launch_error_is_consumed() {
        let launcher = MockBrowserLauncher::new();
        launcher
            .set_next_error(BrowserError::ConnectionFailed("refused".to_string()))
            .await;

        assert!(launcher.launch(true).await.is_err());
        assert!(launcher.launch(true).await.is_ok());
    }
}
