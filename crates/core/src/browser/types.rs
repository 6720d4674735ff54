//! Types for browser automation.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while driving a browser.
#[derive(Debug, Error)]
pub enum BrowserError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Browser command timed out")]
    Timeout,

    #[error("WebDriver error '{error}': {message}")]
    Command { error: String, message: String },

    #[error("Unexpected WebDriver response: {0}")]
    Protocol(String),

    #[error("WebDriver process failed: {0}")]
    Driver(String),

    #[error("Profile preparation failed: {0}")]
    Profile(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl BrowserError {
    /// True when the error only means the page did not finish loading in time.
    pub fn is_timeout(&self) -> bool {
        match self {
            BrowserError::Timeout => true,
            BrowserError::Command { error, .. } => error == "timeout",
            _ => false,
        }
    }
}

/// Opaque handle to an element of the current page.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ElementRef(pub String);

impl ElementRef {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// One live browser session.
///
/// A session is owned by a single worker at a time and is quit at the end of
/// the job that launched it.
#[async_trait]
pub trait BrowserSession: Send + Sync {
    /// Load a page. Returns `BrowserError::Timeout` when the page-load
    /// timeout fires; the page may still be usable.
    async fn navigate(&self, url: &str) -> Result<(), BrowserError>;

    /// Wait up to `timeout` for an element with the given id to appear.
    async fn wait_for_element(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Option<ElementRef>, BrowserError>;

    /// Raw text content of an element, including non-rendered nodes such as
    /// `<script>` bodies.
    async fn text_content(&self, element: &ElementRef) -> Result<String, BrowserError>;

    /// Rendered text of an element.
    async fn visible_text(&self, element: &ElementRef) -> Result<String, BrowserError>;

    /// Find elements by XPath, relative to `within` when given.
    async fn find_elements(
        &self,
        xpath: &str,
        within: Option<&ElementRef>,
    ) -> Result<Vec<ElementRef>, BrowserError>;

    /// End the session.
    async fn quit(&self) -> Result<(), BrowserError>;
}

/// Factory for browser sessions.
#[async_trait]
pub trait BrowserLauncher: Send + Sync {
    /// Backend name for logging.
    fn name(&self) -> &str;

    /// Start a new session. `use_proxy` selects whether traffic is routed
    /// through the configured interceptor.
    async fn launch(&self, use_proxy: bool) -> Result<Box<dyn BrowserSession>, BrowserError>;
}
