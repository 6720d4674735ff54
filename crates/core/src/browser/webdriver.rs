//! W3C WebDriver client, used with geckodriver.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Method};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use crate::config::BrowserConfig;

use super::driver::DriverProcess;
use super::{copy_profile, BrowserError, BrowserLauncher, BrowserSession, ElementRef};

/// Key under which WebDriver serializes element references.
const ELEMENT_KEY: &str = "element-6066-11e4-a52e-4f735466cecf";

const ELEMENT_POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Launches Firefox sessions through WebDriver.
///
/// With `spawn_driver` every session gets its own driver process and its own
/// copy of the template profile, so sessions can run side by side.
pub struct WebDriverLauncher {
    client: Client,
    config: BrowserConfig,
}

impl WebDriverLauncher {
    pub fn new(config: BrowserConfig) -> Result<Self, BrowserError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.command_timeout_secs))
            .build()
            .map_err(|e| BrowserError::ConnectionFailed(e.to_string()))?;

        Ok(Self { client, config })
    }

    fn shared_url(&self) -> &str {
        self.config.webdriver_url.trim_end_matches('/')
    }

    /// Build the new-session payload for a session running on `profile`.
    pub fn capabilities(&self, use_proxy: bool, profile: Option<&Path>) -> Value {
        let mut args: Vec<String> = Vec::new();
        if self.config.headless {
            args.push("-headless".to_string());
        }
        if let Some(dir) = profile {
            args.push("-profile".to_string());
            args.push(dir.display().to_string());
        }

        let mut firefox = json!({
            "args": args,
            "prefs": {
                "network.proxy.allow_hijacking_localhost": true,
            },
        });
        if let Some(binary) = &self.config.firefox_binary {
            firefox["binary"] = json!(binary);
        }

        let mut caps = json!({
            "browserName": "firefox",
            "acceptInsecureCerts": self.config.accept_insecure_certs,
            "pageLoadStrategy": "normal",
            "timeouts": {
                "pageLoad": self.config.page_load_timeout().as_millis() as u64,
                "implicit": 0,
            },
            "moz:firefoxOptions": firefox,
        });

        if use_proxy {
            if let Some(proxy) = self.config.proxy.as_deref().filter(|p| !p.trim().is_empty()) {
                caps["proxy"] = json!({
                    "proxyType": "manual",
                    "httpProxy": proxy,
                    "sslProxy": proxy,
                });
            }
        }

        json!({ "capabilities": { "alwaysMatch": caps } })
    }
}

#[async_trait]
impl BrowserLauncher for WebDriverLauncher {
    fn name(&self) -> &str {
        "webdriver"
    }

    async fn launch(&self, use_proxy: bool) -> Result<Box<dyn BrowserSession>, BrowserError> {
        let profile = match &self.config.profile_dir {
            Some(template) => Some(copy_profile(template).await?),
            None => None,
        };

        let driver = if self.config.spawn_driver {
            let startup = Duration::from_secs(self.config.driver_startup_timeout_secs);
            Some(DriverProcess::spawn(&self.client, &self.config.driver_path, startup).await?)
        } else {
            None
        };
        let base_url = match &driver {
            Some(driver) => driver.base_url().to_string(),
            None => self.shared_url().to_string(),
        };

        // Dropping the driver on error kills it.
        let caps = self.capabilities(use_proxy, profile.as_ref().map(TempDir::path));
        let value = send(
            &self.client,
            Method::POST,
            &format!("{}/session", base_url),
            Some(caps),
        )
        .await?;

        let session_id = value
            .get("sessionId")
            .and_then(Value::as_str)
            .ok_or_else(|| BrowserError::Protocol("new session without sessionId".to_string()))?
            .to_string();

        debug!(session_id = %session_id, base_url = %base_url, use_proxy, "WebDriver session started");

        Ok(Box::new(WebDriverSession {
            client: self.client.clone(),
            base_url,
            session_id,
            driver,
            _profile: profile,
        }))
    }
}

/// A live WebDriver session.
pub struct WebDriverSession {
    client: Client,
    base_url: String,
    session_id: String,
    driver: Option<DriverProcess>,
    /// Private profile copy, removed with the session.
    _profile: Option<TempDir>,
}

impl WebDriverSession {
    fn url(&self, path: &str) -> String {
        format!("{}/session/{}{}", self.base_url, self.session_id, path)
    }

    async fn find_one(&self, using: &str, value: &str) -> Result<ElementRef, BrowserError> {
        let response = send(
            &self.client,
            Method::POST,
            &self.url("/element"),
            Some(json!({ "using": using, "value": value })),
        )
        .await?;
        parse_element(&response)
    }
}

#[async_trait]
impl BrowserSession for WebDriverSession {
    async fn navigate(&self, url: &str) -> Result<(), BrowserError> {
        send(
            &self.client,
            Method::POST,
            &self.url("/url"),
            Some(json!({ "url": url })),
        )
        .await?;
        Ok(())
    }

    async fn wait_for_element(
        &self,
        id: &str,
        timeout: Duration,
    ) -> Result<Option<ElementRef>, BrowserError> {
        let deadline = Instant::now() + timeout;
        let selector = format!("[id=\"{}\"]", id.replace('"', "\\\""));

        loop {
            match self.find_one("css selector", &selector).await {
                Ok(element) => return Ok(Some(element)),
                Err(BrowserError::Command { ref error, .. }) if error == "no such element" => {}
                Err(e) => return Err(e),
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            sleep(ELEMENT_POLL_INTERVAL).await;
        }
    }

    async fn text_content(&self, element: &ElementRef) -> Result<String, BrowserError> {
        let path = format!("/element/{}/property/textContent", element.as_str());
        let value = send(&self.client, Method::GET, &self.url(&path), None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn visible_text(&self, element: &ElementRef) -> Result<String, BrowserError> {
        let path = format!("/element/{}/text", element.as_str());
        let value = send(&self.client, Method::GET, &self.url(&path), None).await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn find_elements(
        &self,
        xpath: &str,
        within: Option<&ElementRef>,
    ) -> Result<Vec<ElementRef>, BrowserError> {
        let path = match within {
            Some(parent) => format!("/element/{}/elements", parent.as_str()),
            None => "/elements".to_string(),
        };
        let value = send(
            &self.client,
            Method::POST,
            &self.url(&path),
            Some(json!({ "using": "xpath", "value": xpath })),
        )
        .await?;

        value
            .as_array()
            .ok_or_else(|| BrowserError::Protocol("elements response is not a list".to_string()))?
            .iter()
            .map(parse_element)
            .collect()
    }

    async fn quit(&self) -> Result<(), BrowserError> {
        let result = send(&self.client, Method::DELETE, &self.url(""), None).await;
        if let Err(ref e) = result {
            warn!(session_id = %self.session_id, error = %e, "Failed to close WebDriver session");
        }
        if let Some(driver) = &self.driver {
            driver.stop().await;
        }
        result.map(|_| ())
    }
}

/// Issue one WebDriver command and unwrap its `value`.
pub(super) async fn send(
    client: &Client,
    method: Method,
    url: &str,
    body: Option<Value>,
) -> Result<Value, BrowserError> {
    let mut request = client.request(method, url);
    if let Some(body) = body {
        request = request.json(&body);
    }

    let response = request.send().await.map_err(|e| {
        if e.is_timeout() {
            BrowserError::Timeout
        } else if e.is_connect() {
            BrowserError::ConnectionFailed(e.to_string())
        } else {
            BrowserError::Protocol(e.to_string())
        }
    })?;

    let status = response.status();
    let body: Value = response
        .json()
        .await
        .map_err(|e| BrowserError::Protocol(format!("HTTP {}: {}", status, e)))?;

    if !status.is_success() {
        return Err(command_error(&body));
    }

    Ok(body.get("value").cloned().unwrap_or(Value::Null))
}

/// Map a WebDriver error body to `BrowserError`.
fn command_error(body: &Value) -> BrowserError {
    let value = body.get("value").unwrap_or(body);
    let error = value
        .get("error")
        .and_then(Value::as_str)
        .unwrap_or("unknown error");
    let message = value
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or_default();

    if error == "timeout" {
        return BrowserError::Timeout;
    }

    BrowserError::Command {
        error: error.to_string(),
        message: message.to_string(),
    }
}

fn parse_element(value: &Value) -> Result<ElementRef, BrowserError> {
    value
        .get(ELEMENT_KEY)
        .and_then(Value::as_str)
        .map(ElementRef::new)
        .ok_or_else(|| BrowserError::Protocol(format!("not an element reference: {}", value)))
}
