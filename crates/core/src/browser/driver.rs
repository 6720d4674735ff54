//! A private WebDriver process per browser session.

use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;

use reqwest::{Client, Method};
use serde_json::Value;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

use super::webdriver::send;
use super::BrowserError;

const STATUS_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// A driver process listening on its own local port.
///
/// The process is killed when this is dropped.
pub(crate) struct DriverProcess {
    child: Mutex<Child>,
    base_url: String,
}

impl DriverProcess {
    /// Start `driver_path` on a free port and wait until it reports ready.
    pub(crate) async fn spawn(
        client: &Client,
        driver_path: &str,
        startup_timeout: Duration,
    ) -> Result<Self, BrowserError> {
        let port = available_port()?;
        let child = Command::new(driver_path)
            .args(["--host", "127.0.0.1", "--port"])
            .arg(port.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| spawn_error(driver_path, e))?;

        let driver = Self {
            child: Mutex::new(child),
            base_url: format!("http://127.0.0.1:{}", port),
        };
        driver.wait_ready(client, startup_timeout).await?;

        debug!(driver = driver_path, port, "WebDriver process ready");
        Ok(driver)
    }

    pub(crate) fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn wait_ready(&self, client: &Client, timeout: Duration) -> Result<(), BrowserError> {
        let deadline = Instant::now() + timeout;
        let url = format!("{}/status", self.base_url);

        loop {
            if let Some(status) = self.child.lock().await.try_wait()? {
                return Err(BrowserError::Driver(format!(
                    "exited during startup with {}",
                    status
                )));
            }

            if let Ok(value) = send(client, Method::GET, &url, None).await {
                if is_ready(&value) {
                    return Ok(());
                }
            }

            if Instant::now() >= deadline {
                self.stop().await;
                return Err(BrowserError::Driver(format!(
                    "not ready after {}s at {}",
                    timeout.as_secs(),
                    self.base_url
                )));
            }
            sleep(STATUS_POLL_INTERVAL).await;
        }
    }

    pub(crate) async fn stop(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            warn!(base_url = %self.base_url, error = %e, "Failed to stop WebDriver process");
        }
    }
}

fn available_port() -> Result<u16, BrowserError> {
    Ok(TcpListener::bind("127.0.0.1:0")?.local_addr()?.port())
}

fn is_ready(status: &Value) -> bool {
    status.get("ready").and_then(Value::as_bool).unwrap_or(false)
}

fn spawn_error(driver_path: &str, e: std::io::Error) -> BrowserError {
    if e.kind() == std::io::ErrorKind::NotFound {
        BrowserError::Driver(format!("driver not found at: {}", driver_path))
    } else {
        BrowserError::Io(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_is_ready() {
        assert!(is_ready(&json!({"ready": true, "message": ""})));
        assert!(!is_ready(&json!({"ready": false})));
        assert!(!is_ready(&json!(null)));
    }

    #[test]
    fn test_available_ports_are_bindable() {
        let port = available_port().unwrap();
        assert_ne!(port, 0);
        assert!(TcpListener::bind(("127.0.0.1", port)).is_ok());
    }

    #[tokio::test]
    async fn test_missing_driver_binary() {
        let client = Client::new();
        let result =
            DriverProcess::spawn(&client, "/nonexistent/geckodriver", Duration::from_secs(1)).await;

        match result {
            Err(BrowserError::Driver(message)) => assert!(message.contains("driver not found")),
            Err(other) => panic!("unexpected {:?}", other),
            Ok(_) => panic!("driver should not start"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_driver_exiting_early_fails_startup() {
        let client = Client::new();
        let result = DriverProcess::spawn(&client, "false", Duration::from_secs(5)).await;
        assert!(matches!(result, Err(BrowserError::Driver(_))));
    }
}
