//! Reachability checks run before any job is scheduled.

use std::future::Future;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::store::ObservationStore;

use super::SchedulerError;

/// Retry policy for a probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbePolicy {
    pub retries: u32,
    pub delay: Duration,
    pub timeout: Duration,
}

impl ProbePolicy {
    pub fn from_config(config: &SchedulerConfig) -> Self {
        Self {
            retries: config.probe_retries.max(1),
            delay: Duration::from_secs(config.probe_delay_secs),
            timeout: Duration::from_secs(config.probe_timeout_secs),
        }
    }
}

async fn with_retries<F, Fut>(what: &str, policy: ProbePolicy, mut probe: F) -> Result<(), SchedulerError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<(), String>>,
{
    let mut last_error = String::new();

    for attempt in 1..=policy.retries {
        match timeout(policy.timeout, probe()).await {
            Ok(Ok(())) => {
                info!(target_name = what, attempt, "Preflight check passed");
                return Ok(());
            }
            Ok(Err(e)) => last_error = e,
            Err(_) => last_error = format!("timed out after {:?}", policy.timeout),
        }

        warn!(target_name = what, attempt, retries = policy.retries, error = %last_error, "Preflight check failed");
        if attempt < policy.retries {
            sleep(policy.delay).await;
        }
    }

    Err(SchedulerError::Preflight(format!(
        "{} unreachable after {} attempt(s): {}",
        what, policy.retries, last_error
    )))
}

/// Check that something accepts TCP connections at `addr`.
pub async fn probe_tcp(addr: &str, policy: ProbePolicy) -> Result<(), SchedulerError> {
    with_retries(&format!("interceptor at {}", addr), policy, || async {
        TcpStream::connect(addr)
            .await
            .map(|_| ())
            .map_err(|e| e.to_string())
    })
    .await
}

/// Check that the store answers a round trip.
pub async fn probe_store(store: &dyn ObservationStore, policy: ProbePolicy) -> Result<(), SchedulerError> {
    with_retries("store", policy, || async { store.ping().map_err(|e| e.to_string()) }).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;
    use tokio::net::TcpListener;

    fn fast_policy(retries: u32) -> ProbePolicy {
        ProbePolicy {
            retries,
            delay: Duration::from_millis(5),
            timeout: Duration::from_millis(500),
        }
    }

    #[tokio::test]
    async fn test_probe_tcp_listening() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        assert!(probe_tcp(&addr, fast_policy(1)).await.is_ok());
    }

    #[tokio::test]
    async fn test_probe_tcp_closed_port() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        drop(listener);

        let result = probe_tcp(&addr, fast_policy(2)).await;
        match result {
            Err(SchedulerError::Preflight(message)) => {
                assert!(message.contains("after 2 attempt(s)"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_probe_store() {
        let store = SqliteStore::in_memory().unwrap();
        assert!(probe_store(&store, fast_policy(1)).await.is_ok());
    }

    #[test]
    fn test_policy_from_config() {
        let policy = ProbePolicy::from_config(&SchedulerConfig::default());
        assert_eq!(policy.retries, 5);
        assert_eq!(policy.delay, Duration::from_secs(10));
        assert_eq!(policy.timeout, Duration::from_secs(10));
    }
}
