//! Waiting for the interceptor to publish the COMPLETE artifact.

use std::time::Duration;

use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::metrics::ARTIFACT_WAIT;

use super::artifact::{ArtifactError, ArtifactState, ArtifactStore};

/// Terminal outcome of a wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Completion {
    /// COMPLETE artifact with this body; left in place for the writer.
    Ready(String),
    /// Empty COMPLETE artifact (nothing new); already removed.
    Empty,
    /// Nothing arrived within the budget.
    NotFound,
}

impl Completion {
    pub fn label(&self) -> &'static str {
        match self {
            Completion::Ready(_) => "ready",
            Completion::Empty => "empty",
            Completion::NotFound => "not_found",
        }
    }
}

pub struct CompletionWaiter {
    artifacts: ArtifactStore,
    poll_interval: Duration,
    max_polls: u32,
}

impl CompletionWaiter {
    pub fn new(artifacts: ArtifactStore, poll_interval: Duration, max_polls: u32) -> Self {
        Self {
            artifacts,
            poll_interval,
            max_polls,
        }
    }

    /// Poll for `{identifier}_COMPLETE`. When the budget runs out while a
    /// PENDING artifact exists (a replay is in flight), wait one more cycle.
    pub async fn wait_for_completion(&self, identifier: &str) -> Result<Completion, ArtifactError> {
        let started = Instant::now();

        let mut outcome = self.wait_cycle(identifier).await?;
        if outcome.is_none() && self.artifacts.state(identifier).await? == ArtifactState::Pending {
            info!(identifier, "Pending artifact still open, waiting another cycle");
            outcome = self.wait_cycle(identifier).await?;
        }

        let completion = match outcome {
            Some(body) if body.trim().is_empty() => {
                self.artifacts.remove_complete(identifier).await?;
                Completion::Empty
            }
            Some(body) => Completion::Ready(body),
            None => {
                warn!(identifier, "No artifact arrived");
                Completion::NotFound
            }
        };

        ARTIFACT_WAIT
            .with_label_values(&[completion.label()])
            .observe(started.elapsed().as_secs_f64());
        debug!(identifier, outcome = completion.label(), "Wait finished");

        Ok(completion)
    }

    async fn wait_cycle(&self, identifier: &str) -> Result<Option<String>, ArtifactError> {
        for poll in 0..self.max_polls {
            if let Some(body) = self.artifacts.read_complete(identifier).await? {
                return Ok(Some(body));
            }
            if poll + 1 < self.max_polls {
                sleep(self.poll_interval).await;
            }
        }
        Ok(None)
    }
}
