//! Ingestion run: plan stale pairs, then drain them with a worker pool.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::browser::{BrowserLauncher, BrowserSession};
use crate::clock::Clock;
use crate::config::Config;
use crate::diagnostics::DiagnosticLog;
use crate::metrics::JOBS_TOTAL;
use crate::persist::PersistenceWriter;
use crate::realtime::{discover_entities, LiveTableSource};
use crate::rendezvous::{ArtifactStore, Completion, CompletionWaiter};
use crate::resolver::{IdentifierResolver, ResolveError, UrlCache};
use crate::store::{EntityKey, ObservationStore};

use super::preflight::{probe_store, probe_tcp, ProbePolicy};
use super::types::{is_stale, IngestJob, JobOutcome, JobStatus, RunReport, SchedulerError};

/// Per-job pipeline shared by all workers.
struct JobRunner {
    launcher: Arc<dyn BrowserLauncher>,
    resolver: IdentifierResolver,
    waiter: CompletionWaiter,
    writer: PersistenceWriter,
}

impl JobRunner {
    /// One job: a fresh session, resolve, wait, persist, quit.
    ///
    /// The pipeline runs in its own task so a panic only fails this job; the
    /// session is quit on every path.
    async fn run(self: Arc<Self>, job: IngestJob, worker: usize) -> JobStatus {
        let session: Arc<dyn BrowserSession> = match self.launcher.launch(true).await {
            Ok(session) => Arc::from(session),
            Err(e) => {
                warn!(entity = %job.key, worker, error = %e, "Failed to start browser session");
                return JobStatus::BrowserFailed {
                    reason: e.to_string(),
                };
            }
        };

        let entity = job.key.clone();
        let task_session = Arc::clone(&session);
        let runner = Arc::clone(&self);
        let status = match tokio::spawn(async move {
            runner.ingest(task_session.as_ref(), &job, worker).await
        })
        .await
        {
            Ok(status) => status,
            Err(e) => {
                let reason = if e.is_panic() {
                    panic_message(e.into_panic())
                } else {
                    "cancelled".to_string()
                };
                error!(entity = %entity, worker, reason = %reason, "Job crashed");
                JobStatus::Crashed { reason }
            }
        };

        if let Err(e) = session.quit().await {
            debug!(entity = %entity, worker, error = %e, "Session quit failed");
        }
        status
    }

    async fn ingest(&self, session: &dyn BrowserSession, job: &IngestJob, worker: usize) -> JobStatus {
        let resolution = match self.resolver.resolve(session, &job.key).await {
            Ok(resolution) => resolution,
            Err(ResolveError::Exhausted { tried, .. }) => {
                return JobStatus::ResolutionFailed {
                    candidates_tried: tried,
                };
            }
        };
        let identifier = resolution.identifier;
        debug!(entity = %job.key, worker, identifier = %identifier, "Waiting for artifact");

        let completion = match self.waiter.wait_for_completion(&identifier).await {
            Ok(completion) => completion,
            Err(e) => {
                warn!(entity = %job.key, identifier = %identifier, error = %e, "Artifact unreadable");
                return JobStatus::NoArtifact { identifier };
            }
        };

        match completion {
            Completion::Ready(payload) => {
                match self.writer.persist(&job.key, &identifier, &payload).await {
                    Ok(report) => JobStatus::Ingested {
                        identifier,
                        rows: report.rows,
                    },
                    Err(e) => JobStatus::PersistFailed {
                        identifier,
                        reason: e.to_string(),
                    },
                }
            }
            Completion::Empty => JobStatus::UpToDate { identifier },
            Completion::NotFound => JobStatus::NoArtifact { identifier },
        }
    }
}

/// Drives one ingestion run over the tracked (entity, period) pairs.
pub struct IngestScheduler {
    config: Config,
    store: Arc<dyn ObservationStore>,
    clock: Arc<dyn Clock>,
    live_table: Option<Arc<dyn LiveTableSource>>,
    runner: Arc<JobRunner>,
}

impl IngestScheduler {
    pub fn new(
        config: Config,
        store: Arc<dyn ObservationStore>,
        launcher: Arc<dyn BrowserLauncher>,
        clock: Arc<dyn Clock>,
        url_cache: Arc<UrlCache>,
        diagnostics: Arc<DiagnosticLog>,
    ) -> Self {
        let artifacts = ArtifactStore::new(
            config.staging.artifact_dir.clone(),
            config.staging.artifact_ext.clone(),
        );

        let runner = JobRunner {
            launcher,
            resolver: IdentifierResolver::new(
                config.source.clone(),
                config.browser.clone(),
                url_cache,
                diagnostics.clone(),
            ),
            waiter: CompletionWaiter::new(
                artifacts.clone(),
                config.scheduler.poll_interval(),
                config.scheduler.max_polls,
            ),
            writer: PersistenceWriter::new(store.clone(), artifacts, diagnostics),
        };

        Self {
            config,
            store,
            clock,
            live_table: None,
            runner: Arc::new(runner),
        }
    }

    /// Discover tracked entities from the live table as well.
    pub fn with_live_table(mut self, live_table: Arc<dyn LiveTableSource>) -> Self {
        self.live_table = Some(live_table);
        self
    }

    /// Preflight, plan and execute one run.
    pub async fn run(&self) -> Result<RunReport, SchedulerError> {
        self.preflight().await?;
        let (jobs, fresh) = self.plan().await?;
        Ok(self.execute(jobs, fresh).await)
    }

    /// Both the interceptor and the store must be reachable.
    pub async fn preflight(&self) -> Result<(), SchedulerError> {
        let policy = ProbePolicy::from_config(&self.config.scheduler);
        probe_tcp(&self.config.scheduler.proxy_addr, policy).await?;
        probe_store(self.store.as_ref(), policy).await?;
        Ok(())
    }

    /// Configured entities, plus those listed in the live table when enabled.
    pub async fn tracked_entities(&self) -> Vec<String> {
        let mut entities: BTreeSet<String> = self.config.tracked.entities.iter().cloned().collect();

        if self.config.tracked.discover_from_live_table {
            if let Some(live_table) = &self.live_table {
                match live_table.fetch().await {
                    Ok(rows) => {
                        let discovered = discover_entities(&rows, &self.config.tracked.periods);
                        info!(count = discovered.len(), "Discovered entities from live table");
                        entities.extend(discovered);
                    }
                    Err(e) => {
                        warn!(error = %e, "Entity discovery failed, using configured entities");
                    }
                }
            }
        }

        entities.into_iter().collect()
    }

    /// Stale pairs to ingest and the number of pairs already current.
    pub async fn plan(&self) -> Result<(Vec<IngestJob>, usize), SchedulerError> {
        let today = self.clock.today();
        let mut jobs = Vec::new();
        let mut fresh = 0;

        for name in self.tracked_entities().await {
            for period in &self.config.tracked.periods {
                let key = EntityKey::new(name.clone(), *period);
                let watermark = self.store.latest_date(&key)?;

                if is_stale(watermark, today) {
                    jobs.push(IngestJob { key, watermark });
                } else {
                    debug!(entity = %key, ?watermark, "Already current");
                    fresh += 1;
                }
            }
        }

        info!(stale = jobs.len(), fresh, "Planned ingestion run");
        Ok((jobs, fresh))
    }

    /// Run `jobs` on the worker pool and collect their outcomes.
    pub async fn execute(&self, jobs: Vec<IngestJob>, fresh: usize) -> RunReport {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let workers = self.config.scheduler.workers.max(1).min(jobs.len().max(1));
        info!(run_id = %run_id, jobs = jobs.len(), workers, "Starting ingestion run");

        let queue = Arc::new(Mutex::new(VecDeque::from(jobs)));
        let mut handles = Vec::with_capacity(workers);

        for worker in 0..workers {
            let queue = Arc::clone(&queue);
            let runner = Arc::clone(&self.runner);

            handles.push(tokio::spawn(async move {
                let mut outcomes = Vec::new();
                loop {
                    let Some(job) = queue.lock().await.pop_front() else {
                        break;
                    };
                    outcomes.push(Self::run_isolated(&runner, job, worker).await);
                }
                debug!(worker, jobs = outcomes.len(), "Worker finished");
                outcomes
            }));
        }

        let mut outcomes = Vec::new();
        for handle in handles {
            match handle.await {
                Ok(worker_outcomes) => outcomes.extend(worker_outcomes),
                Err(e) => error!(error = %e, "Worker task failed"),
            }
        }

        let report = RunReport {
            run_id,
            started_at,
            finished_at: Utc::now(),
            fresh,
            outcomes,
        };
        info!(
            run_id = %report.run_id,
            jobs = report.outcomes.len(),
            ingested = report.count("ingested"),
            up_to_date = report.count("up_to_date"),
            failures = report.failures(),
            rows = report.rows_ingested(),
            "Ingestion run finished"
        );
        report
    }

    async fn run_isolated(runner: &Arc<JobRunner>, job: IngestJob, worker: usize) -> JobOutcome {
        let started = Instant::now();
        let entity = job.key.clone();
        let status = Arc::clone(runner).run(job, worker).await;

        JOBS_TOTAL.with_label_values(&[status.label()]).inc();
        info!(entity = %entity, worker, status = status.label(), "Job finished");

        JobOutcome {
            entity,
            worker,
            status,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}
