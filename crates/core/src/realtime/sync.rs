//! Periodic realtime snapshot sync.

use std::sync::Arc;
use std::time::Duration;

use chrono::NaiveDateTime;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::config::RealtimeConfig;
use crate::metrics::REALTIME_ROWS;
use crate::store::{RealtimeObservation, RealtimeStore};

use super::bucket::{capture_time, minutes_since_midnight, timeframe_bucket};
use super::live_table::{parse_live_rows, LiveQuote, LiveTableSource};
use super::RealtimeError;

/// What one snapshot did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotReport {
    pub captured_at: NaiveDateTime,
    pub timeframe: u32,
    pub inserted: usize,
    pub closed: usize,
    pub skipped: usize,
}

pub struct RealtimeSync {
    source: Arc<dyn LiveTableSource>,
    store: Arc<dyn RealtimeStore>,
    clock: Arc<dyn Clock>,
    config: RealtimeConfig,
    periods: Vec<u32>,
}

impl RealtimeSync {
    pub fn new(
        source: Arc<dyn LiveTableSource>,
        store: Arc<dyn RealtimeStore>,
        clock: Arc<dyn Clock>,
        config: RealtimeConfig,
        periods: Vec<u32>,
    ) -> Self {
        Self {
            source,
            store,
            clock,
            config,
            periods,
        }
    }

    /// Fetch one snapshot and apply it.
    pub async fn run_once(&self) -> Result<SnapshotReport, RealtimeError> {
        let rows = self.source.fetch().await?;
        let quotes = parse_live_rows(&rows, &self.periods);

        let captured_at = capture_time(self.clock.now(), self.config.utc_offset_minutes);
        let timeframe = timeframe_bucket(minutes_since_midnight(captured_at));

        let mut report = SnapshotReport {
            captured_at,
            timeframe,
            inserted: 0,
            closed: 0,
            skipped: 0,
        };

        for quote in &quotes {
            match self.apply(quote, captured_at, timeframe)? {
                Applied::Inserted => report.inserted += 1,
                Applied::Closed => report.closed += 1,
                Applied::Skipped => report.skipped += 1,
            }
        }

        info!(
            captured_at = %captured_at,
            timeframe,
            quotes = quotes.len(),
            inserted = report.inserted,
            closed = report.closed,
            "Realtime snapshot applied"
        );
        Ok(report)
    }

    fn apply(
        &self,
        quote: &LiveQuote,
        captured_at: NaiveDateTime,
        timeframe: u32,
    ) -> Result<Applied, RealtimeError> {
        let entity = self.store.ensure_entity(&quote.key)?;
        let prior = self.store.latest_realtime(entity.id)?;

        let applied = if !quote.closed {
            self.store.insert_realtime(&RealtimeObservation {
                captured_at,
                entity_id: entity.id,
                value: quote.value,
                timeframe,
                is_open: prior.as_ref().is_some_and(|p| p.is_close),
                is_close: false,
            })?;
            Applied::Inserted
        } else {
            match prior {
                Some(prior) if !prior.is_close => {
                    self.store.mark_closed(entity.id, prior.captured_at)?;
                    debug!(entity = %quote.key, at = %prior.captured_at, "Marked session close");
                    Applied::Closed
                }
                _ => Applied::Skipped,
            }
        };

        REALTIME_ROWS.with_label_values(&[applied.label()]).inc();
        Ok(applied)
    }

    /// Run snapshots every `interval_secs` until shutdown. Failed snapshots
    /// are logged and retried on the next tick.
    pub async fn run_periodic(&self, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(Duration::from_secs(self.config.interval_secs));
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        info!(interval_secs = self.config.interval_secs, "Realtime loop started");
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    info!("Realtime loop received shutdown signal");
                    break;
                }
                _ = interval.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "Realtime snapshot failed");
                    }
                }
            }
        }
        info!("Realtime loop stopped");
    }
}

enum Applied {
    Inserted,
    Closed,
    Skipped,
}

impl Applied {
    fn label(&self) -> &'static str {
        match self {
            Applied::Inserted => "inserted",
            Applied::Closed => "closed",
            Applied::Skipped => "skipped",
        }
    }
}
