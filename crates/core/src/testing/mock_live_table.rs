//! Mock live table source for testing.

use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::realtime::{LiveRow, LiveTableSource, RealtimeError};

/// Mock implementation of `LiveTableSource`.
///
/// Snapshots are served in push order; once the queue is drained the last
/// snapshot keeps being returned.
#[derive(Debug, Default)]
pub struct MockLiveTable {
    snapshots: Arc<RwLock<VecDeque<Vec<LiveRow>>>>,
    last: Arc<RwLock<Vec<LiveRow>>>,
    /// If set, the next fetch fails with this error.
    next_error: Arc<RwLock<Option<RealtimeError>>>,
    fetches: Arc<RwLock<usize>>,
}

impl MockLiveTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_rows(rows: Vec<LiveRow>) -> Self {
        Self {
            last: Arc::new(RwLock::new(rows)),
            ..Self::default()
        }
    }

    pub async fn push_snapshot(&self, rows: Vec<LiveRow>) {
        self.snapshots.write().await.push_back(rows);
    }

    pub async fn set_next_error(&self, error: RealtimeError) {
        *self.next_error.write().await = Some(error);
    }

    pub async fn fetch_count(&self) -> usize {
        *self.fetches.read().await
    }
}

#[async_trait]
impl LiveTableSource for MockLiveTable {
    async fn fetch(&self) -> Result<Vec<LiveRow>, RealtimeError> {
        *self.fetches.write().await += 1;

        if let Some(error) = self.next_error.write().await.take() {
            return Err(error);
        }

        if let Some(rows) = self.snapshots.write().await.pop_front() {
            *self.last.write().await = rows.clone();
            return Ok(rows);
        }
        Ok(self.last.read().await.clone())
    }
}
