//! Realtime snapshot sync.
//!
//! A separate periodic job: read the live yields table, bucket the capture
//! minute into a timeframe and record open/close transitions per entity. It
//! does not use the interceptor or the identifier resolver.

mod bucket;
mod live_table;
mod sync;

pub use bucket::{capture_time, minutes_since_midnight, timeframe_bucket, TIMEFRAMES};
pub use live_table::{
    discover_entities, normalize_entity_name, parse_live_rows, BrowserLiveTable, LiveQuote,
    LiveRow, LiveTableSource,
};
pub use sync::{RealtimeSync, SnapshotReport};

use thiserror::Error;

use crate::browser::BrowserError;
use crate::store::StoreError;

#[derive(Debug, Error)]
pub enum RealtimeError {
    #[error("Browser error: {0}")]
    Browser(#[from] BrowserError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Live table element '{0}' not found")]
    TableNotFound(String),
}
