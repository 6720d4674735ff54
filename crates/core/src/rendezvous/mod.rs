//! Rendezvous between ingestion workers and the out-of-process interceptor.
//!
//! The two sides share nothing but the staging directory and the store. The
//! interceptor stages captured rows as `{id}_PENDING` and publishes
//! `{id}_COMPLETE` when the window is fully fetched; the worker's
//! [`CompletionWaiter`] polls for the latter.

mod artifact;
mod bridge;
mod interceptor;
mod payload;
mod waiter;

pub use artifact::{ArtifactError, ArtifactState, ArtifactStore};
pub use bridge::{handle_line, run_bridge, BridgeStats, HookEvent};
pub use interceptor::{
    encode_query, fetch_window, InterceptError, InterceptedRequest, InterceptedResponse,
    Interceptor, RequestAction, ResponseAction,
};
pub use payload::{latest_date, normalize_rows, PagePayload, PriceRow};
pub use waiter::{Completion, CompletionWaiter};
