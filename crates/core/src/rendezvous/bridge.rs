//! JSON-lines bridge between a proxy host and the [`Interceptor`].
//!
//! The host writes one hook event per line:
//!
//! ```text
//! {"hook":"request","url":"https://...","is_replay":false}
//! {"hook":"response","url":"https://...","status":200,"body":"{...}","is_replay":false}
//! ```
//!
//! and reads back one action per line, e.g. `{"action":"forward",...}`.
//! Malformed lines and interceptor failures produce
//! `{"action":"error","message":"..."}`; the host then lets the flow through.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, warn};

use super::interceptor::{
    InterceptedRequest, InterceptedResponse, Interceptor, RequestAction, ResponseAction,
};

/// One event from the proxy host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "hook", rename_all = "snake_case")]
pub enum HookEvent {
    Request(InterceptedRequest),
    Response(InterceptedResponse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum BridgeFailure {
    Error { message: String },
}

/// One reply line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
enum HookReply {
    Request(RequestAction),
    Response(ResponseAction),
    Failure(BridgeFailure),
}

/// Counters for a bridge session.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BridgeStats {
    pub events: usize,
    pub errors: usize,
}

/// Handle a single line, returning the JSON reply.
pub async fn handle_line(interceptor: &Interceptor, line: &str) -> String {
    let reply = match serde_json::from_str::<HookEvent>(line) {
        Ok(HookEvent::Request(request)) => match interceptor.on_request(&request).await {
            Ok(action) => HookReply::Request(action),
            Err(e) => failure(format!("request hook failed: {}", e)),
        },
        Ok(HookEvent::Response(response)) => match interceptor.on_response(&response).await {
            Ok(action) => HookReply::Response(action),
            Err(e) => failure(format!("response hook failed: {}", e)),
        },
        Err(e) => failure(format!("malformed event: {}", e)),
    };

    serde_json::to_string(&reply).unwrap_or_else(|e| {
        format!(
            r#"{{"action":"error","message":"failed to encode reply: {}"}}"#,
            e.to_string().replace('"', "'")
        )
    })
}

fn failure(message: String) -> HookReply {
    warn!(message = %message, "Hook event rejected");
    HookReply::Failure(BridgeFailure::Error { message })
}

/// Serve hook events from `reader` until end of input.
pub async fn run_bridge<R, W>(
    interceptor: &Interceptor,
    reader: R,
    mut writer: W,
) -> std::io::Result<BridgeStats>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut stats = BridgeStats::default();
    let mut lines = reader.lines();

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let reply = handle_line(interceptor, line).await;
        stats.events += 1;
        if reply.starts_with(r#"{"action":"error""#) {
            stats.errors += 1;
        }

        writer.write_all(reply.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
    }

    debug!(events = stats.events, errors = stats.errors, "Hook input closed");
    Ok(stats)
}
