//! Stream server: one WebSocket connection per chat session carrying the
//! duplex frame protocol.
//!
//! The client sends `user_message` frames; the server answers each with
//! exactly one turn's worth of frames: `token`* and interleaved
//! `tool_call`/`tool_result` pairs, terminated by a single `done` (or an
//! `error` frame). A `tool_call` always precedes its `tool_result`.
//! Closing the socket cancels the in-flight turn; reconnection restarts
//! the session with no frame replay.

use crate::agent::{AgentEvent, AgentRuntime};
use crate::error::Error;
use crate::types::CancelToken;
use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::response::Response;
use axum::routing::get;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Owner identity applied to implicitly created sessions. Real identity
/// extraction belongs to the authentication middleware in front of this
/// server.
const LOCAL_USER: &str = "local";
const LOCAL_COMPANY: &str = "local";

/// Title length cap for implicitly created sessions.
const TITLE_MAX_CHARS: usize = 80;

// ---------------------------------------------------------------------------
// Wire frames
// ---------------------------------------------------------------------------

/// Typed duplex frames exchanged over the session socket.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Frame {
    /// client → server: the next user turn.
    UserMessage { content: String },
    /// server → client: partial assistant text.
    Token { content: String },
    /// server → client: the model invoked a tool.
    ToolCall { id: String, tool: String, args: Value },
    /// server → client: the tool finished (or failed).
    ToolResult {
        id: String,
        tool: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        output: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        #[serde(rename = "durationMs")]
        duration_ms: u64,
    },
    /// server → client: end of the assistant turn.
    Done,
    /// server → client: turn-level failure.
    Error { message: String },
}

impl From<AgentEvent> for Frame {
    fn from(event: AgentEvent) -> Self {
        match event {
            AgentEvent::Token(content) => Self::Token { content },
            AgentEvent::ToolCall { id, tool, args } => Self::ToolCall { id, tool, args },
            AgentEvent::ToolResult(r) => Self::ToolResult {
                id: r.id,
                tool: r.name,
                output: r.output,
                error: r.error,
                duration_ms: r.duration_ms,
            },
            AgentEvent::Done => Self::Done,
        }
    }
}

/// Derive a session title from the first user message.
#[must_use]
pub fn derive_title(content: &str) -> String {
    let line = content.lines().next().unwrap_or("").trim();
    if line.is_empty() {
        return "New session".to_string();
    }
    line.chars().take(TITLE_MAX_CHARS).collect()
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

/// Shared state for the stream routes.
#[derive(Clone)]
pub struct StreamState {
    pub runtime: Arc<AgentRuntime>,
}

/// Build the stream-server routes: a health probe and the per-session
/// WebSocket endpoint.
pub fn routes(state: StreamState) -> Router {
    Router::new()
        .route("/healthz", get(|| async { "ok" }))
        .route("/ws/{session_id}", get(ws_upgrade))
        .with_state(state)
}

async fn ws_upgrade(
    Path(session_id): Path<String>,
    State(state): State<StreamState>,
    ws: WebSocketUpgrade,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, session_id, state))
}

// ---------------------------------------------------------------------------
// Connection handling
// ---------------------------------------------------------------------------

async fn handle_socket(socket: WebSocket, session_id: String, state: StreamState) {
    info!(session = session_id.as_str(), "Stream connected");
    let (mut sink, mut inbound) = socket.split();

    while let Some(incoming) = inbound.next().await {
        let message = match incoming {
            Ok(m) => m,
            Err(e) => {
                debug!(session = session_id.as_str(), error = %e, "Socket read failed");
                break;
            }
        };
        let text = match message {
            Message::Text(text) => text,
            Message::Close(_) => break,
            // Pings are answered by axum; binary frames are not part of
            // the protocol.
            _ => continue,
        };

        let frame: Frame = match serde_json::from_str(&text) {
            Ok(f) => f,
            Err(e) => {
                let _ = send_frame(&mut sink, &Frame::Error {
                    message: format!("malformed frame: {e}"),
                })
                .await;
                continue;
            }
        };
        let Frame::UserMessage { content } = frame else {
            let _ = send_frame(&mut sink, &Frame::Error {
                message: "expected a user_message frame".to_string(),
            })
            .await;
            continue;
        };

        if let Err(e) = state
            .runtime
            .store()
            .ensure_session(&session_id, LOCAL_USER, LOCAL_COMPANY, &derive_title(&content))
            .await
        {
            let _ = send_frame(&mut sink, &Frame::Error { message: e.to_string() }).await;
            continue;
        }

        let open = run_turn_on_socket(&state, &session_id, &content, &mut sink, &mut inbound).await;
        if !open {
            break;
        }
    }
    info!(session = session_id.as_str(), "Stream closed");
}

/// Drive one assistant turn, pumping agent events to the socket while
/// watching for the client closing mid-turn. Returns false when the
/// socket is gone.
async fn run_turn_on_socket(
    state: &StreamState,
    session_id: &str,
    content: &str,
    sink: &mut SplitSink<WebSocket, Message>,
    inbound: &mut SplitStream<WebSocket>,
) -> bool {
    let (events_tx, mut events_rx) = mpsc::channel::<AgentEvent>(256);
    let cancel = CancelToken::new();

    let runtime = Arc::clone(&state.runtime);
    let turn_session = session_id.to_string();
    let turn_content = content.to_string();
    let turn_cancel = cancel.clone();
    let mut turn = tokio::spawn(async move {
        runtime
            .run_turn(&turn_session, &turn_content, &events_tx, &turn_cancel)
            .await
    });

    let mut socket_open = true;
    let turn_result = loop {
        tokio::select! {
            event = events_rx.recv() => {
                match event {
                    Some(event) => {
                        if send_frame(sink, &Frame::from(event)).await.is_err() {
                            socket_open = false;
                            cancel.cancel();
                        }
                    }
                    // Sender dropped: the turn task is done (or aborted).
                    None => break (&mut turn).await,
                }
            }
            incoming = inbound.next(), if socket_open => {
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => {
                        debug!(session = session_id, "Client left mid-turn, cancelling");
                        socket_open = false;
                        cancel.cancel();
                    }
                    Some(Ok(_)) => {
                        // One turn per user_message: concurrent input is
                        // refused rather than queued.
                        let _ = send_frame(sink, &Frame::Error {
                            message: "a turn is already in progress".to_string(),
                        })
                        .await;
                    }
                }
            }
        }
    };

    match turn_result {
        Ok(Ok(())) => {}
        Ok(Err(Error::Cancelled)) => {
            debug!(session = session_id, "Turn cancelled");
        }
        Ok(Err(e)) => {
            warn!(session = session_id, error = %e, "Turn failed");
            if socket_open {
                let _ = send_frame(sink, &Frame::Error { message: e.to_string() }).await;
            }
        }
        Err(join_err) => {
            warn!(session = session_id, error = %join_err, "Turn task panicked");
            if socket_open {
                let _ = send_frame(sink, &Frame::Error {
                    message: "internal error while running the turn".to_string(),
                })
                .await;
            }
        }
    }
    socket_open
}

async fn send_frame(
    sink: &mut SplitSink<WebSocket, Message>,
    frame: &Frame,
) -> std::result::Result<(), axum::Error> {
    let text = serde_json::to_string(frame).unwrap_or_default();
    sink.send(Message::Text(text.into())).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolResult;

    #[test]
    fn frames_use_snake_case_tags() {
        let frame = Frame::Token { content: "hi".into() };
        let json = serde_json::to_string(&frame).unwrap();
        assert!(json.contains(r#""type":"token""#));

        let parsed: Frame =
            serde_json::from_str(r#"{"type":"user_message","content":"hello"}"#).unwrap();
        assert!(matches!(parsed, Frame::UserMessage { ref content } if content == "hello"));

        let done = serde_json::to_string(&Frame::Done).unwrap();
        assert_eq!(done, r#"{"type":"done"}"#);
    }

    #[test]
    fn tool_result_frame_omits_empty_sides() {
        let ok = Frame::ToolResult {
            id: "c1".into(),
            tool: "search_code".into(),
            output: Some(serde_json::json!({ "count": 0 })),
            error: None,
            duration_ms: 12,
        };
        let json = serde_json::to_string(&ok).unwrap();
        assert!(json.contains("output"));
        assert!(!json.contains("error"));
    }

    #[test]
    fn agent_events_map_onto_frames() {
        let frame = Frame::from(AgentEvent::ToolResult(ToolResult {
            id: "c1".into(),
            name: "bash".into(),
            args: serde_json::json!({}),
            output: None,
            error: Some("boom".into()),
            duration_ms: 5,
        }));
        match frame {
            Frame::ToolResult { id, tool, error, .. } => {
                assert_eq!(id, "c1");
                assert_eq!(tool, "bash");
                assert_eq!(error.as_deref(), Some("boom"));
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn titles_derive_from_first_line() {
        assert_eq!(derive_title("list the files in /tmp"), "list the files in /tmp");
        assert_eq!(derive_title("first line\nsecond"), "first line");
        assert_eq!(derive_title("   \n\n"), "New session");
        let long = "x".repeat(200);
        assert_eq!(derive_title(&long).chars().count(), 80);
    }
}
