//! The agent loop: request a streaming completion, forward tokens, route
//! tool calls through the registry, feed results back, repeat until the
//! model answers without tools.
//!
//! A rolling circuit breaker watches for the model retrying one identical
//! call; after three consecutive identical invocations the next one is
//! refused with a synthetic error result so a confused model cannot spin
//! forever. Cancellation is checked at every suspension point and partial
//! output is persisted as a terminated message.

use crate::agent::message::{self, AgentMessage, CompletionRequest, ToolCallRequest};
use crate::agent::provider::{CompletionEvent, CompletionProvider};
use crate::error::{Error, Result};
use crate::store::MetaStore;
use crate::tools::{ToolRegistry, ToolResult};
use crate::types::{CancelToken, ChatMessage, ChatSession, MessageRole, new_id};
use chrono::Utc;
use futures_util::StreamExt;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

// ---------------------------------------------------------------------------
// Configuration and events
// ---------------------------------------------------------------------------

/// Tunables for the agent loop.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Upper bound on model→tools round-trips per turn.
    pub max_iterations: usize,
    /// How many prior session messages seed the working conversation.
    pub history_limit: u32,
    /// Per-LLM-request deadline (connect plus streaming read).
    pub llm_timeout: Duration,
    /// Consecutive identical calls allowed before the breaker opens.
    pub breaker_threshold: u32,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            max_iterations: 12,
            history_limit: 40,
            llm_timeout: Duration::from_secs(120),
            breaker_threshold: 3,
        }
    }
}

/// Events emitted while a turn runs; the stream server maps these onto
/// wire frames one-to-one.
#[derive(Debug, Clone)]
pub enum AgentEvent {
    Token(String),
    ToolCall {
        id: String,
        tool: String,
        args: Value,
    },
    ToolResult(ToolResult),
    Done,
}

// ---------------------------------------------------------------------------
// Circuit breaker
// ---------------------------------------------------------------------------

/// Tracks the most recent tool-call key. Repeating one key `threshold`
/// times arms the breaker; further identical calls are refused until a
/// distinct call arrives.
struct CircuitBreaker {
    threshold: u32,
    last_key: Option<String>,
    repeats: u32,
}

impl CircuitBreaker {
    fn new(threshold: u32) -> Self {
        Self { threshold, last_key: None, repeats: 0 }
    }

    /// Returns false when the call must be suppressed.
    fn admit(&mut self, key: &str) -> bool {
        if self.last_key.as_deref() == Some(key) {
            if self.repeats >= self.threshold {
                return false;
            }
            self.repeats += 1;
        } else {
            self.last_key = Some(key.to_string());
            self.repeats = 1;
        }
        true
    }
}

/// Canonical form of tool arguments: parsed and re-serialized so key
/// order cannot defeat the breaker. Numeric formatting is left to the
/// JSON round-trip; unparseable arguments fall back to the raw string.
#[must_use]
pub fn canonical_args(raw: &str) -> String {
    match serde_json::from_str::<Value>(raw) {
        Ok(value) => value.to_string(),
        Err(_) => raw.to_string(),
    }
}

// ---------------------------------------------------------------------------
// Runtime
// ---------------------------------------------------------------------------

/// Drives conversation turns for sessions. One instance serves every
/// session; per-turn state lives on the stack of [`AgentRuntime::run_turn`].
pub struct AgentRuntime {
    store: Arc<MetaStore>,
    registry: Arc<ToolRegistry>,
    provider: Arc<dyn CompletionProvider>,
    config: RuntimeConfig,
}

impl AgentRuntime {
    #[must_use]
    pub fn new(
        store: Arc<MetaStore>,
        registry: Arc<ToolRegistry>,
        provider: Arc<dyn CompletionProvider>,
        config: RuntimeConfig,
    ) -> Self {
        Self { store, registry, provider, config }
    }

    #[must_use]
    pub fn store(&self) -> &Arc<MetaStore> {
        &self.store
    }

    /// Run one assistant turn for a session. Tokens and tool events are
    /// pushed to `events` in strict temporal order; `Done` is the final
    /// event on success. On failure partial output is persisted and the
    /// error propagates (the caller turns it into an error frame).
    pub async fn run_turn(
        &self,
        session_id: &str,
        user_text: &str,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancelToken,
    ) -> Result<()> {
        let session = self
            .store
            .session(session_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("session {session_id}")))?;

        let system_prompt = self.resolve_system_prompt(&session).await?;
        let history = self
            .store
            .recent_messages(session_id, self.config.history_limit)
            .await?;

        self.persist_user(session_id, user_text).await?;

        let mut working: Vec<AgentMessage> = Vec::with_capacity(history.len() + 2);
        working.push(message::system(&system_prompt));
        working.extend(to_agent_messages(&history));
        working.push(message::user(user_text));

        let mut breaker = CircuitBreaker::new(self.config.breaker_threshold);
        let mut full_text = String::new();

        for iteration in 0..self.config.max_iterations {
            let outcome = self
                .one_completion(&working, events, cancel)
                .await;
            let (round_text, tool_calls) = match outcome {
                Ok(v) => v,
                Err(e) => {
                    self.persist_assistant(session_id, &full_text, Some(&e.to_string()))
                        .await?;
                    return Err(e);
                }
            };

            if !round_text.is_empty() {
                if !full_text.is_empty() {
                    full_text.push('\n');
                }
                full_text.push_str(&round_text);
            }

            if tool_calls.is_empty() {
                self.persist_assistant(session_id, &full_text, None).await?;
                send_event(events, AgentEvent::Done).await?;
                debug!(session = session_id, iterations = iteration + 1, "Turn complete");
                return Ok(());
            }

            working.push(message::assistant(&round_text, tool_calls.clone()));
            for call in tool_calls {
                let result = self
                    .dispatch_tool(session_id, &call, &mut breaker, events, cancel)
                    .await?;
                if let Some(guidance) = suppression_guidance(&result) {
                    send_event(events, AgentEvent::Token(guidance.clone())).await?;
                    full_text.push_str(&guidance);
                }
                working.push(message::tool_result(&call.id, &result.content_for_model()));
            }
        }

        let err = Error::Provider(format!(
            "turn abandoned after {} tool iterations",
            self.config.max_iterations
        ));
        warn!(session = session_id, "Agent loop hit the iteration ceiling");
        self.persist_assistant(session_id, &full_text, Some(&err.to_string()))
            .await?;
        Err(err)
    }

    /// Stream one completion, forwarding tokens as they arrive. Returns
    /// the round's text and any assembled tool calls.
    async fn one_completion(
        &self,
        working: &[AgentMessage],
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancelToken,
    ) -> Result<(String, Vec<ToolCallRequest>)> {
        let request = CompletionRequest {
            messages: working.to_vec(),
            tools: self.registry.descriptors(),
        };
        let deadline = Instant::now() + self.config.llm_timeout;
        let timeout_err = || Error::Timeout {
            what: "LLM request".to_string(),
            seconds: self.config.llm_timeout.as_secs(),
        };

        let mut stream = tokio::select! {
            started = tokio::time::timeout_at(deadline, self.provider.complete_stream(&request)) => {
                started.map_err(|_| timeout_err())??
            }
            () = cancel.cancelled() => return Err(Error::Cancelled),
        };

        let mut round_text = String::new();
        let mut tool_calls: Vec<ToolCallRequest> = Vec::new();
        loop {
            let next = tokio::select! {
                item = tokio::time::timeout_at(deadline, stream.next()) => {
                    item.map_err(|_| timeout_err())?
                }
                () = cancel.cancelled() => return Err(Error::Cancelled),
            };
            match next {
                None | Some(Ok(CompletionEvent::Done)) => break,
                Some(Ok(CompletionEvent::Token(text))) => {
                    round_text.push_str(&text);
                    send_event(events, AgentEvent::Token(text)).await?;
                }
                Some(Ok(CompletionEvent::ToolCall(call))) => tool_calls.push(call),
                Some(Err(e)) => return Err(e),
            }
        }
        Ok((round_text, tool_calls))
    }

    /// Route one tool call through the breaker and registry, emit its
    /// events, and persist both sides of the exchange.
    async fn dispatch_tool(
        &self,
        session_id: &str,
        call: &ToolCallRequest,
        breaker: &mut CircuitBreaker,
        events: &mpsc::Sender<AgentEvent>,
        cancel: &CancelToken,
    ) -> Result<ToolResult> {
        let args: Value = serde_json::from_str(&call.arguments)
            .unwrap_or(Value::Object(serde_json::Map::new()));
        let key = format!("{}:{}", call.name, canonical_args(&call.arguments));

        send_event(
            events,
            AgentEvent::ToolCall {
                id: call.id.clone(),
                tool: call.name.clone(),
                args: args.clone(),
            },
        )
        .await?;
        self.persist_tool_call(session_id, call, &args).await?;

        let result = if breaker.admit(&key) {
            if cancel.is_cancelled() {
                return Err(Error::Cancelled);
            }
            self.registry.execute(&call.id, &call.name, args).await
        } else {
            info!(tool = call.name.as_str(), "Circuit breaker suppressed repeated call");
            ToolResult {
                id: call.id.clone(),
                name: call.name.clone(),
                args,
                output: None,
                error: Some(format!(
                    "{}",
                    Error::LoopDetected {
                        tool: call.name.clone(),
                        count: self.config.breaker_threshold,
                    }
                )),
                duration_ms: 0,
            }
        };

        send_event(events, AgentEvent::ToolResult(result.clone())).await?;
        self.persist_tool_result(session_id, &result).await?;
        Ok(result)
    }

    async fn resolve_system_prompt(&self, session: &ChatSession) -> Result<String> {
        if let Some(subagent_id) = &session.subagent_id {
            if let Some(subagent) = self.store.subagent(subagent_id).await? {
                return Ok(subagent.system_prompt);
            }
            warn!(subagent = subagent_id.as_str(), "Assigned subagent missing, using prompt version");
        }
        let prompt = self
            .store
            .active_prompt(&session.user_id, &session.company_id)
            .await?;
        Ok(prompt.prompt)
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    async fn persist_user(&self, session_id: &str, content: &str) -> Result<()> {
        self.store
            .append_message(&ChatMessage {
                id: new_id(),
                session_id: session_id.to_string(),
                role: MessageRole::User,
                content: content.to_string(),
                tool_name: None,
                tool_args: None,
                tool_call_id: None,
                tool_output: None,
                tool_error: None,
                duration_ms: None,
                created_at: Utc::now(),
            })
            .await
    }

    /// Persist the assistant turn. `error` marks terminated or failed
    /// turns while keeping the partial text.
    async fn persist_assistant(
        &self,
        session_id: &str,
        content: &str,
        error: Option<&str>,
    ) -> Result<()> {
        self.store
            .append_message(&ChatMessage {
                id: new_id(),
                session_id: session_id.to_string(),
                role: MessageRole::Assistant,
                content: content.to_string(),
                tool_name: None,
                tool_args: None,
                tool_call_id: None,
                tool_output: None,
                tool_error: error.map(str::to_string),
                duration_ms: None,
                created_at: Utc::now(),
            })
            .await
    }

    async fn persist_tool_call(
        &self,
        session_id: &str,
        call: &ToolCallRequest,
        args: &Value,
    ) -> Result<()> {
        self.store
            .append_message(&ChatMessage {
                id: new_id(),
                session_id: session_id.to_string(),
                role: MessageRole::ToolCall,
                content: String::new(),
                tool_name: Some(call.name.clone()),
                tool_args: Some(args.clone()),
                tool_call_id: Some(call.id.clone()),
                tool_output: None,
                tool_error: None,
                duration_ms: None,
                created_at: Utc::now(),
            })
            .await
    }

    async fn persist_tool_result(&self, session_id: &str, result: &ToolResult) -> Result<()> {
        self.store
            .append_message(&ChatMessage {
                id: new_id(),
                session_id: session_id.to_string(),
                role: MessageRole::ToolResult,
                content: String::new(),
                tool_name: Some(result.name.clone()),
                tool_args: None,
                tool_call_id: Some(result.id.clone()),
                tool_output: result.output.as_ref().map(std::string::ToString::to_string),
                tool_error: result.error.clone(),
                duration_ms: Some(result.duration_ms),
                created_at: Utc::now(),
            })
            .await
    }
}

/// Guidance text pushed into the token stream when the breaker fires.
fn suppression_guidance(result: &ToolResult) -> Option<String> {
    result.error.as_ref().and_then(|err| {
        err.contains("refusing further retries").then(|| {
            format!(
                "\n[The '{}' tool keeps being called with identical arguments and is now \
                 suppressed. Change the arguments or try a different tool.]\n",
                result.name
            )
        })
    })
}

/// Sends an event; a dropped receiver means the client went away, which
/// cancels the turn.
async fn send_event(events: &mpsc::Sender<AgentEvent>, event: AgentEvent) -> Result<()> {
    events.send(event).await.map_err(|_| Error::Cancelled)
}

/// Map persisted session messages into the provider conversation shape.
fn to_agent_messages(history: &[ChatMessage]) -> Vec<AgentMessage> {
    let mut out = Vec::with_capacity(history.len());
    for msg in history {
        match msg.role {
            MessageRole::User => out.push(message::user(&msg.content)),
            MessageRole::Assistant => out.push(message::assistant(&msg.content, Vec::new())),
            // The live system prompt is prepended fresh each turn.
            MessageRole::System => {}
            MessageRole::ToolCall => {
                let call = ToolCallRequest {
                    id: msg.tool_call_id.clone().unwrap_or_default(),
                    name: msg.tool_name.clone().unwrap_or_default(),
                    arguments: msg
                        .tool_args
                        .as_ref()
                        .map_or_else(|| "{}".to_string(), std::string::ToString::to_string),
                };
                out.push(message::assistant("", vec![call]));
            }
            MessageRole::ToolResult => {
                let content = msg
                    .tool_error
                    .as_ref()
                    .map(|e| format!("Error: {e}"))
                    .or_else(|| msg.tool_output.clone())
                    .unwrap_or_default();
                out.push(message::tool_result(
                    msg.tool_call_id.as_deref().unwrap_or_default(),
                    &content,
                ));
            }
        }
    }
    out
}
