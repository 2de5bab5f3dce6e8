//! Pluggable streaming LLM provider trait.
//!
//! Providers translate a [`CompletionRequest`] into a stream of
//! [`CompletionEvent`]s: text tokens as they arrive, assembled tool calls,
//! and a terminal `Done`. All transport concerns (HTTP, SSE decoding,
//! retries) live behind this boundary.

use crate::agent::message::{CompletionRequest, ToolCallRequest};
use crate::error::Result;
use async_trait::async_trait;
use futures_util::Stream;
use std::pin::Pin;

/// One event from a streaming completion.
#[derive(Debug, Clone)]
pub enum CompletionEvent {
    /// A partial-text token to forward immediately.
    Token(String),
    /// A fully assembled tool call (providers buffer argument deltas).
    ToolCall(ToolCallRequest),
    /// End of the completion. Always the final event of a stream.
    Done,
}

/// Boxed event stream returned by providers.
pub type EventStream = Pin<Box<dyn Stream<Item = Result<CompletionEvent>> + Send>>;

/// Streaming completion capability.
#[async_trait]
pub trait CompletionProvider: Send + Sync {
    /// Provider name for logs (e.g. `"openai"`).
    fn name(&self) -> &'static str;

    /// Start a streaming completion.
    ///
    /// # Errors
    ///
    /// Returns [`crate::Error::Provider`] when the request cannot be
    /// started; in-stream failures arrive as `Err` items.
    async fn complete_stream(&self, request: &CompletionRequest) -> Result<EventStream>;
}
