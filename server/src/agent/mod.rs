//! Agent runtime: provider-agnostic LLM messaging, streaming completion
//! providers, and the tool-calling loop that drives a conversation turn.

pub mod message;
pub mod openai;
pub mod provider;
pub mod runtime;

pub use message::{AgentMessage, CompletionRequest, Role, ToolCallRequest};
pub use provider::{CompletionEvent, CompletionProvider, EventStream};
pub use runtime::{AgentEvent, AgentRuntime, RuntimeConfig};
