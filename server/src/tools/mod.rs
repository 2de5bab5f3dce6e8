//! Tool registry: named, schema-typed operations the agent may invoke.
//!
//! Every tool declares a JSON-schema input and is executed uniformly with
//! a 30-second timeout and wall-clock timing. Destructive board-wide
//! operations and "execute arbitrary tool by name" are intentionally not
//! registered for the agent.

mod code;
mod fs;
mod knowledge;
mod tasks;

pub use code::register_code_tools;
pub use fs::register_fs_tools;
pub use knowledge::register_knowledge_tools;
pub use tasks::register_task_tools;

use crate::error::{Error, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Per-call execution timeout.
pub const TOOL_TIMEOUT_SECS: u64 = 30;

// ---------------------------------------------------------------------------
// Tool trait and results
// ---------------------------------------------------------------------------

/// A named operation exposed to the agent.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique lowercase snake_case name.
    fn name(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// JSON Schema of the arguments object.
    fn input_schema(&self) -> Value;

    /// Run the tool. Output is an arbitrary JSON value; errors surface to
    /// the model as tool-result errors, never as crashes.
    async fn invoke(&self, args: Value) -> Result<Value>;
}

/// Descriptor in the shape the LLM function-calling protocol consumes.
#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
}

/// Outcome of one tool execution.
#[derive(Debug, Clone, Serialize)]
pub struct ToolResult {
    pub id: String,
    pub name: String,
    pub args: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub duration_ms: u64,
}

impl ToolResult {
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// The content handed back to the model as the tool turn.
    #[must_use]
    pub fn content_for_model(&self) -> String {
        match (&self.output, &self.error) {
            (_, Some(err)) => format!("Error: {err}"),
            (Some(out), None) => match out {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            (None, None) => String::new(),
        }
    }
}

// ---------------------------------------------------------------------------
// Registry
// ---------------------------------------------------------------------------

/// Immutable-after-startup mapping from tool name to implementation.
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tool. Rejects invalid names and duplicates.
    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<()> {
        let name = tool.name();
        if !is_valid_tool_name(name) {
            return Err(Error::Config(format!(
                "invalid tool name '{name}' (expected lowercase snake_case)"
            )));
        }
        if self.tools.contains_key(name) {
            return Err(Error::Config(format!("duplicate tool name '{name}'")));
        }
        self.tools.insert(name.to_string(), tool);
        Ok(())
    }

    /// All registered tool names, sorted.
    #[must_use]
    pub fn list(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.tools.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    /// Descriptors for the LLM function-calling protocol.
    #[must_use]
    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.tools
            .values()
            .map(|t| ToolDescriptor {
                name: t.name().to_string(),
                description: t.description().to_string(),
                input_schema: t.input_schema(),
            })
            .collect()
    }

    /// Execute a tool by name with timeout and timing. Unknown tools and
    /// failures come back as error results, not `Err`.
    pub async fn execute(&self, call_id: &str, name: &str, args: Value) -> ToolResult {
        let start = Instant::now();
        let outcome = match self.tools.get(name) {
            None => Err(Error::Tool {
                tool: name.to_string(),
                message: format!("unknown tool (available: {})", self.list().join(", ")),
            }),
            Some(tool) => {
                match tokio::time::timeout(
                    Duration::from_secs(TOOL_TIMEOUT_SECS),
                    tool.invoke(args.clone()),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(Error::Timeout {
                        what: format!("tool '{name}'"),
                        seconds: TOOL_TIMEOUT_SECS,
                    }),
                }
            }
        };

        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(tool = name, duration_ms = duration_ms, ok = outcome.is_ok(), "Tool executed");
        match outcome {
            Ok(output) => ToolResult {
                id: call_id.to_string(),
                name: name.to_string(),
                args,
                output: Some(output),
                error: None,
                duration_ms,
            },
            Err(e) => ToolResult {
                id: call_id.to_string(),
                name: name.to_string(),
                args,
                output: None,
                error: Some(e.to_string()),
                duration_ms,
            },
        }
    }
}

fn is_valid_tool_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().next().is_some_and(|c| c.is_ascii_lowercase())
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

// ---------------------------------------------------------------------------
// Argument helpers shared by tool implementations
// ---------------------------------------------------------------------------

pub(crate) fn require_str<'a>(args: &'a Value, key: &str, tool: &str) -> Result<&'a str> {
    args.get(key).and_then(Value::as_str).ok_or_else(|| Error::Tool {
        tool: tool.to_string(),
        message: format!("missing required string argument '{key}'"),
    })
}

pub(crate) fn optional_str<'a>(args: &'a Value, key: &str) -> Option<&'a str> {
    args.get(key).and_then(Value::as_str)
}

pub(crate) fn optional_u64(args: &Value, key: &str) -> Option<u64> {
    args.get(key).and_then(Value::as_u64)
}
