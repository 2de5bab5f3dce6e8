//! Core data model shared across the indexing pipeline, search engine,
//! and agent runtime. These records mirror the metadata-store rows and the
//! vector-store payloads; keep field changes in sync with `store::schema`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Generate a fresh record id.
#[must_use]
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Deterministic vector point id for a chunk. The literal `{fileId}:{chunkIndex}`
/// form makes deletion-by-file a payload filter on `fileId` and guarantees
/// re-upserts land on the same point.
#[must_use]
pub fn point_id(file_id: &str, chunk_index: u32) -> String {
    format!("{file_id}:{chunk_index}")
}

// ---------------------------------------------------------------------------
// Indexed folders and files
// ---------------------------------------------------------------------------

/// Lifecycle state of an indexed folder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FolderStatus {
    Active,
    Scanning,
    Error,
}

impl FolderStatus {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Scanning => "scanning",
            Self::Error => "error",
        }
    }

    /// Parse a stored status string; unknown values map to `Error`.
    #[must_use]
    pub fn parse(s: &str) -> Self {
        match s {
            "active" => Self::Active,
            "scanning" => Self::Scanning,
            _ => Self::Error,
        }
    }
}

/// A folder registered for indexing. `path` is always stored in the
/// canonical (container) namespace.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedFolder {
    pub id: String,
    pub path: String,
    pub description: Option<String>,
    pub status: FolderStatus,
    pub error: Option<String>,
    pub file_count: u64,
    pub added_at: DateTime<Utc>,
    pub last_scanned_at: Option<DateTime<Utc>>,
}

/// One indexed file. Exactly one record exists per (folder, path).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexedFile {
    pub id: String,
    pub folder_id: String,
    pub path: String,
    pub relative_path: String,
    pub language: String,
    /// Hex-encoded SHA-256 of the file contents.
    pub content_hash: String,
    pub size_bytes: u64,
    pub line_count: u32,
    pub chunk_count: u32,
    pub indexed_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A contiguous slice of at most 200 lines of a file. Indices run 0..N-1
/// with no gaps; line ranges are 1-based inclusive and cover the file in
/// order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub file_id: String,
    pub chunk_index: u32,
    pub content: String,
    pub start_line: u32,
    pub end_line: u32,
}

/// Counters returned by a full folder scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanCounters {
    pub files_indexed: u64,
    pub files_updated: u64,
    pub files_skipped: u64,
    pub total_files: u64,
}

// ---------------------------------------------------------------------------
// Search
// ---------------------------------------------------------------------------

/// How much content to return per hit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetrieveMode {
    #[default]
    Chunk,
    Full,
}

/// A semantic search request.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchRequest {
    pub query: String,
    #[serde(default)]
    pub limit: Option<u32>,
    #[serde(default)]
    pub folder_path: Option<String>,
    #[serde(default)]
    pub file_types: Option<Vec<String>>,
    #[serde(default)]
    pub min_score: Option<f32>,
    #[serde(default)]
    pub retrieve: RetrieveMode,
}

/// A ranked search hit joined across the vector and metadata stores.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SearchHit {
    pub file_id: String,
    pub folder_id: String,
    pub file_path: String,
    pub relative_path: String,
    pub language: String,
    pub chunk_index: u32,
    pub start_line: u32,
    pub end_line: u32,
    pub content: String,
    pub score: f32,
    pub folder_path: String,
    pub full_file_retrieved: bool,
}

// ---------------------------------------------------------------------------
// Chat sessions and messages
// ---------------------------------------------------------------------------

/// A persisted conversation. Sessions form a forest via `parent_session_id`;
/// only the parent id is stored, never a back-link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatSession {
    pub id: String,
    pub user_id: String,
    pub company_id: String,
    pub title: String,
    pub parent_session_id: Option<String>,
    pub subagent_id: Option<String>,
    pub task_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Role of a persisted chat message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    System,
    ToolCall,
    ToolResult,
}

impl MessageRole {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
            Self::ToolCall => "tool_call",
            Self::ToolResult => "tool_result",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(Self::User),
            "assistant" => Some(Self::Assistant),
            "system" => Some(Self::System),
            "tool_call" => Some(Self::ToolCall),
            "tool_result" => Some(Self::ToolResult),
            _ => None,
        }
    }
}

/// A persisted message. Tool-call and tool-result payloads are carried
/// inline; every tool_result references a tool_call id that appears
/// earlier in the same session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: String,
    pub session_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_args: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_output: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// System prompts and subagents
// ---------------------------------------------------------------------------

/// One version of a user's system prompt. At most one version per
/// (user, company) is active; a single immutable global default exists.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptVersion {
    pub id: String,
    pub user_id: String,
    pub company_id: String,
    pub version: u32,
    pub prompt: String,
    pub description: Option<String>,
    pub is_active: bool,
    pub is_default: bool,
    pub created_at: DateTime<Utc>,
}

/// A named subagent with its own system prompt. Unique (user, name).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subagent {
    pub id: String,
    pub user_id: String,
    pub company_id: String,
    pub name: String,
    pub description: Option<String>,
    pub system_prompt: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Task board
// ---------------------------------------------------------------------------

/// Who a task is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskKind {
    Human,
    Agent,
}

impl TaskKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Human => "human",
            Self::Agent => "agent",
        }
    }

    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "human" => Some(Self::Human),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

/// A task-board entry with optional prompt notes accumulated by the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRecord {
    pub id: String,
    pub kind: TaskKind,
    pub title: String,
    pub description: Option<String>,
    pub status: String,
    pub assignee: Option<String>,
    pub prompt_notes: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A checklist item attached to a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TodoItem {
    pub id: String,
    pub task_id: String,
    pub description: String,
    pub status: String,
    pub position: u32,
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// Cooperative cancellation handle passed to every long-running operation.
/// Cloning shares the same signal.
#[derive(Clone)]
pub struct CancelToken {
    tx: std::sync::Arc<tokio::sync::watch::Sender<bool>>,
}

impl CancelToken {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = tokio::sync::watch::channel(false);
        Self { tx: std::sync::Arc::new(tx) }
    }

    /// Signal cancellation; wakes every pending [`CancelToken::cancelled`].
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn point_ids_are_deterministic() {
        assert_eq!(point_id("f1", 0), "f1:0");
        assert_eq!(point_id("f1", 12), "f1:12");
        assert_eq!(point_id("f1", 12), point_id("f1", 12));
    }

    #[test]
    fn folder_status_round_trip() {
        for s in [FolderStatus::Active, FolderStatus::Scanning, FolderStatus::Error] {
            assert_eq!(FolderStatus::parse(s.as_str()), s);
        }
        assert_eq!(FolderStatus::parse("garbage"), FolderStatus::Error);
    }

    #[test]
    fn message_role_round_trip() {
        for r in [
            MessageRole::User,
            MessageRole::Assistant,
            MessageRole::System,
            MessageRole::ToolCall,
            MessageRole::ToolResult,
        ] {
            assert_eq!(MessageRole::parse(r.as_str()), Some(r));
        }
        assert_eq!(MessageRole::parse("other"), None);
    }

    #[test]
    fn retrieve_mode_serde() {
        let req: SearchRequest =
            serde_json::from_str(r#"{"query":"jwt","retrieve":"full"}"#).unwrap();
        assert_eq!(req.retrieve, RetrieveMode::Full);
        let req: SearchRequest = serde_json::from_str(r#"{"query":"jwt"}"#).unwrap();
        assert_eq!(req.retrieve, RetrieveMode::Chunk);
    }
}
