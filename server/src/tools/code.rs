//! Code index tools: search, folder add/remove, rescans, and status.

use super::{Tool, optional_str, optional_u64, require_str};
use crate::error::{Error, Result};
use crate::indexer::Indexer;
use crate::search::SearchEngine;
use crate::types::{CancelToken, RetrieveMode, SearchRequest};
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Register the code/index tool family.
pub fn register_code_tools(
    registry: &mut super::ToolRegistry,
    indexer: Arc<Indexer>,
    search: Arc<SearchEngine>,
) -> Result<()> {
    registry.register(Arc::new(SearchCodeTool { search }))?;
    registry.register(Arc::new(AddFolderTool { indexer: Arc::clone(&indexer) }))?;
    registry.register(Arc::new(RemoveFolderTool { indexer: Arc::clone(&indexer) }))?;
    registry.register(Arc::new(ScanFolderTool { indexer: Arc::clone(&indexer) }))?;
    registry.register(Arc::new(IndexStatusTool { indexer }))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// search_code
// ---------------------------------------------------------------------------

struct SearchCodeTool {
    search: Arc<SearchEngine>,
}

#[async_trait]
impl Tool for SearchCodeTool {
    fn name(&self) -> &'static str {
        "search_code"
    }

    fn description(&self) -> &'static str {
        "Semantic search over the indexed codebases. Returns ranked snippets with file paths \
         and line ranges. Filter by folderPath or fileTypes; set retrieve='full' to get whole \
         files instead of chunks."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "query": { "type": "string", "description": "Natural-language or code query" },
                "limit": { "type": "integer", "description": "Max results (default 10, max 50)" },
                "folderPath": { "type": "string", "description": "Restrict to one indexed folder" },
                "fileTypes": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Extensions or language names, e.g. ['go','ts']"
                },
                "minScore": { "type": "number", "description": "Drop hits scoring below this" },
                "retrieve": { "type": "string", "enum": ["chunk", "full"] }
            },
            "required": ["query"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let request = SearchRequest {
            query: require_str(&args, "query", self.name())?.to_string(),
            limit: optional_u64(&args, "limit").map(|n| n as u32),
            folder_path: optional_str(&args, "folderPath").map(str::to_string),
            file_types: args.get("fileTypes").and_then(Value::as_array).map(|a| {
                a.iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            }),
            min_score: args
                .get("minScore")
                .and_then(Value::as_f64)
                .map(|v| v as f32),
            retrieve: match optional_str(&args, "retrieve") {
                Some("full") => RetrieveMode::Full,
                _ => RetrieveMode::Chunk,
            },
        };
        let hits = self.search.search(&request).await?;
        let count = hits.len();
        Ok(json!({ "results": hits, "count": count }))
    }
}

// ---------------------------------------------------------------------------
// add_folder / remove_folder / scan_folder
// ---------------------------------------------------------------------------

struct AddFolderTool {
    indexer: Arc<Indexer>,
}

#[async_trait]
impl Tool for AddFolderTool {
    fn name(&self) -> &'static str {
        "add_folder"
    }

    fn description(&self) -> &'static str {
        "Register a folder for code indexing. Accepts host or container paths; runs an initial \
         scan so the folder is immediately searchable."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute folder path" },
                "description": { "type": "string" }
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let path = require_str(&args, "path", self.name())?;
        let description = optional_str(&args, "description");
        let folder = self.indexer.add_folder(path, description).await?;
        let counters = self
            .indexer
            .scan_folder(&folder.id, &CancelToken::new())
            .await?;
        Ok(json!({ "folder": folder, "scan": counters }))
    }
}

struct RemoveFolderTool {
    indexer: Arc<Indexer>,
}

#[async_trait]
impl Tool for RemoveFolderTool {
    fn name(&self) -> &'static str {
        "remove_folder"
    }

    fn description(&self) -> &'static str {
        "Remove an indexed folder and every file, chunk, and vector derived from it."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Folder path as originally added" }
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let path = require_str(&args, "path", self.name())?;
        let canonical = self.indexer.mapper().to_container(path);
        let folder = self
            .indexer
            .store()
            .folder_by_path(&canonical)
            .await?
            .ok_or_else(|| Error::NotFound(format!("folder '{canonical}'")))?;
        self.indexer.remove_folder(&folder.id).await?;
        Ok(json!({ "removed": folder.path }))
    }
}

struct ScanFolderTool {
    indexer: Arc<Indexer>,
}

#[async_trait]
impl Tool for ScanFolderTool {
    fn name(&self) -> &'static str {
        "scan_folder"
    }

    fn description(&self) -> &'static str {
        "Re-scan an indexed folder: new and changed files are re-embedded, deleted files drop \
         out of the index, unchanged files are skipped by content hash."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Folder path as originally added" }
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let path = require_str(&args, "path", self.name())?;
        let canonical = self.indexer.mapper().to_container(path);
        let folder = self
            .indexer
            .store()
            .folder_by_path(&canonical)
            .await?
            .ok_or_else(|| Error::NotFound(format!("folder '{canonical}'")))?;
        let counters = self
            .indexer
            .scan_folder(&folder.id, &CancelToken::new())
            .await?;
        Ok(json!({ "folder": folder.path, "scan": counters }))
    }
}

// ---------------------------------------------------------------------------
// index_status
// ---------------------------------------------------------------------------

struct IndexStatusTool {
    indexer: Arc<Indexer>,
}

#[async_trait]
impl Tool for IndexStatusTool {
    fn name(&self) -> &'static str {
        "index_status"
    }

    fn description(&self) -> &'static str {
        "Show indexed folders (status, file counts, last scan) and store-wide record counts."
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn invoke(&self, _args: Value) -> Result<Value> {
        let folders = self.indexer.store().list_folders().await?;
        let counts = self.indexer.store().counts().await?;
        Ok(json!({ "folders": folders, "counts": counts }))
    }
}
