//! Filesystem tools: read, write, list, patch, and shell execution.
//!
//! Paths are validated against the path mapper so the agent can only touch
//! mapped volumes when mappings are configured.

use super::{Tool, optional_u64, require_str};
use crate::error::{Error, Result};
use crate::pathmap::PathMapper;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::path::Path;
use std::sync::Arc;

/// Cap on file content returned to the model.
const MAX_READ_BYTES: usize = 256 * 1024;

/// Cap on captured shell output per stream.
const MAX_SHELL_OUTPUT: usize = 64 * 1024;

/// Register the filesystem tool family.
pub fn register_fs_tools(
    registry: &mut super::ToolRegistry,
    mapper: Arc<PathMapper>,
) -> Result<()> {
    registry.register(Arc::new(ReadFileTool { mapper: Arc::clone(&mapper) }))?;
    registry.register(Arc::new(WriteFileTool { mapper: Arc::clone(&mapper) }))?;
    registry.register(Arc::new(ListDirectoryTool { mapper: Arc::clone(&mapper) }))?;
    registry.register(Arc::new(ApplyPatchTool { mapper }))?;
    registry.register(Arc::new(BashTool))?;
    Ok(())
}

/// Translate to the canonical namespace and reject paths outside mapped
/// volumes (when mappings exist) or relative paths (always).
fn resolve_path(mapper: &PathMapper, raw: &str, tool: &str) -> Result<String> {
    if !raw.starts_with('/') {
        return Err(Error::Tool {
            tool: tool.to_string(),
            message: format!("path must be absolute, got '{raw}'"),
        });
    }
    let canonical = mapper.to_container(raw);
    if mapper.has_mappings() && !mapper.validate_container(&canonical) {
        return Err(Error::Tool {
            tool: tool.to_string(),
            message: format!("path '{raw}' is outside every configured mount"),
        });
    }
    Ok(canonical)
}

// ---------------------------------------------------------------------------
// read_file
// ---------------------------------------------------------------------------

struct ReadFileTool {
    mapper: Arc<PathMapper>,
}

#[async_trait]
impl Tool for ReadFileTool {
    fn name(&self) -> &'static str {
        "read_file"
    }

    fn description(&self) -> &'static str {
        "Read a file. Optional startLine/endLine (1-based, inclusive) select a range; large \
         files are truncated at 256KB."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute file path" },
                "startLine": { "type": "integer" },
                "endLine": { "type": "integer" }
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let path = resolve_path(
            &self.mapper,
            require_str(&args, "path", self.name())?,
            self.name(),
        )?;
        let raw = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| Error::PathUnreachable { path: path.clone().into(), source })?;

        let start = optional_u64(&args, "startLine");
        let end = optional_u64(&args, "endLine");
        let content = if start.is_some() || end.is_some() {
            let lines: Vec<&str> = raw.lines().collect();
            let total = lines.len();
            let s = (start.unwrap_or(1).max(1) as usize).min(total.max(1));
            let e = (end.unwrap_or(total as u64) as usize).min(total);
            if s > e {
                return Err(Error::Tool {
                    tool: self.name().to_string(),
                    message: format!("startLine ({s}) > endLine ({e})"),
                });
            }
            lines[s - 1..e].join("\n")
        } else if raw.len() > MAX_READ_BYTES {
            let mut cut = MAX_READ_BYTES;
            while !raw.is_char_boundary(cut) && cut > 0 {
                cut -= 1;
            }
            format!("{}\n[truncated at 256KB]", &raw[..cut])
        } else {
            raw
        };

        Ok(json!({ "path": path, "content": content }))
    }
}

// ---------------------------------------------------------------------------
// write_file
// ---------------------------------------------------------------------------

struct WriteFileTool {
    mapper: Arc<PathMapper>,
}

#[async_trait]
impl Tool for WriteFileTool {
    fn name(&self) -> &'static str {
        "write_file"
    }

    fn description(&self) -> &'static str {
        "Write content to a file, creating parent directories as needed. Overwrites existing \
         content."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute file path" },
                "content": { "type": "string" }
            },
            "required": ["path", "content"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let path = resolve_path(
            &self.mapper,
            require_str(&args, "path", self.name())?,
            self.name(),
        )?;
        let content = require_str(&args, "content", self.name())?;

        if let Some(parent) = Path::new(&path).parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|source| {
                Error::PathUnreachable { path: parent.to_path_buf(), source }
            })?;
        }
        tokio::fs::write(&path, content)
            .await
            .map_err(|source| Error::PathUnreachable { path: path.clone().into(), source })?;
        Ok(json!({ "path": path, "bytesWritten": content.len() }))
    }
}

// ---------------------------------------------------------------------------
// list_directory
// ---------------------------------------------------------------------------

struct ListDirectoryTool {
    mapper: Arc<PathMapper>,
}

#[async_trait]
impl Tool for ListDirectoryTool {
    fn name(&self) -> &'static str {
        "list_directory"
    }

    fn description(&self) -> &'static str {
        "List a directory's entries with type and size, sorted by name."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute directory path" }
            },
            "required": ["path"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let path = resolve_path(
            &self.mapper,
            require_str(&args, "path", self.name())?,
            self.name(),
        )?;
        let mut reader = tokio::fs::read_dir(&path)
            .await
            .map_err(|source| Error::PathUnreachable { path: path.clone().into(), source })?;

        let mut entries = Vec::new();
        while let Some(entry) = reader
            .next_entry()
            .await
            .map_err(|source| Error::PathUnreachable { path: path.clone().into(), source })?
        {
            let meta = entry.metadata().await.ok();
            let is_dir = meta.as_ref().is_some_and(std::fs::Metadata::is_dir);
            entries.push(json!({
                "name": entry.file_name().to_string_lossy(),
                "type": if is_dir { "directory" } else { "file" },
                "size": meta.map(|m| m.len()).unwrap_or(0),
            }));
        }
        entries.sort_by(|a, b| {
            a["name"]
                .as_str()
                .unwrap_or("")
                .cmp(b["name"].as_str().unwrap_or(""))
        });
        Ok(json!({ "path": path, "entries": entries }))
    }
}

// ---------------------------------------------------------------------------
// apply_patch
// ---------------------------------------------------------------------------

struct ApplyPatchTool {
    mapper: Arc<PathMapper>,
}

#[async_trait]
impl Tool for ApplyPatchTool {
    fn name(&self) -> &'static str {
        "apply_patch"
    }

    fn description(&self) -> &'static str {
        "Edit a file by exact text replacement. oldText must appear exactly once; use a larger \
         surrounding snippet to disambiguate."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "path": { "type": "string", "description": "Absolute file path" },
                "oldText": { "type": "string", "description": "Exact text to replace" },
                "newText": { "type": "string", "description": "Replacement text" }
            },
            "required": ["path", "oldText", "newText"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let path = resolve_path(
            &self.mapper,
            require_str(&args, "path", self.name())?,
            self.name(),
        )?;
        let old_text = require_str(&args, "oldText", self.name())?;
        let new_text = require_str(&args, "newText", self.name())?;

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|source| Error::PathUnreachable { path: path.clone().into(), source })?;

        let occurrences = content.matches(old_text).count();
        if occurrences == 0 {
            return Err(Error::Tool {
                tool: self.name().to_string(),
                message: "oldText not found in file".to_string(),
            });
        }
        if occurrences > 1 {
            return Err(Error::Tool {
                tool: self.name().to_string(),
                message: format!("oldText matches {occurrences} locations; provide more context"),
            });
        }

        let updated = content.replacen(old_text, new_text, 1);
        tokio::fs::write(&path, &updated)
            .await
            .map_err(|source| Error::PathUnreachable { path: path.clone().into(), source })?;
        Ok(json!({ "path": path, "applied": true }))
    }
}

// ---------------------------------------------------------------------------
// bash
// ---------------------------------------------------------------------------

struct BashTool;

#[async_trait]
impl Tool for BashTool {
    fn name(&self) -> &'static str {
        "bash"
    }

    fn description(&self) -> &'static str {
        "Run a shell command and capture stdout, stderr, and the exit code. Commands share the \
         30-second tool timeout."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "command": { "type": "string", "description": "Shell command line" },
                "workdir": { "type": "string", "description": "Working directory (optional)" }
            },
            "required": ["command"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let command = require_str(&args, "command", self.name())?;
        let mut cmd = tokio::process::Command::new("sh");
        cmd.arg("-c").arg(command).kill_on_drop(true);
        if let Some(workdir) = super::optional_str(&args, "workdir") {
            cmd.current_dir(workdir);
        }

        let output = cmd.output().await.map_err(|e| Error::Tool {
            tool: self.name().to_string(),
            message: format!("failed to spawn shell: {e}"),
        })?;

        let truncate = |bytes: &[u8]| {
            let text = String::from_utf8_lossy(bytes);
            if text.len() > MAX_SHELL_OUTPUT {
                let mut cut = MAX_SHELL_OUTPUT;
                while !text.is_char_boundary(cut) && cut > 0 {
                    cut -= 1;
                }
                format!("{}\n[truncated]", &text[..cut])
            } else {
                text.into_owned()
            }
        };

        Ok(json!({
            "exitCode": output.status.code().unwrap_or(-1),
            "stdout": truncate(&output.stdout),
            "stderr": truncate(&output.stderr),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_mappings() -> Arc<PathMapper> {
        Arc::new(PathMapper::default())
    }

    #[tokio::test]
    async fn read_write_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("note.txt").to_string_lossy().to_string();

        let write = WriteFileTool { mapper: no_mappings() };
        write
            .invoke(json!({ "path": path, "content": "hello\nworld\n" }))
            .await
            .unwrap();

        let read = ReadFileTool { mapper: no_mappings() };
        let out = read.invoke(json!({ "path": path })).await.unwrap();
        assert_eq!(out["content"], "hello\nworld\n");

        let ranged = read
            .invoke(json!({ "path": path, "startLine": 2, "endLine": 2 }))
            .await
            .unwrap();
        assert_eq!(ranged["content"], "world");
    }

    #[tokio::test]
    async fn patch_requires_unique_match() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a.rs").to_string_lossy().to_string();
        tokio::fs::write(&path, "let x = 1;\nlet y = 1;\n").await.unwrap();

        let patch = ApplyPatchTool { mapper: no_mappings() };
        let err = patch
            .invoke(json!({ "path": path, "oldText": "= 1;", "newText": "= 2;" }))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("2 locations"));

        patch
            .invoke(json!({ "path": path, "oldText": "let x = 1;", "newText": "let x = 2;" }))
            .await
            .unwrap();
        let content = tokio::fs::read_to_string(&path).await.unwrap();
        assert_eq!(content, "let x = 2;\nlet y = 1;\n");
    }

    #[tokio::test]
    async fn mapped_mode_rejects_unmapped_paths() {
        let mapper = Arc::new(PathMapper::parse("/Users/alice/proj:/ws/m0"));
        let read = ReadFileTool { mapper };
        let err = read.invoke(json!({ "path": "/etc/passwd" })).await.unwrap_err();
        assert!(err.to_string().contains("outside"));
    }

    #[tokio::test]
    async fn list_directory_sorts_entries() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join("b.txt"), "b").await.unwrap();
        tokio::fs::write(dir.path().join("a.txt"), "a").await.unwrap();
        tokio::fs::create_dir(dir.path().join("sub")).await.unwrap();

        let list = ListDirectoryTool { mapper: no_mappings() };
        let out = list
            .invoke(json!({ "path": dir.path().to_string_lossy() }))
            .await
            .unwrap();
        let names: Vec<&str> = out["entries"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["name"].as_str().unwrap())
            .collect();
        assert_eq!(names, vec!["a.txt", "b.txt", "sub"]);
    }

    #[tokio::test]
    async fn bash_captures_exit_code_and_output() {
        let bash = BashTool;
        let out = bash
            .invoke(json!({ "command": "echo out; echo err 1>&2; exit 3" }))
            .await
            .unwrap();
        assert_eq!(out["exitCode"], 3);
        assert_eq!(out["stdout"].as_str().unwrap().trim(), "out");
        assert_eq!(out["stderr"].as_str().unwrap().trim(), "err");
    }
}
