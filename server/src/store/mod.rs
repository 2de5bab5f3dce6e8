//! Metadata store: durable records for folders, files, chunks, sessions,
//! messages, prompt versions, subagents, and the task board.
//!
//! Backed by embedded SQLite. A single connection sits behind an async
//! mutex; statements are short and local, so serializing them is cheaper
//! than pooling. All mutation goes through this API; no other module
//! touches the database.

mod schema;

pub use schema::{DEFAULT_PROMPT_ID, SCHEMA_VERSION};

use crate::error::{Error, Result};
use crate::types::{
    ChatMessage, ChatSession, FileChunk, FolderStatus, IndexedFile, IndexedFolder, MessageRole,
    PromptVersion, Subagent, TaskKind, TaskRecord, TodoItem, new_id,
};
use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, params};
use std::path::Path;
use tokio::sync::Mutex;

/// Aggregate record counts for status reporting.
#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct StoreCounts {
    pub folders: u64,
    pub files: u64,
    pub chunks: u64,
    pub sessions: u64,
    pub messages: u64,
}

/// Usage statistics for one knowledge collection.
#[derive(Debug, Clone, serde::Serialize)]
pub struct KnowledgeCollection {
    pub name: String,
    pub item_count: u64,
    pub query_count: u64,
}

/// Handle to the metadata store.
pub struct MetaStore {
    conn: Mutex<Connection>,
}

impl MetaStore {
    /// Open (or create) the store at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when the database cannot be opened or the
    /// schema cannot be initialized.
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open(path)?;
        schema::apply_pragmas(&conn)?;
        schema::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// In-memory store for tests.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Store`] when schema initialization fails.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        schema::apply_pragmas(&conn)?;
        schema::init_schema(&conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    // -----------------------------------------------------------------------
    // Folders
    // -----------------------------------------------------------------------

    /// Register a folder. Paths are unique; a duplicate registration is a
    /// [`Error::MetadataConflict`].
    pub async fn create_folder(
        &self,
        path: &str,
        description: Option<&str>,
    ) -> Result<IndexedFolder> {
        let folder = IndexedFolder {
            id: new_id(),
            path: path.to_string(),
            description: description.map(str::to_string),
            status: FolderStatus::Active,
            error: None,
            file_count: 0,
            added_at: Utc::now(),
            last_scanned_at: None,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO folders (id, path, description, status, error, file_count, added_at)
             VALUES (?1, ?2, ?3, ?4, NULL, 0, ?5)",
            params![
                folder.id,
                folder.path,
                folder.description,
                folder.status.as_str(),
                folder.added_at.to_rfc3339(),
            ],
        )
        .map_err(|e| conflict(e, &format!("folder path '{path}' already indexed")))?;
        Ok(folder)
    }

    pub async fn folder(&self, id: &str) -> Result<Option<IndexedFolder>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{FOLDER_SELECT} WHERE id = ?1"),
            [id],
            folder_from_row,
        )
        .optional()
        .map_err(Error::Store)
    }

    pub async fn folder_by_path(&self, path: &str) -> Result<Option<IndexedFolder>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{FOLDER_SELECT} WHERE path = ?1"),
            [path],
            folder_from_row,
        )
        .optional()
        .map_err(Error::Store)
    }

    pub async fn list_folders(&self) -> Result<Vec<IndexedFolder>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!("{FOLDER_SELECT} ORDER BY path"))?;
        let rows = stmt.query_map([], folder_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    /// Flip folder status; `error` is recorded for [`FolderStatus::Error`]
    /// and cleared otherwise.
    pub async fn set_folder_status(
        &self,
        id: &str,
        status: FolderStatus,
        error: Option<&str>,
    ) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE folders SET status = ?2, error = ?3 WHERE id = ?1",
            params![id, status.as_str(), error],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("folder {id}")));
        }
        Ok(())
    }

    /// Mark a successful scan: status active, fresh timestamp, new count.
    pub async fn finish_scan(&self, id: &str, file_count: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE folders
             SET status = 'active', error = NULL, file_count = ?2, last_scanned_at = ?3
             WHERE id = ?1",
            params![id, file_count as i64, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("folder {id}")));
        }
        Ok(())
    }

    /// Delete a folder; files and chunks cascade.
    pub async fn delete_folder(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM folders WHERE id = ?1", [id])?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Files and chunks
    // -----------------------------------------------------------------------

    /// Write a file record together with its full chunk set, replacing any
    /// previous chunks, in one transaction. Callers must reuse the stored
    /// file id when re-indexing an existing (folder, path).
    pub async fn upsert_file(&self, file: &IndexedFile, chunks: &[FileChunk]) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO files
                (id, folder_id, path, relative_path, language, content_hash,
                 size_bytes, line_count, chunk_count, indexed_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
             ON CONFLICT(folder_id, path) DO UPDATE SET
                relative_path = excluded.relative_path,
                language = excluded.language,
                content_hash = excluded.content_hash,
                size_bytes = excluded.size_bytes,
                line_count = excluded.line_count,
                chunk_count = excluded.chunk_count,
                updated_at = excluded.updated_at",
            params![
                file.id,
                file.folder_id,
                file.path,
                file.relative_path,
                file.language,
                file.content_hash,
                file.size_bytes as i64,
                i64::from(file.line_count),
                i64::from(file.chunk_count),
                file.indexed_at.to_rfc3339(),
                file.updated_at.to_rfc3339(),
            ],
        )?;
        tx.execute("DELETE FROM chunks WHERE file_id = ?1", [&file.id])?;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO chunks (file_id, chunk_index, content, start_line, end_line)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
            )?;
            for chunk in chunks {
                stmt.execute(params![
                    chunk.file_id,
                    i64::from(chunk.chunk_index),
                    chunk.content,
                    i64::from(chunk.start_line),
                    i64::from(chunk.end_line),
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    pub async fn file(&self, id: &str) -> Result<Option<IndexedFile>> {
        let conn = self.conn.lock().await;
        conn.query_row(&format!("{FILE_SELECT} WHERE id = ?1"), [id], file_from_row)
            .optional()
            .map_err(Error::Store)
    }

    pub async fn file_by_path(&self, folder_id: &str, path: &str) -> Result<Option<IndexedFile>> {
        let conn = self.conn.lock().await;
        conn.query_row(
            &format!("{FILE_SELECT} WHERE folder_id = ?1 AND path = ?2"),
            [folder_id, path],
            file_from_row,
        )
        .optional()
        .map_err(Error::Store)
    }

    pub async fn files_in_folder(&self, folder_id: &str) -> Result<Vec<IndexedFile>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare(&format!("{FILE_SELECT} WHERE folder_id = ?1 ORDER BY path"))?;
        let rows = stmt.query_map([folder_id], file_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    pub async fn delete_file(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM files WHERE id = ?1", [id])?;
        Ok(())
    }

    /// Chunks of a file in index order.
    pub async fn chunks_for_file(&self, file_id: &str) -> Result<Vec<FileChunk>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT file_id, chunk_index, content, start_line, end_line
             FROM chunks WHERE file_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map([file_id], |row| {
            Ok(FileChunk {
                file_id: row.get(0)?,
                chunk_index: row.get::<_, i64>(1)? as u32,
                content: row.get(2)?,
                start_line: row.get::<_, i64>(3)? as u32,
                end_line: row.get::<_, i64>(4)? as u32,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    // -----------------------------------------------------------------------
    // Sessions
    // -----------------------------------------------------------------------

    pub async fn create_session(
        &self,
        user_id: &str,
        company_id: &str,
        title: &str,
        parent_session_id: Option<&str>,
        subagent_id: Option<&str>,
        task_id: Option<&str>,
    ) -> Result<ChatSession> {
        let now = Utc::now();
        let session = ChatSession {
            id: new_id(),
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            title: title.to_string(),
            parent_session_id: parent_session_id.map(str::to_string),
            subagent_id: subagent_id.map(str::to_string),
            task_id: task_id.map(str::to_string),
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions
                (id, user_id, company_id, title, parent_session_id, subagent_id, task_id,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                session.id,
                session.user_id,
                session.company_id,
                session.title,
                session.parent_session_id,
                session.subagent_id,
                session.task_id,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(session)
    }

    /// Fetch a session, creating it with the given id when absent. Used
    /// by the stream server for implicitly created sessions whose title
    /// derives from the first user message.
    pub async fn ensure_session(
        &self,
        id: &str,
        user_id: &str,
        company_id: &str,
        title: &str,
    ) -> Result<ChatSession> {
        if let Some(existing) = self.session(id).await? {
            return Ok(existing);
        }
        let now = Utc::now();
        let session = ChatSession {
            id: id.to_string(),
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            title: title.to_string(),
            parent_session_id: None,
            subagent_id: None,
            task_id: None,
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR IGNORE INTO sessions
                (id, user_id, company_id, title, parent_session_id, subagent_id, task_id,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, NULL, NULL, NULL, ?5, ?6)",
            params![
                session.id,
                session.user_id,
                session.company_id,
                session.title,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(session)
    }

    pub async fn session(&self, id: &str) -> Result<Option<ChatSession>> {
        let conn = self.conn.lock().await;
        conn.query_row(&format!("{SESSION_SELECT} WHERE id = ?1"), [id], session_from_row)
            .optional()
            .map_err(Error::Store)
    }

    pub async fn list_sessions(&self, user_id: &str, company_id: &str) -> Result<Vec<ChatSession>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SESSION_SELECT} WHERE user_id = ?1 AND company_id = ?2 ORDER BY updated_at DESC"
        ))?;
        let rows = stmt.query_map([user_id, company_id], session_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    pub async fn child_sessions(&self, parent_id: &str) -> Result<Vec<ChatSession>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SESSION_SELECT} WHERE parent_session_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([parent_id], session_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    pub async fn update_session_title(&self, id: &str, title: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE sessions SET title = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, title, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Append one message and bump the session's updated timestamp.
    pub async fn append_message(&self, message: &ChatMessage) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO messages
                (id, session_id, role, content, tool_name, tool_args, tool_call_id,
                 tool_output, tool_error, duration_ms, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                message.id,
                message.session_id,
                message.role.as_str(),
                message.content,
                message.tool_name,
                message.tool_args.as_ref().map(std::string::ToString::to_string),
                message.tool_call_id,
                message.tool_output,
                message.tool_error,
                message.duration_ms.map(|d| d as i64),
                message.created_at.to_rfc3339(),
            ],
        )?;
        tx.execute(
            "UPDATE sessions SET updated_at = ?2 WHERE id = ?1",
            params![message.session_id, Utc::now().to_rfc3339()],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// All messages of a session in temporal order.
    pub async fn messages(&self, session_id: &str) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT} WHERE session_id = ?1 ORDER BY created_at, rowid"
        ))?;
        let rows = stmt.query_map([session_id], message_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    /// The most recent `limit` messages, returned oldest-first so they can
    /// be appended to a working conversation directly.
    pub async fn recent_messages(&self, session_id: &str, limit: u32) -> Result<Vec<ChatMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{MESSAGE_SELECT} WHERE session_id = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![session_id, i64::from(limit)], message_from_row)?;
        let mut out = rows.collect::<rusqlite::Result<Vec<_>>>()?;
        out.reverse();
        Ok(out)
    }

    // -----------------------------------------------------------------------
    // Prompt versions
    // -----------------------------------------------------------------------

    /// Create the next prompt version for a user. Version numbers increase
    /// monotonically per (user, company); a concurrent writer racing on the
    /// same number is retried once, then surfaces as a conflict.
    pub async fn create_prompt_version(
        &self,
        user_id: &str,
        company_id: &str,
        prompt: &str,
        description: Option<&str>,
    ) -> Result<PromptVersion> {
        for attempt in 0..2 {
            let conn = self.conn.lock().await;
            let next: i64 = conn.query_row(
                "SELECT COALESCE(MAX(version), 0) + 1 FROM prompt_versions
                 WHERE user_id = ?1 AND company_id = ?2 AND is_default = 0",
                [user_id, company_id],
                |r| r.get(0),
            )?;
            let record = PromptVersion {
                id: new_id(),
                user_id: user_id.to_string(),
                company_id: company_id.to_string(),
                version: next as u32,
                prompt: prompt.to_string(),
                description: description.map(str::to_string),
                is_active: false,
                is_default: false,
                created_at: Utc::now(),
            };
            let inserted = conn.execute(
                "INSERT INTO prompt_versions
                    (id, user_id, company_id, version, prompt, description,
                     is_active, is_default, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 0, ?7)",
                params![
                    record.id,
                    record.user_id,
                    record.company_id,
                    i64::from(record.version),
                    record.prompt,
                    record.description,
                    record.created_at.to_rfc3339(),
                ],
            );
            match inserted {
                Ok(_) => return Ok(record),
                Err(e) if attempt == 0 && is_constraint(&e) => continue,
                Err(e) => return Err(conflict(e, "prompt version number collision")),
            }
        }
        unreachable!("loop returns on both arms of the second attempt")
    }

    /// Activate one version; every other version of the same (user, company)
    /// is deactivated in the same transaction. The global default cannot be
    /// activated per-user and is rejected.
    pub async fn activate_prompt_version(
        &self,
        user_id: &str,
        company_id: &str,
        version_id: &str,
    ) -> Result<()> {
        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        let is_default: Option<bool> = tx
            .query_row(
                "SELECT is_default FROM prompt_versions
                 WHERE id = ?1 AND user_id = ?2 AND company_id = ?3",
                params![version_id, user_id, company_id],
                |r| r.get(0),
            )
            .optional()?;
        match is_default {
            None => return Err(Error::NotFound(format!("prompt version {version_id}"))),
            Some(true) => {
                return Err(Error::MetadataConflict(
                    "the global default prompt cannot be activated".into(),
                ));
            }
            Some(false) => {}
        }
        tx.execute(
            "UPDATE prompt_versions SET is_active = 0
             WHERE user_id = ?1 AND company_id = ?2",
            [user_id, company_id],
        )?;
        tx.execute(
            "UPDATE prompt_versions SET is_active = 1 WHERE id = ?1",
            [version_id],
        )?;
        tx.commit()?;
        Ok(())
    }

    /// The active prompt for a user, falling back to the global default.
    pub async fn active_prompt(&self, user_id: &str, company_id: &str) -> Result<PromptVersion> {
        let conn = self.conn.lock().await;
        let active = conn
            .query_row(
                &format!(
                    "{PROMPT_SELECT} WHERE user_id = ?1 AND company_id = ?2 AND is_active = 1"
                ),
                [user_id, company_id],
                prompt_from_row,
            )
            .optional()?;
        if let Some(p) = active {
            return Ok(p);
        }
        conn.query_row(
            &format!("{PROMPT_SELECT} WHERE id = ?1"),
            [DEFAULT_PROMPT_ID],
            prompt_from_row,
        )
        .map_err(Error::Store)
    }

    pub async fn list_prompt_versions(
        &self,
        user_id: &str,
        company_id: &str,
    ) -> Result<Vec<PromptVersion>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{PROMPT_SELECT} WHERE user_id = ?1 AND company_id = ?2 ORDER BY version"
        ))?;
        let rows = stmt.query_map([user_id, company_id], prompt_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    // -----------------------------------------------------------------------
    // Subagents
    // -----------------------------------------------------------------------

    pub async fn create_subagent(
        &self,
        user_id: &str,
        company_id: &str,
        name: &str,
        description: Option<&str>,
        system_prompt: &str,
    ) -> Result<Subagent> {
        let now = Utc::now();
        let agent = Subagent {
            id: new_id(),
            user_id: user_id.to_string(),
            company_id: company_id.to_string(),
            name: name.to_string(),
            description: description.map(str::to_string),
            system_prompt: system_prompt.to_string(),
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO subagents
                (id, user_id, company_id, name, description, system_prompt, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                agent.id,
                agent.user_id,
                agent.company_id,
                agent.name,
                agent.description,
                agent.system_prompt,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )
        .map_err(|e| conflict(e, &format!("subagent '{name}' already exists")))?;
        Ok(agent)
    }

    pub async fn subagent(&self, id: &str) -> Result<Option<Subagent>> {
        let conn = self.conn.lock().await;
        conn.query_row(&format!("{SUBAGENT_SELECT} WHERE id = ?1"), [id], subagent_from_row)
            .optional()
            .map_err(Error::Store)
    }

    pub async fn list_subagents(&self, user_id: &str, company_id: &str) -> Result<Vec<Subagent>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(&format!(
            "{SUBAGENT_SELECT} WHERE user_id = ?1 AND company_id = ?2 ORDER BY name"
        ))?;
        let rows = stmt.query_map([user_id, company_id], subagent_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    // -----------------------------------------------------------------------
    // Task board
    // -----------------------------------------------------------------------

    pub async fn create_task(
        &self,
        kind: TaskKind,
        title: &str,
        description: Option<&str>,
        assignee: Option<&str>,
    ) -> Result<TaskRecord> {
        let now = Utc::now();
        let task = TaskRecord {
            id: new_id(),
            kind,
            title: title.to_string(),
            description: description.map(str::to_string),
            status: "open".to_string(),
            assignee: assignee.map(str::to_string),
            prompt_notes: None,
            created_at: now,
            updated_at: now,
        };
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO tasks
                (id, kind, title, description, status, assignee, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            params![
                task.id,
                task.kind.as_str(),
                task.title,
                task.description,
                task.status,
                task.assignee,
                now.to_rfc3339(),
                now.to_rfc3339(),
            ],
        )?;
        Ok(task)
    }

    pub async fn task(&self, id: &str) -> Result<Option<TaskRecord>> {
        let conn = self.conn.lock().await;
        conn.query_row(&format!("{TASK_SELECT} WHERE id = ?1"), [id], task_from_row)
            .optional()
            .map_err(Error::Store)
    }

    pub async fn list_tasks(&self, kind: TaskKind) -> Result<Vec<TaskRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare(&format!("{TASK_SELECT} WHERE kind = ?1 ORDER BY created_at"))?;
        let rows = stmt.query_map([kind.as_str()], task_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    pub async fn update_task_status(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, status, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Replace (Some) or clear (None) a task's prompt notes.
    pub async fn set_prompt_notes(&self, id: &str, notes: Option<&str>) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks SET prompt_notes = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, notes, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    /// Append a note line to a task's prompt notes.
    pub async fn append_prompt_notes(&self, id: &str, note: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE tasks
             SET prompt_notes = COALESCE(prompt_notes || char(10), '') || ?2, updated_at = ?3
             WHERE id = ?1",
            params![id, note, Utc::now().to_rfc3339()],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("task {id}")));
        }
        Ok(())
    }

    pub async fn add_todo(&self, task_id: &str, description: &str) -> Result<TodoItem> {
        let conn = self.conn.lock().await;
        let position: i64 = conn.query_row(
            "SELECT COUNT(*) FROM todos WHERE task_id = ?1",
            [task_id],
            |r| r.get(0),
        )?;
        let todo = TodoItem {
            id: new_id(),
            task_id: task_id.to_string(),
            description: description.to_string(),
            status: "open".to_string(),
            position: position as u32,
        };
        conn.execute(
            "INSERT INTO todos (id, task_id, description, status, position)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![todo.id, todo.task_id, todo.description, todo.status, position],
        )?;
        Ok(todo)
    }

    pub async fn update_todo_status(&self, id: &str, status: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "UPDATE todos SET status = ?2 WHERE id = ?1",
            params![id, status],
        )?;
        if n == 0 {
            return Err(Error::NotFound(format!("todo {id}")));
        }
        Ok(())
    }

    pub async fn todos_for_task(&self, task_id: &str) -> Result<Vec<TodoItem>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, task_id, description, status, position
             FROM todos WHERE task_id = ?1 ORDER BY position",
        )?;
        let rows = stmt.query_map([task_id], |row| {
            Ok(TodoItem {
                id: row.get(0)?,
                task_id: row.get(1)?,
                description: row.get(2)?,
                status: row.get(3)?,
                position: row.get::<_, i64>(4)? as u32,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    // -----------------------------------------------------------------------
    // Knowledge collection counters
    // -----------------------------------------------------------------------

    pub async fn record_knowledge_upsert(&self, name: &str, added: u64) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO knowledge_collections (name, item_count, query_count, updated_at)
             VALUES (?1, ?2, 0, ?3)
             ON CONFLICT(name) DO UPDATE SET
                item_count = item_count + excluded.item_count,
                updated_at = excluded.updated_at",
            params![name, added as i64, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    pub async fn record_knowledge_query(&self, name: &str) -> Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO knowledge_collections (name, item_count, query_count, updated_at)
             VALUES (?1, 0, 1, ?2)
             ON CONFLICT(name) DO UPDATE SET
                query_count = query_count + 1,
                updated_at = excluded.updated_at",
            params![name, Utc::now().to_rfc3339()],
        )?;
        Ok(())
    }

    /// Collections ranked by query volume.
    pub async fn popular_collections(&self, limit: u32) -> Result<Vec<KnowledgeCollection>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT name, item_count, query_count FROM knowledge_collections
             ORDER BY query_count DESC, name LIMIT ?1",
        )?;
        let rows = stmt.query_map([i64::from(limit)], |row| {
            Ok(KnowledgeCollection {
                name: row.get(0)?,
                item_count: row.get::<_, i64>(1)? as u64,
                query_count: row.get::<_, i64>(2)? as u64,
            })
        })?;
        rows.collect::<rusqlite::Result<Vec<_>>>().map_err(Error::Store)
    }

    // -----------------------------------------------------------------------
    // Status
    // -----------------------------------------------------------------------

    pub async fn counts(&self) -> Result<StoreCounts> {
        let conn = self.conn.lock().await;
        let count = |table: &str| -> rusqlite::Result<u64> {
            conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| {
                r.get::<_, i64>(0).map(|n| n as u64)
            })
        };
        Ok(StoreCounts {
            folders: count("folders")?,
            files: count("files")?,
            chunks: count("chunks")?,
            sessions: count("sessions")?,
            messages: count("messages")?,
        })
    }
}

// ---------------------------------------------------------------------------
// Row mapping
// ---------------------------------------------------------------------------

const FOLDER_SELECT: &str = "SELECT id, path, description, status, error, file_count, added_at, \
                             last_scanned_at FROM folders";
const FILE_SELECT: &str = "SELECT id, folder_id, path, relative_path, language, content_hash, \
                           size_bytes, line_count, chunk_count, indexed_at, updated_at FROM files";
const SESSION_SELECT: &str = "SELECT id, user_id, company_id, title, parent_session_id, \
                              subagent_id, task_id, created_at, updated_at FROM sessions";
const MESSAGE_SELECT: &str = "SELECT id, session_id, role, content, tool_name, tool_args, \
                              tool_call_id, tool_output, tool_error, duration_ms, created_at \
                              FROM messages";
const PROMPT_SELECT: &str = "SELECT id, user_id, company_id, version, prompt, description, \
                             is_active, is_default, created_at FROM prompt_versions";
const SUBAGENT_SELECT: &str = "SELECT id, user_id, company_id, name, description, system_prompt, \
                               created_at, updated_at FROM subagents";
const TASK_SELECT: &str = "SELECT id, kind, title, description, status, assignee, prompt_notes, \
                           created_at, updated_at FROM tasks";

fn ts(raw: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
        })
}

fn folder_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexedFolder> {
    Ok(IndexedFolder {
        id: row.get(0)?,
        path: row.get(1)?,
        description: row.get(2)?,
        status: FolderStatus::parse(&row.get::<_, String>(3)?),
        error: row.get(4)?,
        file_count: row.get::<_, i64>(5)? as u64,
        added_at: ts(row.get(6)?)?,
        last_scanned_at: row.get::<_, Option<String>>(7)?.map(ts).transpose()?,
    })
}

fn file_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<IndexedFile> {
    Ok(IndexedFile {
        id: row.get(0)?,
        folder_id: row.get(1)?,
        path: row.get(2)?,
        relative_path: row.get(3)?,
        language: row.get(4)?,
        content_hash: row.get(5)?,
        size_bytes: row.get::<_, i64>(6)? as u64,
        line_count: row.get::<_, i64>(7)? as u32,
        chunk_count: row.get::<_, i64>(8)? as u32,
        indexed_at: ts(row.get(9)?)?,
        updated_at: ts(row.get(10)?)?,
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatSession> {
    Ok(ChatSession {
        id: row.get(0)?,
        user_id: row.get(1)?,
        company_id: row.get(2)?,
        title: row.get(3)?,
        parent_session_id: row.get(4)?,
        subagent_id: row.get(5)?,
        task_id: row.get(6)?,
        created_at: ts(row.get(7)?)?,
        updated_at: ts(row.get(8)?)?,
    })
}

fn message_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ChatMessage> {
    let role_raw: String = row.get(2)?;
    let tool_args: Option<String> = row.get(5)?;
    Ok(ChatMessage {
        id: row.get(0)?,
        session_id: row.get(1)?,
        role: MessageRole::parse(&role_raw).unwrap_or(MessageRole::System),
        content: row.get(3)?,
        tool_name: row.get(4)?,
        tool_args: tool_args.and_then(|raw| serde_json::from_str(&raw).ok()),
        tool_call_id: row.get(6)?,
        tool_output: row.get(7)?,
        tool_error: row.get(8)?,
        duration_ms: row.get::<_, Option<i64>>(9)?.map(|d| d as u64),
        created_at: ts(row.get(10)?)?,
    })
}

fn prompt_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<PromptVersion> {
    Ok(PromptVersion {
        id: row.get(0)?,
        user_id: row.get(1)?,
        company_id: row.get(2)?,
        version: row.get::<_, i64>(3)? as u32,
        prompt: row.get(4)?,
        description: row.get(5)?,
        is_active: row.get(6)?,
        is_default: row.get(7)?,
        created_at: ts(row.get(8)?)?,
    })
}

fn subagent_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Subagent> {
    Ok(Subagent {
        id: row.get(0)?,
        user_id: row.get(1)?,
        company_id: row.get(2)?,
        name: row.get(3)?,
        description: row.get(4)?,
        system_prompt: row.get(5)?,
        created_at: ts(row.get(6)?)?,
        updated_at: ts(row.get(7)?)?,
    })
}

fn task_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<TaskRecord> {
    let kind_raw: String = row.get(1)?;
    Ok(TaskRecord {
        id: row.get(0)?,
        kind: TaskKind::parse(&kind_raw).unwrap_or(TaskKind::Human),
        title: row.get(2)?,
        description: row.get(3)?,
        status: row.get(4)?,
        assignee: row.get(5)?,
        prompt_notes: row.get(6)?,
        created_at: ts(row.get(7)?)?,
        updated_at: ts(row.get(8)?)?,
    })
}

// ---------------------------------------------------------------------------
// Conflict mapping
// ---------------------------------------------------------------------------

fn is_constraint(e: &rusqlite::Error) -> bool {
    matches!(
        e,
        rusqlite::Error::SqliteFailure(f, _)
            if f.code == rusqlite::ErrorCode::ConstraintViolation
    )
}

fn conflict(e: rusqlite::Error, what: &str) -> Error {
    if is_constraint(&e) {
        Error::MetadataConflict(what.to_string())
    } else {
        Error::Store(e)
    }
}
