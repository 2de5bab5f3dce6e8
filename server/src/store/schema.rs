//! Metadata store schema.

use crate::error::Result;
use rusqlite::Connection;

/// Current schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Id of the immutable system-global default prompt row.
pub const DEFAULT_PROMPT_ID: &str = "prompt-default";

const DEFAULT_PROMPT: &str = "You are a coding assistant with access to an indexed view of the \
user's repositories. Use the code search tools before answering questions about the codebase, \
cite file paths and line numbers, and prefer small verifiable steps when editing files.";

/// Apply connection pragmas. WAL keeps readers unblocked during indexer
/// writes; foreign keys enforce the folder→file→chunk cascade.
pub fn apply_pragmas(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        PRAGMA journal_mode = WAL;
        PRAGMA synchronous = NORMAL;
        PRAGMA foreign_keys = ON;
        PRAGMA busy_timeout = 5000;
        ",
    )?;
    Ok(())
}

/// Initialize tables and indexes. Idempotent; seeds the immutable global
/// default prompt on first run.
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        CREATE TABLE IF NOT EXISTS folders (
            id              TEXT PRIMARY KEY,
            path            TEXT NOT NULL UNIQUE,
            description     TEXT,
            status          TEXT NOT NULL,
            error           TEXT,
            file_count      INTEGER NOT NULL DEFAULT 0,
            added_at        TEXT NOT NULL,
            last_scanned_at TEXT
        );

        CREATE TABLE IF NOT EXISTS files (
            id            TEXT PRIMARY KEY,
            folder_id     TEXT NOT NULL REFERENCES folders(id) ON DELETE CASCADE,
            path          TEXT NOT NULL,
            relative_path TEXT NOT NULL,
            language      TEXT NOT NULL,
            content_hash  TEXT NOT NULL,
            size_bytes    INTEGER NOT NULL,
            line_count    INTEGER NOT NULL,
            chunk_count   INTEGER NOT NULL,
            indexed_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            UNIQUE(folder_id, path)
        );
        CREATE INDEX IF NOT EXISTS idx_files_folder ON files(folder_id);

        CREATE TABLE IF NOT EXISTS chunks (
            file_id     TEXT NOT NULL REFERENCES files(id) ON DELETE CASCADE,
            chunk_index INTEGER NOT NULL,
            content     TEXT NOT NULL,
            start_line  INTEGER NOT NULL,
            end_line    INTEGER NOT NULL,
            PRIMARY KEY (file_id, chunk_index)
        );
        CREATE INDEX IF NOT EXISTS idx_chunks_file ON chunks(file_id);

        CREATE TABLE IF NOT EXISTS sessions (
            id                TEXT PRIMARY KEY,
            user_id           TEXT NOT NULL,
            company_id        TEXT NOT NULL,
            title             TEXT NOT NULL,
            parent_session_id TEXT,
            subagent_id       TEXT,
            task_id           TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_sessions_owner ON sessions(user_id, company_id);
        CREATE INDEX IF NOT EXISTS idx_sessions_parent ON sessions(parent_session_id);

        CREATE TABLE IF NOT EXISTS messages (
            id           TEXT PRIMARY KEY,
            session_id   TEXT NOT NULL REFERENCES sessions(id) ON DELETE CASCADE,
            role         TEXT NOT NULL,
            content      TEXT NOT NULL,
            tool_name    TEXT,
            tool_args    TEXT,
            tool_call_id TEXT,
            tool_output  TEXT,
            tool_error   TEXT,
            duration_ms  INTEGER,
            created_at   TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_session ON messages(session_id, created_at);

        CREATE TABLE IF NOT EXISTS prompt_versions (
            id          TEXT PRIMARY KEY,
            user_id     TEXT NOT NULL,
            company_id  TEXT NOT NULL,
            version     INTEGER NOT NULL,
            prompt      TEXT NOT NULL,
            description TEXT,
            is_active   INTEGER NOT NULL DEFAULT 0,
            is_default  INTEGER NOT NULL DEFAULT 0,
            created_at  TEXT NOT NULL,
            UNIQUE(user_id, company_id, version)
        );
        CREATE INDEX IF NOT EXISTS idx_prompts_active
            ON prompt_versions(user_id, company_id) WHERE is_active = 1;

        CREATE TABLE IF NOT EXISTS subagents (
            id            TEXT PRIMARY KEY,
            user_id       TEXT NOT NULL,
            company_id    TEXT NOT NULL,
            name          TEXT NOT NULL,
            description   TEXT,
            system_prompt TEXT NOT NULL,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            UNIQUE(user_id, name)
        );

        CREATE TABLE IF NOT EXISTS tasks (
            id           TEXT PRIMARY KEY,
            kind         TEXT NOT NULL,
            title        TEXT NOT NULL,
            description  TEXT,
            status       TEXT NOT NULL,
            assignee     TEXT,
            prompt_notes TEXT,
            created_at   TEXT NOT NULL,
            updated_at   TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS todos (
            id          TEXT PRIMARY KEY,
            task_id     TEXT NOT NULL REFERENCES tasks(id) ON DELETE CASCADE,
            description TEXT NOT NULL,
            status      TEXT NOT NULL,
            position    INTEGER NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_todos_task ON todos(task_id);

        CREATE TABLE IF NOT EXISTS knowledge_collections (
            name        TEXT PRIMARY KEY,
            item_count  INTEGER NOT NULL DEFAULT 0,
            query_count INTEGER NOT NULL DEFAULT 0,
            updated_at  TEXT NOT NULL
        ) WITHOUT ROWID;

        CREATE TABLE IF NOT EXISTS schema_info (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        ) WITHOUT ROWID;
        ",
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1)",
        [SCHEMA_VERSION.to_string()],
    )?;

    // Immutable global default prompt: user/company empty, version 0.
    conn.execute(
        "INSERT OR IGNORE INTO prompt_versions
            (id, user_id, company_id, version, prompt, description, is_active, is_default, created_at)
         VALUES (?1, '', '', 0, ?2, 'System default', 0, 1, ?3)",
        rusqlite::params![
            DEFAULT_PROMPT_ID,
            DEFAULT_PROMPT,
            chrono::Utc::now().to_rfc3339(),
        ],
    )?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schema_initializes_and_is_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        apply_pragmas(&conn).unwrap();
        init_schema(&conn).unwrap();
        init_schema(&conn).unwrap();

        let version: String = conn
            .query_row("SELECT value FROM schema_info WHERE key = 'version'", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION.to_string());

        // Exactly one default prompt, even after re-init
        let defaults: u32 = conn
            .query_row("SELECT COUNT(*) FROM prompt_versions WHERE is_default = 1", [], |r| {
                r.get(0)
            })
            .unwrap();
        assert_eq!(defaults, 1);
    }
}
