//! Task-board tools: human and agent tasks, todo checklists, and the
//! prompt-notes scratchpad the agent accumulates per task.

use super::{Tool, optional_str, require_str};
use crate::error::{Error, Result};
use crate::store::MetaStore;
use crate::types::TaskKind;
use async_trait::async_trait;
use serde_json::{Value, json};
use std::sync::Arc;

/// Register the task/todo tool family.
pub fn register_task_tools(registry: &mut super::ToolRegistry, store: Arc<MetaStore>) -> Result<()> {
    registry.register(Arc::new(CreateTaskTool {
        store: Arc::clone(&store),
        kind: TaskKind::Human,
    }))?;
    registry.register(Arc::new(CreateTaskTool {
        store: Arc::clone(&store),
        kind: TaskKind::Agent,
    }))?;
    registry.register(Arc::new(ListTasksTool {
        store: Arc::clone(&store),
        kind: TaskKind::Human,
    }))?;
    registry.register(Arc::new(ListTasksTool {
        store: Arc::clone(&store),
        kind: TaskKind::Agent,
    }))?;
    registry.register(Arc::new(GetAgentTaskTool { store: Arc::clone(&store) }))?;
    registry.register(Arc::new(UpdateTaskStatusTool { store: Arc::clone(&store) }))?;
    registry.register(Arc::new(UpdateTodoStatusTool { store: Arc::clone(&store) }))?;
    registry.register(Arc::new(AddPromptNotesTool { store: Arc::clone(&store) }))?;
    registry.register(Arc::new(UpdatePromptNotesTool { store: Arc::clone(&store) }))?;
    registry.register(Arc::new(ClearPromptNotesTool { store }))?;
    Ok(())
}

const TASK_STATUSES: &[&str] = &["open", "in_progress", "blocked", "done", "cancelled"];
const TODO_STATUSES: &[&str] = &["open", "done", "skipped"];

fn validate_status(tool: &str, status: &str, allowed: &[&str]) -> Result<()> {
    if allowed.contains(&status) {
        return Ok(());
    }
    Err(Error::Tool {
        tool: tool.to_string(),
        message: format!("invalid status '{status}' (expected one of: {})", allowed.join(", ")),
    })
}

// ---------------------------------------------------------------------------
// create_human_task / create_agent_task
// ---------------------------------------------------------------------------

struct CreateTaskTool {
    store: Arc<MetaStore>,
    kind: TaskKind,
}

#[async_trait]
impl Tool for CreateTaskTool {
    fn name(&self) -> &'static str {
        match self.kind {
            TaskKind::Human => "create_human_task",
            TaskKind::Agent => "create_agent_task",
        }
    }

    fn description(&self) -> &'static str {
        match self.kind {
            TaskKind::Human => {
                "Create a task for a human on the shared board, optionally with a todo checklist."
            }
            TaskKind::Agent => {
                "Create a task for an agent on the shared board, optionally with a todo checklist."
            }
        }
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "title": { "type": "string" },
                "description": { "type": "string" },
                "assignee": { "type": "string" },
                "todos": {
                    "type": "array",
                    "items": { "type": "string" },
                    "description": "Initial checklist items, in order"
                }
            },
            "required": ["title"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let title = require_str(&args, "title", self.name())?;
        let task = self
            .store
            .create_task(
                self.kind,
                title,
                optional_str(&args, "description"),
                optional_str(&args, "assignee"),
            )
            .await?;

        let mut todos = Vec::new();
        if let Some(items) = args.get("todos").and_then(Value::as_array) {
            for item in items.iter().filter_map(Value::as_str) {
                todos.push(self.store.add_todo(&task.id, item).await?);
            }
        }
        Ok(json!({ "task": task, "todos": todos }))
    }
}

// ---------------------------------------------------------------------------
// list_human_tasks / list_agent_tasks / get_agent_task
// ---------------------------------------------------------------------------

struct ListTasksTool {
    store: Arc<MetaStore>,
    kind: TaskKind,
}

#[async_trait]
impl Tool for ListTasksTool {
    fn name(&self) -> &'static str {
        match self.kind {
            TaskKind::Human => "list_human_tasks",
            TaskKind::Agent => "list_agent_tasks",
        }
    }

    fn description(&self) -> &'static str {
        match self.kind {
            TaskKind::Human => "List all human tasks on the board with their statuses.",
            TaskKind::Agent => "List all agent tasks on the board with their statuses.",
        }
    }

    fn input_schema(&self) -> Value {
        json!({ "type": "object", "properties": {}, "additionalProperties": false })
    }

    async fn invoke(&self, _args: Value) -> Result<Value> {
        let tasks = self.store.list_tasks(self.kind).await?;
        let count = tasks.len();
        Ok(json!({ "tasks": tasks, "count": count }))
    }
}

struct GetAgentTaskTool {
    store: Arc<MetaStore>,
}

#[async_trait]
impl Tool for GetAgentTaskTool {
    fn name(&self) -> &'static str {
        "get_agent_task"
    }

    fn description(&self) -> &'static str {
        "Fetch one agent task with its todo checklist and prompt notes."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "taskId": { "type": "string" } },
            "required": ["taskId"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let task_id = require_str(&args, "taskId", self.name())?;
        let task = self
            .store
            .task(task_id)
            .await?
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;
        let todos = self.store.todos_for_task(task_id).await?;
        Ok(json!({ "task": task, "todos": todos }))
    }
}

// ---------------------------------------------------------------------------
// update_task_status / update_todo_status
// ---------------------------------------------------------------------------

struct UpdateTaskStatusTool {
    store: Arc<MetaStore>,
}

#[async_trait]
impl Tool for UpdateTaskStatusTool {
    fn name(&self) -> &'static str {
        "update_task_status"
    }

    fn description(&self) -> &'static str {
        "Move a task to a new status: open, in_progress, blocked, done, or cancelled."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": { "type": "string" },
                "status": { "type": "string", "enum": TASK_STATUSES }
            },
            "required": ["taskId", "status"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let task_id = require_str(&args, "taskId", self.name())?;
        let status = require_str(&args, "status", self.name())?;
        validate_status(self.name(), status, TASK_STATUSES)?;
        self.store.update_task_status(task_id, status).await?;
        Ok(json!({ "taskId": task_id, "status": status }))
    }
}

struct UpdateTodoStatusTool {
    store: Arc<MetaStore>,
}

#[async_trait]
impl Tool for UpdateTodoStatusTool {
    fn name(&self) -> &'static str {
        "update_todo_status"
    }

    fn description(&self) -> &'static str {
        "Move a todo checklist item to a new status: open, done, or skipped."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "todoId": { "type": "string" },
                "status": { "type": "string", "enum": TODO_STATUSES }
            },
            "required": ["todoId", "status"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let todo_id = require_str(&args, "todoId", self.name())?;
        let status = require_str(&args, "status", self.name())?;
        validate_status(self.name(), status, TODO_STATUSES)?;
        self.store.update_todo_status(todo_id, status).await?;
        Ok(json!({ "todoId": todo_id, "status": status }))
    }
}

// ---------------------------------------------------------------------------
// Prompt notes
// ---------------------------------------------------------------------------

struct AddPromptNotesTool {
    store: Arc<MetaStore>,
}

#[async_trait]
impl Tool for AddPromptNotesTool {
    fn name(&self) -> &'static str {
        "add_prompt_notes"
    }

    fn description(&self) -> &'static str {
        "Append a note line to a task's prompt notes (context carried into future agent runs)."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": { "type": "string" },
                "note": { "type": "string" }
            },
            "required": ["taskId", "note"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let task_id = require_str(&args, "taskId", self.name())?;
        let note = require_str(&args, "note", self.name())?;
        self.store.append_prompt_notes(task_id, note).await?;
        Ok(json!({ "taskId": task_id, "appended": true }))
    }
}

struct UpdatePromptNotesTool {
    store: Arc<MetaStore>,
}

#[async_trait]
impl Tool for UpdatePromptNotesTool {
    fn name(&self) -> &'static str {
        "update_prompt_notes"
    }

    fn description(&self) -> &'static str {
        "Replace a task's prompt notes wholesale."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "taskId": { "type": "string" },
                "notes": { "type": "string" }
            },
            "required": ["taskId", "notes"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let task_id = require_str(&args, "taskId", self.name())?;
        let notes = require_str(&args, "notes", self.name())?;
        self.store.set_prompt_notes(task_id, Some(notes)).await?;
        Ok(json!({ "taskId": task_id, "updated": true }))
    }
}

struct ClearPromptNotesTool {
    store: Arc<MetaStore>,
}

#[async_trait]
impl Tool for ClearPromptNotesTool {
    fn name(&self) -> &'static str {
        "clear_prompt_notes"
    }

    fn description(&self) -> &'static str {
        "Clear a task's prompt notes."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": { "taskId": { "type": "string" } },
            "required": ["taskId"]
        })
    }

    async fn invoke(&self, args: Value) -> Result<Value> {
        let task_id = require_str(&args, "taskId", self.name())?;
        self.store.set_prompt_notes(task_id, None).await?;
        Ok(json!({ "taskId": task_id, "cleared": true }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::ToolRegistry;

    async fn registry_with_store() -> (ToolRegistry, Arc<MetaStore>) {
        let store = Arc::new(MetaStore::in_memory().unwrap());
        let mut registry = ToolRegistry::new();
        register_task_tools(&mut registry, Arc::clone(&store)).unwrap();
        (registry, store)
    }

    #[tokio::test]
    async fn create_and_fetch_agent_task_with_todos() {
        let (registry, _store) = registry_with_store().await;
        let created = registry
            .execute(
                "c1",
                "create_agent_task",
                json!({ "title": "index repo", "todos": ["add folder", "scan"] }),
            )
            .await;
        assert!(!created.is_error(), "{:?}", created.error);
        let task_id = created.output.as_ref().unwrap()["task"]["id"]
            .as_str()
            .unwrap()
            .to_string();

        let fetched = registry
            .execute("c2", "get_agent_task", json!({ "taskId": task_id }))
            .await;
        let todos = fetched.output.as_ref().unwrap()["todos"].as_array().unwrap().clone();
        assert_eq!(todos.len(), 2);
        assert_eq!(todos[0]["description"], "add folder");
    }

    #[tokio::test]
    async fn status_transitions_validate_values() {
        let (registry, store) = registry_with_store().await;
        let task = store
            .create_task(TaskKind::Human, "review", None, None)
            .await
            .unwrap();

        let bad = registry
            .execute(
                "c1",
                "update_task_status",
                json!({ "taskId": task.id, "status": "flying" }),
            )
            .await;
        assert!(bad.is_error());

        let ok = registry
            .execute(
                "c2",
                "update_task_status",
                json!({ "taskId": task.id, "status": "done" }),
            )
            .await;
        assert!(!ok.is_error());
        assert_eq!(store.task(&task.id).await.unwrap().unwrap().status, "done");
    }

    #[tokio::test]
    async fn prompt_notes_lifecycle() {
        let (registry, store) = registry_with_store().await;
        let task = store
            .create_task(TaskKind::Agent, "notes", None, None)
            .await
            .unwrap();

        registry
            .execute("c1", "add_prompt_notes", json!({ "taskId": task.id, "note": "first" }))
            .await;
        registry
            .execute("c2", "add_prompt_notes", json!({ "taskId": task.id, "note": "second" }))
            .await;
        let notes = store.task(&task.id).await.unwrap().unwrap().prompt_notes.unwrap();
        assert_eq!(notes, "first\nsecond");

        registry
            .execute(
                "c3",
                "update_prompt_notes",
                json!({ "taskId": task.id, "notes": "replaced" }),
            )
            .await;
        assert_eq!(
            store.task(&task.id).await.unwrap().unwrap().prompt_notes.unwrap(),
            "replaced"
        );

        registry
            .execute("c4", "clear_prompt_notes", json!({ "taskId": task.id }))
            .await;
        assert!(store.task(&task.id).await.unwrap().unwrap().prompt_notes.is_none());
    }
}
