//! Per-request orchestration ledger.
//!
//! Each delegation request gets one `Todo` persisted at
//! `orchestration/<request_id>/todo.json`, with per-step artifacts under
//! `orchestration/<request_id>/steps/<step_id>/`. Saves go through a
//! temporary sibling file renamed into place so a reader never observes a
//! partially written ledger.

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;

#[derive(Debug, Error)]
pub enum LedgerError {
    /// A missing ledger for a known request id indicates programmer or
    /// filesystem error; callers must not swallow this.
    #[error("failed to read todo for request {request_id}: {source}")]
    Read {
        request_id: String,
        #[source]
        source: std::io::Error,
    },
    #[error("todo for request {request_id} is unparsable: {source}")]
    Parse {
        request_id: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to write todo for request {request_id}: {source}")]
    Write {
        request_id: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Queued,
    Running,
    Done,
    Blocked,
    Canceled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    Active,
    Done,
    Canceled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    pub title: String,
    pub agent: String,
    pub status: StepStatus,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub prompt: Option<String>,
    pub prompt_path: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub notes: Option<String>,
}

/// Fields a caller supplies when appending a step; everything else is
/// defaulted.
#[derive(Debug, Clone, Default)]
pub struct StepDraft {
    pub title: String,
    pub agent: String,
    pub status: Option<StepStatus>,
    pub prompt: Option<String>,
    pub started_at: Option<String>,
    pub ended_at: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StepPatch {
    pub status: Option<StepStatus>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub prompt_path: Option<String>,
    pub ended_at: Option<String>,
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Todo {
    pub request_id: String,
    pub created_at: String,
    pub user_prompt: String,
    pub requested_agent: String,
    pub status: TodoStatus,
    pub steps: Vec<Step>,
    pub next_actions: Vec<String>,
    pub summary: Option<String>,
}

impl Todo {
    pub fn new(request_id: String, user_prompt: String, requested_agent: String) -> Self {
        Self {
            request_id,
            created_at: now_rfc3339(),
            user_prompt,
            requested_agent,
            status: TodoStatus::Active,
            steps: Vec::new(),
            next_actions: Vec::new(),
            summary: None,
        }
    }

    /// Active iff some step is still running; `canceled` is only ever set
    /// explicitly via [`finalize`].
    pub fn recompute_status(&mut self) {
        if self.status == TodoStatus::Canceled {
            return;
        }
        let any_running = self.steps.iter().any(|s| s.status == StepStatus::Running);
        self.status = if any_running {
            TodoStatus::Active
        } else {
            TodoStatus::Done
        };
    }
}

pub fn now_rfc3339() -> String {
    chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true)
}

pub fn request_dir(base: &Path, request_id: &str) -> PathBuf {
    base.join("orchestration").join(request_id)
}

pub fn todo_path(base: &Path, request_id: &str) -> PathBuf {
    request_dir(base, request_id).join("todo.json")
}

pub fn step_dir(base: &Path, request_id: &str, step_id: &str) -> PathBuf {
    request_dir(base, request_id).join("steps").join(step_id)
}

pub fn load_todo(request_id: &str, base: &Path) -> Result<Todo, LedgerError> {
    let path = todo_path(base, request_id);
    let raw = fs::read_to_string(&path).map_err(|source| LedgerError::Read {
        request_id: request_id.to_string(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|source| LedgerError::Parse {
        request_id: request_id.to_string(),
        source,
    })
}

/// Serializes the todo to a temporary sibling and renames it over the real
/// path. On the same filesystem the rename is atomic.
pub fn save_todo(todo: &Todo, base: &Path) -> Result<(), LedgerError> {
    let path = todo_path(base, &todo.request_id);
    let write = || -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        let body = serde_json::to_string_pretty(todo).map_err(std::io::Error::other)?;
        fs::write(&tmp, body)?;
        fs::rename(&tmp, &path)
    };
    write().map_err(|source| LedgerError::Write {
        request_id: todo.request_id.clone(),
        source,
    })
}

/// Appends a step with the next sequential id (`step-<n>`). Sequential ids
/// are unique only under single-writer discipline; see [`LedgerStore`].
pub fn append_step(todo: &mut Todo, draft: StepDraft) -> Step {
    let step = Step {
        id: format!("step-{}", todo.steps.len() + 1),
        title: draft.title,
        agent: draft.agent,
        status: draft.status.unwrap_or(StepStatus::Queued),
        stdout_path: None,
        stderr_path: None,
        prompt: draft.prompt,
        prompt_path: None,
        started_at: draft.started_at,
        ended_at: draft.ended_at,
        notes: draft.notes,
    };
    todo.steps.push(step.clone());
    step
}

/// Merges patch fields into the matching step; a missing id is a no-op.
pub fn update_step(todo: &mut Todo, id: &str, patch: StepPatch) {
    let Some(step) = todo.steps.iter_mut().find(|s| s.id == id) else {
        return;
    };
    if let Some(status) = patch.status {
        step.status = status;
    }
    if patch.stdout_path.is_some() {
        step.stdout_path = patch.stdout_path;
    }
    if patch.stderr_path.is_some() {
        step.stderr_path = patch.stderr_path;
    }
    if patch.prompt_path.is_some() {
        step.prompt_path = patch.prompt_path;
    }
    if patch.ended_at.is_some() {
        step.ended_at = patch.ended_at;
    }
    if patch.notes.is_some() {
        step.notes = patch.notes;
    }
}

pub fn finalize(todo: &mut Todo, summary: String, status: TodoStatus) {
    todo.status = status;
    todo.summary = Some(summary);
}

/// Serializes ledger mutations per request id.
///
/// The on-disk ledger itself carries no lock; without this, concurrent steps
/// sharing a request id would race load-modify-save and lose updates.
#[derive(Default)]
pub struct LedgerStore {
    locks: std::sync::Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl LedgerStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_for(&self, request_id: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks
            .entry(request_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    /// Runs `mutate` under the per-request writer lock, persisting the todo
    /// afterwards. The closure sees the freshly loaded ledger.
    pub async fn with_todo<T>(
        &self,
        request_id: &str,
        base: &Path,
        mutate: impl FnOnce(&mut Todo) -> T,
    ) -> Result<T, LedgerError> {
        let lock = self.lock_for(request_id);
        let _guard = lock.lock().await;
        let mut todo = load_todo(request_id, base)?;
        let out = mutate(&mut todo);
        save_todo(&todo, base)?;
        Ok(out)
    }

    /// Drops the lock entry for a completed request so the map does not grow
    /// unbounded in a long-running server. In-flight holders keep their Arc;
    /// a later call for the same id simply mints a fresh lock.
    pub fn release(&self, request_id: &str) {
        let mut locks = self.locks.lock().unwrap_or_else(|e| e.into_inner());
        locks.remove(request_id);
    }

    /// Creates the ledger for a request if it does not exist yet; a second
    /// bootstrap with the same id reuses the existing file.
    pub async fn ensure_todo(
        &self,
        request_id: &str,
        base: &Path,
        user_prompt: &str,
        requested_agent: &str,
    ) -> Result<bool, LedgerError> {
        let lock = self.lock_for(request_id);
        let _guard = lock.lock().await;
        if todo_path(base, request_id).exists() {
            return Ok(false);
        }
        let todo = Todo::new(
            request_id.to_string(),
            user_prompt.to_string(),
            requested_agent.to_string(),
        );
        save_todo(&todo, base)?;
        Ok(true)
    }
}
