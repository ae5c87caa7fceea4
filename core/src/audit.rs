//! Append-only audit stream: one JSON object per lifecycle event, written to
//! `orchestration/<request_id>/request.log.jsonl`.
//!
//! Appends are best effort. When the filesystem misbehaves the lines are
//! cached in memory and flushed on the next successful append, with a single
//! degradation notice sent through the notifier.

use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Instant;

use crate::ledger::now_rfc3339;
use crate::ledger::request_dir;

/// Sink for server-initiated notifications (plan updates, console lines).
pub type Notifier = dyn Fn(&str, serde_json::Value) + Send + Sync;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventKind {
    RequestStarted,
    StepStarted,
    StepUpdate,
    StepCompleted,
    StepError,
    RequestCompleted,
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub ts: String,
    pub run_id: String,
    pub event: AuditEventKind,
    pub agent: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_total: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_succeeded: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps_failed: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elapsed_ms: Option<u64>,
}

impl AuditEvent {
    pub fn new(run_id: &str, event: AuditEventKind, agent: &str) -> Self {
        Self {
            ts: now_rfc3339(),
            run_id: run_id.to_string(),
            event,
            agent: agent.to_string(),
            step_id: None,
            name: None,
            output_summary: None,
            error: None,
            steps_total: None,
            steps_succeeded: None,
            steps_failed: None,
            elapsed_ms: None,
        }
    }

    pub fn step(mut self, step_id: &str, name: &str) -> Self {
        self.step_id = Some(step_id.to_string());
        self.name = Some(name.to_string());
        self
    }

    pub fn summary(mut self, text: impl Into<String>) -> Self {
        self.output_summary = Some(text.into());
        self
    }

    pub fn error_message(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StepOutcome {
    InProgress,
    Completed,
    Errored,
}

struct StepState {
    id: String,
    name: String,
    outcome: StepOutcome,
}

struct RunState {
    dir: PathBuf,
    steps: Vec<StepState>,
    cache: Vec<String>,
    degraded: bool,
    start: Instant,
}

/// Tracks active runs and writes their audit streams. One instance per
/// server; no global state.
#[derive(Default)]
pub struct AuditLog {
    runs: Mutex<HashMap<String, RunState>>,
}

impl AuditLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the event and, when a notifier is given, emits plan/console
    /// notifications mirroring the run's step list.
    pub fn record(&self, base: &Path, mut event: AuditEvent, notify: Option<&Notifier>) {
        let mut runs = self.runs.lock().unwrap_or_else(|e| e.into_inner());
        if event.event == AuditEventKind::RequestStarted {
            let dir = request_dir(base, &event.run_id);
            let _ = fs::create_dir_all(&dir);
            runs.insert(
                event.run_id.clone(),
                RunState {
                    dir,
                    steps: Vec::new(),
                    cache: Vec::new(),
                    degraded: false,
                    start: Instant::now(),
                },
            );
        }
        let Some(state) = runs.get_mut(&event.run_id) else {
            return;
        };

        match event.event {
            AuditEventKind::StepStarted => {
                // A new step implicitly completes any still-in-progress one.
                for step in &mut state.steps {
                    if step.outcome == StepOutcome::InProgress {
                        step.outcome = StepOutcome::Completed;
                    }
                }
                if let (Some(id), Some(name)) = (&event.step_id, &event.name) {
                    state.steps.push(StepState {
                        id: id.clone(),
                        name: name.clone(),
                        outcome: StepOutcome::InProgress,
                    });
                }
            }
            AuditEventKind::StepCompleted => {
                if let Some(id) = &event.step_id
                    && let Some(step) = state.steps.iter_mut().find(|s| &s.id == id)
                {
                    step.outcome = StepOutcome::Completed;
                }
            }
            AuditEventKind::StepError => {
                if let Some(id) = &event.step_id
                    && let Some(step) = state.steps.iter_mut().find(|s| &s.id == id)
                {
                    step.outcome = StepOutcome::Errored;
                }
            }
            AuditEventKind::RequestCompleted => {
                event.steps_total.get_or_insert(state.steps.len());
                event.steps_succeeded.get_or_insert(
                    state
                        .steps
                        .iter()
                        .filter(|s| s.outcome == StepOutcome::Completed)
                        .count(),
                );
                event.steps_failed.get_or_insert(
                    state
                        .steps
                        .iter()
                        .filter(|s| s.outcome == StepOutcome::Errored)
                        .count(),
                );
                event
                    .elapsed_ms
                    .get_or_insert(state.start.elapsed().as_millis() as u64);
            }
            _ => {}
        }

        let line = match serde_json::to_string(&event) {
            Ok(body) => format!("{body}\n"),
            Err(_) => return,
        };
        let log_path = state.dir.join("request.log.jsonl");
        let appended = append_line(&log_path, &state.cache, &line);
        match appended {
            Ok(()) => {
                state.cache.clear();
                state.degraded = false;
            }
            Err(_) => {
                state.cache.push(line);
                if !state.degraded {
                    if let Some(notify) = notify {
                        notify(
                            "console",
                            serde_json::json!({ "text": "logging degraded; caching locally" }),
                        );
                    }
                    state.degraded = true;
                }
            }
        }

        if let Some(notify) = notify {
            match event.event {
                AuditEventKind::StepStarted
                | AuditEventKind::StepCompleted
                | AuditEventKind::StepError
                | AuditEventKind::RequestCompleted => {
                    let steps: Vec<String> = state
                        .steps
                        .iter()
                        .enumerate()
                        .map(|(idx, s)| {
                            let status = match s.outcome {
                                StepOutcome::InProgress => "in_progress",
                                StepOutcome::Completed => "completed",
                                StepOutcome::Errored => "error",
                            };
                            format!("{}. {} [{status}]", idx + 1, s.name)
                        })
                        .collect();
                    notify("update_plan", serde_json::json!({ "steps": steps }));
                }
                AuditEventKind::StepUpdate => {
                    if let Some(summary) = &event.output_summary {
                        let text: String = summary.chars().take(120).collect();
                        notify("console", serde_json::json!({ "text": text }));
                    }
                }
                _ => {}
            }
        }

        if event.event == AuditEventKind::RequestCompleted {
            runs.remove(&event.run_id);
        }
    }
}

/// Flushes any cached lines first so the stream stays ordered, then appends
/// the new line.
fn append_line(path: &Path, cache: &[String], line: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for cached in cache {
        file.write_all(cached.as_bytes())?;
    }
    file.write_all(line.as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn start(log: &AuditLog, base: &Path, run: &str) {
        log.record(
            base,
            AuditEvent::new(run, AuditEventKind::RequestStarted, "orchestrator"),
            None,
        );
    }

    #[test]
    fn writes_one_json_object_per_line() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new();
        start(&log, dir.path(), "run-1");
        log.record(
            dir.path(),
            AuditEvent::new("run-1", AuditEventKind::StepStarted, "security").step("step-1", "scan"),
            None,
        );
        log.record(
            dir.path(),
            AuditEvent::new("run-1", AuditEventKind::StepCompleted, "security")
                .step("step-1", "scan"),
            None,
        );
        log.record(
            dir.path(),
            AuditEvent::new("run-1", AuditEventKind::RequestCompleted, "orchestrator"),
            None,
        );
        let raw =
            fs::read_to_string(request_dir(dir.path(), "run-1").join("request.log.jsonl")).unwrap();
        let lines: Vec<&str> = raw.lines().collect();
        assert_eq!(lines.len(), 4);
        let last: serde_json::Value = serde_json::from_str(lines[3]).unwrap();
        assert_eq!(last["event"], "request_completed");
        assert_eq!(last["steps_total"], 1);
        assert_eq!(last["steps_succeeded"], 1);
        assert_eq!(last["steps_failed"], 0);
        assert!(last["elapsed_ms"].is_u64());
    }

    #[test]
    fn step_error_counts_as_failed() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new();
        start(&log, dir.path(), "run-2");
        log.record(
            dir.path(),
            AuditEvent::new("run-2", AuditEventKind::StepStarted, "debugger").step("step-1", "run"),
            None,
        );
        log.record(
            dir.path(),
            AuditEvent::new("run-2", AuditEventKind::StepError, "debugger")
                .step("step-1", "run")
                .error_message("exit 127"),
            None,
        );
        log.record(
            dir.path(),
            AuditEvent::new("run-2", AuditEventKind::RequestCompleted, "orchestrator"),
            None,
        );
        let raw =
            fs::read_to_string(request_dir(dir.path(), "run-2").join("request.log.jsonl")).unwrap();
        let last: serde_json::Value = serde_json::from_str(raw.lines().last().unwrap()).unwrap();
        assert_eq!(last["steps_failed"], 1);
    }

    #[test]
    fn step_update_is_logged_and_sent_to_the_console() {
        use std::sync::Arc;
        use std::sync::Mutex as StdMutex;

        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new();
        start(&log, dir.path(), "run-3");

        let seen: Arc<StdMutex<Vec<(String, serde_json::Value)>>> =
            Arc::new(StdMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let notify = move |method: &str, params: serde_json::Value| {
            sink.lock().unwrap().push((method.to_string(), params));
        };
        log.record(
            dir.path(),
            AuditEvent::new("run-3", AuditEventKind::StepUpdate, "orchestrator")
                .summary("Plan looks good."),
            Some(&notify),
        );

        let raw =
            fs::read_to_string(request_dir(dir.path(), "run-3").join("request.log.jsonl")).unwrap();
        let last: serde_json::Value = serde_json::from_str(raw.lines().last().unwrap()).unwrap();
        assert_eq!(last["event"], "step_update");
        assert_eq!(last["output_summary"], "Plan looks good.");

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "console");
        assert_eq!(seen[0].1["text"], "Plan looks good.");
    }

    #[test]
    fn events_for_unknown_run_are_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let log = AuditLog::new();
        log.record(
            dir.path(),
            AuditEvent::new("ghost", AuditEventKind::StepStarted, "x").step("step-1", "s"),
            None,
        );
        assert!(!request_dir(dir.path(), "ghost").join("request.log.jsonl").exists());
    }
}
