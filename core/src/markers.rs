//! Structured inline markers emitted by orchestrator output.
//!
//! Three single-line forms are recognized, each matched by a literal prefix
//! at the start of the trimmed line:
//!
//! ```text
//! [[ORCH-THINK]] {"text":"..."}
//! [[ORCH-DECISION]] {"text":"..."}
//! [[ORCH-NOTE]] free text
//! ```

use serde::Deserialize;
use std::path::Path;
use tracing::debug;

use crate::agents::ORCHESTRATOR_AGENT;
use crate::ledger::LedgerStore;
use crate::ledger::StepDraft;
use crate::ledger::StepStatus;
use crate::ledger::now_rfc3339;

const THINK_PREFIX: &str = "[[ORCH-THINK]]";
const DECISION_PREFIX: &str = "[[ORCH-DECISION]]";
const NOTE_PREFIX: &str = "[[ORCH-NOTE]]";

const TITLE_MAX: usize = 60;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkerKind {
    Think,
    Decision,
    Note,
}

impl MarkerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Think => "think",
            Self::Decision => "decision",
            Self::Note => "note",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Marker {
    pub kind: MarkerKind,
    pub text: String,
}

#[derive(Debug, Deserialize)]
struct MarkerPayload {
    text: String,
}

fn parse_json_marker(kind: MarkerKind, payload: &str) -> Option<Marker> {
    // Malformed payloads are skipped, not an error.
    let payload: MarkerPayload = serde_json::from_str(payload).ok()?;
    let text = payload.text.trim().to_string();
    if text.is_empty() {
        return None;
    }
    Some(Marker { kind, text })
}

/// Scans `output` line by line and returns recognized markers in order.
pub fn parse_markers(output: &str) -> Vec<Marker> {
    let mut markers = Vec::new();
    for line in output.lines() {
        let line = line.trim();
        if let Some(rest) = line.strip_prefix(THINK_PREFIX) {
            markers.extend(parse_json_marker(MarkerKind::Think, rest.trim()));
        } else if let Some(rest) = line.strip_prefix(DECISION_PREFIX) {
            markers.extend(parse_json_marker(MarkerKind::Decision, rest.trim()));
        } else if let Some(rest) = line.strip_prefix(NOTE_PREFIX) {
            let text = rest.trim();
            if !text.is_empty() {
                markers.push(Marker {
                    kind: MarkerKind::Note,
                    text: text.to_string(),
                });
            }
        }
    }
    markers
}

fn truncate_title(text: &str) -> String {
    if text.chars().count() <= TITLE_MAX {
        return text.to_string();
    }
    let cut: String = text.chars().take(TITLE_MAX).collect();
    format!("{cut}…")
}

/// Appends one `done` step per marker found in `output` to the ledger for
/// `request_id`. Best effort: any failure is logged and swallowed.
pub async fn apply_markers_to_todo(
    store: &LedgerStore,
    request_id: &str,
    base: &Path,
    output: &str,
) {
    let markers = parse_markers(output);
    if markers.is_empty() {
        return;
    }
    let result = store
        .with_todo(request_id, base, |todo| {
            for marker in &markers {
                let ended = now_rfc3339();
                crate::ledger::append_step(
                    todo,
                    StepDraft {
                        title: format!("{}: {}", marker.kind.as_str(), truncate_title(&marker.text)),
                        agent: ORCHESTRATOR_AGENT.to_string(),
                        status: Some(StepStatus::Done),
                        notes: Some(marker.text.clone()),
                        started_at: Some(ended.clone()),
                        ended_at: Some(ended),
                        ..Default::default()
                    },
                );
            }
        })
        .await;
    if let Err(e) = result {
        debug!(request_id, error = %e, "failed to apply orchestrator markers");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_think_decision_note_in_order() {
        let out = [
            "noise before",
            r#"[[ORCH-THINK]] {"text":"consider security first"}"#,
            r#"[[ORCH-DECISION]] {"text":"delegate security + tests"}"#,
            "[[ORCH-NOTE]] kickoff batch",
            "other text",
        ]
        .join("\n");
        let markers = parse_markers(&out);
        let kinds: Vec<_> = markers.iter().map(|m| m.kind).collect();
        assert_eq!(
            kinds,
            vec![MarkerKind::Think, MarkerKind::Decision, MarkerKind::Note]
        );
        assert_eq!(markers[2].text, "kickoff batch");
    }

    #[test]
    fn malformed_json_payloads_are_skipped() {
        let out = [
            "[[ORCH-THINK]] not json",
            r#"[[ORCH-THINK]] {"text":""}"#,
            r#"[[ORCH-DECISION]] {"text":"go"}"#,
        ]
        .join("\n");
        let markers = parse_markers(&out);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].kind, MarkerKind::Decision);
        assert_eq!(markers[0].text, "go");
    }

    #[test]
    fn markers_must_start_the_trimmed_line() {
        let out = r#"prefix [[ORCH-NOTE]] not a marker"#;
        assert!(parse_markers(out).is_empty());
    }

    #[tokio::test]
    async fn applies_markers_as_done_steps() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new();
        store
            .ensure_todo("req-m", dir.path(), "plan", "reviewer")
            .await
            .unwrap();
        let out = [
            r#"[[ORCH-THINK]] {"text":"map critical paths"}"#,
            r#"[[ORCH-DECISION]] {"text":"delegate review"}"#,
        ]
        .join("\n");
        apply_markers_to_todo(&store, "req-m", dir.path(), &out).await;
        let todo = crate::ledger::load_todo("req-m", dir.path()).unwrap();
        let orch: Vec<_> = todo
            .steps
            .iter()
            .filter(|s| s.agent == ORCHESTRATOR_AGENT)
            .collect();
        assert_eq!(orch.len(), 2);
        assert!(orch[0].notes.as_deref().unwrap_or("").contains("critical paths"));
        assert_eq!(orch[0].status, StepStatus::Done);
    }

    #[tokio::test]
    async fn apply_on_missing_ledger_is_swallowed() {
        let dir = tempfile::tempdir().unwrap();
        let store = LedgerStore::new();
        apply_markers_to_todo(&store, "absent", dir.path(), "[[ORCH-NOTE]] hi").await;
    }
}
