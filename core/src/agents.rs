//! Agent registry: built-in personas plus user-defined agents loaded from a
//! directory of `.md` (frontmatter + body) or `.json` files.

use serde::Deserialize;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;

pub const ORCHESTRATOR_AGENT: &str = "orchestrator";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApprovalPolicy {
    Never,
    OnRequest,
    OnFailure,
    Untrusted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SandboxMode {
    ReadOnly,
    WorkspaceWrite,
    DangerFullAccess,
}

/// Normalized agent definition. Produced by the registry, consumed (never
/// mutated) by the router.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSpec {
    pub profile: String,
    pub persona: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<SandboxMode>,
}

/// One row of `list_agents` output.
#[derive(Debug, Clone, Serialize)]
pub struct AgentRow {
    pub name: String,
    pub profile: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<SandboxMode>,
    pub source: &'static str,
}

fn builtin(profile: &str, persona_lines: &[&str]) -> AgentSpec {
    AgentSpec {
        profile: profile.to_string(),
        persona: persona_lines.join("\n"),
        approval_policy: None,
        sandbox_mode: None,
    }
}

/// Built-in personas. User agents with the same name shadow these.
pub fn builtin_agents() -> HashMap<String, AgentSpec> {
    let mut out = HashMap::new();
    out.insert(
        "reviewer".to_string(),
        builtin(
            "reviewer",
            &[
                "You are a senior code reviewer focused on clarity and maintainability.",
                "Goals: readability, naming, structure, tests, error handling, security, performance.",
                "Method:",
                "- Skim repo structure; identify affected modules.",
                "- Review diffs and hotspots; note risks and complexity.",
                "- Propose concrete, minimal patches with rationale.",
                "Output:",
                "- A prioritized list of issues (critical first).",
                "- Unified diffs or file-level patches for the top items.",
                "- Clear next steps to land improvements safely.",
            ],
        ),
    );
    out.insert(
        "debugger".to_string(),
        builtin(
            "debugger",
            &[
                "You are a root-cause debugger. You prioritize reproduction and minimal fixes.",
                "Method:",
                "- Reproduce: identify failing tests or real-world triggers.",
                "- Isolate: bisect, add focused assertions or logs, minimize scope.",
                "- Fix: implement the smallest change that resolves the root cause.",
                "- Verify: add or adjust tests; ensure no regressions.",
                "Output:",
                "- Root cause summary with evidence (stack traces, repro steps).",
                "- The minimal patch (diff) and why it is safe.",
                "- Prevention notes (tests, lint rules, invariants).",
            ],
        ),
    );
    out.insert(
        "security".to_string(),
        builtin(
            "security",
            &[
                "You are a pragmatic security auditor for application code.",
                "Scope: secret exposure, unsafe shell usage, SSRF, path traversal, deserialization,",
                "dependency risks, auth logic gaps, and obvious injection vectors.",
                "Method:",
                "- Map entry points and trust boundaries; prefer grep plus codeflow inspection.",
                "- Flag risky APIs and patterns; propose safer alternatives.",
                "- Balance risk against effort and suggest incremental hardening steps.",
                "Output:",
                "- Findings with severity, impact, and exploitability.",
                "- Concrete code changes or configs to mitigate.",
                "- Policy and ops recommendations where relevant.",
            ],
        ),
    );
    out.insert(
        ORCHESTRATOR_AGENT.to_string(),
        builtin(
            ORCHESTRATOR_AGENT,
            &[
                "You are the orchestrator. You own the overall plan and delegate focused",
                "sub-tasks to specialist agents through the delegate tool, passing the token",
                "and request_id you were given.",
                "Emit progress as single-line markers so it lands in the audit ledger:",
                "- [[ORCH-THINK]] {\"text\":\"...\"} for reasoning checkpoints.",
                "- [[ORCH-DECISION]] {\"text\":\"...\"} when you commit to a course of action.",
                "- [[ORCH-NOTE]] free text for anything else worth recording.",
                "Finish with a short summary followed by a bullet list of next actions.",
            ],
        ),
    );
    out
}

/// Where an on-disk agent definition came from. One parsing strategy per
/// variant, both normalized to [`AgentSpec`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AgentSource {
    Markdown,
    Json,
}

impl AgentSource {
    fn of(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("md") => Some(Self::Markdown),
            Some("json") => Some(Self::Json),
            _ => None,
        }
    }
}

/// Raw shape of a `.json` agent file. `persona_file` is resolved relative to
/// the agents directory.
#[derive(Debug, Deserialize)]
struct JsonAgentFile {
    #[serde(default)]
    profile: Option<String>,
    #[serde(default)]
    persona: Option<String>,
    #[serde(default, alias = "personaFile")]
    persona_file: Option<String>,
    #[serde(default)]
    approval_policy: Option<String>,
    #[serde(default)]
    sandbox_mode: Option<String>,
}

fn parse_approval_policy(raw: &str) -> Option<ApprovalPolicy> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_string())).ok()
}

fn parse_sandbox_mode(raw: &str) -> Option<SandboxMode> {
    serde_json::from_value(serde_json::Value::String(raw.trim().to_string())).ok()
}

/// Splits a markdown document into frontmatter attributes and body. Tolerates
/// CRLF line endings; a document without a leading `---` has no attributes.
pub fn parse_frontmatter(doc: &str) -> (HashMap<String, String>, String) {
    let mut attrs = HashMap::new();
    if !doc.starts_with("---") {
        return (attrs, doc.to_string());
    }
    let Some(end) = doc.find("\n---") else {
        return (attrs, doc.to_string());
    };
    let raw = doc[3..end].trim();
    let mut body = &doc[end + 4..];
    body = body.strip_prefix('\r').unwrap_or(body);
    body = body.trim_start_matches(['\r', '\n', ' ', '\t']);
    for line in raw.lines() {
        let line = line.trim_end_matches('\r');
        if let Some((key, value)) = line.split_once(':') {
            let key = key.trim();
            let value = value.trim();
            if !key.is_empty() && !value.is_empty() {
                attrs.insert(key.to_string(), value.to_string());
            }
        }
    }
    (attrs, body.to_string())
}

fn load_markdown_agent(raw: &str) -> AgentSpec {
    let (attrs, body) = parse_frontmatter(raw);
    let profile = attrs
        .get("profile")
        .or_else(|| attrs.get("agent_profile"))
        .map(|p| p.trim().to_string())
        .filter(|p| !p.is_empty())
        .unwrap_or_else(|| "reviewer".to_string());
    // Invalid policy values are dropped, not fatal.
    let approval_policy = attrs
        .get("approval_policy")
        .and_then(|v| parse_approval_policy(v));
    let sandbox_mode = attrs.get("sandbox_mode").and_then(|v| parse_sandbox_mode(v));
    AgentSpec {
        profile,
        persona: body.trim().to_string(),
        approval_policy,
        sandbox_mode,
    }
}

fn load_json_agent(dir: &Path, raw: &str) -> Option<AgentSpec> {
    let file: JsonAgentFile = serde_json::from_str(raw).ok()?;
    let profile = file.profile?.trim().to_string();
    let persona = match file.persona {
        Some(p) => Some(p),
        None => file
            .persona_file
            .and_then(|name| fs::read_to_string(dir.join(name)).ok()),
    }?;
    if profile.is_empty() || persona.trim().is_empty() {
        return None;
    }
    Some(AgentSpec {
        profile,
        persona,
        approval_policy: file.approval_policy.as_deref().and_then(parse_approval_policy),
        sandbox_mode: file.sandbox_mode.as_deref().and_then(parse_sandbox_mode),
    })
}

/// Loads user agents from `dir`. Unreadable or malformed entries are skipped;
/// a missing directory yields an empty registry.
pub fn load_agents_from_dir(dir: Option<&Path>) -> HashMap<String, AgentSpec> {
    let mut out = HashMap::new();
    let Some(dir) = dir else {
        return out;
    };
    let Ok(entries) = fs::read_dir(dir) else {
        return out;
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if path.is_dir() {
            continue;
        }
        let Some(source) = AgentSource::of(&path) else {
            continue;
        };
        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        let Ok(raw) = fs::read_to_string(&path) else {
            continue;
        };
        let spec = match source {
            AgentSource::Markdown => Some(load_markdown_agent(&raw)),
            AgentSource::Json => load_json_agent(dir, &raw),
        };
        if let Some(spec) = spec {
            out.insert(name.to_string(), spec);
        }
    }
    out
}

/// Resolves the agents directory: explicit flag wins, then the environment,
/// then conventional project-relative defaults.
pub fn resolve_agents_dir(explicit: Option<&Path>, base: &Path) -> Option<PathBuf> {
    if let Some(dir) = explicit {
        return Some(dir.to_path_buf());
    }
    if let Ok(env_dir) = std::env::var("CONDUCTOR_AGENTS_DIR")
        && !env_dir.is_empty()
    {
        return Some(PathBuf::from(env_dir));
    }
    let candidates = [base.join("agents"), base.join(".conductor").join("agents")];
    candidates.into_iter().find(|c| c.exists())
}

// ---- validate_agents ----

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum IssueLevel {
    Error,
    Warning,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationIssue {
    pub level: IssueLevel,
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<&'static str>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileReport {
    pub file: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent_name: Option<String>,
    pub ok: bool,
    pub errors: usize,
    pub warnings: usize,
    pub issues: Vec<ValidationIssue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationSummary {
    pub files: usize,
    pub ok: usize,
    pub with_errors: usize,
    pub with_warnings: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub ok: bool,
    pub summary: ValidationSummary,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub files: Vec<FileReport>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<String>,
}

fn issue(
    level: IssueLevel,
    code: &'static str,
    field: Option<&'static str>,
    message: impl Into<String>,
) -> ValidationIssue {
    ValidationIssue {
        level,
        code,
        message: message.into(),
        field,
    }
}

fn empty_summary() -> ValidationSummary {
    ValidationSummary {
        files: 0,
        ok: 0,
        with_errors: 0,
        with_warnings: 0,
    }
}

fn validate_markdown(raw: &str, issues: &mut Vec<ValidationIssue>) {
    let (attrs, body) = parse_frontmatter(raw);
    let profile = attrs
        .get("profile")
        .or_else(|| attrs.get("agent_profile"))
        .map(|p| p.trim())
        .unwrap_or("");
    if profile.is_empty() {
        issues.push(issue(
            IssueLevel::Warning,
            "missing_profile",
            Some("profile"),
            "profile missing; loader defaults to reviewer",
        ));
    }
    if let Some(ap) = attrs.get("approval_policy")
        && parse_approval_policy(ap).is_none()
    {
        issues.push(issue(
            IssueLevel::Error,
            "invalid_approval_policy",
            Some("approval_policy"),
            format!("Invalid approval_policy: {ap}"),
        ));
    }
    if let Some(sm) = attrs.get("sandbox_mode")
        && parse_sandbox_mode(sm).is_none()
    {
        issues.push(issue(
            IssueLevel::Error,
            "invalid_sandbox_mode",
            Some("sandbox_mode"),
            format!("Invalid sandbox_mode: {sm}"),
        ));
    }
    if body.trim().is_empty() {
        issues.push(issue(
            IssueLevel::Error,
            "empty_persona",
            Some("persona"),
            "Persona body is empty",
        ));
    }
}

fn validate_json(dir: &Path, raw: &str, issues: &mut Vec<ValidationIssue>) {
    let file: JsonAgentFile = match serde_json::from_str(raw) {
        Ok(file) => file,
        Err(e) => {
            issues.push(issue(IssueLevel::Error, "json_parse_error", None, e.to_string()));
            return;
        }
    };
    if file.profile.as_deref().map(str::trim).unwrap_or("").is_empty() {
        issues.push(issue(
            IssueLevel::Error,
            "missing_profile",
            Some("profile"),
            "profile is required",
        ));
    }
    if let Some(ap) = file.approval_policy.as_deref()
        && parse_approval_policy(ap).is_none()
    {
        issues.push(issue(
            IssueLevel::Error,
            "invalid_approval_policy",
            Some("approval_policy"),
            format!("Invalid approval_policy: {ap}"),
        ));
    }
    if let Some(sm) = file.sandbox_mode.as_deref()
        && parse_sandbox_mode(sm).is_none()
    {
        issues.push(issue(
            IssueLevel::Error,
            "invalid_sandbox_mode",
            Some("sandbox_mode"),
            format!("Invalid sandbox_mode: {sm}"),
        ));
    }
    let mut persona = file.persona;
    if persona.is_none()
        && let Some(name) = file.persona_file
    {
        let path = dir.join(&name);
        if path.exists() {
            persona = fs::read_to_string(&path).ok();
        } else {
            issues.push(issue(
                IssueLevel::Error,
                "persona_file_missing",
                Some("persona_file"),
                format!("persona file not found: {}", path.display()),
            ));
        }
    }
    if persona.as_deref().map(str::trim).unwrap_or("").is_empty() {
        issues.push(issue(
            IssueLevel::Error,
            "missing_persona",
            Some("persona"),
            "persona or persona_file is required and must be non-empty",
        ));
    }
}

/// Validates every agent file in `dir` and reports issues per file.
pub fn validate_agents(dir: Option<&Path>) -> ValidationReport {
    let Some(dir) = dir else {
        return ValidationReport {
            ok: false,
            summary: empty_summary(),
            error: Some(
                "No agents directory configured. Use --agents-dir, CONDUCTOR_AGENTS_DIR, or create ./agents"
                    .to_string(),
            ),
            files: Vec::new(),
            dir: None,
        };
    };
    if !dir.exists() {
        return ValidationReport {
            ok: false,
            summary: empty_summary(),
            error: Some(format!("Agents directory not found: {}", dir.display())),
            files: Vec::new(),
            dir: Some(dir.display().to_string()),
        };
    }

    let mut files = Vec::new();
    let mut entries: Vec<_> = fs::read_dir(dir)
        .map(|rd| rd.flatten().map(|e| e.path()).collect())
        .unwrap_or_default();
    entries.sort();
    for path in entries {
        if path.is_dir() {
            continue;
        }
        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
            .to_string();
        let agent_name = path
            .file_stem()
            .and_then(|s| s.to_str())
            .map(ToString::to_string);
        let mut issues = Vec::new();
        match AgentSource::of(&path) {
            Some(source) => match fs::read_to_string(&path) {
                Ok(raw) => match source {
                    AgentSource::Markdown => validate_markdown(&raw, &mut issues),
                    AgentSource::Json => validate_json(dir, &raw, &mut issues),
                },
                Err(e) => {
                    issues.push(issue(IssueLevel::Error, "unreadable", None, e.to_string()));
                }
            },
            None => {
                issues.push(issue(
                    IssueLevel::Warning,
                    "unsupported_extension",
                    None,
                    format!("Skipping unsupported file: {file_name}"),
                ));
            }
        }
        let errors = issues.iter().filter(|i| i.level == IssueLevel::Error).count();
        let warnings = issues
            .iter()
            .filter(|i| i.level == IssueLevel::Warning)
            .count();
        files.push(FileReport {
            file: file_name,
            agent_name,
            ok: errors == 0,
            errors,
            warnings,
            issues,
        });
    }

    let summary = ValidationSummary {
        files: files.len(),
        ok: files.iter().filter(|f| f.ok).count(),
        with_errors: files.iter().filter(|f| f.errors > 0).count(),
        with_warnings: files.iter().filter(|f| f.warnings > 0).count(),
    };
    ValidationReport {
        ok: summary.with_errors == 0,
        summary,
        error: None,
        files,
        dir: Some(dir.display().to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn frontmatter_with_crlf_line_endings() {
        let doc = "---\r\nprofile: debugger\r\napproval_policy: on-request\r\n---\r\nYou are a performance expert.";
        let spec = load_markdown_agent(doc);
        assert_eq!(spec.profile, "debugger");
        assert_eq!(spec.approval_policy, Some(ApprovalPolicy::OnRequest));
        assert_eq!(spec.persona, "You are a performance expert.");
    }

    #[test]
    fn invalid_policy_values_are_dropped() {
        let doc = "---\nprofile: reviewer\napproval_policy: unknown\nsandbox_mode: not-a-mode\n---\nPersona text.";
        let spec = load_markdown_agent(doc);
        assert_eq!(spec.profile, "reviewer");
        assert_eq!(spec.approval_policy, None);
        assert_eq!(spec.sandbox_mode, None);
    }

    #[test]
    fn missing_profile_defaults_to_reviewer() {
        let spec = load_markdown_agent("Just a persona body.");
        assert_eq!(spec.profile, "reviewer");
        assert_eq!(spec.persona, "Just a persona body.");
    }

    #[test]
    fn json_agent_with_persona_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("body.md"), "Persona from file.").unwrap();
        let raw = r#"{"profile":"debugger","persona_file":"body.md","sandbox_mode":"workspace-write"}"#;
        let spec = load_json_agent(dir.path(), raw).expect("agent should load");
        assert_eq!(spec.profile, "debugger");
        assert_eq!(spec.persona, "Persona from file.");
        assert_eq!(spec.sandbox_mode, Some(SandboxMode::WorkspaceWrite));
    }

    #[test]
    fn load_dir_skips_bad_entries() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("perf.md"),
            "---\nprofile: debugger\n---\nPerf persona.",
        )
        .unwrap();
        std::fs::write(dir.path().join("broken.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        let reg = load_agents_from_dir(Some(dir.path()));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg["perf"].profile, "debugger");
    }

    #[test]
    fn validate_reports_errors_and_warnings_per_file() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ok.md"), "---\nprofile: reviewer\n---\nPersona ok.").unwrap();
        std::fs::write(
            dir.path().join("bad.json"),
            r#"{"profile":"debugger","approval_policy":"nope"}"#,
        )
        .unwrap();
        std::fs::write(dir.path().join("notes.txt"), "hello").unwrap();
        let report = validate_agents(Some(dir.path()));
        assert_eq!(report.summary.files, 3);
        let bad = report.files.iter().find(|f| f.file == "bad.json").unwrap();
        assert!(bad.errors > 0);
        let notes = report.files.iter().find(|f| f.file == "notes.txt").unwrap();
        assert!(notes.warnings > 0);
        assert!(!report.ok);
    }

    #[test]
    fn validate_without_dir_is_an_error_report() {
        let report = validate_agents(None);
        assert!(!report.ok);
        assert!(report.error.is_some());
        assert_eq!(report.summary.files, 0);
    }

    #[test]
    fn builtins_include_orchestrator() {
        let reg = builtin_agents();
        assert!(reg.contains_key(ORCHESTRATOR_AGENT));
        assert!(reg.contains_key("reviewer"));
        assert!(reg.contains_key("debugger"));
        assert!(reg.contains_key("security"));
    }
}
