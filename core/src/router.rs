//! Delegation router: validates delegate requests, gates recursion behind the
//! per-process orchestrator token, reroutes unauthenticated requests through
//! the orchestrator, and drives the ledger, marker extractor, and executor.

use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::info;

use crate::agents;
use crate::agents::AgentSpec;
use crate::agents::ApprovalPolicy;
use crate::agents::ORCHESTRATOR_AGENT;
use crate::agents::SandboxMode;
use crate::audit::AuditEvent;
use crate::audit::AuditEventKind;
use crate::audit::AuditLog;
use crate::config::Config;
use crate::exec;
use crate::ledger;
use crate::ledger::LedgerStore;
use crate::ledger::StepDraft;
use crate::ledger::StepPatch;
use crate::ledger::StepStatus;
use crate::markers;
use crate::mirror;

const ENVELOPE_OPEN: &str = "[[ORCH-ENVELOPE]]";
const ENVELOPE_CLOSE: &str = "[[/ORCH-ENVELOPE]]";
const PERSONA_FILE: &str = "AGENTS.md";
const TITLE_MAX: usize = 60;
const SUMMARY_MAX: usize = 400;
const MAX_NEXT_ACTIONS: usize = 5;

/// Arguments of the `delegate` tool.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DelegateParams {
    pub agent: String,
    pub task: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    #[serde(default)]
    pub mirror_repo: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub profile: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub persona: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_policy: Option<ApprovalPolicy>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sandbox_mode: Option<SandboxMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl DelegateParams {
    /// Validates the raw tool arguments, collecting every violated
    /// constraint rather than stopping at the first.
    pub fn parse(value: &Value) -> Result<Self, Vec<String>> {
        let mut violations = Vec::new();
        let Some(obj) = value.as_object() else {
            return Err(vec!["arguments must be an object".to_string()]);
        };

        let get_string = |violations: &mut Vec<String>, key: &str| -> Option<String> {
            match obj.get(key) {
                None | Some(Value::Null) => None,
                Some(Value::String(s)) => Some(s.clone()),
                Some(_) => {
                    violations.push(format!("{key} must be a string"));
                    None
                }
            }
        };

        let agent = get_string(&mut violations, "agent").unwrap_or_default();
        if agent.is_empty() {
            violations.push("agent name is required".to_string());
        }
        let task = get_string(&mut violations, "task").unwrap_or_default();
        if task.is_empty() {
            violations.push("task is required".to_string());
        }
        let cwd = get_string(&mut violations, "cwd");
        let profile = get_string(&mut violations, "profile");
        let persona = get_string(&mut violations, "persona");
        let token = get_string(&mut violations, "token");
        let request_id = get_string(&mut violations, "request_id");

        let mirror_repo = match obj.get("mirror_repo") {
            None | Some(Value::Null) => false,
            Some(Value::Bool(b)) => *b,
            Some(_) => {
                violations.push("mirror_repo must be a boolean".to_string());
                false
            }
        };

        let approval_policy = match obj.get("approval_policy") {
            None | Some(Value::Null) => None,
            Some(v) => match serde_json::from_value::<ApprovalPolicy>(v.clone()) {
                Ok(p) => Some(p),
                Err(_) => {
                    violations.push(
                        "approval_policy must be one of never, on-request, on-failure, untrusted"
                            .to_string(),
                    );
                    None
                }
            },
        };
        let sandbox_mode = match obj.get("sandbox_mode") {
            None | Some(Value::Null) => None,
            Some(v) => match serde_json::from_value::<SandboxMode>(v.clone()) {
                Ok(m) => Some(m),
                Err(_) => {
                    violations.push(
                        "sandbox_mode must be one of read-only, workspace-write, danger-full-access"
                            .to_string(),
                    );
                    None
                }
            },
        };

        if violations.is_empty() {
            Ok(Self {
                agent,
                task,
                cwd,
                mirror_repo,
                profile,
                persona,
                approval_policy,
                sandbox_mode,
                token,
                request_id,
            })
        } else {
            Err(violations)
        }
    }
}

/// Structured result of a delegate call. Failures are always expressed here,
/// never as protocol errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateOutcome {
    pub ok: bool,
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
    pub working_dir: String,
}

impl DelegateOutcome {
    pub fn failure(code: i32, stderr: impl Into<String>, working_dir: impl Into<String>) -> Self {
        Self {
            ok: false,
            code,
            stdout: String::new(),
            stderr: stderr.into(),
            working_dir: working_dir.into(),
        }
    }
}

/// Routing decision for one delegate invocation. Computed without side
/// effects so the state machine is testable in isolation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Token matches: execute as the resolved agent, logging a ledger step
    /// when part of an orchestration.
    Direct,
    /// Fresh top-level request: wrap the task in an orchestrator envelope
    /// and re-enter with `agent = orchestrator`.
    Reroute,
    /// Orchestrator invoked without a request id: mint one and initialize
    /// the ledger.
    Bootstrap,
    /// Orchestrator resuming a known request id.
    Resume,
    /// Unknown agent with no inline persona/profile and no authorization.
    RejectUnknownAgent,
    /// Token mismatch on a request that claims to be an orchestrated step.
    RejectUnauthorized,
}

/// Pure routing decision. `known` is registry membership, `inline` whether
/// persona and profile were both supplied.
pub fn plan_route(
    is_orchestrator: bool,
    known: bool,
    inline: bool,
    token_ok: bool,
    has_request_id: bool,
) -> Route {
    if is_orchestrator {
        return if has_request_id {
            Route::Resume
        } else {
            Route::Bootstrap
        };
    }
    // Unknown-agent errors must never be masked by rerouting.
    if !known && !inline && !token_ok && !has_request_id {
        return Route::RejectUnknownAgent;
    }
    if token_ok {
        return Route::Direct;
    }
    if has_request_id {
        return Route::RejectUnauthorized;
    }
    Route::Reroute
}

/// Builds the wire text handed to the orchestrator: routing metadata between
/// envelope markers, a blank line, then the original task verbatim.
pub fn orchestrator_envelope(params: &DelegateParams, request_id: &str) -> String {
    let meta = serde_json::json!({
        "request_id": request_id,
        "requested_agent": params.agent,
        "cwd": params.cwd,
        "mirror_repo": params.mirror_repo,
        "profile": params.profile,
        "has_persona": params.persona.is_some(),
    });
    let body = serde_json::to_string_pretty(&meta).unwrap_or_else(|_| meta.to_string());
    format!("{ENVELOPE_OPEN}\n{body}\n{ENVELOPE_CLOSE}\n\n{}", params.task)
}

/// Token and request id of the orchestration currently in flight, used by
/// the dispatcher to augment nested delegate calls.
#[derive(Debug, Clone)]
pub struct OrchestrationContext {
    pub token: String,
    pub request_id: String,
}

pub struct Router {
    config: Config,
    /// Random secret minted once per process; read-only afterwards. Lets the
    /// router recognize delegate calls spawned by its own orchestrator runs.
    token: String,
    /// Request id of the orchestrator execution currently in flight, if any.
    current_request: RwLock<Option<String>>,
    ledger: LedgerStore,
    audit: AuditLog,
    notifier: Option<Arc<crate::audit::Notifier>>,
}

fn new_token() -> String {
    use rand::Rng;
    let bytes: [u8; 24] = rand::rng().random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

fn short_title(text: &str) -> String {
    let first_line = text.lines().next().unwrap_or("").trim();
    let mut title: String = first_line.chars().take(TITLE_MAX).collect();
    if first_line.chars().count() > TITLE_MAX {
        title.push('…');
    }
    title
}

fn first_chunk(text: &str) -> Option<String> {
    let chunk = text
        .split("\n\n")
        .map(str::trim)
        .find(|chunk| !chunk.is_empty())?;
    let mut out: String = chunk.chars().take(SUMMARY_MAX).collect();
    if chunk.chars().count() > SUMMARY_MAX {
        out.push('…');
    }
    Some(out)
}

/// Extracts up to five leading bullet or numbered lines as next actions.
fn extract_next_actions(stdout: &str) -> Vec<String> {
    let mut actions = Vec::new();
    for line in stdout.lines() {
        let line = line.trim();
        let action = line
            .strip_prefix("- ")
            .or_else(|| line.strip_prefix("* "))
            .or_else(|| {
                let digits = line.chars().take_while(char::is_ascii_digit).count();
                if digits > 0 {
                    let rest = &line[digits..];
                    rest.strip_prefix(". ").or_else(|| rest.strip_prefix(") "))
                } else {
                    None
                }
            });
        if let Some(action) = action {
            let action = action.trim();
            if !action.is_empty() {
                actions.push(action.to_string());
                if actions.len() >= MAX_NEXT_ACTIONS {
                    break;
                }
            }
        }
    }
    actions
}

fn dir_is_writable(dir: &Path) -> bool {
    let probe = dir.join(".conductor-write-probe");
    match fs::write(&probe, b"") {
        Ok(()) => {
            let _ = fs::remove_file(&probe);
            true
        }
        Err(_) => false,
    }
}

impl Router {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            token: new_token(),
            current_request: RwLock::new(None),
            ledger: LedgerStore::new(),
            audit: AuditLog::new(),
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: Arc<crate::audit::Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Exposed for tests that exercise the token gate directly.
    pub fn token(&self) -> &str {
        &self.token
    }

    /// The in-flight orchestration, if any; used by the dispatcher to inject
    /// token/request_id into nested delegate calls.
    pub fn orchestration_context(&self) -> Option<OrchestrationContext> {
        let current = self
            .current_request
            .read()
            .unwrap_or_else(|e| e.into_inner());
        current.as_ref().map(|request_id| OrchestrationContext {
            token: self.token.clone(),
            request_id: request_id.clone(),
        })
    }

    fn set_current_request(&self, value: Option<String>) -> Option<String> {
        let mut current = self
            .current_request
            .write()
            .unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, value)
    }

    fn registry(&self) -> HashMap<String, AgentSpec> {
        let mut registry = agents::builtin_agents();
        let dir = agents::resolve_agents_dir(self.config.agents_dir.as_deref(), &self.config.base_cwd);
        registry.extend(agents::load_agents_from_dir(dir.as_deref()));
        registry
    }

    fn base_cwd(&self, params: &DelegateParams) -> PathBuf {
        params
            .cwd
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| self.config.base_cwd.clone())
    }

    fn notify_ref(&self) -> Option<&crate::audit::Notifier> {
        self.notifier.as_deref()
    }

    /// Entry point for the `delegate` tool.
    ///
    /// Ledger I/O failures on the critical path propagate as errors; the
    /// dispatcher converts them to a structured failure payload.
    pub async fn delegate(&self, arguments: &Value) -> anyhow::Result<DelegateOutcome> {
        let params = match DelegateParams::parse(arguments) {
            Ok(params) => params,
            Err(violations) => {
                return Ok(DelegateOutcome::failure(
                    2,
                    format!("Invalid delegate arguments: {}", violations.join("; ")),
                    "",
                ));
            }
        };
        self.delegate_params(params).await
    }

    /// Drives the routing state machine as an explicit loop. Each iteration
    /// either terminates with an outcome or rewrites the params and
    /// re-enters.
    pub async fn delegate_params(&self, mut params: DelegateParams) -> anyhow::Result<DelegateOutcome> {
        loop {
            let registry = self.registry();
            let known = registry.contains_key(&params.agent);
            let inline = params.persona.is_some() && params.profile.is_some();
            let token_ok = params.token.as_deref() == Some(self.token.as_str());
            let route = plan_route(
                params.agent == ORCHESTRATOR_AGENT,
                known,
                inline,
                token_ok,
                params.request_id.is_some(),
            );
            match route {
                Route::RejectUnknownAgent => {
                    return Ok(DelegateOutcome::failure(
                        2,
                        format!(
                            "Unknown agent: {}. Create agents/{}.md or pass persona+profile inline.",
                            params.agent, params.agent
                        ),
                        "",
                    ));
                }
                Route::RejectUnauthorized => {
                    return Ok(DelegateOutcome::failure(
                        1,
                        "Only orchestrator can delegate within an active orchestration; \
                         the orchestrator token is required.",
                        "",
                    ));
                }
                Route::Reroute => {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    info!(request_id, requested_agent = %params.agent, "rerouting through orchestrator");
                    self.bootstrap_ledger(&params, &request_id).await?;
                    params = DelegateParams {
                        agent: ORCHESTRATOR_AGENT.to_string(),
                        task: orchestrator_envelope(&params, &request_id),
                        request_id: Some(request_id),
                        persona: None,
                        profile: None,
                        token: None,
                        ..params
                    };
                }
                Route::Bootstrap => {
                    let request_id = uuid::Uuid::new_v4().to_string();
                    self.bootstrap_ledger(&params, &request_id).await?;
                    params.task = orchestrator_envelope(&params, &request_id);
                    params.request_id = Some(request_id);
                }
                Route::Resume => {
                    self.prepare_request_dir(&mut params)?;
                    return self.execute(params, &registry, token_ok).await;
                }
                Route::Direct => {
                    return self.execute(params, &registry, token_ok).await;
                }
            }
        }
    }

    async fn bootstrap_ledger(&self, params: &DelegateParams, request_id: &str) -> anyhow::Result<()> {
        let base = self.base_cwd(params);
        let created = self
            .ledger
            .ensure_todo(request_id, &base, &params.task, &params.agent)
            .await?;
        if created {
            self.audit.record(
                &base,
                AuditEvent::new(request_id, AuditEventKind::RequestStarted, &params.agent)
                    .summary(short_title(&params.task)),
                self.notify_ref(),
            );
        }
        Ok(())
    }

    /// Ensures the per-request working directory exists, substituting a
    /// directory under the system temp root when the chosen one is not
    /// writable. The substitution is recorded in the params used for
    /// execution.
    fn prepare_request_dir(&self, params: &mut DelegateParams) -> anyhow::Result<()> {
        let request_id = params.request_id.clone().unwrap_or_default();
        let base = self.base_cwd(params);
        let request_dir = ledger::request_dir(&base, &request_id);
        let usable = fs::create_dir_all(&request_dir).is_ok() && dir_is_writable(&request_dir);
        if usable {
            return Ok(());
        }
        let fallback = std::env::temp_dir().join("conductor").join(&request_id);
        fs::create_dir_all(ledger::request_dir(&fallback, &request_id))?;
        info!(
            request_id,
            fallback = %fallback.display(),
            "working directory not writable; using temp fallback"
        );
        params.cwd = Some(fallback.display().to_string());
        Ok(())
    }

    async fn execute(
        &self,
        params: DelegateParams,
        registry: &HashMap<String, AgentSpec>,
        token_ok: bool,
    ) -> anyhow::Result<DelegateOutcome> {
        let spec = match registry.get(&params.agent) {
            Some(spec) => {
                let mut spec = spec.clone();
                if spec.approval_policy.is_none() {
                    spec.approval_policy = params.approval_policy;
                }
                if spec.sandbox_mode.is_none() {
                    spec.sandbox_mode = params.sandbox_mode;
                }
                spec
            }
            None => match (&params.persona, &params.profile) {
                (Some(persona), Some(profile)) => AgentSpec {
                    profile: profile.clone(),
                    persona: persona.clone(),
                    approval_policy: params.approval_policy,
                    sandbox_mode: params.sandbox_mode,
                },
                _ => {
                    return Ok(DelegateOutcome::failure(
                        2,
                        format!(
                            "Unknown agent: {}. Create agents/{}.md or pass persona+profile inline.",
                            params.agent, params.agent
                        ),
                        "",
                    ));
                }
            },
        };

        let cwd = self.base_cwd(&params);
        let workdir = match self.prepare_workdir(&params.agent, &spec) {
            Ok(dir) => dir,
            Err(e) => {
                return Ok(DelegateOutcome::failure(
                    1,
                    format!("Failed to prepare agent workdir: {e}"),
                    "",
                ));
            }
        };
        let workdir_display = workdir.display().to_string();

        if params.mirror_repo
            && let Err(e) = mirror::mirror_tree(&cwd, &workdir, &self.config.base_cwd, self.config.mirror_everything)
        {
            return Ok(DelegateOutcome::failure(
                1,
                format!(
                    "Failed to mirror repo into temp dir: {e}. \
                     Consider disabling mirroring or using a git worktree."
                ),
                workdir_display,
            ));
        }

        let is_orchestrator = params.agent == ORCHESTRATOR_AGENT;
        let logged_step = !is_orchestrator && token_ok && params.request_id.is_some();

        // Append the running step before execution so a crash leaves a trace.
        let step_id = if logged_step {
            let request_id = params.request_id.clone().unwrap_or_default();
            let title = short_title(&params.task);
            let step = self
                .ledger
                .with_todo(&request_id, &cwd, |todo| {
                    ledger::append_step(
                        todo,
                        StepDraft {
                            title: title.clone(),
                            agent: params.agent.clone(),
                            status: Some(StepStatus::Running),
                            prompt: Some(params.task.clone()),
                            started_at: Some(ledger::now_rfc3339()),
                            ..Default::default()
                        },
                    )
                })
                .await?;
            self.audit.record(
                &cwd,
                AuditEvent::new(&request_id, AuditEventKind::StepStarted, &params.agent)
                    .step(&step.id, &title),
                self.notify_ref(),
            );
            Some(step.id)
        } else {
            None
        };

        let exec_cwd = if params.mirror_repo { workdir.clone() } else { cwd.clone() };
        let args = vec![
            "--profile".to_string(),
            spec.profile.clone(),
            params.task.clone(),
        ];

        let result = if is_orchestrator {
            let request_id = params.request_id.clone().unwrap_or_default();
            let previous = self.set_current_request(Some(request_id));
            let result = exec::run_task(
                &self.config.task_exec,
                &args,
                &exec_cwd,
                self.config.exec_timeout,
            )
            .await;
            self.set_current_request(previous);
            result
        } else {
            exec::run_task(
                &self.config.task_exec,
                &args,
                &exec_cwd,
                self.config.exec_timeout,
            )
            .await
        };

        if is_orchestrator {
            self.record_orchestrator_output(&params, &cwd, &result).await;
        }

        if let Some(step_id) = step_id {
            self.record_step_output(&params, &cwd, &step_id, &result)
                .await?;
        }

        Ok(DelegateOutcome {
            ok: result.code == 0 && !result.stdout.trim().is_empty(),
            code: result.code,
            stdout: result.stdout.trim().to_string(),
            stderr: result.stderr.trim().to_string(),
            working_dir: workdir_display,
        })
    }

    /// Creates the ephemeral working directory and materializes the persona
    /// into it under a fixed filename.
    fn prepare_workdir(&self, agent: &str, spec: &AgentSpec) -> std::io::Result<PathBuf> {
        let dir = tempfile::Builder::new()
            .prefix(&format!("conductor-{agent}-"))
            .tempdir()?
            .keep();
        let persona = format!(
            "# Persona: {agent}\n\n{}\n\nOperating guide:\n\
             - Respect the project's constraints and existing style.\n\
             - Prefer minimal, incremental changes with clear tests.\n\
             - State assumptions; call out tradeoffs and alternatives.\n",
            spec.persona
        );
        fs::write(dir.join(PERSONA_FILE), persona)?;
        Ok(dir)
    }

    /// Persists summary and next actions derived from orchestrator stdout,
    /// then merges any inline markers as ledger steps. Best effort.
    async fn record_orchestrator_output(
        &self,
        params: &DelegateParams,
        base: &Path,
        result: &exec::ExecResult,
    ) {
        let Some(request_id) = params.request_id.as_deref() else {
            return;
        };
        let summary = first_chunk(&result.stdout)
            .or_else(|| first_chunk(&result.stderr))
            .unwrap_or_default();
        let next_actions = extract_next_actions(&result.stdout);
        let persisted = self
            .ledger
            .with_todo(request_id, base, |todo| {
                todo.summary = Some(summary.clone());
                todo.next_actions = next_actions.clone();
            })
            .await;
        if let Err(e) = persisted {
            tracing::debug!(request_id, error = %e, "failed to persist orchestrator summary");
        }
        if !summary.is_empty() {
            self.audit.record(
                base,
                AuditEvent::new(request_id, AuditEventKind::StepUpdate, ORCHESTRATOR_AGENT)
                    .summary(summary.clone()),
                self.notify_ref(),
            );
        }
        markers::apply_markers_to_todo(&self.ledger, request_id, base, &result.stdout).await;
        self.audit.record(
            base,
            AuditEvent::new(request_id, AuditEventKind::RequestCompleted, ORCHESTRATOR_AGENT)
                .summary(summary),
            self.notify_ref(),
        );
        self.ledger.release(request_id);
    }

    /// Persists per-step artifacts and marks the step done or blocked.
    async fn record_step_output(
        &self,
        params: &DelegateParams,
        base: &Path,
        step_id: &str,
        result: &exec::ExecResult,
    ) -> anyhow::Result<()> {
        let request_id = params.request_id.clone().unwrap_or_default();
        let step_dir = ledger::step_dir(base, &request_id, step_id);
        fs::create_dir_all(&step_dir)?;
        let prompt_path = step_dir.join("prompt.txt");
        let stdout_path = step_dir.join("stdout.txt");
        let stderr_path = step_dir.join("stderr.txt");
        fs::write(&prompt_path, &params.task)?;
        fs::write(&stdout_path, &result.stdout)?;
        fs::write(&stderr_path, &result.stderr)?;

        let status = if result.code == 0 {
            StepStatus::Done
        } else {
            StepStatus::Blocked
        };
        self.ledger
            .with_todo(&request_id, base, |todo| {
                ledger::update_step(
                    todo,
                    step_id,
                    StepPatch {
                        status: Some(status),
                        stdout_path: Some(stdout_path.display().to_string()),
                        stderr_path: Some(stderr_path.display().to_string()),
                        prompt_path: Some(prompt_path.display().to_string()),
                        ended_at: Some(ledger::now_rfc3339()),
                        ..Default::default()
                    },
                );
                todo.recompute_status();
            })
            .await?;

        let event = if result.code == 0 {
            AuditEvent::new(&request_id, AuditEventKind::StepCompleted, &params.agent)
                .step(step_id, &short_title(&params.task))
        } else {
            AuditEvent::new(&request_id, AuditEventKind::StepError, &params.agent)
                .step(step_id, &short_title(&params.task))
                .error_message(format!("exit {}", result.code))
        };
        self.audit.record(base, event, self.notify_ref());
        Ok(())
    }

    /// Batch delegation: every item runs concurrently; results preserve
    /// input order and failures never escape as errors.
    pub async fn delegate_batch(&self, arguments: &Value) -> Vec<DelegateOutcome> {
        let (items, batch_token) = match arguments.get("items") {
            Some(Value::Array(items)) => {
                let token = arguments
                    .get("token")
                    .and_then(Value::as_str)
                    .map(ToString::to_string);
                (items.clone(), token)
            }
            // Legacy single-item shape: the whole object is one delegate call.
            _ => (vec![arguments.clone()], None),
        };

        let futures = items.iter().map(|item| {
            let mut item = item.clone();
            if let (Some(obj), Some(token)) = (item.as_object_mut(), &batch_token)
                && !obj
                    .get("token")
                    .and_then(Value::as_str)
                    .is_some_and(|t| !t.is_empty())
            {
                obj.insert("token".to_string(), Value::String(token.clone()));
            }
            async move {
                match self.delegate(&item).await {
                    Ok(outcome) => outcome,
                    Err(e) => DelegateOutcome::failure(1, format!("delegate failed: {e}"), ""),
                }
            }
        });
        futures::future::join_all(futures).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn plan_route_rejects_unknown_unauthenticated_agents() {
        let route = plan_route(false, false, false, false, false);
        assert_eq!(route, Route::RejectUnknownAgent);
    }

    #[test]
    fn plan_route_rejects_impersonated_steps() {
        // request_id present but token wrong: never reroute, never mask.
        assert_eq!(plan_route(false, true, false, false, true), Route::RejectUnauthorized);
        assert_eq!(plan_route(false, false, false, false, true), Route::RejectUnauthorized);
    }

    #[test]
    fn plan_route_reroutes_fresh_requests() {
        assert_eq!(plan_route(false, true, false, false, false), Route::Reroute);
        // Inline persona/profile also reroutes when unauthenticated.
        assert_eq!(plan_route(false, false, true, false, false), Route::Reroute);
    }

    #[test]
    fn plan_route_direct_with_matching_token() {
        assert_eq!(plan_route(false, true, false, true, false), Route::Direct);
        assert_eq!(plan_route(false, true, false, true, true), Route::Direct);
    }

    #[test]
    fn plan_route_orchestrator_bootstrap_and_resume() {
        assert_eq!(plan_route(true, true, false, false, false), Route::Bootstrap);
        assert_eq!(plan_route(true, true, false, false, true), Route::Resume);
    }

    #[test]
    fn parse_collects_all_violations() {
        let err = DelegateParams::parse(&serde_json::json!({
            "agent": "",
            "mirror_repo": "yes",
            "approval_policy": "sometimes"
        }))
        .unwrap_err();
        assert_eq!(err.len(), 4);
        assert!(err.iter().any(|v| v.contains("agent name is required")));
        assert!(err.iter().any(|v| v.contains("task is required")));
        assert!(err.iter().any(|v| v.contains("mirror_repo")));
        assert!(err.iter().any(|v| v.contains("approval_policy")));
    }

    #[test]
    fn parse_defaults_mirror_repo() {
        let params =
            DelegateParams::parse(&serde_json::json!({ "agent": "reviewer", "task": "test" }))
                .unwrap();
        assert_eq!(params.agent, "reviewer");
        assert!(!params.mirror_repo);
    }

    #[test]
    fn envelope_wraps_task_with_metadata() {
        let params = DelegateParams {
            agent: "security".to_string(),
            task: "scan the tree".to_string(),
            cwd: Some("/work".to_string()),
            ..Default::default()
        };
        let envelope = orchestrator_envelope(&params, "req-1");
        assert!(envelope.starts_with(ENVELOPE_OPEN));
        assert!(envelope.contains("\"requested_agent\": \"security\""));
        assert!(envelope.contains(ENVELOPE_CLOSE));
        assert!(envelope.ends_with("\n\nscan the tree"));
    }

    #[test]
    fn next_actions_extraction_stops_at_five() {
        let stdout = "Summary first.\n\n- one\n- two\n* three\n1. four\n2) five\n- six\n";
        let actions = extract_next_actions(stdout);
        assert_eq!(actions, vec!["one", "two", "three", "four", "five"]);
    }

    #[test]
    fn summary_prefers_stdout_first_chunk() {
        assert_eq!(first_chunk("\n\n  hello world \n\nrest"), Some("hello world".to_string()));
        assert_eq!(first_chunk("   \n \n"), None);
    }
}
