//! Explicit tool registry for the `tools/list` and `tools/call` surface.
//!
//! Every tool is a [`ToolHandler`] registered at startup; registration fails
//! fast on duplicate names or malformed schemas rather than at call time.

use std::collections::BTreeMap;

use anyhow::Context;
use anyhow::bail;
use async_trait::async_trait;
use conductor_core::Router;
use conductor_core::agents;
use conductor_core::agents::AgentRow;
use conductor_protocol::ToolDescription;
use serde_json::Value;
use serde_json::json;

#[async_trait]
pub trait ToolHandler: Send + Sync {
    fn name(&self) -> &'static str;
    fn description(&self) -> &'static str;
    fn input_schema(&self) -> Value;
    /// Whether the dispatcher should fill token/request_id from the
    /// orchestration currently in flight before calling.
    fn injects_orchestration(&self) -> bool {
        false
    }
    async fn call(&self, router: &Router, arguments: Value) -> anyhow::Result<Value>;
}

pub struct ToolRegistry {
    tools: Vec<Box<dyn ToolHandler>>,
}

impl ToolRegistry {
    /// Builds the default registry and validates it.
    pub fn new() -> anyhow::Result<Self> {
        Self::with_tools(vec![
            Box::new(DelegateTool),
            Box::new(DelegateBatchTool),
            Box::new(ListAgentsTool),
            Box::new(ValidateAgentsTool),
        ])
    }

    pub fn with_tools(tools: Vec<Box<dyn ToolHandler>>) -> anyhow::Result<Self> {
        let mut seen = std::collections::HashSet::new();
        for tool in &tools {
            if tool.name().is_empty() {
                bail!("tool registered with an empty name");
            }
            if !seen.insert(tool.name()) {
                bail!("duplicate tool name: {}", tool.name());
            }
            let schema = tool.input_schema();
            let is_object_schema = schema
                .get("type")
                .and_then(Value::as_str)
                .is_some_and(|t| t == "object");
            if !is_object_schema {
                bail!("tool {} has a non-object input schema", tool.name());
            }
        }
        Ok(Self { tools })
    }

    pub fn descriptions(&self) -> Vec<ToolDescription> {
        self.tools
            .iter()
            .map(|tool| ToolDescription {
                name: tool.name().to_string(),
                description: tool.description().to_string(),
                input_schema: tool.input_schema(),
            })
            .collect()
    }

    pub fn get(&self, name: &str) -> Option<&dyn ToolHandler> {
        self.tools
            .iter()
            .find(|tool| tool.name() == name)
            .map(AsRef::as_ref)
    }
}

fn delegate_properties() -> Value {
    json!({
        "agent": {
            "type": "string",
            "description": "Registered agent name, or any name when persona and profile are supplied inline"
        },
        "task": { "type": "string", "description": "Task text handed to the agent" },
        "cwd": { "type": "string", "description": "Working directory context; defaults to the server's cwd" },
        "mirror_repo": {
            "type": "boolean",
            "description": "Copy the cwd tree into the agent workspace before running"
        },
        "profile": { "type": "string", "description": "Execution profile override" },
        "persona": { "type": "string", "description": "Inline persona text overriding the registry" },
        "approval_policy": {
            "type": "string",
            "enum": ["never", "on-request", "on-failure", "untrusted"]
        },
        "sandbox_mode": {
            "type": "string",
            "enum": ["read-only", "workspace-write", "danger-full-access"]
        },
        "token": { "type": "string", "description": "Orchestrator session token" },
        "request_id": { "type": "string", "description": "Orchestration run this call belongs to" }
    })
}

pub struct DelegateTool;

#[async_trait]
impl ToolHandler for DelegateTool {
    fn name(&self) -> &'static str {
        "delegate"
    }

    fn description(&self) -> &'static str {
        "Delegate a task to a named agent persona. Fresh top-level calls are \
         routed through the orchestrator, which plans and fans out gated \
         sub-delegations."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": delegate_properties(),
            "required": ["agent", "task"],
            "additionalProperties": false
        })
    }

    fn injects_orchestration(&self) -> bool {
        true
    }

    async fn call(&self, router: &Router, arguments: Value) -> anyhow::Result<Value> {
        let outcome = router.delegate(&arguments).await?;
        serde_json::to_value(outcome).context("serialize delegate outcome")
    }
}

pub struct DelegateBatchTool;

#[async_trait]
impl ToolHandler for DelegateBatchTool {
    fn name(&self) -> &'static str {
        "delegate_batch"
    }

    fn description(&self) -> &'static str {
        "Run several delegate calls concurrently and return their outcomes in \
         input order."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "items": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": delegate_properties(),
                        "required": ["agent", "task"]
                    }
                },
                "token": {
                    "type": "string",
                    "description": "Token applied to items that carry none"
                },
                "request_id": { "type": "string" }
            },
            "additionalProperties": true
        })
    }

    fn injects_orchestration(&self) -> bool {
        true
    }

    async fn call(&self, router: &Router, arguments: Value) -> anyhow::Result<Value> {
        let outcomes = router.delegate_batch(&arguments).await;
        Ok(json!({ "results": outcomes }))
    }
}

pub struct ListAgentsTool;

#[async_trait]
impl ToolHandler for ListAgentsTool {
    fn name(&self) -> &'static str {
        "list_agents"
    }

    fn description(&self) -> &'static str {
        "List every available agent persona, built-in and user-defined."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {},
            "additionalProperties": false
        })
    }

    async fn call(&self, router: &Router, _arguments: Value) -> anyhow::Result<Value> {
        let config = router.config();
        let dir = agents::resolve_agents_dir(config.agents_dir.as_deref(), &config.base_cwd);
        let custom = agents::load_agents_from_dir(dir.as_deref());

        // BTreeMap keeps the listing sorted by name; custom agents shadow
        // built-ins of the same name.
        let mut rows: BTreeMap<String, AgentRow> = BTreeMap::new();
        for (name, spec) in agents::builtin_agents() {
            rows.insert(
                name.clone(),
                AgentRow {
                    name,
                    profile: spec.profile,
                    approval_policy: spec.approval_policy,
                    sandbox_mode: spec.sandbox_mode,
                    source: "builtin",
                },
            );
        }
        for (name, spec) in custom {
            rows.insert(
                name.clone(),
                AgentRow {
                    name,
                    profile: spec.profile,
                    approval_policy: spec.approval_policy,
                    sandbox_mode: spec.sandbox_mode,
                    source: "custom",
                },
            );
        }
        let agents: Vec<AgentRow> = rows.into_values().collect();
        Ok(json!({ "agents": agents }))
    }
}

pub struct ValidateAgentsTool;

#[async_trait]
impl ToolHandler for ValidateAgentsTool {
    fn name(&self) -> &'static str {
        "validate_agents"
    }

    fn description(&self) -> &'static str {
        "Validate agent definition files and report per-file errors and \
         warnings without aborting on the first problem."
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "dir": {
                    "type": "string",
                    "description": "Directory to validate; defaults to the configured agents directory"
                }
            },
            "additionalProperties": false
        })
    }

    async fn call(&self, router: &Router, arguments: Value) -> anyhow::Result<Value> {
        let explicit = arguments
            .get("dir")
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(std::path::PathBuf::from);
        let config = router.config();
        let dir = match explicit {
            Some(dir) => Some(dir),
            None => agents::resolve_agents_dir(config.agents_dir.as_deref(), &config.base_cwd),
        };
        let report = agents::validate_agents(dir.as_deref());
        serde_json::to_value(report).context("serialize validation report")
    }
}
