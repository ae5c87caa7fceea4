//! JSON-RPC dispatch for the four supported methods.
//!
//! Tool failures are always carried inside a successful `tools/call` result;
//! only unknown methods and unknown tools surface as protocol errors.

use std::sync::Arc;

use conductor_core::Router;
use conductor_protocol::CallToolResult;
use conductor_protocol::InitializeResult;
use conductor_protocol::JsonRpcMessage;
use conductor_protocol::JsonRpcNotification;
use conductor_protocol::JsonRpcResponse;
use conductor_protocol::MCP_PROTOCOL_VERSION;
use conductor_protocol::RequestId;
use conductor_protocol::ServerCapabilities;
use conductor_protocol::ServerInfo;
use conductor_protocol::error_codes;
use serde_json::Value;
use serde_json::json;
use tokio::sync::mpsc;
use tracing::debug;
use tracing::warn;

use crate::tools::ToolRegistry;

#[derive(Debug)]
pub enum OutgoingMessage {
    Response(JsonRpcResponse),
    Notification(JsonRpcNotification),
}

pub struct MessageProcessor {
    router: Arc<Router>,
    registry: ToolRegistry,
    outgoing: mpsc::Sender<OutgoingMessage>,
    debug: bool,
}

impl MessageProcessor {
    pub fn new(
        router: Arc<Router>,
        registry: ToolRegistry,
        outgoing: mpsc::Sender<OutgoingMessage>,
        debug: bool,
    ) -> Self {
        Self {
            router,
            registry,
            outgoing,
            debug,
        }
    }

    pub async fn process(&self, message: JsonRpcMessage) {
        let JsonRpcMessage { id, method, params } = message;
        match method.as_str() {
            "initialize" => self.handle_initialize(id).await,
            "tools/list" => self.handle_tools_list(id).await,
            "tools/call" => self.handle_tools_call(id, params).await,
            "shutdown" => self.respond(JsonRpcResponse::result(id, Value::Null)).await,
            // Client lifecycle notifications need no answer.
            "initialized" | "notifications/initialized" => {}
            other => {
                if id.is_none() {
                    debug!(method = other, "ignoring unknown notification");
                    return;
                }
                self.respond(JsonRpcResponse::error(
                    id,
                    error_codes::METHOD_NOT_FOUND,
                    format!("Method not found: {other}"),
                ))
                .await;
            }
        }
    }

    async fn handle_initialize(&self, id: Option<RequestId>) {
        let result = InitializeResult {
            protocol_version: MCP_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities { tools: json!({}) },
            server_info: ServerInfo {
                name: crate::SERVER_NAME.to_string(),
                version: crate::server_version().to_string(),
            },
        };
        match serde_json::to_value(result) {
            Ok(value) => self.respond(JsonRpcResponse::result(id, value)).await,
            Err(e) => {
                self.respond(JsonRpcResponse::error(
                    id,
                    error_codes::INTERNAL_ERROR,
                    e.to_string(),
                ))
                .await;
            }
        }
        // The handshake notification follows the reply, never precedes it.
        tokio::task::yield_now().await;
        self.notify("notifications/initialized", None).await;
    }

    async fn handle_tools_list(&self, id: Option<RequestId>) {
        let tools = self.registry.descriptions();
        self.respond(JsonRpcResponse::result(id, json!({ "tools": tools })))
            .await;
    }

    async fn handle_tools_call(&self, id: Option<RequestId>, params: Option<Value>) {
        let params = params.unwrap_or(Value::Null);
        let Some(name) = params.get("name").and_then(Value::as_str) else {
            self.respond(JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                "tools/call requires a tool name",
            ))
            .await;
            return;
        };
        let Some(tool) = self.registry.get(name) else {
            self.respond(JsonRpcResponse::error(
                id,
                error_codes::INVALID_PARAMS,
                format!("Unknown tool: {name}"),
            ))
            .await;
            return;
        };

        let mut arguments = params.get("arguments").cloned().unwrap_or(json!({}));
        if tool.injects_orchestration()
            && let Some(ctx) = self.router.orchestration_context()
        {
            augment_orchestration(&ctx, name, &mut arguments);
        }

        let payload = match tool.call(&self.router, arguments).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!(tool = name, error = %e, "tool call failed");
                if self.debug {
                    self.notify(
                        "console",
                        Some(json!({
                            "level": "error",
                            "message": format!("{name} failed: {e}"),
                        })),
                    )
                    .await;
                }
                json!({
                    "ok": false,
                    "code": 1,
                    "stdout": "",
                    "stderr": format!("{name} failed: {e}"),
                    "working_dir": "",
                })
            }
        };

        let text = if self.debug {
            serde_json::to_string_pretty(&payload).unwrap_or_else(|_| payload.to_string())
        } else {
            payload.to_string()
        };
        match serde_json::to_value(CallToolResult::text(text)) {
            Ok(value) => self.respond(JsonRpcResponse::result(id, value)).await,
            Err(e) => {
                self.respond(JsonRpcResponse::error(
                    id,
                    error_codes::INTERNAL_ERROR,
                    e.to_string(),
                ))
                .await;
            }
        }
    }

    async fn respond(&self, response: JsonRpcResponse) {
        if self
            .outgoing
            .send(OutgoingMessage::Response(response))
            .await
            .is_err()
        {
            warn!("outgoing channel closed; dropping response");
        }
    }

    async fn notify(&self, method: &str, params: Option<Value>) {
        let notification = JsonRpcNotification::new(method, params);
        if self
            .outgoing
            .send(OutgoingMessage::Notification(notification))
            .await
            .is_err()
        {
            debug!("outgoing channel closed; dropping notification");
        }
    }
}

/// Fills token and request_id on behalf of tasks spawned by an in-flight
/// orchestrator run. Caller-supplied non-empty values always win. Batch
/// calls get the token at the top level and the request id per item; the
/// legacy single-item batch shape (no `items` array) is treated exactly
/// like a plain delegate call.
fn augment_orchestration(
    ctx: &conductor_core::router::OrchestrationContext,
    tool_name: &str,
    arguments: &mut Value,
) {
    let Some(obj) = arguments.as_object_mut() else {
        return;
    };
    fill_if_absent(obj, "token", &ctx.token);
    if tool_name == "delegate_batch"
        && let Some(items) = obj.get_mut("items").and_then(Value::as_array_mut)
    {
        for item in items {
            if let Some(item) = item.as_object_mut() {
                fill_if_absent(item, "request_id", &ctx.request_id);
            }
        }
    } else {
        fill_if_absent(obj, "request_id", &ctx.request_id);
    }
}

fn fill_if_absent(obj: &mut serde_json::Map<String, Value>, key: &str, value: &str) {
    let present = obj
        .get(key)
        .and_then(Value::as_str)
        .is_some_and(|v| !v.is_empty());
    if !present {
        obj.insert(key.to_string(), Value::String(value.to_string()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conductor_core::router::OrchestrationContext;
    use pretty_assertions::assert_eq;

    fn ctx() -> OrchestrationContext {
        OrchestrationContext {
            token: "tok".to_string(),
            request_id: "req-1".to_string(),
        }
    }

    #[test]
    fn delegate_gets_token_and_request_id_filled() {
        let mut args = json!({ "agent": "security", "task": "scan" });
        augment_orchestration(&ctx(), "delegate", &mut args);
        assert_eq!(args["token"], json!("tok"));
        assert_eq!(args["request_id"], json!("req-1"));
    }

    #[test]
    fn caller_supplied_values_are_not_overwritten() {
        let mut args = json!({
            "agent": "security",
            "task": "scan",
            "token": "theirs",
            "request_id": "req-9",
        });
        augment_orchestration(&ctx(), "delegate", &mut args);
        assert_eq!(args["token"], json!("theirs"));
        assert_eq!(args["request_id"], json!("req-9"));
        // Empty strings count as absent.
        let mut args = json!({ "agent": "a", "task": "t", "token": "" });
        augment_orchestration(&ctx(), "delegate", &mut args);
        assert_eq!(args["token"], json!("tok"));
    }

    #[test]
    fn batch_items_each_get_a_request_id() {
        let mut args = json!({
            "items": [
                { "agent": "security", "task": "scan" },
                { "agent": "debugger", "task": "run", "request_id": "req-7" },
            ],
        });
        augment_orchestration(&ctx(), "delegate_batch", &mut args);
        assert_eq!(args["token"], json!("tok"));
        assert_eq!(args["items"][0]["request_id"], json!("req-1"));
        assert_eq!(args["items"][1]["request_id"], json!("req-7"));
        assert!(args.get("request_id").is_none());
    }

    #[test]
    fn legacy_single_item_batch_is_augmented_like_delegate() {
        let mut args = json!({ "agent": "security", "task": "scan" });
        augment_orchestration(&ctx(), "delegate_batch", &mut args);
        assert_eq!(args["token"], json!("tok"));
        assert_eq!(args["request_id"], json!("req-1"));
    }
}
