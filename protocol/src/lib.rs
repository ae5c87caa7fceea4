//! Wire types shared between the conductor server and its clients.
//!
//! The server speaks a narrow slice of MCP over JSON-RPC 2.0: `initialize`,
//! `tools/list`, `tools/call`, and `shutdown`. These types model exactly that
//! slice; anything richer belongs to the caller.

mod jsonrpc;
mod mcp;

pub use jsonrpc::JSONRPC_VERSION;
pub use jsonrpc::JsonRpcError;
pub use jsonrpc::JsonRpcMessage;
pub use jsonrpc::JsonRpcNotification;
pub use jsonrpc::JsonRpcResponse;
pub use jsonrpc::RequestId;
pub use jsonrpc::error_codes;
pub use mcp::CallToolResult;
pub use mcp::ContentBlock;
pub use mcp::InitializeResult;
pub use mcp::MCP_PROTOCOL_VERSION;
pub use mcp::ServerCapabilities;
pub use mcp::ServerInfo;
pub use mcp::ToolDescription;
