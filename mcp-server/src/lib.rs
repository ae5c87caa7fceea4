//! Stdio MCP server exposing the conductor delegation tools.
//!
//! The binary reads JSON-RPC from stdin, answers on stdout, and keeps every
//! diagnostic on stderr so the wire stays clean.

pub mod message_processor;
pub mod tools;
pub mod transport;

pub const SERVER_NAME: &str = "conductor";

pub fn server_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}
