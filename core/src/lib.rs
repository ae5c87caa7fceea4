//! Delegation and orchestration core for conductor.
//!
//! This crate holds everything behind the RPC surface: the agent registry,
//! the delegation router with its orchestrator token gate, the per-request
//! audit ledger, structured-marker extraction from orchestrator output, and
//! the sandboxed external executor.

pub mod agents;
pub mod audit;
pub mod config;
pub mod exec;
pub mod ledger;
pub mod markers;
pub mod mirror;
pub mod router;

pub use agents::AgentSpec;
pub use config::Config;
pub use router::DelegateOutcome;
pub use router::DelegateParams;
pub use router::Router;
