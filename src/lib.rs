// Core modules
pub mod config;
pub mod error;
pub mod identifier;
pub mod types;

// Session pipeline
pub mod patcher;
pub mod relay;
pub mod request;
pub mod runner;
pub mod schedule;

pub mod api;
pub mod orchestrator;
pub mod server;

// Re-export key types and functions
pub use config::PanelConfig;
pub use error::{PanelError, PanelResult};
pub use identifier::{IdentifierError, Msin, next_identifier};
pub use orchestrator::{BatchSummary, RunPhase, RunSnapshot, RunState, SessionOrchestrator};
pub use request::{BatchRequest, RunMode};

use anyhow::Result;
use std::sync::Arc;

/// Convenience function to build the orchestrator from a loaded config.
///
/// Wires the YAML patcher, the child-process runner and the configured
/// schedule source.
pub fn create_orchestrator(config: &PanelConfig) -> Result<Arc<SessionOrchestrator>> {
    Ok(SessionOrchestrator::from_config(config)?)
}
