//! # relay-orchestrator
//!
//! Runs chat commands against the agent engine: picks a channel and falls
//! back once on transient failure, validates streamed tool calls, and keeps
//! session identity consistent with the store.

pub mod config;
pub mod error;
pub mod fallback;
pub mod monitor;
pub mod orchestrator;
pub mod remediation;
pub mod validation;

pub use config::OrchestratorConfig;
pub use error::OrchestratorError;
pub use fallback::BackendRouter;
pub use monitor::{ToolMonitor, ToolStats, UserToolUsage};
pub use orchestrator::{CommandOrchestrator, RelayOrchestrator, UserSummary};
pub use validation::{CallValidationState, ValidatingSink};
