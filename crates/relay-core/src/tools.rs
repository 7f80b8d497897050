use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::UserId;

/// Prefix every allow-list denial reason starts with. Remediation text is
/// keyed off it.
pub const TOOL_NOT_ALLOWED_MARKER: &str = "Tool not allowed:";

/// Tools whose denial aborts the run immediately instead of being reported
/// once the engine finishes.
pub const CRITICAL_TOOLS: &[&str] = &["Task", "Read", "Write", "Edit"];

pub fn is_critical(name: &str) -> bool {
    CRITICAL_TOOLS.contains(&name)
}

/// One tool invocation streamed back by the engine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub name: String,
    #[serde(default)]
    pub input: serde_json::Value,
    #[serde(default)]
    pub validated: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub denial_reason: Option<String>,
}

impl ToolCall {
    pub fn new(name: impl Into<String>, input: serde_json::Value) -> Self {
        Self {
            name: name.into(),
            input,
            validated: false,
            denial_reason: None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "verdict", rename_all = "snake_case")]
pub enum ToolVerdict {
    Allowed,
    Denied { reason: String },
}

impl ToolVerdict {
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied {
            reason: reason.into(),
        }
    }

    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allowed)
    }
}

/// Policy check applied to every tool call before it reaches the caller.
#[async_trait]
pub trait ToolValidator: Send + Sync {
    async fn validate_tool_call(
        &self,
        name: &str,
        input: &serde_json::Value,
        working_directory: &Path,
        user_id: UserId,
    ) -> ToolVerdict;
}
