use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::ValidationError;
use crate::tools::ToolCall;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    System,
    Assistant,
    ToolResult,
    Result,
    Error,
}

/// One incremental message observed while the engine runs.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    pub kind: UpdateKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default)]
    pub tool_calls: Vec<ToolCall>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

impl StreamUpdate {
    pub fn new(kind: UpdateKind) -> Self {
        Self {
            kind,
            content: None,
            tool_calls: Vec::new(),
            session_id: None,
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::new(UpdateKind::Assistant).with_content(content)
    }

    pub fn tool_use(calls: Vec<ToolCall>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::new(UpdateKind::Assistant)
        }
    }

    pub fn with_content(mut self, content: impl Into<String>) -> Self {
        self.content = Some(content.into());
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn has_tool_calls(&self) -> bool {
        !self.tool_calls.is_empty()
    }
}

/// Receiver a backend pushes every update through, in order.
///
/// An `Err` means the run must stop: the backend abandons the engine and
/// returns `BackendError::StreamAborted`.
#[async_trait]
pub trait UpdateSink: Send + Sync {
    async fn deliver(&self, update: StreamUpdate) -> Result<(), ValidationError>;
}

/// Caller-supplied observer. Its failures never affect the run.
#[async_trait]
pub trait StreamHandler: Send + Sync {
    async fn on_update(&self, update: &StreamUpdate) -> anyhow::Result<()>;
}
