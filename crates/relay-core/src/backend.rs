use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::errors::BackendError;
use crate::response::Response;
use crate::stream::UpdateSink;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Bidirectional typed message protocol, strict decoding.
    Structured,
    /// One-shot CLI invocation, lenient line parsing.
    Subprocess,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Structured => "structured",
            Self::Subprocess => "subprocess",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything a backend needs for one run.
#[derive(Clone, Debug, PartialEq)]
pub struct ExecuteRequest {
    pub prompt: String,
    pub working_directory: PathBuf,
    /// Engine session id to resume. Never a placeholder.
    pub session_id: Option<String>,
    pub continue_session: bool,
    pub model: Option<String>,
}

/// A channel to the agent engine.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Run the engine to completion, pushing every update through `sink`.
    async fn execute(
        &self,
        request: ExecuteRequest,
        sink: Arc<dyn UpdateSink>,
    ) -> Result<Response, BackendError>;

    /// Terminate every in-flight run. Returns how many were signalled.
    async fn kill_all(&self) -> usize;
}
