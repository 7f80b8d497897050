use std::time::Duration;

/// Message fragments the engine emits when its structured channel breaks
/// down mid-stream. Only consulted for opaque engine errors; typed variants
/// classify themselves.
const TRANSIENT_SIGNATURES: &[&str] = &[
    "Failed to decode JSON",
    "JSON decode error",
    "TaskGroup",
    "ExceptionGroup",
];

/// Typed error surface of an execution backend.
/// Classifies failures as transient (another channel may succeed) or final.
#[derive(Clone, Debug, thiserror::Error)]
pub enum BackendError {
    // Transient: the other channel may still work
    #[error("Failed to decode JSON: {0}")]
    Decode(String),
    #[error("unhandled errors in a TaskGroup ({} sub-exceptions): {}", .0.len(), .0.join("; "))]
    TaskGroup(Vec<String>),

    // Final
    #[error("failed to start engine: {0}")]
    Spawn(String),
    #[error("engine exited with status {code:?}: {stderr}")]
    ProcessFailed { code: Option<i32>, stderr: String },
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("usage quota exceeded: {0}")]
    QuotaExceeded(String),
    #[error("engine timed out after {0:?}")]
    Timeout(Duration),
    #[error("engine run was terminated")]
    Killed,
    #[error("io error: {0}")]
    Io(String),
    #[error("{0}")]
    Engine(String),

    /// The stream sink refused an update; the run was abandoned.
    #[error("run aborted by tool validation: {0}")]
    StreamAborted(ValidationError),
}

impl BackendError {
    /// Whether switching to the secondary channel is worth attempting.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Decode(_) | Self::TaskGroup(_) => true,
            Self::Engine(message) => matches_transient_signature(message),
            Self::ProcessFailed { stderr, .. } => matches_transient_signature(stderr),
            _ => false,
        }
    }

    /// Short classification string for logging.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Decode(_) => "decode",
            Self::TaskGroup(_) => "task_group",
            Self::Spawn(_) => "spawn",
            Self::ProcessFailed { .. } => "process_failed",
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::QuotaExceeded(_) => "quota_exceeded",
            Self::Timeout(_) => "timeout",
            Self::Killed => "killed",
            Self::Io(_) => "io",
            Self::Engine(_) => "engine",
            Self::StreamAborted(_) => "stream_aborted",
        }
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(e.to_string())
    }
}

pub fn matches_transient_signature(message: &str) -> bool {
    TRANSIENT_SIGNATURES.iter().any(|sig| message.contains(sig))
}

/// A critical tool was denied while the engine was streaming.
#[derive(Clone, Debug, PartialEq, thiserror::Error)]
#[error("{message}")]
pub struct ValidationError {
    /// The tool whose denial aborted the run.
    pub tool_name: String,
    /// User-facing explanation with remediation steps.
    pub message: String,
    pub blocked_tools: Vec<String>,
    pub allowed_tools: Vec<String>,
}
