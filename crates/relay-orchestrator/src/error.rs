use relay_core::{BackendError, ValidationError};
use relay_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// A critical tool was denied mid-stream and the run was aborted.
    #[error(transparent)]
    ToolValidation(ValidationError),

    #[error(transparent)]
    Backend(BackendError),

    #[error("session store: {0}")]
    Store(#[from] StoreError),
}

impl OrchestratorError {
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ToolValidation(_) => "tool_validation",
            Self::Backend(e) => e.error_kind(),
            Self::Store(_) => "store",
        }
    }
}

impl From<BackendError> for OrchestratorError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::StreamAborted(validation) => Self::ToolValidation(validation),
            other => Self::Backend(other),
        }
    }
}
