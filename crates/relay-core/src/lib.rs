pub mod backend;
pub mod errors;
pub mod ids;
pub mod response;
pub mod session;
pub mod stream;
pub mod tools;

pub use backend::{BackendKind, ExecuteRequest, ExecutionBackend};
pub use errors::{BackendError, ValidationError};
pub use ids::{PlaceholderId, SessionId, UserId};
pub use response::{Response, TOOL_VALIDATION_FAILED};
pub use session::{Session, SessionSummary};
pub use stream::{StreamHandler, StreamUpdate, UpdateKind, UpdateSink};
pub use tools::{
    is_critical, ToolCall, ToolValidator, ToolVerdict, CRITICAL_TOOLS, TOOL_NOT_ALLOWED_MARKER,
};
