//! Per-call tool validation interposed between a backend and the caller.

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tracing::{error, warn};

use relay_core::{
    is_critical, StreamHandler, StreamUpdate, ToolValidator, ToolVerdict, UpdateSink, UserId,
    ValidationError, TOOL_NOT_ALLOWED_MARKER,
};

use crate::remediation;

/// Outcome of validating every tool call of one `run_command`.
#[derive(Clone, Debug, PartialEq)]
pub struct CallValidationState {
    pub all_valid: bool,
    pub reasons: Vec<String>,
    /// Allow-list violations only, first-seen order.
    pub blocked_tool_names: Vec<String>,
}

impl CallValidationState {
    pub fn new() -> Self {
        Self {
            all_valid: true,
            reasons: Vec::new(),
            blocked_tool_names: Vec::new(),
        }
    }

    pub fn record_denial(&mut self, tool_name: &str, reason: String) {
        self.all_valid = false;
        if reason.contains(TOOL_NOT_ALLOWED_MARKER)
            && !self.blocked_tool_names.iter().any(|t| t == tool_name)
        {
            self.blocked_tool_names.push(tool_name.to_string());
        }
        self.reasons.push(reason);
    }
}

impl Default for CallValidationState {
    fn default() -> Self {
        Self::new()
    }
}

/// [`UpdateSink`] that validates tool calls before forwarding an update.
///
/// Denials are recorded; a denied critical tool fails the delivery, which
/// aborts the backend run. Handler failures are logged and otherwise ignored.
pub struct ValidatingSink {
    validator: Arc<dyn ToolValidator>,
    handler: Option<Arc<dyn StreamHandler>>,
    working_directory: PathBuf,
    user_id: UserId,
    allowed_tools: Vec<String>,
    state: Mutex<CallValidationState>,
}

impl ValidatingSink {
    pub fn new(
        validator: Arc<dyn ToolValidator>,
        handler: Option<Arc<dyn StreamHandler>>,
        working_directory: impl Into<PathBuf>,
        user_id: UserId,
        allowed_tools: Vec<String>,
    ) -> Self {
        Self {
            validator,
            handler,
            working_directory: working_directory.into(),
            user_id,
            allowed_tools,
            state: Mutex::new(CallValidationState::new()),
        }
    }

    pub fn state(&self) -> CallValidationState {
        self.state.lock().clone()
    }

    fn critical_denial(&self, tool_name: &str, blocked: Vec<String>) -> ValidationError {
        ValidationError {
            tool_name: tool_name.to_string(),
            message: remediation::tool_blocked_message(&blocked, &self.allowed_tools),
            blocked_tools: blocked,
            allowed_tools: self.allowed_tools.clone(),
        }
    }
}

#[async_trait]
impl UpdateSink for ValidatingSink {
    async fn deliver(&self, mut update: StreamUpdate) -> Result<(), ValidationError> {
        for call in update.tool_calls.iter_mut() {
            let verdict = self
                .validator
                .validate_tool_call(&call.name, &call.input, &self.working_directory, self.user_id)
                .await;

            let reason = match verdict {
                ToolVerdict::Allowed => {
                    call.validated = true;
                    continue;
                }
                ToolVerdict::Denied { reason } => reason,
            };

            error!(tool_name = %call.name, error = %reason, user_id = self.user_id, "tool validation failed");
            call.denial_reason = Some(reason.clone());
            let blocked = {
                let mut state = self.state.lock();
                state.record_denial(&call.name, reason);
                state.blocked_tool_names.clone()
            };

            if is_critical(&call.name) {
                return Err(self.critical_denial(&call.name, blocked));
            }
        }

        if let Some(handler) = &self.handler {
            if let Err(e) = handler.on_update(&update).await {
                warn!(error = %e, user_id = self.user_id, "stream handler failed");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relay_core::{ToolCall, UpdateKind};
    use serde_json::{json, Value};
    use std::path::Path;

    /// Denies every tool whose name is listed, with the given reason.
    struct DenyList(Vec<(&'static str, &'static str)>);

    #[async_trait]
    impl ToolValidator for DenyList {
        async fn validate_tool_call(&self, name: &str, _: &Value, _: &Path, _: UserId) -> ToolVerdict {
            match self.0.iter().find(|(tool, _)| *tool == name) {
                Some((_, reason)) => ToolVerdict::denied(*reason),
                None => ToolVerdict::Allowed,
            }
        }
    }

    #[derive(Default)]
    struct Collect(Mutex<Vec<StreamUpdate>>);

    #[async_trait]
    impl StreamHandler for Collect {
        async fn on_update(&self, update: &StreamUpdate) -> anyhow::Result<()> {
            self.0.lock().push(update.clone());
            Ok(())
        }
    }

    struct Failing;

    #[async_trait]
    impl StreamHandler for Failing {
        async fn on_update(&self, _: &StreamUpdate) -> anyhow::Result<()> {
            anyhow::bail!("chat API unavailable")
        }
    }

    fn sink(denials: Vec<(&'static str, &'static str)>, handler: Option<Arc<dyn StreamHandler>>) -> ValidatingSink {
        ValidatingSink::new(
            Arc::new(DenyList(denials)),
            handler,
            "/work",
            42,
            vec!["Read".into(), "Write".into()],
        )
    }

    fn calls(names: &[&str]) -> StreamUpdate {
        StreamUpdate::tool_use(names.iter().map(|n| ToolCall::new(*n, json!({}))).collect())
    }

    #[tokio::test]
    async fn allowed_calls_are_marked_and_forwarded() {
        let collect = Arc::new(Collect::default());
        let sink = sink(vec![], Some(collect.clone()));

        sink.deliver(calls(&["Read", "Grep"])).await.unwrap();

        let forwarded = collect.0.lock().clone();
        assert_eq!(forwarded.len(), 1);
        assert!(forwarded[0].tool_calls.iter().all(|c| c.validated));
        assert!(sink.state().all_valid);
    }

    #[tokio::test]
    async fn non_critical_denial_is_deferred() {
        let collect = Arc::new(Collect::default());
        let sink = sink(vec![("Bash", "Tool not allowed: Bash")], Some(collect.clone()));

        sink.deliver(calls(&["Bash"])).await.unwrap();
        sink.deliver(StreamUpdate::assistant("continuing")).await.unwrap();

        let state = sink.state();
        assert!(!state.all_valid);
        assert_eq!(state.reasons, vec!["Tool not allowed: Bash"]);
        assert_eq!(state.blocked_tool_names, vec!["Bash"]);

        let forwarded = collect.0.lock().clone();
        assert_eq!(forwarded.len(), 2);
        assert_eq!(forwarded[0].tool_calls[0].denial_reason.as_deref(), Some("Tool not allowed: Bash"));
    }

    #[tokio::test]
    async fn critical_denial_fails_before_forwarding() {
        let collect = Arc::new(Collect::default());
        let sink = sink(
            vec![("Bash", "Tool not allowed: Bash"), ("Task", "Tool not allowed: Task")],
            Some(collect.clone()),
        );

        let err = sink.deliver(calls(&["Bash", "Task"])).await.unwrap_err();
        assert_eq!(err.tool_name, "Task");
        assert_eq!(err.blocked_tools, vec!["Bash", "Task"]);
        assert_eq!(err.allowed_tools, vec!["Read", "Write"]);
        assert!(err.message.contains("RELAY_ALLOWED_TOOLS=\"Read,Write,Bash,Task\""));
        assert!(collect.0.lock().is_empty());
    }

    #[tokio::test]
    async fn critical_denial_without_marker_has_no_blocked_names() {
        let sink = sink(vec![("Write", "Path outside approved directory: /etc/passwd")], None);

        let err = sink.deliver(calls(&["Write"])).await.unwrap_err();
        assert!(err.blocked_tools.is_empty());
        assert_eq!(sink.state().reasons.len(), 1);
    }

    #[tokio::test]
    async fn handler_failure_is_swallowed() {
        let sink = sink(vec![], Some(Arc::new(Failing)));
        assert!(sink.deliver(StreamUpdate::new(UpdateKind::System)).await.is_ok());
    }

    #[test]
    fn blocked_names_deduplicated() {
        let mut state = CallValidationState::new();
        state.record_denial("Bash", "Tool not allowed: Bash".into());
        state.record_denial("Bash", "Tool not allowed: Bash".into());
        state.record_denial("Grep", "Path outside approved directory: /".into());
        assert_eq!(state.blocked_tool_names, vec!["Bash"]);
        assert_eq!(state.reasons.len(), 3);
    }
}
