//! Command orchestration: session continuity, channel fallback and tool
//! validation around one engine run.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};

use relay_backend::{EngineConfig, StructuredBackend, SubprocessBackend};
use relay_core::{
    ExecuteRequest, ExecutionBackend, Response, SessionId, SessionSummary, StreamHandler, ToolValidator,
    UserId, TOOL_NOT_ALLOWED_MARKER, TOOL_VALIDATION_FAILED,
};
use relay_settings::RelaySettings;
use relay_store::{SessionStore, StoreError};

use crate::config::OrchestratorConfig;
use crate::error::OrchestratorError;
use crate::fallback::BackendRouter;
use crate::monitor::{ToolMonitor, ToolStats, UserToolUsage};
use crate::remediation;
use crate::validation::{CallValidationState, ValidatingSink};

/// Entry points used by a chat front end.
#[async_trait]
pub trait CommandOrchestrator: Send + Sync {
    async fn run_command(
        &self,
        prompt: &str,
        working_directory: &Path,
        user_id: UserId,
        session_id: Option<&str>,
        handler: Option<Arc<dyn StreamHandler>>,
    ) -> Result<Response, OrchestratorError>;

    /// Resume the most recently used session in `working_directory`.
    /// `None` when the user has no resumable session there.
    async fn continue_session(
        &self,
        user_id: UserId,
        working_directory: &Path,
        prompt: Option<&str>,
        handler: Option<Arc<dyn StreamHandler>>,
    ) -> Result<Option<Response>, OrchestratorError>;

    async fn shutdown(&self) -> Result<(), OrchestratorError>;
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct UserSummary {
    pub user_id: UserId,
    pub session_count: usize,
    pub active_sessions: usize,
    pub total_cost: f64,
    pub total_messages: u64,
    pub remaining_budget: f64,
    pub tool_usage: UserToolUsage,
}

pub struct RelayOrchestrator {
    config: OrchestratorConfig,
    router: BackendRouter,
    store: Arc<dyn SessionStore>,
    monitor: Arc<ToolMonitor>,
    validator: Arc<dyn ToolValidator>,
}

impl RelayOrchestrator {
    pub fn new(
        config: OrchestratorConfig,
        router: BackendRouter,
        store: Arc<dyn SessionStore>,
        monitor: Arc<ToolMonitor>,
    ) -> Self {
        Self {
            config,
            router,
            store,
            validator: monitor.clone(),
            monitor,
        }
    }

    /// Real engine channels built from settings.
    pub fn from_settings(settings: &RelaySettings, store: Arc<dyn SessionStore>) -> Self {
        let config = OrchestratorConfig::from_settings(settings);
        let engine = EngineConfig::from_settings(settings);
        let primary = config
            .use_structured_backend
            .then(|| Arc::new(StructuredBackend::new(engine.clone())) as Arc<dyn ExecutionBackend>);
        let router = BackendRouter::new(primary, Arc::new(SubprocessBackend::new(engine)));
        let monitor = Arc::new(ToolMonitor::from_config(&config));
        Self::new(config, router, store, monitor)
    }

    /// Validate tool calls with `validator` instead of the monitor. Usage
    /// statistics then only reflect what `validator` forwards to the monitor.
    pub fn with_validator(mut self, validator: Arc<dyn ToolValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.router.consecutive_failures()
    }

    pub async fn session_info(&self, session_id: &str) -> Result<Option<SessionSummary>, OrchestratorError> {
        let session = self.store.get(session_id).await?;
        Ok(session.map(|s| s.summary(self.config.session_timeout_hours, Utc::now())))
    }

    pub async fn user_sessions(&self, user_id: UserId) -> Result<Vec<SessionSummary>, OrchestratorError> {
        let now = Utc::now();
        let sessions = self.store.user_sessions(user_id).await?;
        Ok(sessions
            .iter()
            .map(|s| s.summary(self.config.session_timeout_hours, now))
            .collect())
    }

    pub async fn cleanup_expired_sessions(&self) -> Result<usize, OrchestratorError> {
        let purged = self.store.cleanup_expired(self.config.session_timeout_hours).await?;
        if purged > 0 {
            info!(purged, "expired sessions removed");
        }
        Ok(purged)
    }

    pub fn tool_stats(&self) -> ToolStats {
        self.monitor.tool_stats()
    }

    pub async fn user_summary(&self, user_id: UserId) -> Result<UserSummary, OrchestratorError> {
        let now = Utc::now();
        let sessions = self.store.user_sessions(user_id).await?;
        let total_cost: f64 = sessions.iter().map(|s| s.total_cost).sum();
        Ok(UserSummary {
            user_id,
            session_count: sessions.len(),
            active_sessions: sessions
                .iter()
                .filter(|s| !s.is_expired(self.config.session_timeout_hours, now))
                .count(),
            total_cost,
            total_messages: sessions.iter().map(|s| u64::from(s.message_count)).sum(),
            remaining_budget: (self.config.max_cost_per_user - total_cost).max(0.0),
            tool_usage: self.monitor.user_tool_usage(user_id),
        })
    }

    fn apply_validation_failure(&self, response: &mut Response, state: &CallValidationState) {
        response.is_error = true;
        response.error_type = Some(TOOL_VALIDATION_FAILED.to_string());
        response.content = if state.reasons.iter().any(|r| r.contains(TOOL_NOT_ALLOWED_MARKER)) {
            let blocked = remediation::blocked_tools_from_reasons(&state.reasons);
            remediation::tool_blocked_message(&blocked, &self.config.allowed_tools)
        } else {
            remediation::validation_failed_message(&state.reasons)
        };
    }
}

#[async_trait]
impl CommandOrchestrator for RelayOrchestrator {
    async fn run_command(
        &self,
        prompt: &str,
        working_directory: &Path,
        user_id: UserId,
        session_id: Option<&str>,
        handler: Option<Arc<dyn StreamHandler>>,
    ) -> Result<Response, OrchestratorError> {
        info!(
            user_id,
            working_directory = %working_directory.display(),
            session_id,
            prompt_length = prompt.len(),
            "running command"
        );

        let session = self.store.get_or_create(user_id, working_directory, session_id).await?;
        let continue_session = session_id.is_some() && !session.is_new_session();

        let model = match self.store.preferred_model(user_id).await {
            Ok(model) => model,
            Err(e) => {
                debug!(user_id, error = %e, "preferred model lookup failed, using default");
                None
            }
        };

        let sink = Arc::new(ValidatingSink::new(
            self.validator.clone(),
            handler,
            working_directory,
            user_id,
            self.config.allowed_tools.clone(),
        ));
        let request = ExecuteRequest {
            prompt: prompt.to_string(),
            working_directory: working_directory.to_path_buf(),
            session_id: session.id.engine_id().map(str::to_string),
            continue_session,
            model,
        };

        let mut response = match self.router.execute(request, sink.clone()).await {
            Ok(response) => response,
            Err(e) => {
                let err = OrchestratorError::from(e);
                error!(user_id, session_id = %session.id, error = %err, error_kind = err.error_kind(), "command failed");
                return Err(err);
            }
        };

        let state = sink.state();
        if !state.all_valid {
            warn!(user_id, reasons = ?state.reasons, "command completed but tool validation failed");
            self.apply_validation_failure(&mut response, &state);
        }

        let rekeyed = match self.store.update(&session.id, &response).await {
            Ok(rekeyed) => rekeyed,
            // Evicted by a concurrent call while the engine ran.
            Err(StoreError::NotFound(_)) => {
                warn!(user_id, session_id = %session.id, "session evicted during run, usage not recorded");
                response
                    .session_id
                    .as_deref()
                    .filter(|id| session.is_new_session() && !id.is_empty())
                    .map(SessionId::real)
            }
            Err(e) => {
                error!(user_id, session_id = %session.id, error = %e, "session update failed");
                return Err(e.into());
            }
        };
        response.session_id = rekeyed
            .as_ref()
            .map(|id| id.as_str().to_string())
            .or_else(|| session.id.engine_id().map(str::to_string));

        info!(
            user_id,
            session_id = response.session_id.as_deref(),
            cost = response.cost,
            duration_ms = response.duration_ms,
            num_turns = response.num_turns,
            is_error = response.is_error,
            "command completed"
        );
        Ok(response)
    }

    async fn continue_session(
        &self,
        user_id: UserId,
        working_directory: &Path,
        prompt: Option<&str>,
        handler: Option<Arc<dyn StreamHandler>>,
    ) -> Result<Option<Response>, OrchestratorError> {
        let sessions = self.store.user_sessions(user_id).await?;
        let latest = sessions
            .into_iter()
            .filter(|s| s.project_path == working_directory && !s.is_new_session())
            .max_by_key(|s| s.last_used);

        let Some(latest) = latest else {
            info!(user_id, working_directory = %working_directory.display(), "no session to continue");
            return Ok(None);
        };

        let response = self
            .run_command(
                prompt.unwrap_or_default(),
                working_directory,
                user_id,
                Some(latest.id.as_str()),
                handler,
            )
            .await?;
        Ok(Some(response))
    }

    async fn shutdown(&self) -> Result<(), OrchestratorError> {
        let killed = self.router.kill_all().await;
        info!(killed, "engine runs terminated");
        self.cleanup_expired_sessions().await?;
        Ok(())
    }
}
