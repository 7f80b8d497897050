use std::path::Path;

use async_trait::async_trait;
use relay_core::{Response, Session, SessionId, UserId};

use crate::error::StoreError;

/// Persistence for conversation sessions.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Resolve `session_id` for `user_id`, or create a placeholder session when
    /// no id is given, the id is unknown, or it belongs to another user.
    async fn get_or_create(
        &self,
        user_id: UserId,
        project_path: &Path,
        session_id: Option<&str>,
    ) -> Result<Session, StoreError>;

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError>;

    /// Fold a finished run into the session. Returns the engine id when a
    /// placeholder was re-keyed.
    async fn update(
        &self,
        session_id: &SessionId,
        response: &Response,
    ) -> Result<Option<SessionId>, StoreError>;

    /// Most recently used first.
    async fn user_sessions(&self, user_id: UserId) -> Result<Vec<Session>, StoreError>;

    /// Remove sessions idle longer than `timeout_hours`. Returns how many.
    async fn cleanup_expired(&self, timeout_hours: u64) -> Result<usize, StoreError>;

    async fn preferred_model(&self, user_id: UserId) -> Result<Option<String>, StoreError>;

    async fn set_preferred_model(
        &self,
        user_id: UserId,
        model: Option<&str>,
    ) -> Result<(), StoreError>;
}
