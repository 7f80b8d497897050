use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use chrono::Utc;
use parking_lot::Mutex;
use tracing::{debug, warn};

use relay_core::{Response, Session, SessionId, UserId};

use crate::error::StoreError;
use crate::store::SessionStore;

#[derive(Default)]
struct Inner {
    sessions: HashMap<String, Session>,
    preferred_models: HashMap<UserId, String>,
}

/// Process-local [`SessionStore`]; nothing survives a restart.
pub struct InMemorySessionStore {
    inner: Mutex<Inner>,
    max_sessions_per_user: usize,
}

impl InMemorySessionStore {
    pub fn new(max_sessions_per_user: usize) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            max_sessions_per_user: max_sessions_per_user.max(1),
        }
    }

    /// Insert or replace a session as-is.
    pub fn insert(&self, session: Session) {
        self.inner
            .lock()
            .sessions
            .insert(session.id.as_str().to_string(), session);
    }
}

impl Default for InMemorySessionStore {
    fn default() -> Self {
        Self::new(5)
    }
}

impl Inner {
    fn evict_to(&mut self, user_id: UserId, keep: usize) {
        let mut owned: Vec<(String, chrono::DateTime<Utc>)> = self
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .map(|s| (s.id.as_str().to_string(), s.last_used))
            .collect();
        owned.sort_by(|a, b| b.1.cmp(&a.1));
        for (id, _) in owned.into_iter().skip(keep) {
            self.sessions.remove(&id);
        }
    }
}

#[async_trait]
impl SessionStore for InMemorySessionStore {
    async fn get_or_create(
        &self,
        user_id: UserId,
        project_path: &Path,
        session_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        let mut inner = self.inner.lock();
        if let Some(id) = session_id {
            if let Some(session) = inner.sessions.get(id).filter(|s| s.user_id == user_id) {
                return Ok(session.clone());
            }
            debug!(session_id = id, user_id, "no usable session, starting new");
        }

        inner.evict_to(user_id, self.max_sessions_per_user - 1);
        let session = Session::new_placeholder(user_id, project_path);
        inner
            .sessions
            .insert(session.id.as_str().to_string(), session.clone());
        Ok(session)
    }

    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        Ok(self.inner.lock().sessions.get(session_id).cloned())
    }

    async fn update(
        &self,
        session_id: &SessionId,
        response: &Response,
    ) -> Result<Option<SessionId>, StoreError> {
        let mut inner = self.inner.lock();
        let mut session = inner
            .sessions
            .remove(session_id.as_str())
            .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;

        let mut rekeyed = session.record(response, Utc::now());
        let owner = inner.sessions.get(session.id.as_str()).map(|s| s.user_id);
        if rekeyed.is_some() && owner.is_some_and(|uid| uid != session.user_id) {
            warn!(new_session_id = %session.id, "engine id belongs to another user, keeping placeholder");
            session.id = session_id.clone();
            rekeyed = None;
        }

        let key = session.id.as_str().to_string();
        // A re-key onto a tracked engine id folds the placeholder into it.
        match inner.sessions.get_mut(&key).filter(|_| rekeyed.is_some()) {
            Some(existing) => {
                existing.total_cost += session.total_cost;
                existing.message_count = existing.message_count.saturating_add(session.message_count);
                existing.tools_used.extend(session.tools_used);
                existing.last_used = existing.last_used.max(session.last_used);
            }
            None => {
                inner.sessions.insert(key, session);
            }
        }
        Ok(rekeyed)
    }

    async fn user_sessions(&self, user_id: UserId) -> Result<Vec<Session>, StoreError> {
        let mut sessions: Vec<Session> = self
            .inner
            .lock()
            .sessions
            .values()
            .filter(|s| s.user_id == user_id)
            .cloned()
            .collect();
        sessions.sort_by(|a, b| b.last_used.cmp(&a.last_used));
        Ok(sessions)
    }

    async fn cleanup_expired(&self, timeout_hours: u64) -> Result<usize, StoreError> {
        let now = Utc::now();
        let mut inner = self.inner.lock();
        let before = inner.sessions.len();
        inner.sessions.retain(|_, s| !s.is_expired(timeout_hours, now));
        Ok(before - inner.sessions.len())
    }

    async fn preferred_model(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        Ok(self.inner.lock().preferred_models.get(&user_id).cloned())
    }

    async fn set_preferred_model(
        &self,
        user_id: UserId,
        model: Option<&str>,
    ) -> Result<(), StoreError> {
        let mut inner = self.inner.lock();
        match model {
            Some(m) => {
                inner.preferred_models.insert(user_id, m.to_string());
            }
            None => {
                inner.preferred_models.remove(&user_id);
            }
        }
        Ok(())
    }
}
