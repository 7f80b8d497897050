use std::collections::BTreeSet;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{SessionId, UserId};
use crate::response::Response;

/// Conversation continuity for one user in one project directory.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub user_id: UserId,
    pub project_path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_used: DateTime<Utc>,
    pub total_cost: f64,
    pub message_count: u32,
    pub tools_used: BTreeSet<String>,
}

impl Session {
    /// A session the engine has not seen yet.
    pub fn new_placeholder(user_id: UserId, project_path: impl Into<PathBuf>) -> Self {
        let now = Utc::now();
        Self {
            id: SessionId::placeholder(),
            user_id,
            project_path: project_path.into(),
            created_at: now,
            last_used: now,
            total_cost: 0.0,
            message_count: 0,
            tools_used: BTreeSet::new(),
        }
    }

    pub fn is_new_session(&self) -> bool {
        self.id.is_placeholder()
    }

    pub fn is_expired(&self, timeout_hours: u64, now: DateTime<Utc>) -> bool {
        let timeout_secs = i64::try_from(timeout_hours.saturating_mul(3600)).unwrap_or(i64::MAX);
        (now - self.last_used).num_seconds() > timeout_secs
    }

    /// Fold a finished run into the session.
    ///
    /// Counters never decrease. When the session still holds a placeholder and
    /// the response carries an engine id, the session is re-keyed and the new
    /// id returned.
    pub fn record(&mut self, response: &Response, now: DateTime<Utc>) -> Option<SessionId> {
        self.total_cost += response.cost.max(0.0);
        self.message_count = self.message_count.saturating_add(1);
        self.tools_used.extend(response.tools_used.iter().cloned());
        if now > self.last_used {
            self.last_used = now;
        }

        match (&self.id, response.session_id.as_deref()) {
            (SessionId::Placeholder(_), Some(engine_id)) if !engine_id.is_empty() => {
                self.id = SessionId::real(engine_id);
                Some(self.id.clone())
            }
            _ => None,
        }
    }

    pub fn summary(&self, timeout_hours: u64, now: DateTime<Utc>) -> SessionSummary {
        SessionSummary {
            session_id: self.id.to_string(),
            project_path: self.project_path.display().to_string(),
            created_at: self.created_at.to_rfc3339(),
            last_used: self.last_used.to_rfc3339(),
            total_cost: self.total_cost,
            message_count: self.message_count,
            tools_used: self.tools_used.iter().cloned().collect(),
            expired: self.is_expired(timeout_hours, now),
        }
    }
}

/// Read-only view returned by session listings.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub project_path: String,
    pub created_at: String,
    pub last_used: String,
    pub total_cost: f64,
    pub message_count: u32,
    pub tools_used: Vec<String>,
    pub expired: bool,
}
