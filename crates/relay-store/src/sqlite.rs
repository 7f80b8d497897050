use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use rusqlite::{Connection, OptionalExtension};
use tracing::{debug, info, instrument, warn};

use relay_core::{PlaceholderId, Response, Session, SessionId, UserId};

use crate::database::Database;
use crate::error::StoreError;
use crate::row_helpers::{self, format_timestamp, parse_timestamp};
use crate::store::SessionStore;

const SESSION_COLUMNS: &str =
    "id, is_placeholder, user_id, project_path, created_at, last_used, total_cost, message_count";

/// SQLite-backed [`SessionStore`].
pub struct SqliteSessionStore {
    db: Database,
    max_sessions_per_user: usize,
}

impl SqliteSessionStore {
    pub fn new(db: Database, max_sessions_per_user: usize) -> Self {
        Self {
            db,
            max_sessions_per_user: max_sessions_per_user.max(1),
        }
    }

    pub fn database(&self) -> &Database {
        &self.db
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> Result<Session, StoreError> {
    let raw_id: String = row_helpers::get(row, 0, "sessions", "id")?;
    let is_placeholder: bool = row_helpers::get(row, 1, "sessions", "is_placeholder")?;
    let project_path: String = row_helpers::get(row, 3, "sessions", "project_path")?;
    let created_at: String = row_helpers::get(row, 4, "sessions", "created_at")?;
    let last_used: String = row_helpers::get(row, 5, "sessions", "last_used")?;
    let message_count: i64 = row_helpers::get(row, 7, "sessions", "message_count")?;

    let id = if is_placeholder {
        SessionId::Placeholder(PlaceholderId::from_raw(raw_id))
    } else {
        SessionId::Real(raw_id)
    };

    Ok(Session {
        id,
        user_id: row_helpers::get(row, 2, "sessions", "user_id")?,
        project_path: PathBuf::from(project_path),
        created_at: parse_timestamp(&created_at, "sessions", "created_at")?,
        last_used: parse_timestamp(&last_used, "sessions", "last_used")?,
        total_cost: row_helpers::get(row, 6, "sessions", "total_cost")?,
        message_count: u32::try_from(message_count).map_err(|_| StoreError::CorruptRow {
            table: "sessions",
            column: "message_count",
            detail: format!("out of range: {message_count}"),
        })?,
        tools_used: BTreeSet::new(),
    })
}

fn load_tools(conn: &Connection, session_id: &str) -> Result<BTreeSet<String>, StoreError> {
    let mut stmt =
        conn.prepare("SELECT tool_name FROM session_tools WHERE session_id = ?1 ORDER BY tool_name")?;
    let mut rows = stmt.query([session_id])?;
    let mut tools = BTreeSet::new();
    while let Some(row) = rows.next()? {
        tools.insert(row_helpers::get::<String>(row, 0, "session_tools", "tool_name")?);
    }
    Ok(tools)
}

fn fetch(conn: &Connection, session_id: &str) -> Result<Option<Session>, StoreError> {
    let mut stmt = conn.prepare(&format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?1"))?;
    let mut rows = stmt.query([session_id])?;
    let Some(row) = rows.next()? else {
        return Ok(None);
    };
    let mut session = row_to_session(row)?;
    session.tools_used = load_tools(conn, session_id)?;
    Ok(Some(session))
}

fn fetch_for_user(conn: &Connection, user_id: UserId) -> Result<Vec<Session>, StoreError> {
    let mut stmt = conn.prepare(&format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE user_id = ?1 ORDER BY last_used DESC"
    ))?;
    let mut rows = stmt.query([user_id])?;
    let mut sessions = Vec::new();
    while let Some(row) = rows.next()? {
        sessions.push(row_to_session(row)?);
    }
    for session in &mut sessions {
        session.tools_used = load_tools(conn, session.id.as_str())?;
    }
    Ok(sessions)
}

fn insert(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    conn.execute(
        &format!("INSERT INTO sessions ({SESSION_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)"),
        rusqlite::params![
            session.id.as_str(),
            session.id.is_placeholder(),
            session.user_id,
            session.project_path.display().to_string(),
            format_timestamp(&session.created_at),
            format_timestamp(&session.last_used),
            session.total_cost,
            session.message_count,
        ],
    )?;
    write_tools(conn, session)
}

fn write_counters(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    conn.execute(
        "UPDATE sessions SET last_used = ?1, total_cost = ?2, message_count = ?3, is_placeholder = ?4
         WHERE id = ?5",
        rusqlite::params![
            format_timestamp(&session.last_used),
            session.total_cost,
            session.message_count,
            session.id.is_placeholder(),
            session.id.as_str(),
        ],
    )?;
    write_tools(conn, session)
}

fn write_tools(conn: &Connection, session: &Session) -> Result<(), StoreError> {
    let mut stmt =
        conn.prepare("INSERT OR IGNORE INTO session_tools (session_id, tool_name) VALUES (?1, ?2)")?;
    for tool in &session.tools_used {
        stmt.execute(rusqlite::params![session.id.as_str(), tool])?;
    }
    Ok(())
}

/// Delete least recently used sessions until fewer than `keep` remain.
fn evict_to(conn: &Connection, user_id: UserId, keep: usize) -> Result<usize, StoreError> {
    let ids: Vec<String> = {
        let mut stmt =
            conn.prepare("SELECT id FROM sessions WHERE user_id = ?1 ORDER BY last_used DESC")?;
        let rows = stmt.query_map([user_id], |row| row.get(0))?;
        rows.collect::<Result<_, _>>()?
    };
    let mut evicted = 0;
    for id in ids.iter().skip(keep) {
        evicted += conn.execute("DELETE FROM sessions WHERE id = ?1", [id])?;
    }
    Ok(evicted)
}

#[async_trait]
impl SessionStore for SqliteSessionStore {
    #[instrument(skip(self, project_path), fields(project_path = %project_path.display()))]
    async fn get_or_create(
        &self,
        user_id: UserId,
        project_path: &Path,
        session_id: Option<&str>,
    ) -> Result<Session, StoreError> {
        self.db.with_conn(|conn| {
            if let Some(id) = session_id {
                match fetch(conn, id)? {
                    Some(session) if session.user_id == user_id => return Ok(session),
                    Some(_) => warn!(session_id = id, "session belongs to another user, starting new"),
                    None => debug!(session_id = id, "unknown session, starting new"),
                }
            }

            let evicted = evict_to(conn, user_id, self.max_sessions_per_user - 1)?;
            if evicted > 0 {
                info!(evicted, "evicted least recently used sessions");
            }

            let session = Session::new_placeholder(user_id, project_path);
            insert(conn, &session)?;
            Ok(session)
        })
    }

    #[instrument(skip(self))]
    async fn get(&self, session_id: &str) -> Result<Option<Session>, StoreError> {
        self.db.with_conn(|conn| fetch(conn, session_id))
    }

    #[instrument(skip(self, session_id, response), fields(session_id = %session_id))]
    async fn update(
        &self,
        session_id: &SessionId,
        response: &Response,
    ) -> Result<Option<SessionId>, StoreError> {
        self.db.with_conn(|conn| {
            let tx = conn.unchecked_transaction()?;
            let mut session = fetch(&tx, session_id.as_str())?
                .ok_or_else(|| StoreError::NotFound(format!("session {session_id}")))?;

            let mut rekeyed = session.record(response, Utc::now());
            match &rekeyed {
                Some(new_id) => match fetch(&tx, new_id.as_str())? {
                    Some(existing) if existing.user_id != session.user_id => {
                        warn!(new_session_id = %new_id, "engine id belongs to another user, keeping placeholder");
                        session.id = session_id.clone();
                        write_counters(&tx, &session)?;
                        rekeyed = None;
                    }
                    // The engine resumed a conversation already tracked under
                    // its real id: fold the placeholder into it.
                    Some(mut existing) => {
                        existing.total_cost += session.total_cost;
                        existing.message_count =
                            existing.message_count.saturating_add(session.message_count);
                        existing.tools_used.extend(session.tools_used.iter().cloned());
                        existing.last_used = existing.last_used.max(session.last_used);
                        write_counters(&tx, &existing)?;
                        tx.execute("DELETE FROM sessions WHERE id = ?1", [session_id.as_str()])?;
                    }
                    None => {
                        tx.execute(
                            "UPDATE sessions SET id = ?1, is_placeholder = 0 WHERE id = ?2",
                            [new_id.as_str(), session_id.as_str()],
                        )?;
                        write_counters(&tx, &session)?;
                    }
                },
                None => write_counters(&tx, &session)?,
            }

            tx.commit()?;
            if let Some(new_id) = &rekeyed {
                info!(new_session_id = %new_id, "placeholder session re-keyed");
            }
            Ok(rekeyed)
        })
    }

    #[instrument(skip(self))]
    async fn user_sessions(&self, user_id: UserId) -> Result<Vec<Session>, StoreError> {
        self.db.with_conn(|conn| fetch_for_user(conn, user_id))
    }

    #[instrument(skip(self))]
    async fn cleanup_expired(&self, timeout_hours: u64) -> Result<usize, StoreError> {
        let hours = i64::try_from(timeout_hours).unwrap_or(i64::MAX);
        let Some(cutoff) = Duration::try_hours(hours).and_then(|d| Utc::now().checked_sub_signed(d))
        else {
            return Ok(0);
        };
        let purged = self.db.with_conn(|conn| {
            Ok(conn.execute(
                "DELETE FROM sessions WHERE last_used < ?1",
                [format_timestamp(&cutoff)],
            )?)
        })?;
        if purged > 0 {
            info!(purged, "expired sessions removed");
        }
        Ok(purged)
    }

    #[instrument(skip(self))]
    async fn preferred_model(&self, user_id: UserId) -> Result<Option<String>, StoreError> {
        self.db.with_conn(|conn| {
            let model: Option<Option<String>> = conn
                .query_row(
                    "SELECT preferred_model FROM users WHERE user_id = ?1",
                    [user_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(model.flatten())
        })
    }

    #[instrument(skip(self))]
    async fn set_preferred_model(
        &self,
        user_id: UserId,
        model: Option<&str>,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO users (user_id, preferred_model, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(user_id) DO UPDATE SET
                    preferred_model = excluded.preferred_model,
                    updated_at = excluded.updated_at",
                rusqlite::params![user_id, model, format_timestamp(&Utc::now())],
            )?;
            Ok(())
        })
    }
}
