use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

const CREATE_LOGS: &str = "
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        session_id TEXT,
        user_id INTEGER,
        backend TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
    CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
    CREATE INDEX IF NOT EXISTS idx_logs_user ON logs(user_id);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);
";

/// A persisted warn+ log record.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining event fields as a JSON object.
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<i64>,
    pub backend: Option<String>,
}

#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    /// Substring match.
    pub target: Option<String>,
    pub session_id: Option<String>,
    pub user_id: Option<i64>,
    /// RFC 3339 lower bound, inclusive.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn open(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        conn.execute_batch(CREATE_LOGS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(CREATE_LOGS)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn insert(&self, record: &PendingRecord) {
        let conn = self.conn.lock();
        // Logging must never fail the caller.
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id, user_id, backend)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.session_id,
                record.user_id,
                record.backend,
            ],
        );
    }

    /// Newest first.
    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut clauses: Vec<String> = Vec::new();
        let mut values: Vec<rusqlite::types::Value> = Vec::new();

        if let Some(level) = &q.level {
            values.push(level.to_uppercase().into());
            clauses.push(format!("level = ?{}", values.len()));
        }
        if let Some(target) = &q.target {
            values.push(format!("%{target}%").into());
            clauses.push(format!("target LIKE ?{}", values.len()));
        }
        if let Some(session_id) = &q.session_id {
            values.push(session_id.clone().into());
            clauses.push(format!("session_id = ?{}", values.len()));
        }
        if let Some(user_id) = q.user_id {
            values.push(user_id.into());
            clauses.push(format!("user_id = ?{}", values.len()));
        }
        if let Some(since) = &q.since {
            values.push(since.clone().into());
            clauses.push(format!("timestamp >= ?{}", values.len()));
        }

        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, session_id, user_id, backend FROM logs",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                session_id: row.get(6)?,
                user_id: row.get(7)?,
                backend: row.get(8)?,
            })
        })?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

struct PendingRecord {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    session_id: Option<String>,
    user_id: Option<i64>,
    backend: Option<String>,
}

/// tracing Layer that writes warn+ events to a [`SqliteLogSink`].
///
/// `session_id`, `user_id` and `backend` get their own columns, taken from
/// the event or else from the nearest enclosing span that recorded them.
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
    keys: CorrelationKeys,
}

/// Correlation fields, also stashed on spans for child events.
#[derive(Clone, Default)]
struct CorrelationKeys {
    session_id: Option<String>,
    user_id: Option<i64>,
    backend: Option<String>,
}

impl CorrelationKeys {
    fn is_empty(&self) -> bool {
        self.session_id.is_none() && self.user_id.is_none() && self.backend.is_none()
    }

    fn is_complete(&self) -> bool {
        self.session_id.is_some() && self.user_id.is_some() && self.backend.is_some()
    }

    fn fill_from(&mut self, other: &CorrelationKeys) {
        if self.session_id.is_none() {
            self.session_id.clone_from(&other.session_id);
        }
        if self.user_id.is_none() {
            self.user_id = other.user_id;
        }
        if self.backend.is_none() {
            self.backend.clone_from(&other.backend);
        }
    }
}

impl FieldVisitor {
    fn record_text(&mut self, field: &Field, value: String) {
        match field.name() {
            "message" => self.message = Some(value),
            "session_id" => self.keys.session_id = Some(value),
            "backend" => self.keys.backend = Some(value),
            "user_id" => match value.parse() {
                Ok(id) => self.keys.user_id = Some(id),
                Err(_) => {
                    self.fields.insert("user_id".into(), serde_json::Value::String(value));
                }
            },
            name => {
                self.fields.insert(name.to_string(), serde_json::Value::String(value));
            }
        }
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let val = format!("{value:?}");
        self.record_text(field, val.trim_matches('"').to_string());
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.record_text(field, value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        if field.name() == "user_id" {
            self.keys.user_id = Some(value);
        } else {
            self.fields.insert(field.name().to_string(), value.into());
        }
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        match (field.name(), i64::try_from(value)) {
            ("user_id", Ok(id)) => self.keys.user_id = Some(id),
            (name, _) => {
                self.fields.insert(name.to_string(), value.into());
            }
        }
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields.insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        if !visitor.keys.is_complete() {
            if let Some(scope) = ctx.event_scope(event) {
                for span in scope {
                    if let Some(keys) = span.extensions().get::<CorrelationKeys>() {
                        visitor.keys.fill_from(keys);
                    }
                }
            }
        }

        let fields = if visitor.fields.is_empty() {
            None
        } else {
            serde_json::to_string(&visitor.fields).ok()
        };

        self.sink.insert(&PendingRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string().to_uppercase(),
            target: event.metadata().target().to_string(),
            message: visitor.message.unwrap_or_default(),
            fields,
            session_id: visitor.keys.session_id,
            user_id: visitor.keys.user_id,
            backend: visitor.keys.backend,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);
        if visitor.keys.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(visitor.keys);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn record(level: &str, target: &str, message: &str) -> PendingRecord {
        PendingRecord {
            timestamp: Utc::now().to_rfc3339(),
            level: level.into(),
            target: target.into(),
            message: message.into(),
            fields: None,
            session_id: None,
            user_id: None,
            backend: None,
        }
    }

    fn with_layer(sink: Arc<SqliteLogSink>, f: impl FnOnce()) {
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink));
        tracing::subscriber::with_default(subscriber, f);
    }

    #[test]
    fn sink_opens_file_database() {
        let dir = tempfile::tempdir().unwrap();
        let sink = SqliteLogSink::open(&dir.path().join("nested/logs.db")).unwrap();
        sink.insert(&record("WARN", "relay_backend", "slow"));
        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn query_filters_combine() {
        let sink = SqliteLogSink::in_memory().unwrap();
        let mut a = record("ERROR", "relay_orchestrator", "both failed");
        a.user_id = Some(42);
        sink.insert(&a);
        let mut b = record("ERROR", "relay_orchestrator", "other user");
        b.user_id = Some(7);
        sink.insert(&b);
        sink.insert(&record("WARN", "relay_orchestrator", "warned"));

        let results = sink
            .query(&LogQuery {
                level: Some("error".into()),
                user_id: Some(42),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "both failed");
    }

    #[test]
    fn query_limit_newest_first() {
        let sink = SqliteLogSink::in_memory().unwrap();
        for i in 0..5 {
            sink.insert(&record("WARN", "test", &format!("msg {i}")));
        }
        let results = sink
            .query(&LogQuery {
                limit: Some(2),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].message, "msg 4");
    }

    #[test]
    fn layer_skips_below_warn() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        with_layer(sink.clone(), || {
            tracing::info!("ignored");
            tracing::debug!("ignored too");
        });
        assert_eq!(sink.count().unwrap(), 0);
    }

    #[test]
    fn layer_extracts_correlation_fields_from_event() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        with_layer(sink.clone(), || {
            tracing::warn!(user_id = 42_i64, session_id = "sess-1", backend = "structured", attempt = 2, "fallback");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message, "fallback");
        assert_eq!(rows[0].user_id, Some(42));
        assert_eq!(rows[0].session_id.as_deref(), Some("sess-1"));
        assert_eq!(rows[0].backend.as_deref(), Some("structured"));
        let fields: serde_json::Value = serde_json::from_str(rows[0].fields.as_deref().unwrap()).unwrap();
        assert_eq!(fields["attempt"], 2);
    }

    #[test]
    fn layer_inherits_fields_from_span() {
        let sink = Arc::new(SqliteLogSink::in_memory().unwrap());
        with_layer(sink.clone(), || {
            let span = tracing::info_span!("run_command", user_id = 9_i64, session_id = %"sess-9");
            let _enter = span.enter();
            tracing::error!("engine crashed");
        });

        let rows = sink
            .query(&LogQuery {
                session_id: Some("sess-9".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].user_id, Some(9));
        assert_eq!(rows[0].level, "ERROR");
    }
}
