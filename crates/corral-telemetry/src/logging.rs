//! Persisted warnings and errors, keyed by the session, backend and
//! execution unit they concern.

use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::types::Value as SqlValue;
use rusqlite::{params_from_iter, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{span, Level};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS logs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        timestamp TEXT NOT NULL,
        level TEXT NOT NULL,
        target TEXT NOT NULL,
        message TEXT NOT NULL,
        fields TEXT,
        session_id TEXT,
        backend TEXT,
        unit TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_logs_session ON logs(session_id);
    CREATE INDEX IF NOT EXISTS idx_logs_unit ON logs(unit);
    CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);";

const COLUMNS: &str = "id, timestamp, level, target, message, fields, session_id, backend, unit";

/// One persisted log line.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    /// Remaining structured fields as a JSON object.
    pub fields: Option<String>,
    pub session_id: Option<String>,
    pub backend: Option<String>,
    /// Container or app the line concerns.
    pub unit: Option<String>,
}

impl LogRecord {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            timestamp: row.get(1)?,
            level: row.get(2)?,
            target: row.get(3)?,
            message: row.get(4)?,
            fields: row.get(5)?,
            session_id: row.get(6)?,
            backend: row.get(7)?,
            unit: row.get(8)?,
        })
    }
}

/// Filter for [`SqliteLogSink::query`]. Empty filters match everything;
/// results are newest first.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub session_id: Option<String>,
    pub backend: Option<String>,
    pub unit: Option<String>,
    /// `true` keeps only errors.
    pub errors_only: bool,
    /// RFC 3339 lower bound.
    pub since: Option<String>,
    pub limit: Option<u32>,
}

impl LogQuery {
    fn to_sql(&self) -> (String, Vec<SqlValue>) {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        let exact = [
            ("session_id", &self.session_id),
            ("backend", &self.backend),
            ("unit", &self.unit),
            ("timestamp", &self.since),
        ];
        for (column, value) in exact {
            if let Some(v) = value {
                let op = if column == "timestamp" { ">=" } else { "=" };
                values.push(SqlValue::Text(v.clone()));
                clauses.push(format!("{column} {op} ?{}", values.len()));
            }
        }
        if self.errors_only {
            clauses.push("level = 'ERROR'".to_string());
        }
        let filter = if clauses.is_empty() { String::new() } else { format!(" WHERE {}", clauses.join(" AND ")) };
        let sql = format!("SELECT {COLUMNS} FROM logs{filter} ORDER BY id DESC LIMIT {}", self.limit.unwrap_or(100));
        (sql, values)
    }
}

/// SQLite store behind [`SqliteLogLayer`].
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            if let Err(e) = std::fs::create_dir_all(parent) {
                eprintln!("corral-telemetry: cannot create {}: {e}", parent.display());
            }
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    fn insert(&self, entry: &Entry) -> rusqlite::Result<()> {
        self.conn.lock().execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, session_id, backend, unit)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                entry.timestamp,
                entry.level,
                entry.target,
                entry.message,
                entry.fields,
                entry.tags.session_id,
                entry.tags.backend,
                entry.tags.unit,
            ],
        )?;
        Ok(())
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let (sql, values) = q.to_sql();
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values), LogRecord::from_row)?;
        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        self.conn.lock().query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// Correlation fields; events inherit whatever their spans carry.
#[derive(Clone, Debug, Default)]
struct Tags {
    session_id: Option<String>,
    backend: Option<String>,
    unit: Option<String>,
}

impl Tags {
    fn any(&self) -> bool {
        self.session_id.is_some() || self.backend.is_some() || self.unit.is_some()
    }

    fn fill_from(&mut self, outer: &Tags) {
        if self.session_id.is_none() {
            self.session_id.clone_from(&outer.session_id);
        }
        if self.backend.is_none() {
            self.backend.clone_from(&outer.backend);
        }
        if self.unit.is_none() {
            self.unit.clone_from(&outer.unit);
        }
    }
}

struct Entry {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    tags: Tags,
}

#[derive(Default)]
struct Collector {
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
    tags: Tags,
}

impl Collector {
    fn text(&mut self, name: &str, value: String) {
        match name {
            "message" => self.message = value,
            "session_id" => self.tags.session_id = Some(value),
            "backend" => self.tags.backend = Some(value),
            // containers and apps are both units
            "unit" | "container" | "app" => self.tags.unit = Some(value),
            other => {
                self.fields.insert(other.to_string(), value.into());
            }
        }
    }

    fn value(&mut self, name: &str, value: serde_json::Value) {
        self.fields.insert(name.to_string(), value);
    }
}

impl Visit for Collector {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        let rendered = match field.name() {
            "message" => rendered,
            _ => rendered.trim_matches('"').to_string(),
        };
        self.text(field.name(), rendered);
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.text(field.name(), value.to_string());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.value(field.name(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.value(field.name(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.value(field.name(), value.into());
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.value(field.name(), n.into());
        }
    }
}

/// Layer that writes WARN and ERROR events to a [`SqliteLogSink`].
pub struct SqliteLogLayer {
    sink: Arc<SqliteLogSink>,
}

impl SqliteLogLayer {
    pub fn new(sink: Arc<SqliteLogSink>) -> Self {
        Self { sink }
    }
}

impl<S> Layer<S> for SqliteLogLayer
where
    S: tracing::Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut collector = Collector::default();
        attrs.record(&mut collector);
        if collector.tags.any() {
            if let Some(span) = ctx.span(id) {
                span.extensions_mut().insert(collector.tags);
            }
        }
    }

    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        let meta = event.metadata();
        if *meta.level() > Level::WARN {
            return;
        }
        let mut collector = Collector::default();
        event.record(&mut collector);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<Tags>() {
                    collector.tags.fill_from(outer);
                }
            }
        }

        let entry = Entry {
            timestamp: Utc::now().to_rfc3339(),
            level: meta.level().as_str().to_string(),
            target: meta.target().to_string(),
            message: collector.message,
            fields: (!collector.fields.is_empty())
                .then(|| serde_json::Value::Object(collector.fields).to_string()),
            tags: collector.tags,
        };
        if let Err(e) = self.sink.insert(&entry) {
            eprintln!("corral-telemetry: failed to persist log line: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    fn sink_in(dir: &tempfile::TempDir) -> Arc<SqliteLogSink> {
        Arc::new(SqliteLogSink::new(&dir.path().join("logs.db")).unwrap())
    }

    fn entry(ts: &str, level: &str, message: &str, session: Option<&str>, unit: Option<&str>) -> Entry {
        Entry {
            timestamp: ts.into(),
            level: level.into(),
            target: "corral_backends::docker".into(),
            message: message.into(),
            fields: None,
            tags: Tags { session_id: session.map(Into::into), backend: Some("docker".into()), unit: unit.map(Into::into) },
        }
    }

    #[test]
    fn query_filters_by_session_unit_level_and_time() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        sink.insert(&entry("2026-03-01T11:00:00Z", "WARN", "probe failed", Some("s1"), Some("corral-ws-1"))).unwrap();
        sink.insert(&entry("2026-03-01T13:00:00Z", "ERROR", "start failed", Some("s2"), Some("corral-ws-2"))).unwrap();
        assert_eq!(sink.count().unwrap(), 2);

        let by_session = sink.query(&LogQuery { session_id: Some("s2".into()), ..Default::default() }).unwrap();
        assert_eq!(by_session.len(), 1);
        assert_eq!(by_session[0].message, "start failed");

        let by_unit = sink.query(&LogQuery { unit: Some("corral-ws-1".into()), ..Default::default() }).unwrap();
        assert_eq!(by_unit[0].message, "probe failed");

        let errors = sink.query(&LogQuery { errors_only: true, ..Default::default() }).unwrap();
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].level, "ERROR");

        let recent = sink.query(&LogQuery { since: Some("2026-03-01T12:00:00Z".into()), ..Default::default() }).unwrap();
        assert_eq!(recent.len(), 1);

        let none = sink
            .query(&LogQuery { session_id: Some("s1".into()), errors_only: true, ..Default::default() })
            .unwrap();
        assert!(none.is_empty());
    }

    #[test]
    fn newest_first_with_limit() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        for i in 0..5 {
            sink.insert(&entry(&format!("2026-03-01T12:00:0{i}Z"), "WARN", &format!("line {i}"), None, None)).unwrap();
        }
        let rows = sink.query(&LogQuery { limit: Some(2), ..Default::default() }).unwrap();
        let messages: Vec<&str> = rows.iter().map(|r| r.message.as_str()).collect();
        assert_eq!(messages, vec!["line 4", "line 3"]);
    }

    #[test]
    fn layer_keeps_warnings_and_inherits_span_tags() {
        let dir = tempfile::tempdir().unwrap();
        let sink = sink_in(&dir);
        let subscriber = tracing_subscriber::registry().with(SqliteLogLayer::new(sink.clone()));

        tracing::subscriber::with_default(subscriber, || {
            let span = tracing::info_span!("turn", session_id = "s42", backend = "docker");
            let _entered = span.enter();
            tracing::info!("dropped");
            tracing::warn!(container = "corral-ws-42", attempt = 3u64, "health probe failed");
        });

        let rows = sink.query(&LogQuery::default()).unwrap();
        assert_eq!(rows.len(), 1);
        let row = &rows[0];
        assert_eq!(row.level, "WARN");
        assert_eq!(row.message, "health probe failed");
        assert_eq!(row.session_id.as_deref(), Some("s42"));
        assert_eq!(row.backend.as_deref(), Some("docker"));
        assert_eq!(row.unit.as_deref(), Some("corral-ws-42"));
        let fields: serde_json::Value = serde_json::from_str(row.fields.as_deref().unwrap()).unwrap();
        assert_eq!(fields["attempt"], 3);
        assert!(fields.get("container").is_none());
    }
}
