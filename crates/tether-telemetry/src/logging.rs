use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing_subscriber::layer::Context;
use tracing_subscriber::Layer;

/// A log record persisted to SQLite.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct LogRecord {
    pub id: i64,
    pub timestamp: String,
    pub level: String,
    pub target: String,
    pub message: String,
    pub fields: Option<String>,
    pub span_id: Option<String>,
    pub conversation_id: Option<String>,
    pub device_id: Option<String>,
}

/// Query parameters for searching persisted logs.
#[derive(Clone, Debug, Default)]
pub struct LogQuery {
    pub level: Option<String>,
    pub target: Option<String>,
    pub conversation_id: Option<String>,
    pub since: Option<String>,
    pub limit: Option<u32>,
}

/// Row about to be written. Private: the public read type is `LogRecord`.
struct LogInsert {
    timestamp: String,
    level: String,
    target: String,
    message: String,
    fields: Option<String>,
    span_id: Option<String>,
    conversation_id: Option<String>,
    device_id: Option<String>,
}

/// SQLite sink that persists warn+ logs.
pub struct SqliteLogSink {
    conn: Mutex<Connection>,
}

impl SqliteLogSink {
    pub fn new(db_path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(db_path)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             CREATE TABLE IF NOT EXISTS logs (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 timestamp TEXT NOT NULL,
                 level TEXT NOT NULL,
                 target TEXT NOT NULL,
                 message TEXT NOT NULL,
                 fields TEXT,
                 span_id TEXT,
                 conversation_id TEXT,
                 device_id TEXT,
                 created_at TEXT NOT NULL DEFAULT (datetime('now'))
             );
             CREATE INDEX IF NOT EXISTS idx_logs_level ON logs(level);
             CREATE INDEX IF NOT EXISTS idx_logs_conversation ON logs(conversation_id);
             CREATE INDEX IF NOT EXISTS idx_logs_timestamp ON logs(timestamp);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    // Best-effort: a full log database must never take the daemon down.
    fn insert(&self, record: &LogInsert) {
        let conn = self.conn.lock();
        let _ = conn.execute(
            "INSERT INTO logs (timestamp, level, target, message, fields, span_id, conversation_id, device_id)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
            rusqlite::params![
                record.timestamp,
                record.level,
                record.target,
                record.message,
                record.fields,
                record.span_id,
                record.conversation_id,
                record.device_id,
            ],
        );
    }

    pub fn query(&self, q: &LogQuery) -> Result<Vec<LogRecord>, rusqlite::Error> {
        let mut clauses: Vec<String> = Vec::new();
        let mut params: Vec<Box<dyn rusqlite::types::ToSql>> = Vec::new();

        if let Some(level) = &q.level {
            params.push(Box::new(level.clone()));
            clauses.push(format!("level = ?{}", params.len()));
        }
        if let Some(target) = &q.target {
            params.push(Box::new(format!("%{target}%")));
            clauses.push(format!("target LIKE ?{}", params.len()));
        }
        if let Some(conversation_id) = &q.conversation_id {
            params.push(Box::new(conversation_id.clone()));
            clauses.push(format!("conversation_id = ?{}", params.len()));
        }
        if let Some(since) = &q.since {
            params.push(Box::new(since.clone()));
            clauses.push(format!("timestamp >= ?{}", params.len()));
        }

        let mut sql = String::from(
            "SELECT id, timestamp, level, target, message, fields, span_id, conversation_id, device_id FROM logs",
        );
        if !clauses.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&clauses.join(" AND "));
        }
        sql.push_str(&format!(" ORDER BY id DESC LIMIT {}", q.limit.unwrap_or(100)));

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let param_refs: Vec<&dyn rusqlite::types::ToSql> =
            params.iter().map(|p| p.as_ref()).collect();
        let rows = stmt.query_map(param_refs.as_slice(), |row| {
            Ok(LogRecord {
                id: row.get(0)?,
                timestamp: row.get(1)?,
                level: row.get(2)?,
                target: row.get(3)?,
                message: row.get(4)?,
                fields: row.get(5)?,
                span_id: row.get(6)?,
                conversation_id: row.get(7)?,
                device_id: row.get(8)?,
            })
        })?;

        rows.collect()
    }

    pub fn count(&self) -> Result<i64, rusqlite::Error> {
        let conn = self.conn.lock();
        conn.query_row("SELECT COUNT(*) FROM logs", [], |row| row.get(0))
    }
}

/// Visitor that collects a tracing event's fields. The message is kept
/// apart; context keys are pulled out of the map afterwards with
/// `take_context`.
#[derive(Default)]
struct FieldVisitor {
    message: Option<String>,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl FieldVisitor {
    /// Remove and return a context field recorded on this event.
    /// Values that arrived through `record_debug` carry quotes; strip them.
    fn take_context(&mut self, key: &str) -> Option<String> {
        match self.fields.remove(key)? {
            serde_json::Value::String(s) => Some(s.trim_matches('"').to_string()),
            other => Some(other.to_string()),
        }
    }

    fn fields_json(&self) -> Option<String> {
        if self.fields.is_empty() {
            return None;
        }
        serde_json::to_string(&self.fields).ok()
    }
}

impl Visit for FieldVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{value:?}");
        if field.name() == "message" {
            self.message = Some(rendered);
        } else {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::String(rendered));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = Some(value.to_string());
        } else {
            self.fields.insert(
                field.name().to_string(),
                serde_json::Value::String(value.to_string()),
            );
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(
            field.name().to_string(),
            serde_json::Value::Number(value.into()),
        );
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        if let Some(n) = serde_json::Number::from_f64(value) {
            self.fields
                .insert(field.name().to_string(), serde_json::Value::Number(n));
        }
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields
            .insert(field.name().to_string(), serde_json::Value::Bool(value));
    }
}

/// Context keys carried on spans so child events inherit them.
#[derive(Clone, Default)]
struct SpanContext {
    conversation_id: Option<String>,
    device_id: Option<String>,
}

impl SpanContext {
    fn fill_from(&mut self, other: &SpanContext) {
        if self.conversation_id.is_none() {
            self.conversation_id.clone_from(&other.conversation_id);
        }
        if self.device_id.is_none() {
            self.device_id.clone_from(&other.device_id);
        }
    }

    fn is_empty(&self) -> bool {
        self.conversation_id.is_none() && self.device_id.is_none()
    }
}

/// tracing Layer that writes warn+ events to SQLite.
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
    S: tracing::Subscriber + for<'a> tracing_subscriber::registry::LookupSpan<'a>,
{
    fn on_event(&self, event: &tracing::Event<'_>, ctx: Context<'_, S>) {
        // Only persist WARN and above
        let level = *event.metadata().level();
        if level > tracing::Level::WARN {
            return;
        }

        let mut visitor = FieldVisitor::default();
        event.record(&mut visitor);

        let mut context = SpanContext {
            conversation_id: visitor.take_context("conversation_id"),
            device_id: visitor.take_context("device_id"),
        };

        // Inherit context keys from enclosing spans the event didn't set
        let mut span_id = None;
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if span_id.is_none() {
                    span_id = Some(format!("{:?}", span.id()));
                }
                if let Some(fields) = span.extensions().get::<SpanContext>() {
                    context.fill_from(fields);
                }
            }
        }

        self.sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message.clone().unwrap_or_default(),
            fields: visitor.fields_json(),
            span_id,
            conversation_id: context.conversation_id,
            device_id: context.device_id,
        });
    }

    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut visitor = FieldVisitor::default();
        attrs.record(&mut visitor);

        let context = SpanContext {
            conversation_id: visitor.take_context("conversation_id"),
            device_id: visitor.take_context("device_id"),
        };
        if context.is_empty() {
            return;
        }

        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(context);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn temp_db() -> PathBuf {
        let dir = std::env::temp_dir().join(format!("tether-test-logs-{}", uuid::Uuid::now_v7()));
        std::fs::create_dir_all(&dir).unwrap();
        dir.join("test-logs.db")
    }

    fn insert_row(sink: &SqliteLogSink, level: &str, target: &str, message: &str) {
        sink.insert(&LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: level.into(),
            target: target.into(),
            message: message.into(),
            fields: None,
            span_id: None,
            conversation_id: None,
            device_id: None,
        });
    }

    fn insert_for_conversation(sink: &SqliteLogSink, conversation_id: &str, message: &str) {
        sink.insert(&LogInsert {
            conversation_id: Some(conversation_id.into()),
            ..minimal_row(message)
        });
    }

    fn insert_at(sink: &SqliteLogSink, timestamp: &str, message: &str) {
        sink.insert(&LogInsert {
            timestamp: timestamp.into(),
            ..minimal_row(message)
        });
    }

    fn minimal_row(message: &str) -> LogInsert {
        LogInsert {
            timestamp: Utc::now().to_rfc3339(),
            level: "WARN".into(),
            target: "test".into(),
            message: message.into(),
            fields: None,
            span_id: None,
            conversation_id: None,
            device_id: None,
        }
    }

    #[test]
    fn sqlite_sink_create_and_insert() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();

        sink.insert(&LogInsert {
            timestamp: "2026-08-14T12:00:00Z".into(),
            level: "WARN".into(),
            target: "tether_sync::retry".into(),
            message: "retrying after error".into(),
            fields: Some(r#"{"attempt":1}"#.into()),
            span_id: None,
            conversation_id: Some("conv_123".into()),
            device_id: None,
        });

        assert_eq!(sink.count().unwrap(), 1);
    }

    #[test]
    fn sqlite_sink_query_by_level() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert_row(&sink, "WARN", "test", "warning msg");
        insert_row(&sink, "ERROR", "test", "error msg");

        let results = sink
            .query(&LogQuery {
                level: Some("ERROR".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "error msg");
    }

    #[test]
    fn sqlite_sink_query_by_conversation() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert_for_conversation(&sink, "conv_aaa", "conversation A");
        insert_for_conversation(&sink, "conv_bbb", "conversation B");

        let results = sink
            .query(&LogQuery {
                conversation_id: Some("conv_aaa".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "conversation A");
    }

    #[test]
    fn sqlite_sink_query_by_target() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert_row(&sink, "ERROR", "tether_cloud::http", "server error");
        insert_row(&sink, "ERROR", "tether_store::messages", "db error");

        let results = sink
            .query(&LogQuery {
                target: Some("http".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "server error");
    }

    #[test]
    fn sqlite_sink_query_limit() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        for i in 0..10 {
            insert_row(&sink, "WARN", "test", &format!("msg {i}"));
        }

        let results = sink
            .query(&LogQuery {
                limit: Some(3),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 3);
        // Most recent first (ORDER BY id DESC)
        assert_eq!(results[0].message, "msg 9");
    }

    #[test]
    fn sqlite_sink_query_since() {
        let sink = SqliteLogSink::new(&temp_db()).unwrap();
        insert_at(&sink, "2026-08-14T11:00:00Z", "old");
        insert_at(&sink, "2026-08-14T13:00:00Z", "new");

        let results = sink
            .query(&LogQuery {
                since: Some("2026-08-14T12:00:00Z".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(results[0].message, "new");
    }

    #[test]
    fn take_context_strips_debug_quotes() {
        let mut visitor = FieldVisitor::default();
        visitor.fields.insert(
            "conversation_id".into(),
            serde_json::Value::String("\"conv_123\"".into()),
        );
        assert_eq!(
            visitor.take_context("conversation_id").as_deref(),
            Some("conv_123")
        );
        // Removed from the remaining fields
        assert!(visitor.fields_json().is_none());
    }

    #[test]
    fn span_context_fill_keeps_existing() {
        let mut inner = SpanContext {
            conversation_id: Some("conv_inner".into()),
            device_id: None,
        };
        let outer = SpanContext {
            conversation_id: Some("conv_outer".into()),
            device_id: Some("dev_outer".into()),
        };
        inner.fill_from(&outer);
        // Innermost span wins; only the missing key is inherited
        assert_eq!(inner.conversation_id.as_deref(), Some("conv_inner"));
        assert_eq!(inner.device_id.as_deref(), Some("dev_outer"));
    }

    #[test]
    fn log_record_serde_roundtrip() {
        let record = LogRecord {
            id: 1,
            timestamp: "2026-08-14T12:00:00Z".into(),
            level: "WARN".into(),
            target: "tether_sync".into(),
            message: "delta base rejected".into(),
            fields: Some(r#"{"expected_base":850}"#.into()),
            span_id: Some("Id(42)".into()),
            conversation_id: Some("conv_123".into()),
            device_id: Some("dev_456".into()),
        };
        let json = serde_json::to_string(&record).unwrap();
        let parsed: LogRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, 1);
        assert_eq!(parsed.level, "WARN");
        assert_eq!(parsed.conversation_id.as_deref(), Some("conv_123"));
    }
}
