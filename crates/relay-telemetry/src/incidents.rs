//! Incident journal.
//!
//! Call sites mark lifecycle trouble by adding an `incident` field to a
//! warn or error event, e.g. `warn!(incident = "decode_failure", ...)`.
//! [`IncidentLayer`] picks those events up, attaches the connection and
//! session they happened in, and appends them to SQLite so `/api/logs` can
//! show what went wrong for a given chat session after the fact. Events
//! without an `incident` field only go to stdout.

use std::fmt::Debug;
use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::{params_from_iter, Connection};
use serde::{Deserialize, Serialize};
use tracing::field::{Field, Visit};
use tracing::{span, Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

/// Field name that turns a log event into an incident.
pub const INCIDENT_FIELD: &str = "incident";

const DEFAULT_LIMIT: u32 = 100;

/// One journaled incident.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Incident {
    pub id: i64,
    pub at: String,
    pub level: String,
    pub kind: String,
    pub message: String,
    pub connection_id: Option<String>,
    pub session_id: Option<String>,
    /// Remaining event fields as a JSON object, if any.
    pub detail: Option<String>,
}

/// Filters for [`IncidentJournal::recent`]. Unset fields match everything.
#[derive(Clone, Debug, Default)]
pub struct IncidentQuery {
    pub level: Option<String>,
    pub kind: Option<String>,
    pub connection_id: Option<String>,
    pub session_id: Option<String>,
    pub limit: Option<u32>,
}

#[derive(Debug, Default)]
struct Entry {
    level: String,
    kind: String,
    message: String,
    connection_id: Option<String>,
    session_id: Option<String>,
    detail: serde_json::Map<String, serde_json::Value>,
}

pub struct IncidentJournal {
    conn: Mutex<Connection>,
}

impl IncidentJournal {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(dir) = path.parent() {
            let _ = std::fs::create_dir_all(dir);
        }
        Self::with_connection(Connection::open(path)?)
    }

    pub fn in_memory() -> Result<Self, rusqlite::Error> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, rusqlite::Error> {
        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             CREATE TABLE IF NOT EXISTS incidents (
                 id INTEGER PRIMARY KEY AUTOINCREMENT,
                 at TEXT NOT NULL,
                 level TEXT NOT NULL,
                 kind TEXT NOT NULL,
                 message TEXT NOT NULL,
                 connection_id TEXT,
                 session_id TEXT,
                 detail TEXT
             );
             CREATE INDEX IF NOT EXISTS idx_incidents_connection ON incidents(connection_id);
             CREATE INDEX IF NOT EXISTS idx_incidents_session ON incidents(session_id);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn append(&self, entry: Entry) {
        let detail = (!entry.detail.is_empty())
            .then(|| serde_json::Value::Object(entry.detail).to_string());
        let result = self.conn.lock().execute(
            "INSERT INTO incidents (at, level, kind, message, connection_id, session_id, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                Utc::now().to_rfc3339(),
                entry.level,
                entry.kind,
                entry.message,
                entry.connection_id,
                entry.session_id,
                detail,
            ],
        );
        // Logging here would re-enter the layer.
        if let Err(e) = result {
            eprintln!("relay-telemetry: dropped incident: {e}");
        }
    }

    /// Newest first.
    pub fn recent(&self, query: &IncidentQuery) -> Result<Vec<Incident>, rusqlite::Error> {
        let mut clauses = Vec::new();
        let mut values = Vec::new();
        let filters = [
            ("level", query.level.as_ref().map(|l| l.to_uppercase())),
            ("kind", query.kind.clone()),
            ("connection_id", query.connection_id.clone()),
            ("session_id", query.session_id.clone()),
        ];
        for (column, value) in filters {
            if let Some(value) = value {
                values.push(value);
                clauses.push(format!("{column} = ?{}", values.len()));
            }
        }
        let filter = if clauses.is_empty() {
            String::new()
        } else {
            format!("WHERE {}", clauses.join(" AND "))
        };
        let sql = format!(
            "SELECT id, at, level, kind, message, connection_id, session_id, detail
             FROM incidents {filter} ORDER BY id DESC LIMIT {}",
            query.limit.unwrap_or(DEFAULT_LIMIT)
        );

        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(values.iter()), |row| {
            Ok(Incident {
                id: row.get(0)?,
                at: row.get(1)?,
                level: row.get(2)?,
                kind: row.get(3)?,
                message: row.get(4)?,
                connection_id: row.get(5)?,
                session_id: row.get(6)?,
                detail: row.get(7)?,
            })
        })?;
        rows.collect()
    }
}

/// Routes `incident`-tagged warn/error events into an [`IncidentJournal`].
pub struct IncidentLayer {
    journal: Arc<IncidentJournal>,
}

impl IncidentLayer {
    pub fn new(journal: Arc<IncidentJournal>) -> Self {
        Self { journal }
    }
}

/// Connection and session ids declared on a span.
#[derive(Clone, Default)]
struct Scope {
    connection_id: Option<String>,
    session_id: Option<String>,
}

impl Visit for Scope {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "connection_id" => self.connection_id = Some(value.to_string()),
            "session_id" => self.session_id = Some(value.to_string()),
            _ => {}
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.record_str(field, &unquote(format!("{value:?}")));
    }
}

impl Visit for Entry {
    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message = value.to_string(),
            INCIDENT_FIELD => self.kind = value.to_string(),
            "connection_id" => self.connection_id = Some(value.to_string()),
            "session_id" => self.session_id = Some(value.to_string()),
            name => {
                self.detail.insert(name.to_string(), value.into());
            }
        }
    }

    fn record_debug(&mut self, field: &Field, value: &dyn Debug) {
        self.record_str(field, &unquote(format!("{value:?}")));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.detail.insert(field.name().to_string(), value.into());
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.detail.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.detail.insert(field.name().to_string(), value.into());
    }
}

fn unquote(s: String) -> String {
    match s.strip_prefix('"').and_then(|s| s.strip_suffix('"')) {
        Some(inner) => inner.to_string(),
        None => s,
    }
}

impl<S> Layer<S> for IncidentLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut scope = Scope::default();
        attrs.record(&mut scope);
        if scope.connection_id.is_none() && scope.session_id.is_none() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(scope);
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN
            || !event.metadata().fields().iter().any(|f| f.name() == INCIDENT_FIELD)
        {
            return;
        }

        let mut entry = Entry {
            level: level.as_str().to_string(),
            ..Default::default()
        };
        event.record(&mut entry);

        // Innermost span wins for ids the event doesn't carry itself.
        if let Some(spans) = ctx.event_scope(event) {
            for span in spans {
                let extensions = span.extensions();
                let Some(scope) = extensions.get::<Scope>() else { continue };
                if entry.connection_id.is_none() {
                    entry.connection_id.clone_from(&scope.connection_id);
                }
                if entry.session_id.is_none() {
                    entry.session_id.clone_from(&scope.session_id);
                }
            }
        }

        self.journal.append(entry);
    }
}
