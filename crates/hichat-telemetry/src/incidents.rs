//! Warn+ chat events persisted to SQLite.
//!
//! Every event at WARN or above becomes one row in `incidents`. The routing
//! identities the server logs (`user_id`, `target_id`, `group_id`,
//! `connection_id`, `conversation`) and the error fields (`error`, `kind`)
//! get their own columns so a dropped delivery can be traced to a
//! conversation with plain SQL. Identities missing on the event are taken
//! from the nearest enclosing span that carries them.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use rusqlite::Connection;
use serde_json::{Map, Value};
use tracing::field::{Field, Visit};
use tracing::span;
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::Context;
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::Layer;

const SCHEMA: &str = "
    PRAGMA journal_mode = WAL;
    PRAGMA synchronous = NORMAL;
    CREATE TABLE IF NOT EXISTS incidents (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        recorded_at TEXT NOT NULL,
        level TEXT NOT NULL,
        module TEXT NOT NULL,
        message TEXT NOT NULL,
        kind TEXT,
        error TEXT,
        user_id TEXT,
        target_id TEXT,
        group_id TEXT,
        connection_id TEXT,
        conversation TEXT,
        detail TEXT
    );
    CREATE INDEX IF NOT EXISTS idx_incidents_user ON incidents(user_id);
    CREATE INDEX IF NOT EXISTS idx_incidents_conversation ON incidents(conversation);
    CREATE INDEX IF NOT EXISTS idx_incidents_kind ON incidents(kind);
";

/// Append-only incident table.
pub struct IncidentStore {
    conn: Mutex<Connection>,
    path: PathBuf,
}

impl IncidentStore {
    pub fn open(path: &Path) -> Result<Self, rusqlite::Error> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record(&self, incident: &Incident) -> Result<(), rusqlite::Error> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare_cached(
            "INSERT INTO incidents (recorded_at, level, module, message, kind, error,
                 user_id, target_id, group_id, connection_id, conversation, detail)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
        )?;
        let ctx = &incident.context;
        stmt.execute(rusqlite::params![
            incident.recorded_at,
            incident.level,
            incident.module,
            incident.message,
            ctx.kind,
            ctx.error,
            ctx.user_id,
            ctx.target_id,
            ctx.group_id,
            ctx.connection_id,
            ctx.conversation,
            incident.detail,
        ])?;
        Ok(())
    }
}

struct Incident {
    recorded_at: String,
    level: &'static str,
    module: String,
    message: String,
    context: ChatContext,
    detail: Option<String>,
}

/// The chat identities and error fields carried by an event or span.
#[derive(Clone, Debug, Default, PartialEq)]
struct ChatContext {
    user_id: Option<String>,
    target_id: Option<String>,
    group_id: Option<String>,
    connection_id: Option<String>,
    conversation: Option<String>,
    error: Option<String>,
    kind: Option<String>,
}

impl ChatContext {
    fn slot(&mut self, name: &str) -> Option<&mut Option<String>> {
        match name {
            "user_id" => Some(&mut self.user_id),
            "target_id" => Some(&mut self.target_id),
            "group_id" => Some(&mut self.group_id),
            "connection_id" => Some(&mut self.connection_id),
            "conversation" => Some(&mut self.conversation),
            "error" => Some(&mut self.error),
            "kind" => Some(&mut self.kind),
            _ => None,
        }
    }

    /// Fill the slots still empty here from `outer`.
    fn inherit(&mut self, outer: &ChatContext) {
        for (mine, theirs) in [
            (&mut self.user_id, &outer.user_id),
            (&mut self.target_id, &outer.target_id),
            (&mut self.group_id, &outer.group_id),
            (&mut self.connection_id, &outer.connection_id),
            (&mut self.conversation, &outer.conversation),
        ] {
            if mine.is_none() {
                mine.clone_from(theirs);
            }
        }
    }

    fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Splits recorded fields into the message, the chat context and the rest.
#[derive(Default)]
struct EventFields {
    message: Option<String>,
    context: ChatContext,
    extra: Map<String, Value>,
}

impl EventFields {
    fn put(&mut self, field: &Field, text: String, raw: Value) {
        let name = field.name();
        if name == "message" {
            self.message = Some(text);
        } else if let Some(slot) = self.context.slot(name) {
            *slot = Some(text);
        } else {
            self.extra.insert(name.to_owned(), raw);
        }
    }
}

impl Visit for EventFields {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let text = format!("{value:?}");
        self.put(field, text.clone(), Value::String(text));
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        self.put(field, value.to_owned(), Value::String(value.to_owned()));
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.put(field, value.to_string(), Value::from(value));
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.put(field, value.to_string(), Value::from(value));
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.put(field, value.to_string(), Value::Bool(value));
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        let text = value.to_string();
        self.put(field, text.clone(), Value::String(text));
    }
}

/// `tracing` layer feeding an [`IncidentStore`].
pub struct IncidentLayer {
    store: Arc<IncidentStore>,
}

impl IncidentLayer {
    pub fn new(store: Arc<IncidentStore>) -> Self {
        Self { store }
    }
}

impl<S> Layer<S> for IncidentLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_new_span(&self, attrs: &span::Attributes<'_>, id: &span::Id, ctx: Context<'_, S>) {
        let mut fields = EventFields::default();
        attrs.record(&mut fields);
        if fields.context.is_empty() {
            return;
        }
        if let Some(span) = ctx.span(id) {
            span.extensions_mut().insert(fields.context);
        }
    }

    fn on_record(&self, id: &span::Id, values: &span::Record<'_>, ctx: Context<'_, S>) {
        let Some(span) = ctx.span(id) else { return };
        let mut fields = EventFields::default();
        values.record(&mut fields);
        if fields.context.is_empty() {
            return;
        }
        let mut extensions = span.extensions_mut();
        match extensions.get_mut::<ChatContext>() {
            Some(existing) => {
                fields.context.inherit(existing);
                *existing = fields.context;
            }
            None => extensions.insert(fields.context),
        }
    }

    fn on_event(&self, event: &Event<'_>, ctx: Context<'_, S>) {
        let level = *event.metadata().level();
        if level > Level::WARN {
            return;
        }

        let mut fields = EventFields::default();
        event.record(&mut fields);
        if let Some(scope) = ctx.event_scope(event) {
            for span in scope {
                if let Some(outer) = span.extensions().get::<ChatContext>() {
                    fields.context.inherit(outer);
                }
            }
        }

        let incident = Incident {
            recorded_at: Utc::now().to_rfc3339(),
            level: level.as_str(),
            module: event.metadata().target().to_owned(),
            message: fields.message.unwrap_or_default(),
            context: fields.context,
            detail: (!fields.extra.is_empty())
                .then(|| Value::Object(fields.extra).to_string()),
        };
        if let Err(e) = self.store.record(&incident) {
            // Logging here would recurse into this layer
            eprintln!("hichat-telemetry: failed to record incident: {e}");
        }
    }
}
