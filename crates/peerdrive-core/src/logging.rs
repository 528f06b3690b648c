//! Tracing setup with optional JSONL file output.
//!
//! Each node instance can append machine-readable log lines to its own file,
//! which keeps multi-node debugging greppable:
//!
//! ```bash
//! jq 'select(.level == "ERROR")' node-a.jsonl
//! cat */node-*.jsonl | jq -s 'sort_by(.ts)'
//! ```

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};
use tracing_subscriber::registry::LookupSpan;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

use crate::config::LogOptions;
use crate::error::NodeResult;

/// One JSONL line.
#[derive(Debug, Serialize)]
pub struct JsonLogEntry {
    /// RFC 3339 timestamp
    pub ts: String,
    pub level: String,
    pub target: String,
    pub message: String,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    pub fields: serde_json::Map<String, serde_json::Value>,
}

/// Layer that appends one JSON object per event to a file.
pub struct JsonlLayer {
    writer: Arc<Mutex<File>>,
}

impl JsonlLayer {
    pub fn new(path: impl AsRef<Path>) -> NodeResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: Arc::new(Mutex::new(file)),
        })
    }
}

struct JsonVisitor {
    message: String,
    fields: serde_json::Map<String, serde_json::Value>,
}

impl Visit for JsonVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn std::fmt::Debug) {
        let rendered = format!("{:?}", value);
        if field.name() == "message" {
            self.message = rendered;
        } else {
            self.fields.insert(field.name().to_string(), rendered.into());
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.fields.insert(field.name().to_string(), value.into());
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.fields.insert(field.name().to_string(), value.into());
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.fields.insert(field.name().to_string(), value.into());
    }
}

impl<S> Layer<S> for JsonlLayer
where
    S: Subscriber + for<'a> LookupSpan<'a>,
{
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut visitor = JsonVisitor {
            message: String::new(),
            fields: serde_json::Map::new(),
        };
        event.record(&mut visitor);

        let entry = JsonLogEntry {
            ts: chrono::Utc::now().to_rfc3339(),
            level: event.metadata().level().to_string(),
            target: event.metadata().target().to_string(),
            message: visitor.message,
            fields: visitor.fields,
        };

        if let Ok(line) = serde_json::to_string(&entry) {
            let mut file = self.writer.lock();
            let _ = writeln!(file, "{}", line);
            let _ = file.flush();
        }
    }
}

/// Install the global subscriber: env-filtered stderr output plus an
/// optional JSONL file. Safe to call more than once; later calls are no-ops.
pub fn init(options: &LogOptions) -> NodeResult<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let jsonl = match &options.file {
        Some(path) => Some(JsonlLayer::new(path)?),
        None => None,
    };

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(jsonl)
        .try_init();

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing::info;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn test_jsonl_layer_writes_entries() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs").join("node.jsonl");

        let layer = JsonlLayer::new(&path).unwrap();
        let subscriber = tracing_subscriber::registry().with(layer);

        tracing::subscriber::with_default(subscriber, || {
            info!(answer = 42, flag = true, "hello world");
        });

        let contents = std::fs::read_to_string(&path).unwrap();
        let line = contents.lines().next().expect("one line");
        let parsed: serde_json::Value = serde_json::from_str(line).unwrap();
        assert_eq!(parsed["level"], "INFO");
        assert_eq!(parsed["message"], "hello world");
        assert_eq!(parsed["fields"]["answer"], 42);
        assert_eq!(parsed["fields"]["flag"], true);
    }

    #[test]
    fn test_init_is_idempotent() {
        let options = LogOptions::default();
        init(&options).unwrap();
        init(&options).unwrap();
    }
}
