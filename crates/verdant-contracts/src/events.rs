//! Job event log: one JSON object per line, numbered in emission order.

use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::Context;
use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Keys every event carries; payload entries with these names are dropped.
pub const ENVELOPE_KEYS: [&str; 4] = ["type", "job_id", "seq", "ts"];

/// Shared, cloneable event sink for one job.
///
/// File-backed writers append to `events.jsonl` and keep the handle open.
/// In-memory writers retain every event so observers can replay them.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    job_id: String,
    state: Mutex<SinkState>,
}

#[derive(Debug)]
struct SinkState {
    next_seq: u64,
    sink: Sink,
}

#[derive(Debug)]
enum Sink {
    Jsonl { path: PathBuf, file: Option<File> },
    Memory(Vec<Value>),
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, job_id: impl Into<String>) -> Self {
        Self::with_sink(
            job_id.into(),
            Sink::Jsonl {
                path: path.into(),
                file: None,
            },
        )
    }

    pub fn in_memory(job_id: impl Into<String>) -> Self {
        Self::with_sink(job_id.into(), Sink::Memory(Vec::new()))
    }

    fn with_sink(job_id: String, sink: Sink) -> Self {
        Self {
            inner: Arc::new(Inner {
                job_id,
                state: Mutex::new(SinkState { next_seq: 1, sink }),
            }),
        }
    }

    pub fn path(&self) -> Option<PathBuf> {
        match &self.state().sink {
            Sink::Jsonl { path, .. } => Some(path.clone()),
            Sink::Memory(_) => None,
        }
    }

    pub fn job_id(&self) -> &str {
        &self.inner.job_id
    }

    /// Events kept by an in-memory writer; empty for file-backed writers.
    pub fn recorded(&self) -> Vec<Value> {
        match &self.state().sink {
            Sink::Memory(events) => events.clone(),
            Sink::Jsonl { .. } => Vec::new(),
        }
    }

    /// Records one event. Object payloads are flattened into the envelope;
    /// any other value lands under `data`.
    pub fn emit(&self, event_type: &str, payload: Value) -> anyhow::Result<Value> {
        let mut state = self.state();
        let seq = state.next_seq;

        let mut event = Map::new();
        event.insert("type".to_string(), Value::String(event_type.to_string()));
        event.insert("job_id".to_string(), Value::String(self.inner.job_id.clone()));
        event.insert("seq".to_string(), Value::from(seq));
        event.insert("ts".to_string(), Value::String(now_utc_iso()));
        match payload {
            Value::Object(fields) => {
                for (key, value) in fields {
                    if !ENVELOPE_KEYS.contains(&key.as_str()) {
                        event.insert(key, value);
                    }
                }
            }
            Value::Null => {}
            other => {
                event.insert("data".to_string(), other);
            }
        }
        let event = Value::Object(event);

        match &mut state.sink {
            Sink::Memory(events) => events.push(event.clone()),
            Sink::Jsonl { path, file } => {
                let line = serde_json::to_string(&event)?;
                if file.is_none() {
                    *file = Some(open_append(path)?);
                }
                if let Some(handle) = file.as_mut() {
                    writeln!(handle, "{line}")
                        .with_context(|| format!("failed appending to {}", path.display()))?;
                }
            }
        }
        state.next_seq = seq + 1;
        Ok(event)
    }

    fn state(&self) -> MutexGuard<'_, SinkState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

fn open_append(path: &Path) -> anyhow::Result<File> {
    if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
        fs::create_dir_all(parent)
            .with_context(|| format!("failed creating {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed opening event log {}", path.display()))
}

pub fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}

#[cfg(test)]
mod tests {
    use chrono::DateTime;
    use serde_json::{json, Value};

    use super::EventWriter;

    #[test]
    fn file_writer_appends_numbered_lines() -> anyhow::Result<()> {
        let temp = tempfile::tempdir()?;
        let path = temp.path().join("nested").join("events.jsonl");
        let writer = EventWriter::new(&path, "job-123");

        let first = writer.emit("job_started", json!({"total_steps": 4}))?;
        writer.emit("job_finished", json!({"status": "completed"}))?;

        let lines: Vec<Value> = std::fs::read_to_string(&path)?
            .lines()
            .map(serde_json::from_str)
            .collect::<Result<_, _>>()?;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0], first);
        assert_eq!(lines[0]["job_id"], json!("job-123"));
        assert_eq!(lines[0]["total_steps"], json!(4));
        assert_eq!(lines[0]["seq"], json!(1));
        assert_eq!(lines[1]["seq"], json!(2));
        assert_eq!(lines[1]["type"], json!("job_finished"));
        DateTime::parse_from_rfc3339(lines[1]["ts"].as_str().unwrap_or(""))?;
        assert!(writer.recorded().is_empty());
        Ok(())
    }

    #[test]
    fn envelope_keys_survive_payload_collisions() -> anyhow::Result<()> {
        let writer = EventWriter::in_memory("job-a");
        let emitted = writer.emit("mask_built", json!({"type": "x", "seq": 99, "step": 1}))?;
        assert_eq!(emitted["type"], json!("mask_built"));
        assert_eq!(emitted["seq"], json!(1));
        assert_eq!(emitted["step"], json!(1));

        let scalar = writer.emit("note", json!("hello"))?;
        assert_eq!(scalar["data"], json!("hello"));
        Ok(())
    }

    #[test]
    fn memory_writer_replays_in_order_across_clones() -> anyhow::Result<()> {
        let writer = EventWriter::in_memory("job-mem");
        let clone = writer.clone();
        writer.emit("one", Value::Null)?;
        clone.emit("two", Value::Null)?;

        assert!(writer.path().is_none());
        let types: Vec<String> = writer
            .recorded()
            .iter()
            .filter_map(|event| event["type"].as_str().map(str::to_string))
            .collect();
        assert_eq!(types, vec!["one", "two"]);
        assert_eq!(clone.recorded()[1]["seq"], json!(2));
        Ok(())
    }
}
