use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};

pub type EventPayload = Map<String, Value>;

/// Append-only JSONL log of one stitch run.
///
/// Every line carries `type`, `run_id`, `seq` and `ts` ahead of the payload.
/// `seq` starts at 1 and follows write order, so readers can detect gaps
/// when several writers share a file. Payload keys win on collision.
#[derive(Debug, Clone)]
pub struct EventWriter {
    inner: Arc<Shared>,
}

#[derive(Debug)]
struct Shared {
    path: PathBuf,
    run_id: String,
    next_seq: Mutex<u64>,
}

impl EventWriter {
    pub fn new(path: impl Into<PathBuf>, run_id: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Shared {
                path: path.into(),
                run_id: run_id.into(),
                next_seq: Mutex::new(1),
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    pub fn run_id(&self) -> &str {
        &self.inner.run_id
    }

    pub fn emit(&self, event_type: &str, payload: EventPayload) -> anyhow::Result<Value> {
        if let Some(parent) = self.inner.path.parent() {
            fs::create_dir_all(parent)?;
        }

        // Held across the write so `seq` order matches line order.
        let mut next_seq = self
            .inner
            .next_seq
            .lock()
            .map_err(|_| anyhow::anyhow!("event writer lock poisoned"))?;

        let mut event = Map::new();
        event.insert("type".to_string(), Value::from(event_type));
        event.insert("run_id".to_string(), Value::from(self.inner.run_id.as_str()));
        event.insert("seq".to_string(), Value::from(*next_seq));
        event.insert("ts".to_string(), Value::from(now_utc_iso()));
        event.extend(payload);

        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.inner.path)?
            .write_all(&line)?;
        *next_seq += 1;

        Ok(Value::Object(event))
    }
}

/// Parses every well-formed line of an events file; malformed lines are skipped.
pub fn read_events(path: &Path) -> anyhow::Result<Vec<Value>> {
    let raw = fs::read_to_string(path)?;
    Ok(raw
        .lines()
        .filter_map(|line| serde_json::from_str::<Value>(line).ok())
        .collect())
}

pub fn read_event_types(path: &Path) -> anyhow::Result<Vec<String>> {
    Ok(read_events(path)?
        .iter()
        .filter_map(|row| row.get("type").and_then(Value::as_str).map(str::to_string))
        .collect())
}

fn now_utc_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Micros, false)
}
