//! Append-only trace log, one JSONL file per run.
//!
//! Every run has its own lock. Ids start at 1 and are assigned under that
//! lock; an id is only consumed once its line has been written to the file,
//! so a failed write never leaves a gap. Reads are cursor based: callers pass
//! the last id they have seen and receive the id to pass on the next call.
//!
//! The sink only knows run ids and their capture settings. Verbosity filters
//! optional detail fields and truncation shortens long strings; neither
//! affects which events get ids or in what order.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::core::types::{Detail, Verbosity};
use crate::io::artifacts::RunPaths;
use crate::io::config::is_id_char;

/// Upper bound on events returned by a single read.
pub const MAX_READ_LIMIT: usize = 1000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TraceEvent {
    pub id: u64,
    pub ts: DateTime<Utc>,
    pub event_kind: String,
    pub fields: Map<String, Value>,
}

/// One cursor read.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TracePage {
    pub events: Vec<TraceEvent>,
    /// Pass this as `since_id` on the next read.
    pub next_since_id: u64,
    /// Highest id written for the run so far (0 when empty).
    pub latest_id: u64,
}

impl TracePage {
    pub fn empty(since_id: u64) -> Self {
        Self {
            events: Vec::new(),
            next_since_id: since_id,
            latest_id: 0,
        }
    }
}

/// Capture settings for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSettings {
    pub verbosity: Verbosity,
    /// `None` disables truncation.
    pub max_field_chars: Option<usize>,
}

/// Event fields: values that are always captured plus verbosity-gated details.
#[derive(Debug, Clone, Default)]
pub struct TraceFields {
    values: Map<String, Value>,
    details: Vec<(Detail, String, Value)>,
}

impl TraceFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        self.values.insert(key.to_string(), to_value(value));
        self
    }

    /// Add a field that is only kept when the run's verbosity captures `detail`.
    pub fn detail(mut self, detail: Detail, key: &str, value: impl Serialize) -> Self {
        self.details.push((detail, key.to_string(), to_value(value)));
        self
    }

    fn render(self, settings: CaptureSettings) -> Map<String, Value> {
        let mut values = self.values;
        for (detail, key, value) in self.details {
            if settings.verbosity.captures(detail) {
                values.insert(key, value);
            }
        }
        if let Some(limit) = settings.max_field_chars {
            for value in values.values_mut() {
                truncate_value(value, limit);
            }
        }
        values
    }
}

struct RunLog {
    path: PathBuf,
    settings: CaptureSettings,
    next_id: u64,
    events: Vec<TraceEvent>,
    writer: Option<File>,
    /// The file does not end with a newline (torn line or failed write).
    needs_newline: bool,
}

impl RunLog {
    fn load(path: PathBuf) -> Result<Self> {
        let mut log = RunLog {
            path,
            settings: CaptureSettings::default(),
            next_id: 1,
            events: Vec::new(),
            writer: None,
            needs_newline: false,
        };
        if !log.path.exists() {
            return Ok(log);
        }
        let contents = fs::read_to_string(&log.path)
            .with_context(|| format!("read trace {}", log.path.display()))?;
        for (lineno, line) in contents.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<TraceEvent>(line) {
                Ok(event) if event.id >= log.next_id => {
                    log.next_id = event.id + 1;
                    log.events.push(event);
                }
                Ok(event) => {
                    warn!(path = %log.path.display(), id = event.id, "skipping out-of-order trace event");
                }
                Err(err) => {
                    warn!(path = %log.path.display(), line = lineno + 1, err = %err, "skipping unreadable trace line");
                }
            }
        }
        log.needs_newline = !contents.is_empty() && !contents.ends_with('\n');
        debug!(path = %log.path.display(), events = log.events.len(), next_id = log.next_id, "trace loaded");
        Ok(log)
    }

    fn page(&self, since_id: u64, limit: usize) -> TracePage {
        let limit = limit.clamp(1, MAX_READ_LIMIT);
        let start = self.events.partition_point(|event| event.id <= since_id);
        let events: Vec<TraceEvent> = self.events[start..].iter().take(limit).cloned().collect();
        TracePage {
            next_since_id: events.last().map_or(since_id, |event| event.id),
            latest_id: self.events.last().map_or(0, |event| event.id),
            events,
        }
    }

    fn write_line(&mut self, line: &str) -> Result<()> {
        if self.writer.is_none() {
            self.writer = Some(open_append(&self.path)?);
        }
        let Some(file) = self.writer.as_mut() else {
            return Err(anyhow!("trace writer unavailable for {}", self.path.display()));
        };
        let mut buf = String::with_capacity(line.len() + 1);
        if self.needs_newline {
            buf.push('\n');
        }
        buf.push_str(line);
        let written = file.write_all(buf.as_bytes()).and_then(|()| file.flush());
        match written {
            Ok(()) => {
                self.needs_newline = false;
                Ok(())
            }
            Err(err) => {
                self.needs_newline = true;
                Err(err).with_context(|| format!("append trace {}", self.path.display()))
            }
        }
    }
}

/// Trace logs for all runs under one directory.
pub struct TraceSink {
    runs_dir: PathBuf,
    runs: Mutex<HashMap<String, Arc<Mutex<RunLog>>>>,
}

impl TraceSink {
    pub fn new(runs_dir: impl Into<PathBuf>) -> Self {
        Self {
            runs_dir: runs_dir.into(),
            runs: Mutex::new(HashMap::new()),
        }
    }

    /// Register capture settings for a run, resuming ids from an existing file.
    ///
    /// The run stays resident until [`TraceSink::close_run`].
    pub fn open_run(&self, run_id: &str, settings: CaptureSettings) -> Result<()> {
        let log = self.writable(run_id)?;
        lock(&log).settings = settings;
        Ok(())
    }

    /// Append an event and return its id once it is written.
    pub fn append(&self, run_id: &str, event_kind: &str, fields: TraceFields) -> Result<u64> {
        let log = self.writable(run_id)?;
        let mut log = lock(&log);
        let event = TraceEvent {
            id: log.next_id,
            ts: Utc::now(),
            event_kind: event_kind.to_string(),
            fields: fields.render(log.settings),
        };
        let mut line = serde_json::to_string(&event).context("serialize trace event")?;
        line.push('\n');
        log.write_line(&line)?;
        log.next_id += 1;
        let id = event.id;
        log.events.push(event);
        debug!(run_id, event_kind, id, "trace event appended");
        Ok(id)
    }

    /// Events with `id > since_id`, at most `limit` (clamped to `1..=MAX_READ_LIMIT`).
    ///
    /// Runs that are not resident are read from disk without being cached.
    pub fn read(&self, run_id: &str, since_id: u64, limit: usize) -> Result<TracePage> {
        validate_run_id(run_id)?;
        let resident = lock(&self.runs).get(run_id).map(Arc::clone);
        if let Some(log) = resident {
            return Ok(lock(&log).page(since_id, limit));
        }
        let path = RunPaths::new(&self.runs_dir, run_id).trace_path;
        if !path.exists() {
            return Ok(TracePage::empty(since_id));
        }
        Ok(RunLog::load(path)?.page(since_id, limit))
    }

    /// Drop a finished run from memory. Its file stays readable through [`TraceSink::read`].
    pub fn close_run(&self, run_id: &str) {
        if lock(&self.runs).remove(run_id).is_some() {
            debug!(run_id, "trace log closed");
        }
    }

    fn writable(&self, run_id: &str) -> Result<Arc<Mutex<RunLog>>> {
        validate_run_id(run_id)?;
        let mut runs = lock(&self.runs);
        if let Some(log) = runs.get(run_id) {
            return Ok(Arc::clone(log));
        }
        let path = RunPaths::new(&self.runs_dir, run_id).trace_path;
        let log = Arc::new(Mutex::new(RunLog::load(path)?));
        runs.insert(run_id.to_string(), Arc::clone(&log));
        Ok(log)
    }
}

/// Run ids double as directory names, so only `[A-Za-z0-9_-]` is accepted.
pub fn validate_run_id(run_id: &str) -> Result<()> {
    if run_id.is_empty() || !run_id.chars().all(is_id_char) {
        return Err(anyhow!("invalid run id {run_id:?}"));
    }
    Ok(())
}

fn open_append(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create trace dir {}", parent.display()))?;
    }
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("open trace {}", path.display()))
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_value(value: impl Serialize) -> Value {
    serde_json::to_value(value).unwrap_or_else(|err| Value::String(format!("<unserializable: {err}>")))
}

fn truncate_value(value: &mut Value, limit: usize) {
    match value {
        Value::String(text) => {
            let total = text.chars().count();
            if total > limit {
                let kept: String = text.chars().take(limit).collect();
                *text = format!("{kept}... [truncated {} chars]", total - limit);
            }
        }
        Value::Array(items) => {
            for item in items {
                truncate_value(item, limit);
            }
        }
        Value::Object(map) => {
            for item in map.values_mut() {
                truncate_value(item, limit);
            }
        }
        _ => {}
    }
}
