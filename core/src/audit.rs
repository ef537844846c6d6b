//! Append-only audit trail for a run.
//!
//! The recorder is a pure observer: it is never consulted for authorisation.
//! Every authorisation decision and side effect lands here so a run can be
//! reconstructed from the log alone.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;

use crate::error::ToolError;
use outpost_protocol::WireError;

/// Longest string kept verbatim in an audit entry; anything bigger is cut.
const MAX_AUDIT_STRING: usize = 2048;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditKind {
    ToolCall,
    Approval,
    Patch,
    Command,
    Error,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AuditEntry {
    /// Milliseconds since the Unix epoch, stamped at insertion.
    pub ts: i64,
    pub run_id: String,
    #[serde(rename = "type")]
    pub kind: AuditKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<WireError>,
}

#[derive(Default)]
struct Buffers {
    entries: Vec<AuditEntry>,
    notes: Vec<String>,
    flushed_entries: usize,
    flushed_notes: usize,
}

/// Per-run audit buffer. Mutated only by the session that owns the run;
/// flushed to `<home>/audit/<runId>.jsonl` plus a free-form
/// `<home>/logs/<runId>.log` (or `<logDir>/<runId>.log` when the logging
/// section names a directory).
pub struct AuditRecorder {
    run_id: String,
    log_dir: Option<PathBuf>,
    buffers: Mutex<Buffers>,
}

impl AuditRecorder {
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            log_dir: None,
            buffers: Mutex::new(Buffers::default()),
        }
    }

    /// Redirect the free-form run log to a configured directory.
    pub fn with_log_dir(mut self, log_dir: Option<PathBuf>) -> Self {
        self.log_dir = log_dir;
        self
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn record(
        &self,
        kind: AuditKind,
        tool: Option<&str>,
        input: Option<&Value>,
        output: Option<&Value>,
        duration: Option<Duration>,
        error: Option<&ToolError>,
    ) {
        let entry = AuditEntry {
            ts: Utc::now().timestamp_millis(),
            run_id: self.run_id.clone(),
            kind,
            tool: tool.map(str::to_owned),
            input: input.map(redact_value),
            output: output.map(redact_value),
            duration_ms: duration.map(|d| d.as_millis() as u64),
            error: error.map(ToolError::to_wire),
        };
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.entries.push(entry);
        }
    }

    /// Free-form line for the per-run log file.
    pub fn note(&self, line: impl AsRef<str>) {
        let stamped = format!("{} {}", Utc::now().to_rfc3339(), line.as_ref());
        if let Ok(mut buffers) = self.buffers.lock() {
            buffers.notes.push(stamped);
        }
    }

    pub fn entry_count(&self) -> usize {
        self.buffers.lock().map(|b| b.entries.len()).unwrap_or(0)
    }

    /// Persist everything recorded since the previous flush. Entries already
    /// on disk are never rewritten.
    pub fn flush(&self, home: &Path) -> std::io::Result<()> {
        let (new_entries, new_notes) = {
            let mut buffers = self
                .buffers
                .lock()
                .map_err(|_| std::io::Error::other("audit buffer poisoned"))?;
            let entries: Vec<String> = buffers.entries[buffers.flushed_entries..]
                .iter()
                .filter_map(|entry| serde_json::to_string(entry).ok())
                .collect();
            let notes: Vec<String> = buffers.notes[buffers.flushed_notes..].to_vec();
            buffers.flushed_entries = buffers.entries.len();
            buffers.flushed_notes = buffers.notes.len();
            (entries, notes)
        };

        if !new_entries.is_empty() {
            append_lines(&audit_log_path(home, &self.run_id), &new_entries)?;
        }
        if !new_notes.is_empty() {
            let log_path = match &self.log_dir {
                Some(dir) => dir.join(format!("{}.log", self.run_id)),
                None => run_log_path(home, &self.run_id),
            };
            append_lines(&log_path, &new_notes)?;
        }
        Ok(())
    }
}

pub fn audit_log_path(home: &Path, run_id: &str) -> PathBuf {
    home.join("audit").join(format!("{run_id}.jsonl"))
}

pub fn run_log_path(home: &Path, run_id: &str) -> PathBuf {
    home.join("logs").join(format!("{run_id}.log"))
}

fn append_lines(path: &Path, lines: &[String]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    for line in lines {
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
    }
    file.flush()
}

/// Strip secrets and oversized blobs from a value before it is logged.
/// Key-based: any key mentioning token/secret/password/credential/
/// authorization is replaced wholesale. Long strings are cut so file
/// contents cannot ride along inside the log.
pub fn redact_value(value: &Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, val)| {
                    if is_sensitive_key(key) {
                        (key.clone(), Value::String("[REDACTED]".to_string()))
                    } else {
                        (key.clone(), redact_value(val))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.iter().map(redact_value).collect()),
        Value::String(s) if s.len() > MAX_AUDIT_STRING => {
            let mut cut = MAX_AUDIT_STRING;
            while !s.is_char_boundary(cut) {
                cut -= 1;
            }
            Value::String(format!("{}…[truncated]", &s[..cut]))
        }
        other => other.clone(),
    }
}

fn is_sensitive_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    ["token", "secret", "password", "credential", "authorization"]
        .iter()
        .any(|marker| lower.contains(marker))
}
