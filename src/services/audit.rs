// src/services/audit.rs
//! Action logbook: one JSONL line per noteworthy operation.
//!
//! Appends are best-effort: a full disk or missing directory must never fail
//! the operation being audited, so every write error is swallowed after a
//! `tracing` warning.

use chrono::Utc;
use serde_json::{Value, json};
use std::fs;
use std::io::Write;
use std::path::PathBuf;

/// Cheap cloneable handle to the actions stream. Threaded into every service
/// that records events; there is no process-global logger state.
#[derive(Debug, Clone)]
pub struct Audit {
    actions: PathBuf,
    enabled: bool,
    preview_len: usize,
}

impl Audit {
    pub fn new(logbook_dir: impl Into<PathBuf>, enabled: bool, preview_len: usize) -> Self {
        Self {
            actions: logbook_dir.into().join("actions.jsonl"),
            enabled,
            preview_len,
        }
    }

    /// Record a generic action event (lightweight telemetry).
    ///
    /// `agent` is the logical component name (e.g. `"proposals"`,
    /// `"compactor"`), `action` a short verb label, `severity` one of
    /// `"low" | "medium" | "high"` for quick triage.
    pub fn record(&self, agent: &str, action: &str, details: &Value, severity: &str) {
        if !self.enabled {
            return;
        }
        let entry = json!({
            "timestamp": Utc::now().to_rfc3339(),
            "event": "action",
            "agent": agent,
            "action": action,
            "severity": severity,
            "details": details
        });
        self.append(&entry);
    }

    /// Produce a privacy-safe preview of free text for logging:
    /// newlines collapsed, truncated with an ellipsis.
    pub fn preview(&self, s: &str) -> String {
        let mut t = s.replace('\n', " ");
        if t.len() > self.preview_len {
            t.truncate(self.preview_len);
            t.push('…');
        }
        t
    }

    fn append(&self, val: &Value) {
        if let Some(parent) = self.actions.parent() {
            let _ = fs::create_dir_all(parent);
        }
        match fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.actions)
        {
            Ok(mut f) => {
                if let Err(e) = writeln!(f, "{}", val) {
                    tracing::warn!("audit append failed: {e}");
                }
            }
            Err(e) => tracing::warn!("audit open failed: {e}"),
        }
    }
}
