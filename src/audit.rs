//! Structured audit events
//!
//! The core reports what it did through an [`AuditSink`] and leaves
//! persistence to the caller. Sinks must never fail the operation that
//! emits into them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Encrypt,
    Decrypt,
    Skip,
    Backup,
    Purge,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "detail")]
pub enum Outcome {
    Success,
    Skipped(String),
    Failed(String),
}

#[derive(Debug, Clone, Serialize)]
pub struct AuditEvent {
    pub operation: Operation,
    /// A path, or a count such as "7 commits"
    pub subject: String,
    pub timestamp: DateTime<Utc>,
    pub outcome: Outcome,
}

impl AuditEvent {
    pub fn new(operation: Operation, subject: impl Into<String>, outcome: Outcome) -> Self {
        Self {
            operation,
            subject: subject.into(),
            timestamp: Utc::now(),
            outcome,
        }
    }

    pub fn for_path(operation: Operation, path: &Path, outcome: Outcome) -> Self {
        Self::new(operation, path.display().to_string(), outcome)
    }
}

/// Receives every event an operation emits. Implementations swallow their
/// own failures.
pub trait AuditSink {
    fn record(&mut self, event: AuditEvent);
}

/// Discards everything.
pub struct NullAuditSink;

impl AuditSink for NullAuditSink {
    fn record(&mut self, _event: AuditEvent) {}
}

/// Emits each event as a `tracing` info record.
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&mut self, event: AuditEvent) {
        info!(
            target: "artifact_shield::audit",
            operation = ?event.operation,
            subject = %event.subject,
            outcome = ?event.outcome,
            "audit"
        );
    }
}

/// Keeps events in memory.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    pub events: Vec<AuditEvent>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&mut self, event: AuditEvent) {
        self.events.push(event);
    }
}

/// Appends one JSON object per line to a file. Write failures are logged
/// and otherwise ignored.
pub struct JsonLinesAuditSink {
    path: PathBuf,
}

impl JsonLinesAuditSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    fn append(&self, event: &AuditEvent) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        let mut line = serde_json::to_vec(event).map_err(std::io::Error::other)?;
        line.push(b'\n');
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(&line)
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&mut self, event: AuditEvent) {
        if let Err(e) = self.append(&event) {
            warn!(path = %self.path.display(), error = %e, "failed to write audit event");
        }
    }
}

/// Forwards every event to each inner sink.
pub struct TeeAuditSink {
    sinks: Vec<Box<dyn AuditSink>>,
}

impl TeeAuditSink {
    pub fn new(sinks: Vec<Box<dyn AuditSink>>) -> Self {
        Self { sinks }
    }
}

impl AuditSink for TeeAuditSink {
    fn record(&mut self, event: AuditEvent) {
        for sink in &mut self.sinks {
            sink.record(event.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_lines() {
        let dir = TempDir::new().unwrap();
        let log = dir.path().join("logs").join("audit.log");
        let mut sink = JsonLinesAuditSink::new(&log);

        sink.record(AuditEvent::new(
            Operation::Encrypt,
            "docs/plan.md",
            Outcome::Success,
        ));
        sink.record(AuditEvent::new(
            Operation::Skip,
            "docs/readme.md",
            Outcome::Skipped("classification unmatched".to_string()),
        ));

        let content = std::fs::read_to_string(&log).unwrap();
        let lines: Vec<serde_json::Value> = content
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["operation"], "encrypt");
        assert_eq!(lines[0]["subject"], "docs/plan.md");
        assert_eq!(lines[0]["outcome"]["status"], "success");
        assert_eq!(lines[1]["outcome"]["status"], "skipped");
        assert_eq!(lines[1]["outcome"]["detail"], "classification unmatched");
        assert!(lines[0]["timestamp"].is_string());
    }

    #[test]
    fn test_unwritable_log_does_not_panic() {
        let dir = TempDir::new().unwrap();
        // A directory where the log file should be.
        let log = dir.path().join("audit.log");
        std::fs::create_dir(&log).unwrap();
        let mut sink = JsonLinesAuditSink::new(&log);
        sink.record(AuditEvent::new(Operation::Purge, "3 commits", Outcome::Success));
    }

    #[test]
    fn test_tee() {
        struct Counter(std::rc::Rc<std::cell::Cell<usize>>);
        impl AuditSink for Counter {
            fn record(&mut self, _event: AuditEvent) {
                self.0.set(self.0.get() + 1);
            }
        }

        let count = std::rc::Rc::new(std::cell::Cell::new(0));
        let mut tee = TeeAuditSink::new(vec![
            Box::new(Counter(count.clone())),
            Box::new(Counter(count.clone())),
            Box::new(NullAuditSink),
        ]);
        tee.record(AuditEvent::new(Operation::Backup, "x", Outcome::Success));
        assert_eq!(count.get(), 2);
    }
}
