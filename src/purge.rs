//! History retention
//!
//! `Idle -> BackingUp -> Rewriting -> Done`, with `Aborted` reachable from
//! every step. A purge never panics and never returns an error; everything
//! that happened is described by the returned [`PurgeReport`].
//!
//! Backup and rewrite are not one transaction. Stopping between them leaves
//! a valid backup and the original history, which is safe.

use crate::audit::{AuditEvent, AuditSink, Operation, Outcome};
use crate::config::PurgeConfig;
use crate::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use crate::history::History;
use chrono::{DateTime, Local};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AbortReason {
    /// The revision count could not be determined.
    CountFailed(String),
    /// The snapshot failed and `fail_safe` is off.
    BackupFailed(String),
    /// Rewriting failed; history was left as it was.
    RewriteFailed(String),
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AbortReason::CountFailed(msg) => write!(f, "counting revisions failed: {}", msg),
            AbortReason::BackupFailed(msg) => write!(f, "backup failed: {}", msg),
            AbortReason::RewriteFailed(msg) => write!(f, "rewrite failed: {}", msg),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PurgeState {
    Idle,
    BackingUp,
    Rewriting,
    Done,
    Aborted(AbortReason),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeReport {
    /// Terminal state: `Done` or `Aborted`
    pub state: PurgeState,
    /// Every state entered, in order
    pub trail: Vec<PurgeState>,
    pub commits_removed: usize,
    pub commits_kept: usize,
    pub backup_path: Option<PathBuf>,
    /// Set when a backup failed but `fail_safe` let the purge continue
    pub backup_error: Option<String>,
}

impl PurgeReport {
    pub fn is_done(&self) -> bool {
        self.state == PurgeState::Done
    }
}

/// Run one purge against `history`.
///
/// `kill_switch` is the caller's environment-level override; when set, as
/// when `config.enabled` is false, nothing is touched.
pub fn purge(
    history: &mut dyn History,
    config: &PurgeConfig,
    kill_switch: bool,
    sink: &mut dyn AuditSink,
) -> PurgeReport {
    Purger::new(config, sink).run(history, kill_switch, Local::now())
}

struct Purger<'a> {
    config: &'a PurgeConfig,
    sink: &'a mut dyn AuditSink,
    report: PurgeReport,
}

impl<'a> Purger<'a> {
    fn new(config: &'a PurgeConfig, sink: &'a mut dyn AuditSink) -> Self {
        Self {
            config,
            sink,
            report: PurgeReport {
                state: PurgeState::Idle,
                trail: vec![PurgeState::Idle],
                commits_removed: 0,
                commits_kept: 0,
                backup_path: None,
                backup_error: None,
            },
        }
    }

    fn enter(&mut self, state: PurgeState) {
        debug!(from = ?self.report.state, to = ?state, "purge state change");
        self.report.state = state.clone();
        self.report.trail.push(state);
    }

    fn abort(mut self, reason: AbortReason) -> PurgeReport {
        warn!(reason = %reason, "history purge aborted");
        self.sink.record(AuditEvent::new(
            Operation::Purge,
            "history",
            Outcome::Failed(reason.to_string()),
        ));
        self.enter(PurgeState::Aborted(reason));
        self.report
    }

    fn run(mut self, history: &mut dyn History, kill_switch: bool, now: DateTime<Local>) -> PurgeReport {
        if kill_switch || !self.config.enabled {
            info!(kill_switch, enabled = self.config.enabled, "history purge disabled");
            self.enter(PurgeState::Done);
            return self.report;
        }

        let keep = self.config.keep_count.get();
        let total = match history.revision_count() {
            Ok(total) => total,
            Err(e) => return self.abort(AbortReason::CountFailed(format!("{:#}", e))),
        };

        if total <= keep {
            info!(total, keep, "no purge needed");
            self.report.commits_kept = total;
            self.enter(PurgeState::Done);
            return self.report;
        }

        if self.config.backup_enabled {
            self.enter(PurgeState::BackingUp);
            match take_backup(history, &self.config.backup_location, now) {
                Ok(path) => {
                    info!(path = %path.display(), "history backup created");
                    self.sink
                        .record(AuditEvent::for_path(Operation::Backup, &path, Outcome::Success));
                    self.report.backup_path = Some(path);
                }
                Err(e) => {
                    let msg = format!("{:#}", e);
                    self.sink.record(AuditEvent::new(
                        Operation::Backup,
                        self.config.backup_location.display().to_string(),
                        Outcome::Failed(msg.clone()),
                    ));
                    if !self.config.fail_safe {
                        return self.abort(AbortReason::BackupFailed(msg));
                    }
                    warn!(error = %msg, "backup failed, continuing because fail_safe is set");
                    self.report.backup_error = Some(msg);
                }
            }
        }

        self.enter(PurgeState::Rewriting);
        if let Err(e) = history.truncate(keep) {
            return self.abort(AbortReason::RewriteFailed(format!("{:#}", e)));
        }

        // Report what the rewrite actually left behind.
        let kept = match history.revision_count() {
            Ok(after) => after,
            Err(e) => {
                warn!(error = %format!("{:#}", e), "could not recount revisions after purge");
                keep
            }
        };
        self.report.commits_kept = kept;
        self.report.commits_removed = total.saturating_sub(kept);
        info!(
            removed = self.report.commits_removed,
            kept,
            "history purged"
        );
        self.sink.record(AuditEvent::new(
            Operation::Purge,
            format!("{} commits", self.report.commits_removed),
            Outcome::Success,
        ));
        self.enter(PurgeState::Done);
        self.report
    }
}

fn take_backup(history: &mut dyn History, location: &Path, now: DateTime<Local>) -> Result<PathBuf> {
    std::fs::create_dir_all(location).map_err(|e| {
        ShieldError::with_kind_and_source(
            ErrorCategory::Internal,
            ErrorKind::BackupFailure,
            format!("failed to create {}", location.display()),
            e,
        )
    })?;
    let path = backup_path(location, now);
    history.create_backup(&path)?;
    if !path.is_file() {
        return Err(ShieldError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::BackupFailure,
            format!("backup reported success but {} is missing", path.display()),
        ));
    }
    Ok(path)
}

/// `backup_YYYYmmdd_HHMMSS.bundle` in `location`, with `_N` appended if a
/// backup of that name already exists. Existing backups are never reused.
pub fn backup_path(location: &Path, now: DateTime<Local>) -> PathBuf {
    let stem = format!("backup_{}", now.format("%Y%m%d_%H%M%S"));
    let first = location.join(format!("{}.bundle", stem));
    if !first.exists() {
        return first;
    }
    (1..)
        .map(|n| location.join(format!("{}_{}.bundle", stem, n)))
        .find(|p| !p.exists())
        .unwrap_or(first)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;
    use std::num::NonZeroUsize;
    use tempfile::TempDir;

    /// In-memory linear history.
    struct FakeHistory {
        revisions: usize,
        fail_count: bool,
        fail_backup: bool,
        fail_truncate: bool,
        /// Revisions a truncate leaves, when it differs from `keep`
        truncate_leaves: Option<usize>,
        backups: Vec<PathBuf>,
    }

    impl FakeHistory {
        fn new(revisions: usize) -> Self {
            Self {
                revisions,
                fail_count: false,
                fail_backup: false,
                fail_truncate: false,
                truncate_leaves: None,
                backups: Vec::new(),
            }
        }
    }

    impl History for FakeHistory {
        fn revision_count(&mut self) -> Result<usize> {
            if self.fail_count {
                return Err(ShieldError::new(ErrorCategory::Internal, "not a repository"));
            }
            Ok(self.revisions)
        }

        fn create_backup(&mut self, dest: &Path) -> Result<()> {
            if self.fail_backup {
                return Err(ShieldError::with_kind(
                    ErrorCategory::Internal,
                    ErrorKind::BackupFailure,
                    "disk full",
                ));
            }
            std::fs::write(dest, format!("{} revisions", self.revisions)).unwrap();
            self.backups.push(dest.to_path_buf());
            Ok(())
        }

        fn truncate(&mut self, keep: usize) -> Result<()> {
            if self.fail_truncate {
                return Err(ShieldError::with_kind(
                    ErrorCategory::Internal,
                    ErrorKind::HistoryRewrite,
                    "ref moved underneath us",
                ));
            }
            self.revisions = self.truncate_leaves.unwrap_or(keep).min(self.revisions);
            Ok(())
        }
    }

    fn config(dir: &Path, keep: usize) -> PurgeConfig {
        PurgeConfig {
            enabled: true,
            keep_count: NonZeroUsize::new(keep).unwrap(),
            backup_enabled: true,
            backup_location: dir.join("backups"),
            fail_safe: true,
        }
    }

    #[test]
    fn test_twelve_keep_five() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(12);
        let mut sink = MemoryAuditSink::new();

        let report = purge(&mut history, &config(dir.path(), 5), false, &mut sink);

        assert_eq!(report.state, PurgeState::Done);
        assert_eq!(report.commits_removed, 7);
        assert_eq!(report.commits_kept, 5);
        let backup = report.backup_path.expect("backup path");
        assert!(backup.is_file());
        assert!(backup.starts_with(dir.path().join("backups")));
        assert_eq!(history.revisions, 5);
        assert_eq!(
            report.trail,
            vec![
                PurgeState::Idle,
                PurgeState::BackingUp,
                PurgeState::Rewriting,
                PurgeState::Done
            ]
        );
        assert_eq!(sink.events.len(), 2);
    }

    #[test]
    fn test_report_counts_are_measured() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(11);
        history.truncate_leaves = Some(5);
        let mut sink = MemoryAuditSink::new();

        let report = purge(&mut history, &config(dir.path(), 8), false, &mut sink);

        assert!(report.is_done());
        assert_eq!(report.commits_kept, 5);
        assert_eq!(report.commits_removed, 6);
    }

    #[test]
    fn test_within_retention_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(5);
        let mut sink = MemoryAuditSink::new();

        let report = purge(&mut history, &config(dir.path(), 5), false, &mut sink);

        assert!(report.is_done());
        assert_eq!(report.commits_removed, 0);
        assert_eq!(report.commits_kept, 5);
        assert_eq!(report.backup_path, None);
        assert!(history.backups.is_empty());
        assert!(!dir.path().join("backups").exists());
    }

    #[test]
    fn test_repeat_purge_is_noop() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(9);
        let mut sink = MemoryAuditSink::new();
        let cfg = config(dir.path(), 3);

        purge(&mut history, &cfg, false, &mut sink);
        let second = purge(&mut history, &cfg, false, &mut sink);
        assert!(second.is_done());
        assert_eq!(second.commits_removed, 0);
        assert_eq!(history.backups.len(), 1);
    }

    #[test]
    fn test_disabled() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(12);
        let mut sink = MemoryAuditSink::new();
        let mut cfg = config(dir.path(), 5);

        let report = purge(&mut history, &cfg, true, &mut sink);
        assert!(report.is_done());
        assert_eq!(history.revisions, 12);
        assert_eq!(report.trail, vec![PurgeState::Idle, PurgeState::Done]);

        cfg.enabled = false;
        let report = purge(&mut history, &cfg, false, &mut sink);
        assert!(report.is_done());
        assert_eq!(history.revisions, 12);
        assert!(history.backups.is_empty());
        assert!(sink.events.is_empty());
    }

    #[test]
    fn test_backup_failure_fail_safe_continues() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(12);
        history.fail_backup = true;
        let mut sink = MemoryAuditSink::new();

        let report = purge(&mut history, &config(dir.path(), 5), false, &mut sink);

        assert!(report.is_done());
        assert_eq!(report.commits_removed, 7);
        assert_eq!(report.backup_path, None);
        assert!(report.backup_error.unwrap().contains("disk full"));
        assert_eq!(history.revisions, 5);
    }

    #[test]
    fn test_backup_failure_without_fail_safe_aborts() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(12);
        history.fail_backup = true;
        let mut sink = MemoryAuditSink::new();
        let mut cfg = config(dir.path(), 5);
        cfg.fail_safe = false;

        let report = purge(&mut history, &cfg, false, &mut sink);

        assert!(matches!(
            report.state,
            PurgeState::Aborted(AbortReason::BackupFailed(_))
        ));
        assert!(!report.trail.contains(&PurgeState::Rewriting));
        assert_eq!(report.commits_removed, 0);
        assert_eq!(history.revisions, 12);
    }

    #[test]
    fn test_rewrite_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(12);
        history.fail_truncate = true;
        let mut sink = MemoryAuditSink::new();

        let report = purge(&mut history, &config(dir.path(), 5), false, &mut sink);

        assert!(matches!(
            report.state,
            PurgeState::Aborted(AbortReason::RewriteFailed(_))
        ));
        assert!(report.backup_path.is_some());
        assert_eq!(report.commits_removed, 0);
    }

    #[test]
    fn test_empty_history_is_done() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(0);
        let mut sink = MemoryAuditSink::new();

        let report = purge(&mut history, &config(dir.path(), 5), false, &mut sink);
        assert!(report.is_done());
        assert_eq!(report.commits_removed, 0);
        assert_eq!(report.commits_kept, 0);
        assert!(history.backups.is_empty());
    }

    #[test]
    fn test_count_failure_aborts() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(12);
        history.fail_count = true;
        let mut sink = MemoryAuditSink::new();

        let report = purge(&mut history, &config(dir.path(), 5), false, &mut sink);
        assert!(matches!(
            report.state,
            PurgeState::Aborted(AbortReason::CountFailed(_))
        ));
        assert_eq!(report.trail.len(), 2);
    }

    #[test]
    fn test_no_backup_configured() {
        let dir = TempDir::new().unwrap();
        let mut history = FakeHistory::new(12);
        let mut sink = MemoryAuditSink::new();
        let mut cfg = config(dir.path(), 5);
        cfg.backup_enabled = false;

        let report = purge(&mut history, &cfg, false, &mut sink);
        assert!(report.is_done());
        assert_eq!(report.backup_path, None);
        assert!(!report.trail.contains(&PurgeState::BackingUp));
    }

    #[test]
    fn test_backup_path_never_reused() {
        let dir = TempDir::new().unwrap();
        let now = Local::now();
        let first = backup_path(dir.path(), now);
        assert!(
            first
                .file_name()
                .unwrap()
                .to_string_lossy()
                .starts_with("backup_")
        );
        std::fs::write(&first, b"x").unwrap();

        let second = backup_path(dir.path(), now);
        assert_ne!(first, second);
        assert!(second.to_string_lossy().ends_with("_1.bundle"));
    }
}
