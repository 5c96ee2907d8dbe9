//! Bulk encryption of classified files
//!
//! One bad file never stops a batch: every per-file failure becomes a skip
//! record in the returned [`BatchReport`].

use crate::audit::{AuditEvent, AuditSink, Operation, Outcome};
use crate::classify::{ClassificationTag, Scanner};
use crate::codec;
use crate::config::CodecSettings;
use crate::error::{ErrorCategory, ErrorKind, ShieldError};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};
use walkdir::WalkDir;

/// Why a file was not encrypted.
#[derive(Debug)]
pub enum SkipReason {
    /// No configured marker (or not the requested one) was found.
    ClassificationUnmatched,
    /// The file already starts with the container marker.
    AlreadyEncrypted,
    /// Reading, encrypting, or writing failed.
    Failed(ShieldError),
}

impl SkipReason {
    /// Error kind behind a failure, if any.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            SkipReason::ClassificationUnmatched => None,
            SkipReason::AlreadyEncrypted => Some(ErrorKind::AlreadyEncrypted),
            SkipReason::Failed(e) => e.kind,
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, SkipReason::Failed(_))
    }
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::ClassificationUnmatched => f.write_str("classification unmatched"),
            SkipReason::AlreadyEncrypted => f.write_str("already encrypted"),
            SkipReason::Failed(e) => write!(f, "{:#}", e),
        }
    }
}

#[derive(Debug, Default)]
pub struct BatchReport {
    /// Container paths that were written
    pub encrypted: Vec<PathBuf>,
    /// Source paths a dry run would have encrypted
    pub planned: Vec<PathBuf>,
    /// Source paths that were left alone, with the reason
    pub skipped: Vec<(PathBuf, SkipReason)>,
}

impl BatchReport {
    /// Skips caused by an error rather than by policy.
    pub fn failures(&self) -> impl Iterator<Item = &(PathBuf, SkipReason)> {
        self.skipped.iter().filter(|(_, reason)| reason.is_failure())
    }
}

/// Result of [`Batcher::survey`].
#[derive(Debug, Default)]
pub struct Survey {
    /// Files that start with the container marker
    pub containers: Vec<PathBuf>,
    /// Plaintext files carrying a configured classification marker
    pub classified: Vec<(PathBuf, ClassificationTag)>,
}

/// Applies the scanner and the codec to many files.
pub struct Batcher<'a> {
    settings: &'a CodecSettings,
    scanner: Scanner,
    sink: &'a mut dyn AuditSink,
}

impl<'a> Batcher<'a> {
    /// Scanner built from `settings`; per-file events go to `sink`.
    pub fn new(settings: &'a CodecSettings, sink: &'a mut dyn AuditSink) -> Self {
        let scanner = Scanner::new(&settings.classifications, settings.scan_window);
        Self {
            settings,
            scanner,
            sink,
        }
    }

    /// Recursively encrypt every classified file under `root`.
    ///
    /// Paths whose location relative to `root` matches an exclusion pattern
    /// and existing containers (by suffix) are not visited.
    /// `filter` restricts encryption to one tag; `None` accepts any
    /// configured tag.
    pub fn scan_and_encrypt(
        &mut self,
        root: &Path,
        passphrase: &[u8],
        filter: Option<ClassificationTag>,
    ) -> BatchReport {
        let mut report = BatchReport::default();

        for entry in walk(root, self.settings) {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| root.to_path_buf());
                    let err = match e.into_io_error() {
                        Some(io) => ShieldError::io("failed to walk directory", io),
                        None => ShieldError::with_kind(
                            ErrorCategory::Internal,
                            ErrorKind::Io,
                            "directory walk failed",
                        ),
                    };
                    self.skip(&mut report, path, SkipReason::Failed(err));
                    continue;
                }
            };

            let file_type = entry.file_type();
            if file_type.is_dir() {
                continue;
            }
            // Symlinks are attempted too; a dangling one shows up as a failure.
            if !(file_type.is_file() || file_type.is_symlink()) {
                continue;
            }
            if self.settings.has_container_suffix(entry.path()) {
                continue;
            }
            self.process(&mut report, entry.path(), passphrase, filter);
        }

        info!(
            root = %root.display(),
            encrypted = report.encrypted.len(),
            planned = report.planned.len(),
            skipped = report.skipped.len(),
            "directory scan complete"
        );
        report
    }

    /// Run the per-file pipeline over an explicit list below `root`, e.g.
    /// staged files. Relative paths are resolved against `root`.
    ///
    /// As in [`Batcher::scan_and_encrypt`], exclusion patterns only see the
    /// part of each path below `root`, and excluded paths and existing
    /// containers are ignored silently.
    pub fn encrypt_paths<I, P>(
        &mut self,
        root: &Path,
        paths: I,
        passphrase: &[u8],
        filter: Option<ClassificationTag>,
    ) -> BatchReport
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut report = BatchReport::default();
        for path in paths {
            let path = root.join(path.as_ref());
            let relative = path.strip_prefix(root).unwrap_or(&path);
            if self.settings.is_excluded(relative) || self.settings.has_container_suffix(&path) {
                debug!(path = %path.display(), "excluded");
                continue;
            }
            self.process(&mut report, &path, passphrase, filter);
        }
        report
    }

    /// Read-only walk reporting existing containers and classified plaintext.
    /// Unreadable files are left out.
    pub fn survey(&self, root: &Path) -> Survey {
        let mut survey = Survey::default();
        for entry in walk(root, self.settings).filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if codec::is_encrypted(path, self.settings) {
                survey.containers.push(path.to_path_buf());
            } else if self.settings.has_container_suffix(path) {
                continue;
            } else if let Ok(Some(tag)) = self.classify_file(path) {
                survey.classified.push((path.to_path_buf(), tag));
            }
        }
        survey
    }

    /// Classify the leading window of one file.
    pub fn classify_file(&self, path: &Path) -> Result<Option<ClassificationTag>, ShieldError> {
        Ok(self.scanner.classify(&self.read_head(path)?))
    }

    fn read_head(&self, path: &Path) -> Result<Vec<u8>, ShieldError> {
        let file = File::open(path)
            .map_err(|e| ShieldError::io(format!("failed to open {}", path.display()), e))?;
        let mut head = Vec::with_capacity(self.scanner.window().min(64 * 1024));
        file.take(self.scanner.window() as u64)
            .read_to_end(&mut head)
            .map_err(|e| ShieldError::io(format!("failed to read from {}", path.display()), e))?;
        Ok(head)
    }

    fn process(
        &mut self,
        report: &mut BatchReport,
        path: &Path,
        passphrase: &[u8],
        filter: Option<ClassificationTag>,
    ) {
        let head = match self.read_head(path) {
            Ok(head) => head,
            Err(e) => {
                self.skip(report, path.to_path_buf(), SkipReason::Failed(e));
                return;
            }
        };

        let matched = match filter {
            None => self.scanner.classify(&head).is_some(),
            Some(wanted) => self.scanner.matches(&head, wanted),
        };
        if !matched {
            self.skip(report, path.to_path_buf(), SkipReason::ClassificationUnmatched);
            return;
        }

        if codec::is_encrypted(path, self.settings) {
            self.skip(report, path.to_path_buf(), SkipReason::AlreadyEncrypted);
            return;
        }

        if self.settings.dry_run {
            debug!(path = %path.display(), "dry run, not encrypting");
            self.sink.record(AuditEvent::for_path(
                Operation::Skip,
                path,
                Outcome::Skipped("dry run".to_string()),
            ));
            report.planned.push(path.to_path_buf());
            return;
        }

        match codec::encrypt(path, passphrase, self.settings) {
            Ok(output) => {
                self.sink
                    .record(AuditEvent::for_path(Operation::Encrypt, path, Outcome::Success));
                report.encrypted.push(output);
            }
            Err(e) if e.is(ErrorKind::AlreadyEncrypted) => {
                self.skip(report, path.to_path_buf(), SkipReason::AlreadyEncrypted);
            }
            Err(e) => {
                warn!(path = %path.display(), error = %format!("{:#}", e), "encryption failed");
                self.skip(report, path.to_path_buf(), SkipReason::Failed(e));
            }
        }
    }

    fn skip(&mut self, report: &mut BatchReport, path: PathBuf, reason: SkipReason) {
        let event = match &reason {
            SkipReason::Failed(e) => {
                AuditEvent::for_path(Operation::Encrypt, &path, Outcome::Failed(format!("{:#}", e)))
            }
            other => AuditEvent::for_path(Operation::Skip, &path, Outcome::Skipped(other.to_string())),
        };
        self.sink.record(event);
        report.skipped.push((path, reason));
    }
}

/// Sorted walk below `root` that prunes excluded paths. Exclusion patterns are
/// matched against the path relative to `root`, and `root` itself is never
/// pruned.
fn walk<'s>(
    root: &'s Path,
    settings: &'s CodecSettings,
) -> impl Iterator<Item = walkdir::Result<walkdir::DirEntry>> + 's {
    WalkDir::new(root)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(move |entry| {
            let relative = entry.path().strip_prefix(root).unwrap_or(entry.path());
            entry.depth() == 0 || !settings.is_excluded(relative)
        })
}
