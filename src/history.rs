//! Version history access
//!
//! [`History`] is the narrow view of a repository the purger needs.
//! [`GitHistory`] implements it by running the `git` binary. A rewrite
//! expires the reflogs of the moved ref so the dropped commits become
//! unreachable; collecting them is left to `git gc`.

use crate::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use tracing::{debug, warn};

/// The repository operations a purge needs.
pub trait History {
    /// Number of revisions reachable from the current head; 0 before the
    /// first commit.
    fn revision_count(&mut self) -> Result<usize>;

    /// Write a snapshot of the full history to `dest`, which does not exist yet.
    fn create_backup(&mut self, dest: &Path) -> Result<()>;

    /// Make only the `keep` most recent revisions reachable from the current
    /// head. Must either complete or leave history untouched, and must refuse
    /// rather than drop any of those `keep` revisions.
    fn truncate(&mut self, keep: usize) -> Result<()>;
}

/// A git working copy, driven through the `git` command line.
#[derive(Debug, Clone)]
pub struct GitHistory {
    repo: PathBuf,
}

impl GitHistory {
    pub fn new(repo: impl Into<PathBuf>) -> Self {
        Self { repo: repo.into() }
    }

    /// Paths added, copied, or modified in the index, relative to the repo root.
    pub fn staged_files(&self) -> Result<Vec<PathBuf>> {
        let out = self.git(&["diff", "--cached", "--name-only", "--diff-filter=ACM"])?;
        Ok(out
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from)
            .collect())
    }

    /// `git add` the given paths.
    pub fn stage(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec!["add".to_string(), "--".to_string()];
        args.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        self.git_owned(&args).map(|_| ())
    }

    /// Remove the given paths from the index, leaving the work tree alone.
    pub fn unstage(&self, paths: &[PathBuf]) -> Result<()> {
        if paths.is_empty() {
            return Ok(());
        }
        let mut args = vec![
            "rm".to_string(),
            "--cached".to_string(),
            "--quiet".to_string(),
            "--ignore-unmatch".to_string(),
            "--".to_string(),
        ];
        args.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
        self.git_owned(&args).map(|_| ())
    }

    fn git(&self, args: &[&str]) -> Result<String> {
        self.run(args, &[], None)
    }

    fn git_owned(&self, args: &[String]) -> Result<String> {
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        self.run(&args, &[], None)
    }

    fn run(&self, args: &[&str], env: &[(&str, &str)], stdin: Option<&[u8]>) -> Result<String> {
        debug!(repo = %self.repo.display(), ?args, "running git");
        let mut cmd = Command::new("git");
        cmd.args(args)
            .current_dir(&self.repo)
            .envs(env.iter().copied())
            .stdin(if stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|e| ShieldError::io("failed to run git", e))?;
        if let Some(input) = stdin {
            if let Some(mut pipe) = child.stdin.take() {
                pipe.write_all(input)
                    .map_err(|e| ShieldError::io("failed to write to git stdin", e))?;
            }
        }
        let output = child
            .wait_with_output()
            .map_err(|e| ShieldError::io("failed to wait for git", e))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(ShieldError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::HistoryRewrite,
                format!("git {} failed: {}", args.join(" "), stderr.trim()),
            ));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    /// Recreate `commit` with the same tree, identity, dates, and message on
    /// top of `parent` (or as a root commit). Returns the new commit id.
    fn replay(&self, commit: &str, parent: Option<&str>) -> Result<String> {
        let meta = self.git(&[
            "show",
            "-s",
            "--format=%an%x00%ae%x00%aI%x00%cn%x00%ce%x00%cI%x00%B",
            commit,
        ])?;
        let fields: Vec<&str> = meta.splitn(7, '\0').collect();
        let &[an, ae, ad, cn, ce, cd, message] = fields.as_slice() else {
            return Err(ShieldError::with_kind(
                ErrorCategory::Internal,
                ErrorKind::HistoryRewrite,
                format!("unexpected metadata format for commit {}", commit),
            ));
        };

        let tree = format!("{}^{{tree}}", commit);
        let mut args = vec!["commit-tree", "--no-gpg-sign", tree.as_str()];
        if let Some(parent) = parent {
            args.extend(["-p", parent]);
        }
        let env = [
            ("GIT_AUTHOR_NAME", an),
            ("GIT_AUTHOR_EMAIL", ae),
            ("GIT_AUTHOR_DATE", ad),
            ("GIT_COMMITTER_NAME", cn),
            ("GIT_COMMITTER_EMAIL", ce),
            ("GIT_COMMITTER_DATE", cd),
        ];
        let message = message.strip_suffix('\n').unwrap_or(message);
        let out = self.run(&args, &env, Some(message.as_bytes()))?;
        Ok(out.trim().to_string())
    }
}

impl History for GitHistory {
    fn revision_count(&mut self) -> Result<usize> {
        // Outside a repository this fails; an unborn HEAD inside one is empty.
        self.git(&["rev-parse", "--git-dir"])?;
        if self.git(&["rev-parse", "--verify", "-q", "HEAD"]).is_err() {
            debug!("no commits yet");
            return Ok(0);
        }
        let out = self.git(&["rev-list", "--count", "HEAD"])?;
        out.trim().parse().map_err(|e| {
            ShieldError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::HistoryRewrite,
                format!("unexpected rev-list output {:?}", out.trim()),
                e,
            )
        })
    }

    fn create_backup(&mut self, dest: &Path) -> Result<()> {
        let dest = dest.to_string_lossy().into_owned();
        self.git(&["bundle", "create", dest.as_str(), "--all"])
            .map(|_| ())
            .map_err(|e| {
                ShieldError::with_kind(
                    ErrorCategory::Internal,
                    ErrorKind::BackupFailure,
                    format!("{:#}", e),
                )
            })
    }

    fn truncate(&mut self, keep: usize) -> Result<()> {
        let keep_arg = format!("--max-count={}", keep);
        let head = self.git(&["rev-parse", "--verify", "HEAD"])?.trim().to_string();
        let recent = self.git(&["rev-list", "--first-parent", keep_arg.as_str(), "HEAD"])?;
        let mut commits: Vec<&str> = recent.lines().map(str::trim).filter(|l| !l.is_empty()).collect();
        commits.reverse();
        let Some(&oldest) = commits.first() else {
            return Ok(());
        };

        // One `<commit> <parent>...` line per kept commit.
        let mut show = vec!["show".to_string(), "-s".to_string(), "--format=%H %P".to_string()];
        show.extend(commits.iter().map(|c| c.to_string()));
        let listing = self.git_owned(&show)?;
        let parent_count = |commit: &str| {
            listing
                .lines()
                .map(|l| l.split_whitespace().collect::<Vec<_>>())
                .find(|fields| fields.first() == Some(&commit))
                .map_or(0, |fields| fields.len() - 1)
        };

        if parent_count(oldest) == 0 && self.revision_count()? <= keep {
            debug!("history already within retention");
            return Ok(());
        }
        // Ancestors of the oldest kept commit are dropped anyway, but a merge
        // above it would lose its side branch when replayed onto one parent.
        if let Some(merge) = commits[1..].iter().find(|&&c| parent_count(c) > 1) {
            return Err(ShieldError::with_kind(
                ErrorCategory::User,
                ErrorKind::HistoryRewrite,
                format!(
                    "merge commit {} is among the {} most recent revisions; refusing to flatten it",
                    merge, keep
                ),
            ));
        }

        let mut parent: Option<String> = None;
        for commit in &commits {
            let new = self.replay(commit, parent.as_deref())?;
            parent = Some(new);
        }
        let Some(new_head) = parent else {
            return Ok(());
        };

        // Detached HEAD has no symbolic ref; move HEAD itself.
        let target = match self.git(&["symbolic-ref", "-q", "HEAD"]) {
            Ok(r) if !r.trim().is_empty() => r.trim().to_string(),
            _ => "HEAD".to_string(),
        };
        let reason = format!("artifact-shield: keep {} most recent commits", keep);
        self.git(&[
            "update-ref",
            "-m",
            reason.as_str(),
            target.as_str(),
            new_head.as_str(),
            head.as_str(),
        ])?;

        let mut expire = vec!["reflog", "expire", "--expire=now", "--expire-unreachable=now"];
        expire.push(target.as_str());
        if target != "HEAD" {
            expire.push("HEAD");
        }
        if let Err(e) = self.git(&expire) {
            warn!(error = %format!("{:#}", e), "history rewritten but reflog still references old commits");
        }
        Ok(())
    }
}

/// True if a usable `git` binary is on PATH.
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}
