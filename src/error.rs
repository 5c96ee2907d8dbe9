use std::error::Error as StdError;

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorCategory {
    /// Filesystem, git, or shield itself misbehaved. Also the fallback when
    /// the cause is unclear.
    Internal,

    /// The user provided invalid input or asked for something that cannot be
    /// done (wrong passphrase length, encrypting a container twice, ...).
    User,
}

/// What went wrong, for callers that react differently per condition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Passphrase length is outside the accepted byte range.
    InvalidPassphraseLength,
    /// The input already starts with the container marker.
    AlreadyEncrypted,
    /// The input does not carry the container marker (or suffix).
    NotEncrypted,
    /// The marker is present but the version tag is not one we understand.
    UnsupportedVersion,
    /// The container ended before the salt could be read.
    TruncatedInput,
    /// No source could supply a passphrase.
    PassphraseUnavailable,
    /// Creating the history snapshot failed.
    BackupFailure,
    /// Counting or rewriting version history failed.
    HistoryRewrite,
    /// Configuration could not be parsed or serialized.
    Config,
    /// Unexpected state reached within shield logic.
    InternalInvariant,
    /// Interaction with the filesystem, stdin/stdout, or a subprocess failed.
    Io,
}

#[derive(Debug, Error)]
#[error("{msg}")]
pub struct ShieldError {
    pub category: ErrorCategory,
    /// Unset for one-off failures that nobody branches on.
    pub kind: Option<ErrorKind>,
    #[source]
    source: Option<BoxedSource>,
    msg: String,
}

type BoxedSource = Box<dyn StdError + Send + Sync + 'static>;

impl ShieldError {
    fn build(
        category: ErrorCategory,
        kind: Option<ErrorKind>,
        source: Option<BoxedSource>,
        msg: String,
    ) -> Self {
        ShieldError {
            category,
            kind,
            source,
            msg,
        }
    }

    /// Untagged error with only a category and message.
    pub fn new(category: ErrorCategory, msg: impl Into<String>) -> Self {
        Self::build(category, None, None, msg.into())
    }

    /// Error tagged with an [`ErrorKind`] callers can match on.
    pub fn with_kind(category: ErrorCategory, kind: ErrorKind, msg: impl Into<String>) -> Self {
        Self::build(category, Some(kind), None, msg.into())
    }

    /// Kind-tagged error wrapping the lower-level failure that caused it.
    pub fn with_kind_and_source(
        category: ErrorCategory,
        kind: ErrorKind,
        msg: impl Into<String>,
        source: impl StdError + Send + Sync + 'static,
    ) -> Self {
        Self::build(category, Some(kind), Some(Box::new(source)), msg.into())
    }

    /// Filesystem and subprocess failures. A missing path is the caller's
    /// mistake; anything else is ours.
    pub fn io(msg: impl Into<String>, source: std::io::Error) -> Self {
        let category = match source.kind() {
            std::io::ErrorKind::NotFound => ErrorCategory::User,
            _ => ErrorCategory::Internal,
        };
        Self::with_kind_and_source(category, ErrorKind::Io, msg, source)
    }

    /// The outermost message, without the source chain.
    pub fn message(&self) -> &str {
        &self.msg
    }

    /// Put `msg` in front; kind and category stay, `self` becomes the source.
    pub fn with_context(self, msg: impl Into<String>) -> Self {
        let (category, kind) = (self.category, self.kind);
        Self::build(category, kind, Some(Box::new(self)), msg.into())
    }

    /// True if this error is tagged with `kind`. Context wrapping keeps the
    /// tag, so this also sees through [`ShieldError::with_context`].
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == Some(kind)
    }
}

pub type Result<T> = std::result::Result<T, ShieldError>;
