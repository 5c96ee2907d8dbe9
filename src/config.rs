//! Settings for the codec and the history purger (loaded from shield.toml)
//!
//! Missing or unreadable configuration is never fatal: [`ShieldConfig::load`]
//! logs what went wrong and falls back to the defaults below.

use crate::classify::{ClassificationTag, DEFAULT_SCAN_WINDOW};
use crate::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use serde::{Deserialize, Serialize};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Marker written at the start of every container
pub const DEFAULT_MARKER: &str = "ARTIFACT_SHIELD_ENCRYPTED";

/// Suffix appended to the plaintext path to name its container
pub const DEFAULT_SUFFIX: &str = ".enc";

/// Name of the per-user state directory under `$HOME`
pub const SHIELD_DIR_NAME: &str = ".artifact_shield";

/// `$HOME/.artifact_shield`, or a relative `.artifact_shield` if HOME is unset.
pub fn shield_home() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) if !home.is_empty() => PathBuf::from(home).join(SHIELD_DIR_NAME),
        _ => PathBuf::from(SHIELD_DIR_NAME),
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ShieldConfig {
    pub codec: CodecSettings,
    pub purge: PurgeConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CodecSettings {
    /// Literal string identifying a container
    pub marker: String,
    /// Filename suffix of containers
    pub suffix: String,
    /// Tags that trigger protection
    pub classifications: Vec<ClassificationTag>,
    /// Paths containing any of these substrings are never touched
    pub exclude_patterns: Vec<String>,
    /// Delete the plaintext once its container is written and verified
    pub remove_plaintext: bool,
    /// Leading bytes inspected for classification markers
    pub scan_window: usize,
    /// Batch runs report what they would encrypt and write nothing
    pub dry_run: bool,
}

impl Default for CodecSettings {
    fn default() -> Self {
        Self {
            marker: DEFAULT_MARKER.to_string(),
            suffix: DEFAULT_SUFFIX.to_string(),
            classifications: ClassificationTag::ALL.to_vec(),
            exclude_patterns: [".shield", "backups", "scripts/shield", "node_modules", ".git"]
                .into_iter()
                .map(String::from)
                .collect(),
            remove_plaintext: true,
            scan_window: DEFAULT_SCAN_WINDOW,
            dry_run: false,
        }
    }
}

impl CodecSettings {
    /// True if `path` contains any exclusion pattern.
    pub fn is_excluded(&self, path: &Path) -> bool {
        let path = path.to_string_lossy();
        self.exclude_patterns
            .iter()
            .any(|pattern| !pattern.is_empty() && path.contains(pattern.as_str()))
    }

    /// True if the file name ends with the container suffix.
    pub fn has_container_suffix(&self, path: &Path) -> bool {
        path.file_name()
            .map(|name| name.to_string_lossy().ends_with(self.suffix.as_str()))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PurgeConfig {
    /// Purging is opt-in
    pub enabled: bool,
    /// Number of most recent revisions that stay reachable
    #[serde(alias = "keep_commits")]
    pub keep_count: NonZeroUsize,
    /// Bundle the full history before rewriting it
    pub backup_enabled: bool,
    /// Directory receiving backup bundles
    pub backup_location: PathBuf,
    /// Continue without a backup if the backup fails
    pub fail_safe: bool,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            keep_count: NonZeroUsize::new(5).unwrap_or(NonZeroUsize::MIN),
            backup_enabled: true,
            backup_location: shield_home().join("backups"),
            fail_safe: true,
        }
    }
}

impl ShieldConfig {
    /// Strict parse; unknown fields are ignored, malformed values are errors.
    pub fn from_toml_str(s: &str) -> Result<Self> {
        let mut config: ShieldConfig = toml::from_str(s).map_err(|e| {
            ShieldError::with_kind_and_source(
                ErrorCategory::User,
                ErrorKind::Config,
                format!("invalid configuration: {}", e),
                e,
            )
        })?;
        config.heal();
        Ok(config)
    }

    pub fn to_toml_string(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| {
            ShieldError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::Config,
                "failed to serialize configuration",
                e,
            )
        })
    }

    /// Load configuration from `path`, falling back to defaults on any problem.
    pub fn load(path: &Path) -> Self {
        let content = match std::fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "config file not found, using defaults");
                return Self::default();
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "reading config failed, using defaults");
                return Self::default();
            }
        };
        match Self::from_toml_str(&content) {
            Ok(config) => config,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "parsing config failed, using defaults");
                Self::default()
            }
        }
    }

    /// Write the configuration to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent).map_err(|e| {
                ShieldError::io(format!("failed to create {}", parent.display()), e)
            })?;
        }
        let content = self.to_toml_string()?;
        std::fs::write(path, content)
            .map_err(|e| ShieldError::io(format!("failed to write {}", path.display()), e))
    }

    /// Replace values that would make the codec misbehave with their defaults.
    fn heal(&mut self) {
        let defaults = CodecSettings::default();
        if self.codec.marker.is_empty() {
            warn!("empty container marker configured, using default");
            self.codec.marker = defaults.marker;
        }
        if self.codec.suffix.is_empty() {
            warn!("empty container suffix configured, using default");
            self.codec.suffix = defaults.suffix;
        }
        if self.codec.classifications.is_empty() {
            warn!("no classifications configured, using all");
            self.codec.classifications = defaults.classifications;
        }
        if self.codec.scan_window == 0 {
            warn!("zero scan window configured, using default");
            self.codec.scan_window = defaults.scan_window;
        }
    }
}
