//! Classification marker detection

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// How many leading bytes of a file are inspected by default
pub const DEFAULT_SCAN_WINDOW: usize = 1000;

/// Protection level named by a literal marker in file content.
///
/// Variants are declared in priority order, highest first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ClassificationTag {
    TopSecret,
    Confidential,
    Restricted,
}

impl ClassificationTag {
    /// Every tag, highest priority first.
    pub const ALL: [ClassificationTag; 3] = [
        ClassificationTag::TopSecret,
        ClassificationTag::Confidential,
        ClassificationTag::Restricted,
    ];

    /// The literal marker looked for in content.
    pub fn marker(self) -> &'static str {
        match self {
            ClassificationTag::TopSecret => "TOP_SECRET",
            ClassificationTag::Confidential => "CONFIDENTIAL",
            ClassificationTag::Restricted => "RESTRICTED",
        }
    }
}

impl fmt::Display for ClassificationTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.marker())
    }
}

impl FromStr for ClassificationTag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ClassificationTag::ALL
            .into_iter()
            .find(|tag| tag.marker().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| {
                format!(
                    "unknown classification {:?} (expected TOP_SECRET, CONFIDENTIAL or RESTRICTED)",
                    s
                )
            })
    }
}

/// Return the highest-priority tag whose marker occurs anywhere in `content`.
pub fn classify(content: &[u8]) -> Option<ClassificationTag> {
    first_match(content, &ClassificationTag::ALL)
}

/// Classifier restricted to a configured set of tags and a leading window of
/// the content.
#[derive(Debug, Clone)]
pub struct Scanner {
    tags: Vec<ClassificationTag>,
    window: usize,
}

impl Scanner {
    /// `tags` are re-sorted into priority order; duplicates are dropped.
    pub fn new(tags: &[ClassificationTag], window: usize) -> Self {
        let mut tags = tags.to_vec();
        tags.sort();
        tags.dedup();
        Self { tags, window }
    }

    /// Number of leading bytes this scanner looks at.
    pub fn window(&self) -> usize {
        self.window
    }

    /// Highest-priority configured tag whose marker occurs in the window.
    pub fn classify(&self, content: &[u8]) -> Option<ClassificationTag> {
        let end = content.len().min(self.window);
        first_match(&content[..end], &self.tags)
    }

    /// True if `tag` is configured and its marker occurs in the window,
    /// regardless of higher-priority tags also being present.
    pub fn matches(&self, content: &[u8], tag: ClassificationTag) -> bool {
        let end = content.len().min(self.window);
        self.tags.contains(&tag) && contains(&content[..end], tag.marker().as_bytes())
    }
}

impl Default for Scanner {
    fn default() -> Self {
        Self::new(&ClassificationTag::ALL, DEFAULT_SCAN_WINDOW)
    }
}

fn first_match(content: &[u8], tags: &[ClassificationTag]) -> Option<ClassificationTag> {
    tags.iter()
        .copied()
        .find(|tag| contains(content, tag.marker().as_bytes()))
}

fn contains(haystack: &[u8], needle: &[u8]) -> bool {
    haystack.windows(needle.len()).any(|w| w == needle)
}
