//! Round-trip self check
//!
//! Pushes generated content through the file codec in a scratch directory and
//! compares SHA-256 digests of what went in and what came back. The cases
//! cover dense mixed text, arithmetic that is re-verified after decryption,
//! multi-byte UTF-8, and a file of about a megabyte.

use crate::codec;
use crate::config::CodecSettings;
use crate::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;
use tempfile::TempDir;
use tracing::{info, warn};

/// Name of the saved report inside the shield home directory
pub const RESULTS_FILE: &str = "test_results.json";

#[derive(Debug, Clone, Serialize)]
pub struct CaseResult {
    pub name: String,
    pub passed: bool,
    pub message: String,
    pub bytes_processed: usize,
    /// Hex SHA-256 of the generated input
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    pub timestamp: DateTime<Utc>,
    pub tests: Vec<CaseResult>,
    /// Percentage of passed cases, 0 to 100
    pub success_rate: f64,
}

impl ValidationReport {
    pub fn passed(&self) -> bool {
        self.tests.iter().all(|t| t.passed)
    }

    pub fn failed(&self) -> usize {
        self.tests.iter().filter(|t| !t.passed).count()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| {
            ShieldError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::InternalInvariant,
                "failed to serialize validation report",
                e,
            )
        })
    }

    /// Write the report as JSON to `path`, creating parent directories.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| ShieldError::io(format!("failed to create {}", parent.display()), e))?;
        }
        codec::write_atomic(path, self.to_json()?.as_bytes())
    }
}

type Check = fn(&[u8]) -> Result<()>;

struct Case {
    name: &'static str,
    passphrase: &'static [u8],
    content: Vec<u8>,
    check: Option<Check>,
}

fn cases() -> Vec<Case> {
    vec![
        Case {
            name: "Dense Data Encryption Accuracy",
            passphrase: b"TestPass123!@#",
            content: dense_content().into_bytes(),
            check: None,
        },
        Case {
            name: "Mathematical Accuracy Preservation",
            passphrase: b"MathTest789",
            content: math_content().into_bytes(),
            check: Some(check_math),
        },
        Case {
            name: "Special Characters & Unicode",
            passphrase: b"Unicode@Test#456",
            content: SPECIAL_CONTENT.as_bytes().to_vec(),
            check: None,
        },
        Case {
            name: "Large File Handling",
            passphrase: b"LargeFile!Pass",
            content: large_content().into_bytes(),
            check: None,
        },
    ]
}

/// Run every case with `settings` (marker and suffix are honored; the
/// plaintext is always removed so the restore has to recreate it).
///
/// Only failing to set up the scratch directory is an error; a case that
/// fails is recorded in the report.
pub fn run_validation_cycle(settings: &CodecSettings) -> Result<ValidationReport> {
    let scratch = TempDir::new()
        .map_err(|e| ShieldError::io("failed to create scratch directory for self test", e))?;
    let settings = CodecSettings {
        remove_plaintext: true,
        dry_run: false,
        ..settings.clone()
    };

    let tests: Vec<CaseResult> = cases()
        .iter()
        .enumerate()
        .map(|(i, case)| run_case(scratch.path(), i, case, &settings))
        .collect();
    let passed = tests.iter().filter(|t| t.passed).count();
    let report = ValidationReport {
        timestamp: Utc::now(),
        success_rate: passed as f64 * 100.0 / tests.len() as f64,
        tests,
    };
    info!(passed, total = report.tests.len(), "self test complete");
    Ok(report)
}

fn run_case(dir: &Path, index: usize, case: &Case, settings: &CodecSettings) -> CaseResult {
    let digest = sha256_hex(&case.content);
    let (passed, message) = match round_trip(dir, index, case, &digest, settings) {
        Ok(()) => (true, format!("{} bytes restored intact", case.content.len())),
        Err(e) => {
            warn!(case = case.name, error = %format!("{:#}", e), "self test case failed");
            (false, format!("{:#}", e))
        }
    };
    CaseResult {
        name: case.name.to_string(),
        passed,
        message,
        bytes_processed: case.content.len(),
        sha256: digest,
    }
}

fn round_trip(
    dir: &Path,
    index: usize,
    case: &Case,
    digest: &str,
    settings: &CodecSettings,
) -> Result<()> {
    let path = dir.join(format!("case_{}.txt", index));
    fs::write(&path, &case.content)
        .map_err(|e| ShieldError::io(format!("failed to write {}", path.display()), e))?;

    let container = codec::encrypt(&path, case.passphrase, settings)?;
    if path.exists() {
        return Err(mismatch("plaintext still present after encryption"));
    }
    let sealed = fs::read(&container)
        .map_err(|e| ShieldError::io(format!("failed to read {}", container.display()), e))?;
    if !case.content.is_empty() && sealed.ends_with(&case.content) {
        return Err(mismatch("container carries the plaintext unchanged"));
    }

    let restored_path = codec::restore(&container, case.passphrase, settings, false)?;
    let restored = fs::read(&restored_path)
        .map_err(|e| ShieldError::io(format!("failed to read {}", restored_path.display()), e))?;
    if sha256_hex(&restored) != digest {
        return Err(mismatch("digest of restored content differs"));
    }
    match case.check {
        Some(check) => check(&restored),
        None => Ok(()),
    }
}

fn mismatch(msg: &str) -> ShieldError {
    ShieldError::with_kind(ErrorCategory::Internal, ErrorKind::InternalInvariant, msg)
}

/// Lowercase hex SHA-256 of `data`.
pub fn sha256_hex(data: &[u8]) -> String {
    Sha256::digest(data)
        .iter()
        .fold(String::with_capacity(64), |mut out, b| {
            let _ = write!(out, "{:02x}", b);
            out
        })
}

fn cubic(i: i64) -> i64 {
    i.pow(3) - i.pow(2) + i * 13 - 7
}

fn math_content() -> String {
    (1..=50)
        .map(|i| format!("{},{}", i, cubic(i)))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Every `i,value` line must still satisfy the formula it was generated from.
fn check_math(restored: &[u8]) -> Result<()> {
    let text = std::str::from_utf8(restored).map_err(|_| mismatch("restored text is not UTF-8"))?;
    for line in text.lines() {
        let parsed = line
            .split_once(',')
            .and_then(|(i, v)| Some((i.parse::<i64>().ok()?, v.parse::<i64>().ok()?)));
        match parsed {
            Some((i, value)) if cubic(i) == value => {}
            _ => return Err(mismatch(&format!("calculation mismatch in line {:?}", line))),
        }
    }
    Ok(())
}

const SPECIAL_CONTENT: &str = "Mathematical: ∑∫∂∇√∞≈≠≤≥\n\
Greek: αβγδεζηθικλμνξοπρστυφχψω\n\
Currency: $€£¥₹₽₿\n\
Arrows: →←↑↓↔⇒⇐⇔\n\
Symbols: ™©®℠℗§¶†‡\n\
Emoji: 🛡️🔒🔐🗝️💻🚀\n\
Control: \t\r\u{0}\u{7f}\n";

fn dense_content() -> String {
    let rule = "=".repeat(80);
    let mut lines = vec![
        rule.clone(),
        "SHIELD VALIDATION TEST FILE".to_string(),
        "Classification: TOP_SECRET".to_string(),
        rule,
        String::new(),
        "## Mathematical Validation Data".to_string(),
        "Prime numbers sequence:".to_string(),
        "2 3 5 7 11 13 17 19 23 29 31 37 41 43 47".to_string(),
    ];

    let mut fib = vec![1u64, 1];
    while fib.len() < 15 {
        fib.push(fib[fib.len() - 1] + fib[fib.len() - 2]);
    }
    lines.push("Fibonacci sequence:".to_string());
    lines.push(fib.iter().map(u64::to_string).collect::<Vec<_>>().join(" "));

    lines.push("Complex calculations:".to_string());
    for i in 1..=10i64 {
        let result = i.pow(3) + i.pow(2) - i * 7 + 42;
        lines.push(format!("f({i}) = {i}^3 + {i}^2 - {i}*7 + 42 = {result}"));
    }

    lines.push("## Dense Data Patterns".to_string());
    for i in 0..16u8 {
        lines.push(format!("{:2}: {:08b}", i, i));
    }
    for word in ["Shield", "Quantum", "Encryption", "Security", "Artifact"] {
        lines.push(format!("{:12} -> {}", word, &sha256_hex(word.as_bytes())[..16]));
    }

    lines.push("## Unicode and Special Characters".to_string());
    lines.push("Mathematical symbols: ∑ ∫ ∂ ∇ √ ∞ ≈ ≠ ≤ ≥".to_string());
    lines.push("Greek letters: α β γ δ ε ζ η θ ι κ λ μ ν ξ ο π ρ σ τ υ φ χ ψ ω".to_string());

    lines.push("## Structured Data".to_string());
    let structured = serde_json::json!({
        "shield_version": env!("CARGO_PKG_VERSION"),
        "numeric_data": [1.414, 2.718, 3.142, 6.626e-34],
        "nested": { "level1": { "level2": { "value": "deeply_nested_data" } } },
    });
    lines.push(serde_json::to_string_pretty(&structured).unwrap_or_default());

    lines.push("## Dense Text Block".to_string());
    lines.push(vec!["Lorem ipsum dolor sit amet consectetur adipiscing elit"; 20].join(" "));

    let body = lines.join("\n");
    let checksum = sha256_hex(body.as_bytes());
    format!("{}\n\n## Verification Checksum\nSHA256: {}", body, checksum)
}

fn large_content() -> String {
    let line = format!("{}\n", "ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789".repeat(100));
    line.repeat(300)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cycle_passes_with_defaults() {
        let report = run_validation_cycle(&CodecSettings::default()).unwrap();

        assert_eq!(report.tests.len(), 4);
        assert!(report.passed(), "{:#?}", report.tests);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.success_rate, 100.0);
        assert!(report.tests.iter().all(|t| t.sha256.len() == 64));
        assert!(report.tests[3].bytes_processed > 1_000_000);
    }

    #[test]
    fn test_cycle_honors_marker_and_suffix() {
        let settings = CodecSettings {
            marker: "CUSTOM_MARK".to_string(),
            suffix: ".sealed".to_string(),
            remove_plaintext: false,
            ..CodecSettings::default()
        };
        let report = run_validation_cycle(&settings).unwrap();
        assert!(report.passed(), "{:#?}", report.tests);
    }

    #[test]
    fn test_math_check_catches_altered_line() {
        assert!(check_math(math_content().as_bytes()).is_ok());

        let altered = math_content().replace("2,23\n", "2,24\n");
        assert_ne!(altered, math_content());
        assert!(check_math(altered.as_bytes()).is_err());
        assert!(check_math(b"1,6\nnot a number").is_err());
    }

    #[test]
    fn test_sha256_hex() {
        assert_eq!(
            sha256_hex(b"abc"),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn test_save_writes_json() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("nested").join(RESULTS_FILE);
        let report = run_validation_cycle(&CodecSettings::default()).unwrap();
        report.save(&path).unwrap();

        let saved: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        assert_eq!(saved["tests"].as_array().unwrap().len(), 4);
        assert_eq!(saved["success_rate"], 100.0);
        assert_eq!(saved["tests"][1]["name"], "Mathematical Accuracy Preservation");
        assert!(saved["timestamp"].is_string());
    }
}
