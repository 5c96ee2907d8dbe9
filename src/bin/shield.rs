//! Artifact Shield CLI
//!
//! Encrypts classification-marked files before they are committed and keeps
//! git history down to a configured number of commits.

use clap::{Parser, Subcommand};
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::process;
use tracing::{debug, info, warn};
use zeroize::Zeroizing;

use artifact_shield::audit::{
    AuditEvent, AuditSink, JsonLinesAuditSink, Operation, Outcome, TeeAuditSink, TracingAuditSink,
};
use artifact_shield::batch::Batcher;
use artifact_shield::classify::ClassificationTag;
use artifact_shield::codec;
use artifact_shield::config::{ShieldConfig, shield_home};
use artifact_shield::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use artifact_shield::history::GitHistory;
use artifact_shield::passphrase::{
    self, EnvPassphraseReader, PassphraseReader, StreamPassphraseReader, TerminalPassphraseReader,
};
use artifact_shield::purge::{self, PurgeReport, PurgeState};
use artifact_shield::selftest;

const PASSPHRASE_ENV: &str = "SHIELD_PASSPHRASE";

#[derive(Parser)]
#[command(name = "shield")]
#[command(version)]
#[command(about = "Keeps classified files out of version control in plaintext.", long_about = None)]
struct Cli {
    /// Configuration file (default: ~/.artifact_shield/config.toml)
    #[arg(long, global = true, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Read passphrase from stdin instead of from terminal
    #[arg(long, global = true)]
    passphrase_stdin: bool,

    /// Log filter used when RUST_LOG is not set
    #[arg(long, global = true, value_name = "LEVEL", default_value = "warn")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Encrypt a file into FILE.enc
    #[command(alias = "e")]
    Encrypt {
        /// Path to the file whose contents is to be encrypted
        #[arg(value_name = "FILE")]
        file: PathBuf,
    },

    /// Decrypt FILE.enc back into FILE
    #[command(alias = "d")]
    Decrypt {
        /// Path to the encrypted file
        #[arg(value_name = "FILE")]
        file: PathBuf,

        /// Do not delete the encrypted file afterwards
        #[arg(long)]
        keep_container: bool,
    },

    /// Show encrypted files and classified plaintext below a directory
    Status {
        #[arg(value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },

    /// Encrypt every classified file below a directory
    Scan {
        #[arg(value_name = "DIR", default_value = ".")]
        dir: PathBuf,

        /// Only encrypt files carrying this marker
        #[arg(long, short, value_name = "TAG")]
        classification: Option<ClassificationTag>,

        /// List what would be encrypted without writing anything
        #[arg(long)]
        dry_run: bool,
    },

    /// Round-trip generated content through the codec and check it by hash
    Selftest {
        /// Where to save the JSON results (default: ~/.artifact_shield/test_results.json)
        #[arg(long, value_name = "PATH")]
        output: Option<PathBuf>,
    },

    /// Back up and truncate git history now
    Purge {
        /// Repository to purge
        #[arg(long, value_name = "DIR", default_value = ".")]
        repo: PathBuf,

        /// Number of commits to keep (overrides the configuration)
        #[arg(long, value_name = "N")]
        keep: Option<NonZeroUsize>,
    },

    /// Entry points for git hooks
    Hook {
        #[command(subcommand)]
        hook: HookCommand,
    },

    /// Inspect or create the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigCommand,
    },
}

#[derive(Subcommand)]
enum HookCommand {
    /// Report (and optionally encrypt) classified files in the index
    PreCommit {
        #[arg(long, value_name = "DIR", default_value = ".")]
        repo: PathBuf,

        /// Encrypt classified staged files and stage the containers instead
        #[arg(long, env = "SHIELD_AUTO_ENCRYPT")]
        auto_encrypt: bool,
    },

    /// Run the configured history purge
    PrePush {
        #[arg(long, value_name = "DIR", default_value = ".")]
        repo: PathBuf,

        /// Skip the purge entirely
        #[arg(long, env = "SHIELD_PURGE_DISABLED")]
        no_purge: bool,
    },
}

#[derive(Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration
    Show,
    /// Write the default configuration if no file exists yet
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

fn main() {
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| shield_home().join("config.toml"));
    let mut config = ShieldConfig::load(&config_path);
    let mut sink = audit_sink();

    let result = match cli.command {
        Commands::Encrypt { ref file } => {
            encrypt(file, &config, cli.passphrase_stdin, &mut sink)
        }
        Commands::Decrypt {
            ref file,
            keep_container,
        } => decrypt(file, keep_container, &config, cli.passphrase_stdin, &mut sink),
        Commands::Status { ref dir } => status(dir, &config, &mut sink),
        Commands::Scan {
            ref dir,
            classification,
            dry_run,
        } => {
            config.codec.dry_run |= dry_run;
            scan(dir, classification, &config, cli.passphrase_stdin, &mut sink)
        }
        Commands::Selftest { ref output } => selftest(output.as_deref(), &config),
        Commands::Purge { ref repo, keep } => manual_purge(repo, keep, &config, &mut sink),
        Commands::Hook {
            hook: HookCommand::PreCommit {
                ref repo,
                auto_encrypt,
            },
        } => {
            // A commit is never blocked; problems are reported and the commit
            // goes ahead.
            if let Err(e) = pre_commit(repo, auto_encrypt, &config, cli.passphrase_stdin, &mut sink)
            {
                eprintln!("shield: pre-commit check failed: {}", chain(&e));
            }
            Ok(())
        }
        Commands::Hook {
            hook: HookCommand::PrePush { ref repo, no_purge },
        } => pre_push(repo, no_purge, &config, &mut sink),
        Commands::Config {
            action: ConfigCommand::Show,
        } => config.to_toml_string().map(|s| print!("{}", s)),
        Commands::Config {
            action: ConfigCommand::Init { force },
        } => config_init(&config_path, force),
    };

    if let Err(e) = result {
        eprintln!("Error: {}", chain(&e));
        process::exit(1);
    }
}

/// `outer: inner: root cause`
fn chain(err: &ShieldError) -> String {
    use std::error::Error as _;

    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str(": ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}

fn init_logging(level: &str) {
    use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

fn audit_sink() -> TeeAuditSink {
    TeeAuditSink::new(vec![
        Box::new(TracingAuditSink),
        Box::new(JsonLinesAuditSink::new(shield_home().join("audit.log"))),
    ])
}

/// The environment wins over stdin, which wins over the terminal.
fn get_passphrase_reader(use_stdin: bool) -> Box<dyn PassphraseReader> {
    if let Some(reader) = EnvPassphraseReader::from_env(PASSPHRASE_ENV) {
        debug!(var = PASSPHRASE_ENV, "passphrase taken from environment");
        Box::new(reader)
    } else if use_stdin {
        Box::new(StreamPassphraseReader::new(std::io::stdin()))
    } else {
        Box::new(TerminalPassphraseReader::default())
    }
}

fn read_passphrase(use_stdin: bool) -> Result<Zeroizing<Vec<u8>>> {
    let mut reader = get_passphrase_reader(use_stdin);
    passphrase::read_validated(&mut *reader).map_err(|e| {
        if e.is(ErrorKind::PassphraseUnavailable) {
            e.with_context(format!(
                "set {} or pass --passphrase-stdin",
                PASSPHRASE_ENV
            ))
        } else {
            e
        }
    })
}

fn encrypt(
    file: &Path,
    config: &ShieldConfig,
    use_stdin: bool,
    sink: &mut dyn AuditSink,
) -> Result<()> {
    let passphrase = read_passphrase(use_stdin)?;
    match codec::encrypt(file, &passphrase, &config.codec) {
        Ok(output) => {
            sink.record(AuditEvent::for_path(Operation::Encrypt, file, Outcome::Success));
            println!("{}", output.display());
            Ok(())
        }
        Err(e) => {
            sink.record(AuditEvent::for_path(
                Operation::Encrypt,
                file,
                Outcome::Failed(chain(&e)),
            ));
            Err(e)
        }
    }
}

fn decrypt(
    file: &Path,
    keep_container: bool,
    config: &ShieldConfig,
    use_stdin: bool,
    sink: &mut dyn AuditSink,
) -> Result<()> {
    let passphrase = read_passphrase(use_stdin)?;
    match codec::restore(file, &passphrase, &config.codec, keep_container) {
        Ok(output) => {
            sink.record(AuditEvent::for_path(Operation::Decrypt, file, Outcome::Success));
            println!("{}", output.display());
            Ok(())
        }
        Err(e) => {
            sink.record(AuditEvent::for_path(
                Operation::Decrypt,
                file,
                Outcome::Failed(chain(&e)),
            ));
            Err(e)
        }
    }
}

fn status(dir: &Path, config: &ShieldConfig, sink: &mut dyn AuditSink) -> Result<()> {
    if !dir.is_dir() {
        return Err(ShieldError::new(
            ErrorCategory::User,
            format!("{} is not a directory", dir.display()),
        ));
    }
    let survey = Batcher::new(&config.codec, sink).survey(dir);

    println!("encrypted: {}", survey.containers.len());
    for path in &survey.containers {
        println!("  {}", path.display());
    }
    println!("classified plaintext: {}", survey.classified.len());
    for (path, tag) in &survey.classified {
        println!("  {} ({})", path.display(), tag);
    }
    Ok(())
}

fn scan(
    dir: &Path,
    classification: Option<ClassificationTag>,
    config: &ShieldConfig,
    use_stdin: bool,
    sink: &mut dyn AuditSink,
) -> Result<()> {
    if !dir.is_dir() {
        return Err(ShieldError::new(
            ErrorCategory::User,
            format!("{} is not a directory", dir.display()),
        ));
    }
    let passphrase = if config.codec.dry_run {
        Zeroizing::new(Vec::new())
    } else {
        read_passphrase(use_stdin)?
    };
    let report = Batcher::new(&config.codec, sink).scan_and_encrypt(dir, &passphrase, classification);

    for path in &report.planned {
        println!("would encrypt {}", path.display());
    }
    for path in &report.encrypted {
        println!("encrypted {}", path.display());
    }
    let failures: Vec<_> = report.failures().collect();
    for (path, reason) in &failures {
        eprintln!("failed {}: {}", path.display(), reason);
    }
    println!(
        "{} encrypted, {} skipped ({} failed)",
        report.encrypted.len(),
        report.skipped.len(),
        failures.len()
    );

    if failures.is_empty() {
        Ok(())
    } else {
        Err(ShieldError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::Io,
            format!("{} file(s) could not be encrypted", failures.len()),
        ))
    }
}

fn pre_commit(
    repo: &Path,
    auto_encrypt: bool,
    config: &ShieldConfig,
    use_stdin: bool,
    sink: &mut dyn AuditSink,
) -> Result<()> {
    let git = GitHistory::new(repo);
    let staged: Vec<PathBuf> = git
        .staged_files()?
        .into_iter()
        .filter(|p| !config.codec.is_excluded(p) && !config.codec.has_container_suffix(p))
        .collect();

    let mut batcher = Batcher::new(&config.codec, sink);
    let mut classified = Vec::new();
    for relative in staged {
        let path = repo.join(&relative);
        match batcher.classify_file(&path) {
            Ok(Some(tag)) if !codec::is_encrypted(&path, &config.codec) => {
                eprintln!("shield: {} is marked {} and staged in plaintext", path.display(), tag);
                classified.push(relative);
            }
            Ok(_) => {}
            Err(e) => warn!(path = %path.display(), error = %e, "could not classify staged file"),
        }
    }

    if classified.is_empty() {
        return Ok(());
    }
    if !auto_encrypt {
        eprintln!(
            "shield: set SHIELD_AUTO_ENCRYPT=1 to encrypt these files automatically, \
             or run `shield encrypt <FILE>`"
        );
        return Ok(());
    }

    if config.codec.dry_run {
        let report = batcher.encrypt_paths(repo, &classified, b"", None);
        for path in &report.planned {
            eprintln!("shield: dry run, would encrypt {}", path.display());
        }
        return Ok(());
    }

    let passphrase = read_passphrase(use_stdin)?;
    let report = batcher.encrypt_paths(repo, &classified, &passphrase, None);

    let originals: Vec<PathBuf> = report
        .encrypted
        .iter()
        .filter_map(|c| codec::plaintext_path(c, &config.codec.suffix))
        .collect();
    git.stage(&report.encrypted)?;
    git.unstage(&originals)?;

    for path in &report.encrypted {
        eprintln!("shield: encrypted and staged {}", path.display());
    }
    for (path, reason) in report.failures() {
        eprintln!("shield: could not encrypt {}: {}", path.display(), reason);
    }
    info!(
        encrypted = report.encrypted.len(),
        failed = report.failures().count(),
        "pre-commit encryption complete"
    );
    Ok(())
}

fn selftest(output: Option<&Path>, config: &ShieldConfig) -> Result<()> {
    let report = selftest::run_validation_cycle(&config.codec)?;
    for case in &report.tests {
        let status = if case.passed { "ok" } else { "FAILED" };
        println!("{:<6} {} ({})", status, case.name, case.message);
    }
    println!(
        "{} passed, {} failed ({:.1}%)",
        report.tests.len() - report.failed(),
        report.failed(),
        report.success_rate
    );

    let path = output.map_or_else(|| shield_home().join(selftest::RESULTS_FILE), Path::to_path_buf);
    match report.save(&path) {
        Ok(()) => debug!(path = %path.display(), "self test results saved"),
        Err(e) => warn!(path = %path.display(), error = %chain(&e), "could not save self test results"),
    }

    if report.passed() {
        Ok(())
    } else {
        Err(ShieldError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            format!("{} self test case(s) failed", report.failed()),
        ))
    }
}

fn pre_push(
    repo: &Path,
    no_purge: bool,
    config: &ShieldConfig,
    sink: &mut dyn AuditSink,
) -> Result<()> {
    let mut history = GitHistory::new(repo);
    let report = purge::purge(&mut history, &config.purge, no_purge, sink);
    print_purge_report(&report);

    match &report.state {
        PurgeState::Aborted(reason) if !config.purge.fail_safe => Err(ShieldError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::HistoryRewrite,
            format!("history purge aborted: {}", reason),
        )),
        PurgeState::Aborted(reason) => {
            eprintln!("shield: history purge aborted, continuing: {}", reason);
            Ok(())
        }
        _ => Ok(()),
    }
}

fn manual_purge(
    repo: &Path,
    keep: Option<NonZeroUsize>,
    config: &ShieldConfig,
    sink: &mut dyn AuditSink,
) -> Result<()> {
    let mut purge_config = config.purge.clone();
    purge_config.enabled = true;
    if let Some(keep) = keep {
        purge_config.keep_count = keep;
    }

    let mut history = GitHistory::new(repo);
    let report = purge::purge(&mut history, &purge_config, false, sink);
    print_purge_report(&report);

    match &report.state {
        PurgeState::Aborted(reason) => Err(ShieldError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::HistoryRewrite,
            format!("history purge aborted: {}", reason),
        )),
        _ => Ok(()),
    }
}

fn print_purge_report(report: &PurgeReport) {
    // Disabled or switched off: nothing was counted.
    if !report.is_done() || report.commits_kept == 0 {
        return;
    }
    println!(
        "{} commit(s) removed, {} kept",
        report.commits_removed, report.commits_kept
    );
    if let Some(path) = &report.backup_path {
        println!("backup: {}", path.display());
    }
    if let Some(error) = &report.backup_error {
        eprintln!("shield: backup failed, history rewritten without one: {}", error);
    }
}

fn config_init(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        return Err(ShieldError::new(
            ErrorCategory::User,
            format!("{} already exists (use --force to overwrite)", path.display()),
        ));
    }
    ShieldConfig::default().save(path)?;
    println!("{}", path.display());
    Ok(())
}
