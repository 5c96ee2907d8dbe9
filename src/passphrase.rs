//! Where passphrases come from
//!
//! The library never consults the environment on its own; callers pick a
//! reader and pass the result in.

use crate::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use crate::keys;
use std::ffi::OsString;
use std::io::{self, IsTerminal, Read, Write};
use zeroize::Zeroizing;

const DEFAULT_PROMPT: &str = "Passphrase (shield): ";

/// A source of passphrase bytes.
pub trait PassphraseReader {
    /// Produce the passphrase bytes. They need not be UTF-8, and are wiped on
    /// drop.
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>>;
}

/// Read through `reader` and enforce the accepted length range.
pub fn read_validated(reader: &mut dyn PassphraseReader) -> Result<Zeroizing<Vec<u8>>> {
    let passphrase = reader.read_passphrase()?;
    keys::validate_passphrase(&passphrase)?;
    Ok(passphrase)
}

/// A passphrase captured from an environment variable, or given directly.
pub struct EnvPassphraseReader {
    value: Zeroizing<Vec<u8>>,
}

impl EnvPassphraseReader {
    /// `None` if `var` is not set.
    pub fn from_env(var: &str) -> Option<Self> {
        std::env::var_os(var).map(Self::from_os_string)
    }

    pub fn from_os_string(value: OsString) -> Self {
        Self {
            value: Zeroizing::new(value.into_encoded_bytes()),
        }
    }
}

impl PassphraseReader for EnvPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        Ok(self.value.clone())
    }
}

/// Takes everything `inner` yields, byte for byte. Nothing is trimmed, so a
/// trailing newline becomes part of the passphrase.
pub struct StreamPassphraseReader<R> {
    inner: R,
}

impl<R: Read> StreamPassphraseReader<R> {
    pub fn new(inner: R) -> Self {
        Self { inner }
    }
}

impl<R: Read> PassphraseReader for StreamPassphraseReader<R> {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        let mut buf = Zeroizing::new(Vec::new());
        if let Err(e) = self.inner.read_to_end(&mut buf) {
            return Err(ShieldError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::PassphraseUnavailable,
                "could not read passphrase from stdin",
                e,
            ));
        }
        Ok(buf)
    }
}

/// Prompts on stderr and reads without echo. Terminal input is UTF-8 only;
/// arbitrary bytes need the environment or stdin.
pub struct TerminalPassphraseReader {
    prompt: String,
}

impl TerminalPassphraseReader {
    pub fn with_prompt(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
        }
    }
}

impl Default for TerminalPassphraseReader {
    fn default() -> Self {
        Self::with_prompt(DEFAULT_PROMPT)
    }
}

impl PassphraseReader for TerminalPassphraseReader {
    fn read_passphrase(&mut self) -> Result<Zeroizing<Vec<u8>>> {
        if !io::stdin().is_terminal() {
            return Err(ShieldError::with_kind(
                ErrorCategory::User,
                ErrorKind::PassphraseUnavailable,
                "no passphrase: stdin is not a terminal",
            ));
        }

        let mut stderr = io::stderr();
        stderr
            .write_all(self.prompt.as_bytes())
            .and_then(|()| stderr.flush())
            .map_err(|e| ShieldError::io("could not write passphrase prompt", e))?;

        let typed = rpassword::read_password().map_err(|e| {
            ShieldError::with_kind_and_source(
                ErrorCategory::Internal,
                ErrorKind::PassphraseUnavailable,
                "could not read passphrase from terminal",
                e,
            )
        })?;
        Ok(Zeroizing::new(typed.into_bytes()))
    }
}
