//! On-disk container format
//!
//! A container is the plaintext run through the layered cipher, prefixed
//! with enough information to decrypt it again:
//!
//! - marker: the configured marker string (`ARTIFACT_SHIELD_ENCRYPTED` by default)
//! - version tag: `::v1::`
//! - salt: 32 bytes
//! - ciphertext: same length as the plaintext
//!
//! Nothing in the container authenticates the ciphertext.

use crate::cipher;
use crate::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use crate::keys::{self, SALT_LEN};
use rand::RngCore;
use rand::rngs::OsRng;

/// Version 1 tag, written right after the marker
const V1_TAG: &[u8] = b"::v1::";

/// Prefix shared by every version tag
const VERSION_PREFIX: &[u8] = b"::v";

/// True if `data` starts with `marker`.
pub fn has_marker(data: &[u8], marker: &str) -> bool {
    data.starts_with(marker.as_bytes())
}

/// Length of everything that precedes the ciphertext.
pub fn header_len(marker: &str) -> usize {
    marker.len() + V1_TAG.len() + SALT_LEN
}

/// Encrypt `plaintext` under a freshly generated salt.
pub fn seal(plaintext: &[u8], passphrase: &[u8], marker: &str) -> Result<Vec<u8>> {
    let mut salt = [0u8; SALT_LEN];
    OsRng.fill_bytes(&mut salt);

    seal_with_salt(plaintext, passphrase, marker, &salt)
}

/// Encrypt `plaintext` under the provided salt.
///
/// This exists to make tests deterministic. Production code goes through
/// [`seal`], which never reuses a salt.
pub fn seal_with_salt(
    plaintext: &[u8],
    passphrase: &[u8],
    marker: &str,
    salt: &[u8; SALT_LEN],
) -> Result<Vec<u8>> {
    let schedule = keys::derive(passphrase, salt)?;
    let ciphertext = cipher::apply(plaintext, &schedule);

    let mut output = Vec::with_capacity(header_len(marker) + ciphertext.len());
    output.extend_from_slice(marker.as_bytes());
    output.extend_from_slice(V1_TAG);
    output.extend_from_slice(salt);
    output.extend_from_slice(&ciphertext);
    Ok(output)
}

/// Split a container into its salt and ciphertext.
pub fn parse<'a>(container: &'a [u8], marker: &str) -> Result<([u8; SALT_LEN], &'a [u8])> {
    let Some(rest) = container.strip_prefix(marker.as_bytes()) else {
        return Err(ShieldError::with_kind(
            ErrorCategory::User,
            ErrorKind::NotEncrypted,
            "input unrecognized as a shield container",
        ));
    };

    let body = match rest.strip_prefix(V1_TAG) {
        Some(body) => body,
        None if rest.starts_with(VERSION_PREFIX) => {
            return Err(ShieldError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnsupportedVersion,
                "input claims to be a shield container, but not a version we support",
            ));
        }
        None => {
            return Err(ShieldError::with_kind(
                ErrorCategory::User,
                ErrorKind::UnsupportedVersion,
                "container marker is not followed by a version tag",
            ));
        }
    };

    if body.len() < SALT_LEN {
        return Err(ShieldError::with_kind(
            ErrorCategory::User,
            ErrorKind::TruncatedInput,
            "input likely truncated while reading salt",
        ));
    }
    let (salt_bytes, ciphertext) = body.split_at(SALT_LEN);
    let salt: [u8; SALT_LEN] = salt_bytes.try_into().map_err(|_| {
        ShieldError::with_kind(
            ErrorCategory::Internal,
            ErrorKind::InternalInvariant,
            "salt slice has unexpected length",
        )
    })?;
    Ok((salt, ciphertext))
}

/// Decrypt a container.
///
/// A wrong passphrase is not detected: the result is simply garbage of the
/// same length as the original plaintext.
pub fn open(container: &[u8], passphrase: &[u8], marker: &str) -> Result<Vec<u8>> {
    let (salt, ciphertext) = parse(container, marker)?;
    let schedule = keys::derive(passphrase, &salt)?;
    Ok(cipher::reverse(ciphertext, &schedule))
}
