//! Key schedule derivation
//!
//! Every container gets its own random salt. The salt and the passphrase are
//! chained through SHA-512 and BLAKE3 once per cipher layer, each layer mixed
//! with its own tag so the three keys are unrelated to each other.
//!
//! For layer `n`:
//! - `a = SHA-512(salt || passphrase)`
//! - `b = BLAKE3(a || tag_n)`
//! - `key_n = SHA-512(a || b || tag_n)`

use crate::error::{ErrorCategory, ErrorKind, Result, ShieldError};
use sha2::{Digest, Sha512};
use zeroize::Zeroizing;

/// Length of the per-file salt in bytes
pub const SALT_LEN: usize = 32;

/// Length of each layer key in bytes
pub const KEY_LEN: usize = 64;

/// Shortest accepted passphrase, in bytes
pub const MIN_PASSPHRASE_LEN: usize = 5;

/// Longest accepted passphrase, in bytes
pub const MAX_PASSPHRASE_LEN: usize = 1000;

const LAYER_TAGS: [&[u8]; 3] = [
    b"artifact-shield/layer-1",
    b"artifact-shield/layer-2",
    b"artifact-shield/layer-3",
];

/// The three per-layer keys. Wiped from memory on drop.
pub struct KeySchedule {
    layers: [Zeroizing<[u8; KEY_LEN]>; 3],
}

impl KeySchedule {
    /// Key for the plain xor layer.
    pub fn layer1(&self) -> &[u8] {
        &self.layers[0][..]
    }

    /// Key for the reversed xor layer.
    pub fn layer2(&self) -> &[u8] {
        &self.layers[1][..]
    }

    /// Key for the position-dependent xor layer.
    pub fn layer3(&self) -> &[u8] {
        &self.layers[2][..]
    }
}

impl std::fmt::Debug for KeySchedule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySchedule").finish_non_exhaustive()
    }
}

/// Reject passphrases whose byte length is outside
/// [`MIN_PASSPHRASE_LEN`, `MAX_PASSPHRASE_LEN`].
pub fn validate_passphrase(passphrase: &[u8]) -> Result<()> {
    let len = passphrase.len();
    if !(MIN_PASSPHRASE_LEN..=MAX_PASSPHRASE_LEN).contains(&len) {
        return Err(ShieldError::with_kind(
            ErrorCategory::User,
            ErrorKind::InvalidPassphraseLength,
            format!(
                "passphrase must be between {} and {} bytes (got {})",
                MIN_PASSPHRASE_LEN, MAX_PASSPHRASE_LEN, len
            ),
        ));
    }
    Ok(())
}

/// Derive the layered key schedule for `passphrase` and `salt`.
///
/// Deterministic: the same inputs always produce the same schedule, which is
/// what lets decryption rebuild the keys from the salt stored in a container.
pub fn derive(passphrase: &[u8], salt: &[u8; SALT_LEN]) -> Result<KeySchedule> {
    validate_passphrase(passphrase)?;

    let mut base = Sha512::new();
    base.update(salt);
    base.update(passphrase);
    let mut a = Zeroizing::new([0u8; KEY_LEN]);
    a.copy_from_slice(&base.finalize());

    let layers = LAYER_TAGS.map(|tag| {
        let mut mix = blake3::Hasher::new();
        mix.update(&a[..]);
        mix.update(tag);
        let b = Zeroizing::new(*mix.finalize().as_bytes());

        let mut fin = Sha512::new();
        fin.update(&a[..]);
        fin.update(&b[..]);
        fin.update(tag);
        let mut key = Zeroizing::new([0u8; KEY_LEN]);
        key.copy_from_slice(&fin.finalize());
        key
    });

    Ok(KeySchedule { layers })
}
