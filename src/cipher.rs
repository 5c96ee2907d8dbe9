//! Three-layer xor transform
//!
//! - Layer 1: xor against key 1.
//! - Layer 2: reverse the buffer, then xor against key 2.
//! - Layer 3: xor against key 3 and the low byte of the absolute offset.
//!
//! Keys are cycled when the payload is longer than the key. Every layer is its
//! own inverse given the same key, so [`reverse`] just runs them backwards.
//! There is no authentication: a wrong key yields garbage, not an error.

use crate::keys::KeySchedule;

/// Encrypt `plaintext` under `schedule`. Output length equals input length.
pub fn apply(plaintext: &[u8], schedule: &KeySchedule) -> Vec<u8> {
    let mut buf = plaintext.to_vec();
    xor_cycled(&mut buf, schedule.layer1());
    buf.reverse();
    xor_cycled(&mut buf, schedule.layer2());
    xor_positional(&mut buf, schedule.layer3());
    buf
}

/// Exact inverse of [`apply`] for the same schedule.
pub fn reverse(ciphertext: &[u8], schedule: &KeySchedule) -> Vec<u8> {
    let mut buf = ciphertext.to_vec();
    xor_positional(&mut buf, schedule.layer3());
    xor_cycled(&mut buf, schedule.layer2());
    buf.reverse();
    xor_cycled(&mut buf, schedule.layer1());
    buf
}

fn xor_cycled(buf: &mut [u8], key: &[u8]) {
    for (b, k) in buf.iter_mut().zip(key.iter().cycle()) {
        *b ^= k;
    }
}

fn xor_positional(buf: &mut [u8], key: &[u8]) {
    for (i, (b, k)) in buf.iter_mut().zip(key.iter().cycle()).enumerate() {
        *b ^= k ^ (i % 256) as u8;
    }
}
