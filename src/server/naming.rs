//! Channel name derivation

use rand::RngCore as _;
use sha2::{Digest as _, Sha256};

/// Digest bytes kept in a channel name; hex encoding doubles the length.
const NAME_LEN: usize = 20;

/// Derives the channel name tied to a peer's public key. The digest is
/// salted with the server secret so that knowing someone's public key is
/// not enough to find their channel.
pub(super) fn for_key(key: &str, secret: &str) -> String {
    digest(key.as_bytes(), secret)
}

/// A single-use channel name from random material.
pub(super) fn random(secret: &str) -> String {
    let mut base = [0u8; 512];
    rand::thread_rng().fill_bytes(&mut base);
    digest(&base, secret)
}

fn digest(base: &[u8], secret: &str) -> String {
    let mut h = Sha256::new();
    h.update(base);
    h.update(secret.as_bytes());
    hex::encode(&h.finalize()[..NAME_LEN])
}
