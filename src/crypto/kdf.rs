//! Password hashing using PBKDF2-HMAC-SHA256.
//!
//! Vault records store `PBKDF2(password, salt)` next to the salt and
//! recompute it on every login. Parameters are fixed per record format
//! version (see `vault::format`), not configurable at runtime, because
//! an existing vault must always verify with the settings it was
//! written with.

use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::Zeroizing;

/// PBKDF2 settings tied to one record format version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pbkdf2Params {
    /// Number of HMAC-SHA256 rounds.
    pub iterations: u32,
    /// Length of the derived hash in bytes.
    pub hash_len: usize,
    /// Length of freshly generated salts in bytes.
    pub salt_len: usize,
}

impl Default for Pbkdf2Params {
    fn default() -> Self {
        Self {
            iterations: 100_000,
            hash_len: 32,
            salt_len: 32,
        }
    }
}

/// Derive the stored password hash for `password` under `salt`.
pub fn derive_password_hash(
    password: &[u8],
    salt: &[u8],
    params: &Pbkdf2Params,
) -> Zeroizing<Vec<u8>> {
    let mut out = Zeroizing::new(vec![0u8; params.hash_len]);
    pbkdf2_hmac::<Sha256>(password, salt, params.iterations, &mut out);
    out
}

/// Recompute the hash of `candidate` and compare it to `expected` in
/// constant time.
///
/// A length mismatch yields `false` without short-circuiting on content.
pub fn verify_password_hash(
    candidate: &[u8],
    salt: &[u8],
    expected: &[u8],
    params: &Pbkdf2Params,
) -> bool {
    let derived = derive_password_hash(candidate, salt, params);
    derived.as_slice().ct_eq(expected).into()
}

/// Generate a cryptographically random salt of `len` bytes.
pub fn generate_salt(len: usize) -> Vec<u8> {
    let mut salt = vec![0u8; len];
    rand::rng().fill_bytes(&mut salt);
    salt
}
