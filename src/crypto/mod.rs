//! Cryptographic primitives for PassVault.
//!
//! Vault payloads arrive already encrypted by the client, so the server
//! side only needs password hashing:
//! - PBKDF2-HMAC-SHA256 derivation and constant-time verification (`kdf`)

pub mod kdf;

pub use kdf::{derive_password_hash, generate_salt, verify_password_hash, Pbkdf2Params};
