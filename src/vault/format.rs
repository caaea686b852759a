//! Binary vault record format and password authentication.
//!
//! A vault file has this layout (all integers little-endian):
//!
//! ```text
//! [version: u32][salt_len: u16][hash_len: u16][salt][hash][payload_len: u32][payload][trailing...]
//! ```
//!
//! - **Version**: selects the decoder and the PBKDF2 settings. Only `0`
//!   exists today.
//! - **Salt / hash**: PBKDF2-HMAC-SHA256 of the account password.
//! - **Payload**: opaque client data (already encrypted client side).
//! - **Trailing**: reserved bytes; carried over unchanged on rewrite.
//!
//! Decoding is split in two steps. `VaultRecord::decode` reads only the
//! header so a login can be rejected before the payload is touched;
//! `load_payload` reads the rest.

use tracing::debug;
use zeroize::Zeroizing;

use crate::crypto::kdf::{derive_password_hash, generate_salt, verify_password_hash, Pbkdf2Params};
use crate::errors::{Result, VaultError};
use crate::storage::{ByteFile, Whence};

/// Known record format versions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordVersion {
    V0,
}

impl RecordVersion {
    /// Version used for every newly created record.
    pub const LATEST: Self = Self::V0;

    pub fn from_u32(n: u32) -> Result<Self> {
        match n {
            0 => Ok(Self::V0),
            other => Err(VaultError::UnsupportedVersion(other)),
        }
    }

    pub fn as_u32(self) -> u32 {
        match self {
            Self::V0 => 0,
        }
    }

    /// PBKDF2 settings used by this version.
    pub fn kdf_params(self) -> Pbkdf2Params {
        match self {
            Self::V0 => Pbkdf2Params::default(),
        }
    }
}

/// Salt and hash, only ever present together.
#[derive(Clone)]
struct Credentials {
    salt: Vec<u8>,
    hash: Zeroizing<Vec<u8>>,
}

/// One user's vault: password credentials plus the opaque payload.
#[derive(Clone)]
pub struct VaultRecord {
    version: RecordVersion,
    kdf: Pbkdf2Params,
    credentials: Option<Credentials>,
    payload: Option<Vec<u8>>,
    trailing: Vec<u8>,
}

impl VaultRecord {
    /// A blank record at the latest version, for account creation.
    ///
    /// It has neither credentials nor payload until `set_password` and
    /// `set_payload` are called.
    pub fn new() -> Self {
        Self::with_version(RecordVersion::LATEST)
    }

    fn with_version(version: RecordVersion) -> Self {
        Self {
            version,
            kdf: version.kdf_params(),
            credentials: None,
            payload: None,
            trailing: Vec::new(),
        }
    }

    /// Override the PBKDF2 settings of a blank record.
    ///
    /// Records written with non-default settings cannot be read back by
    /// `decode`, so this exists only to keep unit tests fast.
    #[cfg(test)]
    pub(crate) fn with_kdf(mut self, kdf: Pbkdf2Params) -> Self {
        self.kdf = kdf;
        self
    }

    /// Decode the version and credential header starting at the cursor.
    pub fn decode(file: &mut ByteFile) -> Result<Self> {
        let version = RecordVersion::from_u32(file.read_u32()?)?;
        let mut record = Self::with_version(version);
        match version {
            RecordVersion::V0 => record.decode_v0_header(file)?,
        }
        debug!(version = version.as_u32(), "decoded vault header");
        Ok(record)
    }

    fn decode_v0_header(&mut self, file: &mut ByteFile) -> Result<()> {
        let salt_len = usize::from(file.read_u16()?);
        let hash_len = usize::from(file.read_u16()?);
        let salt = file.read_bytes(salt_len, true)?;
        let hash = Zeroizing::new(file.read_bytes(hash_len, true)?);
        self.credentials = Some(Credentials { salt, hash });
        Ok(())
    }

    /// Read the length-prefixed payload and any trailing bytes.
    ///
    /// The cursor must sit right after the header, where `decode` left it.
    pub fn load_payload(&mut self, file: &mut ByteFile) -> Result<()> {
        if self.credentials.is_none() {
            return Err(VaultError::RecordIncomplete(
                "header must be decoded before the payload",
            ));
        }
        let len = usize::try_from(file.read_u32()?)
            .map_err(|_| VaultError::FieldTooLarge("payload length"))?;
        self.payload = Some(file.read_bytes(len, true)?);
        self.trailing = file.read_to_end()?;
        Ok(())
    }

    /// Check `candidate` against the stored hash in constant time.
    ///
    /// A record without credentials verifies nothing.
    pub fn verify_password(&self, candidate: &[u8]) -> bool {
        match &self.credentials {
            Some(c) => verify_password_hash(candidate, &c.salt, &c.hash, &self.kdf),
            None => false,
        }
    }

    /// Replace the credentials with a fresh salt and the hash of
    /// `new_password`.
    pub fn set_password(&mut self, new_password: &[u8]) {
        let salt = generate_salt(self.kdf.salt_len);
        let hash = derive_password_hash(new_password, &salt, &self.kdf);
        self.credentials = Some(Credentials { salt, hash });
    }

    pub fn set_payload(&mut self, payload: Vec<u8>) {
        self.payload = Some(payload);
    }

    /// Write the whole record from offset 0.
    ///
    /// Requires credentials and a payload.
    pub fn encode(&self, file: &mut ByteFile) -> Result<()> {
        let credentials = self
            .credentials
            .as_ref()
            .ok_or(VaultError::RecordIncomplete("no password has been set"))?;
        let payload = self
            .payload
            .as_ref()
            .ok_or(VaultError::RecordIncomplete("no payload has been set"))?;

        let salt_len = u16::try_from(credentials.salt.len())
            .map_err(|_| VaultError::FieldTooLarge("salt"))?;
        let hash_len = u16::try_from(credentials.hash.len())
            .map_err(|_| VaultError::FieldTooLarge("hash"))?;
        let payload_len =
            u32::try_from(payload.len()).map_err(|_| VaultError::FieldTooLarge("payload"))?;

        file.seek(0, Whence::Begin)?;
        file.write_u32(self.version.as_u32())?;
        file.write_u16(salt_len)?;
        file.write_u16(hash_len)?;
        file.write_bytes(&credentials.salt, true)?;
        file.write_bytes(&credentials.hash, true)?;
        file.write_u32(payload_len)?;
        file.write_bytes(payload, true)?;
        file.write_bytes(&self.trailing, true)?;
        debug!(
            version = self.version.as_u32(),
            payload_len,
            trailing_len = self.trailing.len(),
            "encoded vault record"
        );
        Ok(())
    }

    pub fn version(&self) -> RecordVersion {
        self.version
    }

    /// The payload, once loaded or set.
    pub fn payload(&self) -> Option<&[u8]> {
        self.payload.as_deref()
    }

    /// Reserved bytes found after the payload.
    pub fn trailing(&self) -> &[u8] {
        &self.trailing
    }

    pub fn salt(&self) -> Option<&[u8]> {
        self.credentials.as_ref().map(|c| c.salt.as_slice())
    }

    pub fn hash(&self) -> Option<&[u8]> {
        self.credentials.as_ref().map(|c| c.hash.as_slice())
    }
}

impl Default for VaultRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VaultRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultRecord")
            .field("version", &self.version)
            .field("has_credentials", &self.credentials.is_some())
            .field("payload_len", &self.payload.as_ref().map(Vec::len))
            .field("trailing_len", &self.trailing.len())
            .finish()
    }
}
