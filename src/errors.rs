use std::path::PathBuf;
use thiserror::Error;

use crate::conditions::ConditionalHeader;

/// All errors that can occur in PassVault.
#[derive(Debug, Error)]
pub enum VaultError {
    // --- Client-facing errors ---
    /// Bad credentials or an absent vault. The two are never told apart.
    #[error("username or password is incorrect")]
    Auth,

    #[error("username already taken")]
    UsernameTaken,

    #[error("invalid username '{0}': must start with a letter or digit and contain only ASCII letters, digits, '_', '.', '$' and '-'")]
    InvalidUsername(String),

    #[error("precondition failed: {}", join_headers(.0))]
    Precondition(Vec<ConditionalHeader>),

    #[error("unsupported conditional header: {}", .0.join(", "))]
    UnsupportedConditionalHeader(Vec<String>),

    #[error("invalid conditional header: {}", join_headers(.0))]
    InvalidConditionalHeader(Vec<ConditionalHeader>),

    #[error("action '{action}' was blocked by server policy")]
    PolicyRejected { action: &'static str },

    // --- Storage errors ---
    /// Raised by a `FileSource` when a path opened for reading is absent.
    /// Transactions fold this into `Auth`.
    #[error("file not found: {0}")]
    NotFound(PathBuf),

    #[error("unsupported vault record version {0}")]
    UnsupportedVersion(u32),

    #[error("short {op}: expected {expected} bytes, transferred {actual}")]
    ShortIo {
        op: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("vault record is incomplete: {0}")]
    RecordIncomplete(&'static str),

    #[error("vault record was already encoded in this transaction")]
    AlreadyEncoded,

    #[error("field too large for the vault format: {0}")]
    FieldTooLarge(&'static str),

    #[error("file handle is already closed")]
    Closed,

    // --- Defects ---
    #[error("lock usage error: {0}")]
    LockUsage(String),

    #[error("timed out waiting for another process to release {0}")]
    LockTimeout(PathBuf),

    #[error("operation finished without completing the transaction")]
    Incomplete,

    // --- IO errors ---
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // --- Config errors ---
    #[error("Config file error: {0}")]
    ConfigError(String),

    // --- CLI errors ---
    #[error("Command failed: {0}")]
    CommandFailed(String),
}

fn join_headers(headers: &[ConditionalHeader]) -> String {
    headers
        .iter()
        .map(|h| h.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}

impl VaultError {
    /// HTTP-equivalent status the request layer should answer with.
    pub fn status(&self) -> u16 {
        match self {
            Self::Auth
            | Self::NotFound(_)
            | Self::UsernameTaken
            | Self::InvalidUsername(_)
            | Self::UnsupportedConditionalHeader(_)
            | Self::InvalidConditionalHeader(_)
            | Self::PolicyRejected { .. } => 400,
            Self::Precondition(_) => 412,
            _ => 500,
        }
    }

    /// Stable machine-readable error code for client responses.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Auth | Self::NotFound(_) => "E_AUTH",
            Self::UsernameTaken => "E_USER",
            Self::InvalidUsername(_) => "E_INVAL_USERNAME",
            Self::Precondition(_) => "E_PRECONDITION",
            Self::UnsupportedConditionalHeader(_) => "E_UNSUPPORTED_CONDITIONAL_HEADER",
            Self::InvalidConditionalHeader(_) => "E_INVAL_CONDITIONAL_HEADER",
            Self::PolicyRejected { .. } => "E_POLICY",
            Self::Incomplete => "E_UNKNOWN",
            _ => "E_SERVER",
        }
    }

    /// `true` for conditions the caller caused and can act on.
    ///
    /// Everything else points at a corrupted vault or a defect and is
    /// reported to clients as a generic server error.
    pub fn is_client_error(&self) -> bool {
        self.status() < 500
    }
}

/// Convenience type alias for PassVault results.
pub type Result<T> = std::result::Result<T, VaultError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_and_not_found_share_a_code() {
        let missing = VaultError::NotFound(PathBuf::from("/data/alice"));
        assert_eq!(VaultError::Auth.code(), missing.code());
    }

    #[test]
    fn precondition_lists_failed_headers() {
        let err = VaultError::Precondition(vec![ConditionalHeader::IfUnmodifiedSince]);
        assert_eq!(err.status(), 412);
        assert_eq!(err.to_string(), "precondition failed: if-unmodified-since");
    }

    #[test]
    fn storage_defects_are_internal() {
        let short = VaultError::ShortIo {
            op: "read",
            expected: 4,
            actual: 1,
        };
        assert!(!short.is_client_error());
        assert!(!VaultError::UnsupportedVersion(7).is_client_error());
        assert!(!VaultError::LockUsage("release without acquire".into()).is_client_error());
    }
}
