//! Server policy hooks.
//!
//! A `Policy` gets the last word on every account action, after the
//! caller has authenticated and before anything is written. Each hook
//! sees the username and the payload involved.

use crate::errors::{Result, VaultError};

/// Decides whether account actions may proceed.
///
/// Every hook defaults to allowing the action.
pub trait Policy: Send + Sync {
    fn allow_create(&self, _username: &str, _payload: &[u8]) -> bool {
        true
    }

    fn allow_read(&self, _username: &str, _payload: &[u8]) -> bool {
        true
    }

    fn allow_update(&self, _username: &str, _payload: &[u8]) -> bool {
        true
    }

    fn allow_password_change(&self, _username: &str, _payload: &[u8]) -> bool {
        true
    }
}

/// The account actions a policy rules on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Create,
    Read,
    Update,
    ChangePassword,
}

impl Action {
    /// Name reported back to clients in `PolicyRejected`.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Create => "createAccount",
            Self::Read => "readAccount",
            Self::Update => "updateAccount",
            Self::ChangePassword => "updatePassword",
        }
    }
}

/// Ask `policy` about `action` and turn a refusal into an error.
pub fn enforce(
    policy: &dyn Policy,
    action: Action,
    username: &str,
    payload: &[u8],
) -> Result<()> {
    let allowed = match action {
        Action::Create => policy.allow_create(username, payload),
        Action::Read => policy.allow_read(username, payload),
        Action::Update => policy.allow_update(username, payload),
        Action::ChangePassword => policy.allow_password_change(username, payload),
    };
    if allowed {
        Ok(())
    } else {
        tracing::info!(user = username, action = action.as_str(), "blocked by policy");
        Err(VaultError::PolicyRejected {
            action: action.as_str(),
        })
    }
}

/// Allows everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenPolicy;

impl Policy for OpenPolicy {}

/// Refuses everything. Also the fallback when a configured policy name
/// is not recognised.
#[derive(Debug, Clone, Copy, Default)]
pub struct DenyPolicy;

impl Policy for DenyPolicy {
    fn allow_create(&self, _username: &str, _payload: &[u8]) -> bool {
        false
    }

    fn allow_read(&self, _username: &str, _payload: &[u8]) -> bool {
        false
    }

    fn allow_update(&self, _username: &str, _payload: &[u8]) -> bool {
        false
    }

    fn allow_password_change(&self, _username: &str, _payload: &[u8]) -> bool {
        false
    }
}

/// Caps the payload size of anything written. Reads are unrestricted so
/// oversized vaults written before the cap can still be fetched.
#[derive(Debug, Clone, Copy)]
pub struct LimitPolicy {
    pub max_payload_bytes: usize,
}

impl LimitPolicy {
    fn fits(&self, payload: &[u8]) -> bool {
        payload.len() <= self.max_payload_bytes
    }
}

impl Policy for LimitPolicy {
    fn allow_create(&self, _username: &str, payload: &[u8]) -> bool {
        self.fits(payload)
    }

    fn allow_update(&self, _username: &str, payload: &[u8]) -> bool {
        self.fits(payload)
    }

    fn allow_password_change(&self, _username: &str, payload: &[u8]) -> bool {
        self.fits(payload)
    }
}
