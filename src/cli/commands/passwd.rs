//! `passvault passwd`: change a vault's password.
//!
//! The payload is opaque to the server. Clients that encrypt it with a
//! key derived from the password pass the re-encrypted payload along.

use std::path::Path;

use crate::cli::{output, prompt_new_password, prompt_password, read_payload};
use crate::errors::Result;
use crate::vault::VaultEngine;

/// Execute the `passwd` command.
pub async fn execute(engine: &VaultEngine, user: &str, data: Option<&Path>, hex: bool) -> Result<()> {
    let payload = match data {
        Some(path) => Some(read_payload(Some(path), hex)?),
        None => None,
    };

    output::info("Enter the current vault password.");
    let password = prompt_password()?;
    output::info("Choose the new vault password.");
    let new_password = prompt_new_password("PASSVAULT_NEW_PASSWORD")?;

    engine
        .change_password(user, password.as_bytes(), new_password.as_bytes(), payload)
        .await?;

    output::success(&format!("Password changed for '{user}'"));
    Ok(())
}
