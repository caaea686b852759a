//! `passvault create`: register a new user with an initial payload.

use std::path::Path;

use crate::cli::{output, prompt_new_password, read_payload};
use crate::errors::Result;
use crate::vault::VaultEngine;

/// Execute the `create` command.
pub async fn execute(engine: &VaultEngine, user: &str, data: Option<&Path>, hex: bool) -> Result<()> {
    let payload = read_payload(data, hex)?;
    let password = prompt_new_password("PASSVAULT_PASSWORD")?;

    engine
        .create_vault(user, password.as_bytes(), &payload)
        .await?;

    output::success(&format!(
        "Created vault for '{user}' ({} byte payload)",
        payload.len()
    ));
    output::tip(&format!("Read it back with `passvault read {user}`"));
    Ok(())
}
