//! `passvault read`: print a vault's payload.

use std::path::Path;

use crate::cli::{output, prompt_password};
use crate::conditions::format_http_date;
use crate::errors::Result;
use crate::vault::VaultEngine;

/// Execute the `read` command.
pub async fn execute(engine: &VaultEngine, user: &str, out: Option<&Path>) -> Result<()> {
    let password = prompt_password()?;
    let snapshot = engine.read_vault(user, password.as_bytes()).await?;

    match out {
        Some(path) => {
            std::fs::write(path, &snapshot.payload)?;
            output::success(&format!(
                "Wrote {} bytes to {}",
                snapshot.payload.len(),
                path.display()
            ));
        }
        None => println!("{}", hex::encode(&snapshot.payload)),
    }
    output::info(&format!(
        "Last-Modified: {}",
        format_http_date(snapshot.last_modified)
    ));
    Ok(())
}
