//! `passvault info`: show record details without printing the payload.

use crate::cli::{output, prompt_password};
use crate::conditions::format_http_date;
use crate::errors::Result;
use crate::vault::VaultEngine;

/// Execute the `info` command.
pub async fn execute(engine: &VaultEngine, user: &str) -> Result<()> {
    let password = prompt_password()?;

    let rows = engine
        .read(user, password.as_bytes())
        .run(|view| {
            let record = view.record;
            Ok(vec![
                ("User", view.username.to_string()),
                ("Record version", record.version().as_u32().to_string()),
                ("Payload bytes", view.payload().len().to_string()),
                ("Reserved bytes", record.trailing().len().to_string()),
                ("Salt bytes", record.salt().map_or(0, <[u8]>::len).to_string()),
                ("Last-Modified", format_http_date(view.last_modified)),
            ])
        })
        .await
        .into_result()?;

    output::print_details_table(&rows);
    Ok(())
}
