//! `passvault write`: replace a vault's payload, optionally conditional
//! on its modification time.

use std::path::Path;

use crate::cli::{conditions_from_flags, output, prompt_password, read_payload};
use crate::errors::Result;
use crate::vault::{VaultEngine, WriteLocking};

/// Options of the `write` command beyond the username.
pub struct WriteArgs<'a> {
    pub data: &'a Path,
    pub hex: bool,
    pub if_unmodified_since: Option<&'a str>,
    pub if_modified_since: Option<&'a str>,
    pub upgrade: bool,
}

/// Execute the `write` command.
pub async fn execute(engine: &VaultEngine, user: &str, args: WriteArgs<'_>) -> Result<()> {
    // Reject bad flags before prompting for anything.
    let conditions = conditions_from_flags(args.if_unmodified_since, args.if_modified_since)?;
    let payload = read_payload(Some(args.data), args.hex)?;
    let size = payload.len();
    let password = prompt_password()?;

    let locking = if args.upgrade {
        WriteLocking::UpgradeFromShared
    } else {
        WriteLocking::Exclusive
    };

    engine
        .write(user, password.as_bytes())
        .conditions(conditions)
        .locking(locking)
        .run(|ctx| {
            ctx.set_payload(payload)?;
            ctx.encode()
        })
        .await
        .into_result()?;

    output::success(&format!("Updated vault for '{user}' ({size} byte payload)"));
    Ok(())
}
