//! CLI module: Clap argument parser, output helpers, and command implementations.

pub mod commands;
pub mod output;

use std::path::{Path, PathBuf};

use clap::Parser;

use zeroize::Zeroizing;

use crate::conditions::Conditions;
use crate::config::Settings;
use crate::errors::{Result, VaultError};

/// Minimum length for newly chosen passwords.
const MIN_PASSWORD_LEN: usize = 8;

/// PassVault CLI: per-user password vault storage.
#[derive(Parser)]
#[command(
    name = "passvault",
    about = "Per-user password vault storage with transactional writes",
    version
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Directory containing passvault.toml (default: current directory)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Vault data directory, overriding the config file
    #[arg(long, global = true)]
    pub data_dir: Option<PathBuf>,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,
}

/// All available subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Create a vault for a new user
    Create {
        /// Username
        user: String,
        /// File holding the initial payload (empty if omitted)
        #[arg(long)]
        data: Option<PathBuf>,
        /// The payload file is hex text rather than raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Print a vault's payload as hex
    Read {
        /// Username
        user: String,
        /// Write the raw payload to this file instead
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Replace a vault's payload
    Write {
        /// Username
        user: String,
        /// File holding the new payload
        #[arg(long)]
        data: PathBuf,
        /// The payload file is hex text rather than raw bytes
        #[arg(long)]
        hex: bool,
        /// Only write if the vault is unchanged since this HTTP date
        #[arg(long)]
        if_unmodified_since: Option<String>,
        /// Only write if the vault changed after this HTTP date
        #[arg(long)]
        if_modified_since: Option<String>,
        /// Authenticate under a shared lock before taking the exclusive one
        #[arg(long)]
        upgrade: bool,
    },

    /// Change a vault's password
    Passwd {
        /// Username
        user: String,
        /// Replacement payload, re-encrypted for the new password
        #[arg(long)]
        data: Option<PathBuf>,
        /// The payload file is hex text rather than raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Show a table of vault details
    Info {
        /// Username
        user: String,
    },
}

// ---------------------------------------------------------------------------
// Shared helpers used by multiple commands
// ---------------------------------------------------------------------------

/// Directory the config file and relative data directory are resolved in.
pub fn config_dir(cli: &Cli) -> Result<PathBuf> {
    match &cli.config {
        Some(dir) => Ok(dir.clone()),
        None => Ok(std::env::current_dir()?),
    }
}

/// Load `passvault.toml` and apply command-line overrides.
pub fn load_settings(cli: &Cli) -> Result<(Settings, PathBuf)> {
    let dir = config_dir(cli)?;
    let mut settings = Settings::load(&dir)?;
    if let Some(data_dir) = &cli.data_dir {
        settings.data_dir = data_dir.to_string_lossy().into_owned();
    }
    Ok((settings, dir))
}

/// Log filter directive for the given `-v` count.
pub fn log_filter(verbose: u8, settings: &Settings) -> String {
    match verbose {
        0 => settings.log_filter().to_string(),
        1 => "debug".to_string(),
        _ => "trace".to_string(),
    }
}

/// Get the vault password, trying in order:
/// 1. `PASSVAULT_PASSWORD` env var (scripts)
/// 2. Interactive prompt
///
/// Returns `Zeroizing<String>` so the password is wiped from memory on drop.
pub fn prompt_password() -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("PASSVAULT_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }

    let pw = dialoguer::Password::new()
        .with_prompt("Enter vault password")
        .interact()
        .map_err(|e| VaultError::CommandFailed(format!("password prompt: {e}")))?;
    Ok(Zeroizing::new(pw))
}

/// Prompt for a new password with confirmation.
///
/// `env_var` is checked first for scripted use. Enforces a minimum
/// password length.
pub fn prompt_new_password(env_var: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var(env_var) {
        if !pw.is_empty() {
            if pw.len() < MIN_PASSWORD_LEN {
                return Err(VaultError::CommandFailed(format!(
                    "password must be at least {MIN_PASSWORD_LEN} characters"
                )));
            }
            return Ok(Zeroizing::new(pw));
        }
    }

    loop {
        let password = dialoguer::Password::new()
            .with_prompt("Choose vault password")
            .with_confirmation(
                "Confirm vault password",
                "Passwords do not match, try again",
            )
            .interact()
            .map_err(|e| VaultError::CommandFailed(format!("password prompt: {e}")))?;

        if password.len() < MIN_PASSWORD_LEN {
            output::warning(&format!(
                "Password must be at least {MIN_PASSWORD_LEN} characters. Try again."
            ));
            continue;
        }

        return Ok(Zeroizing::new(password));
    }
}

/// Read a payload file, decoding it from hex when `hex` is set.
///
/// No file means an empty payload.
pub fn read_payload(path: Option<&Path>, hex: bool) -> Result<Vec<u8>> {
    let Some(path) = path else {
        return Ok(Vec::new());
    };
    let bytes = std::fs::read(path)?;
    if !hex {
        return Ok(bytes);
    }
    let text = String::from_utf8(bytes).map_err(|_| {
        VaultError::CommandFailed(format!("{} is not hex text", path.display()))
    })?;
    ::hex::decode(text.trim()).map_err(|e| {
        VaultError::CommandFailed(format!("{} is not valid hex: {e}", path.display()))
    })
}

/// Build preconditions from the `--if-*` flags.
pub fn conditions_from_flags(
    if_unmodified_since: Option<&str>,
    if_modified_since: Option<&str>,
) -> Result<Conditions> {
    let headers = [
        ("if-unmodified-since", if_unmodified_since),
        ("if-modified-since", if_modified_since),
    ];
    Conditions::from_headers(
        headers
            .iter()
            .filter_map(|(name, value)| value.map(|v| (*name, v))),
    )
}
