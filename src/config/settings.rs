use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::errors::{Result, VaultError};
use crate::policy::{DenyPolicy, LimitPolicy, OpenPolicy, Policy};

/// Server configuration, loaded from `passvault.toml`.
///
/// Every field has a default so the server runs without any config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Directory (relative to the config directory) holding one vault
    /// file per user.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// `tracing` filter directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,

    /// Shorthand for `log_filter = "debug"`.
    #[serde(default)]
    pub debug: bool,

    /// `open` or `deny`.
    #[serde(default = "default_policy")]
    pub policy: String,

    /// Largest payload accepted on create or update.
    #[serde(default)]
    pub max_payload_bytes: Option<usize>,
}

// ── Serde default helpers ────────────────────────────────────────────

fn default_data_dir() -> String {
    "server-data".to_string()
}

fn default_log_filter() -> String {
    "info".to_string()
}

fn default_policy() -> String {
    "open".to_string()
}

// ── Implementation ───────────────────────────────────────────────────

impl Default for Settings {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            log_filter: default_log_filter(),
            debug: false,
            policy: default_policy(),
            max_payload_bytes: None,
        }
    }
}

impl Settings {
    /// Name of the config file we look for in the config directory.
    pub const FILE_NAME: &'static str = "passvault.toml";

    /// Load settings from `<config_dir>/passvault.toml`.
    ///
    /// If the file does not exist, defaults are returned.
    /// If the file exists but cannot be parsed, an error is returned.
    pub fn load(config_dir: &Path) -> Result<Self> {
        let config_path = config_dir.join(Self::FILE_NAME);

        if !config_path.exists() {
            return Ok(Self::default());
        }

        let contents = std::fs::read_to_string(&config_path)?;

        let settings: Settings = toml::from_str(&contents).map_err(|e| {
            VaultError::ConfigError(format!("Failed to parse {}: {e}", config_path.display()))
        })?;

        Ok(settings)
    }

    /// Directory holding the vault files.
    pub fn data_path(&self, config_dir: &Path) -> PathBuf {
        config_dir.join(&self.data_dir)
    }

    /// Filter directive to log with, after applying `debug`.
    pub fn log_filter(&self) -> &str {
        if self.debug {
            "debug"
        } else {
            &self.log_filter
        }
    }

    /// Build the configured policy.
    ///
    /// An unknown policy name falls back to denying everything.
    pub fn build_policy(&self) -> Arc<dyn Policy> {
        match self.policy.as_str() {
            "open" => match self.max_payload_bytes {
                Some(max_payload_bytes) => Arc::new(LimitPolicy { max_payload_bytes }),
                None => Arc::new(OpenPolicy),
            },
            "deny" => Arc::new(DenyPolicy),
            other => {
                tracing::warn!(policy = other, "unrecognized policy; denying all actions");
                Arc::new(DenyPolicy)
            }
        }
    }
}

// ── Tests ────────────────────────────────────────────────────────────
