//! The long-lived owner of everything transactions share.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use crate::conditions::Conditions;
use crate::config::Settings;
use crate::errors::Result;
use crate::lock::KeyedLock;
use crate::policy::{OpenPolicy, Policy};
use crate::storage::{FileSource, NativeSource};

use super::transaction::{CreateTxn, ReadTxn, WriteTxn};
use super::validate_username;

/// Entry point for vault operations.
///
/// One engine is built at startup and shared (usually behind an `Arc`)
/// by every request. It owns the per-path lock table, so two engines over
/// the same directory do not coordinate with each other.
pub struct VaultEngine {
    source: Arc<dyn FileSource>,
    locks: KeyedLock<PathBuf>,
    policy: Arc<dyn Policy>,
    data_dir: PathBuf,
}

/// A vault's payload as of one read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VaultSnapshot {
    pub payload: Vec<u8>,
    pub last_modified: SystemTime,
}

impl VaultEngine {
    /// Engine over `source` with vaults stored under `data_dir` and an
    /// allow-everything policy.
    pub fn new(source: Arc<dyn FileSource>, data_dir: impl Into<PathBuf>) -> Self {
        Self {
            source,
            locks: KeyedLock::new(),
            policy: Arc::new(OpenPolicy),
            data_dir: data_dir.into(),
        }
    }

    pub fn with_policy(mut self, policy: Arc<dyn Policy>) -> Self {
        self.policy = policy;
        self
    }

    /// Engine on the real filesystem as described by `settings`, creating
    /// the data directory if needed.
    pub fn from_settings(settings: &Settings, config_dir: &Path) -> Result<Self> {
        let data_dir = settings.data_path(config_dir);
        std::fs::create_dir_all(&data_dir)?;
        tracing::debug!(data_dir = %data_dir.display(), policy = %settings.policy, "engine ready");
        Ok(Self::new(Arc::new(NativeSource::new()), data_dir).with_policy(settings.build_policy()))
    }

    pub fn source(&self) -> &dyn FileSource {
        self.source.as_ref()
    }

    pub fn locks(&self) -> &KeyedLock<PathBuf> {
        &self.locks
    }

    pub fn policy(&self) -> &dyn Policy {
        self.policy.as_ref()
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    /// Validate `username` and resolve its vault file.
    pub fn vault_path(&self, username: &str) -> Result<PathBuf> {
        validate_username(username)?;
        Ok(self.data_dir.join(username))
    }

    pub fn read<'a>(&'a self, username: &'a str, password: &'a [u8]) -> ReadTxn<'a> {
        ReadTxn::new(self, username, password)
    }

    pub fn write<'a>(&'a self, username: &'a str, password: &'a [u8]) -> WriteTxn<'a> {
        WriteTxn::new(self, username, password)
    }

    /// `payload` is what the policy's create hook rules on, and what the
    /// new record starts out with.
    pub fn create<'a>(&'a self, username: &'a str, payload: &'a [u8]) -> CreateTxn<'a> {
        CreateTxn::new(self, username, payload)
    }

    /// Wait until no transaction holds a lock.
    pub async fn shutdown(&self) {
        self.locks.drain().await;
    }

    // ------------------------------------------------------------------
    // One-shot operations
    // ------------------------------------------------------------------

    pub async fn create_vault(&self, username: &str, password: &[u8], payload: &[u8]) -> Result<()> {
        self.create(username, payload)
            .run(|ctx| {
                ctx.set_password(password)?;
                ctx.encode()
            })
            .await
            .into_result()
    }

    pub async fn read_vault(&self, username: &str, password: &[u8]) -> Result<VaultSnapshot> {
        self.read(username, password)
            .run(|view| {
                Ok(VaultSnapshot {
                    payload: view.payload().to_vec(),
                    last_modified: view.last_modified,
                })
            })
            .await
            .into_result()
    }

    pub async fn update_payload(
        &self,
        username: &str,
        password: &[u8],
        payload: Vec<u8>,
        conditions: Conditions,
    ) -> Result<()> {
        self.write(username, password)
            .conditions(conditions)
            .run(|ctx| {
                ctx.set_payload(payload)?;
                ctx.encode()
            })
            .await
            .into_result()
    }

    /// Re-key a vault. Clients re-encrypt their payload under the new
    /// password, so a replacement payload usually comes along.
    pub async fn change_password(
        &self,
        username: &str,
        password: &[u8],
        new_password: &[u8],
        payload: Option<Vec<u8>>,
    ) -> Result<()> {
        self.write(username, password)
            .run(|ctx| {
                if let Some(payload) = payload {
                    ctx.set_payload(payload)?;
                }
                ctx.set_password(new_password)?;
                ctx.encode()
            })
            .await
            .into_result()
    }
}

impl std::fmt::Debug for VaultEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultEngine")
            .field("data_dir", &self.data_dir)
            .field("held_keys", &self.locks.held_keys())
            .finish_non_exhaustive()
    }
}
