//! Read, write and create transactions over one user's vault.
//!
//! Each transaction locks the vault's path, opens the handles it needs,
//! runs a caller-supplied closure, then tears everything down in a fixed
//! order: close handles, commit or roll back, run the response hook,
//! release the lock. The caller always gets a `Finished` back, whatever
//! step failed.
//!
//! Writes never touch the live file. The new record goes to a staging
//! file next to it (`<path> new`) and is renamed over the original only
//! once the closure has completed the transaction.
//!
//! The lock table only orders transactions of one engine. Writes and
//! creates also claim `<path> lock` through the file source, which keeps
//! engines in other processes off the same vault until teardown.

use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::conditions::Conditions;
use crate::errors::{Result, VaultError};
use crate::lock::{LockGuard, LockMode, LockPriority, UpgradePath};
use crate::policy::{self, Action, Policy};
use crate::storage::{ByteFile, FileSource, OpenMode, PathLock};

use super::engine::VaultEngine;
use super::format::VaultRecord;

/// What happened to the files of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Teardown has not run yet. A transaction whose future is dropped in
    /// this state rolls back.
    Pending,
    /// The transaction completed. For writes the new record is live.
    Committed,
    /// The transaction did not complete. Any staged or partial file was
    /// removed and the previous record, if any, is untouched.
    RolledBack,
}

/// Final state of a transaction: what happened on disk, and what the
/// closure (or the machinery around it) returned.
///
/// The two are independent. A closure that fails after completing still
/// commits, and an `Ok` closure that never completed is rolled back with
/// `VaultError::Incomplete`.
#[derive(Debug)]
pub struct Finished<T> {
    pub outcome: Outcome,
    pub result: Result<T>,
}

impl<T> Finished<T> {
    pub fn into_result(self) -> Result<T> {
        self.result
    }

    pub fn is_committed(&self) -> bool {
        self.outcome == Outcome::Committed
    }

    fn rejected(err: VaultError, hook: Option<ResponseHook<'_>>) -> Self {
        if let Some(hook) = hook {
            hook(Outcome::RolledBack);
        }
        Self {
            outcome: Outcome::RolledBack,
            result: Err(err),
        }
    }

    fn settle(outcome: Outcome, result: Result<T>, failure: Option<VaultError>) -> Self {
        let result = match (result, failure) {
            (Ok(_), Some(e)) => Err(e),
            (result, _) => result,
        };
        Self { outcome, result }
    }
}

/// How a write transaction takes its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteLocking {
    /// Exclusive from the start.
    #[default]
    Exclusive,
    /// Authenticate under a shared lock, then upgrade. Wrong passwords
    /// are turned away without ever blocking readers.
    UpgradeFromShared,
}

/// Called once per transaction after its files are closed and before its
/// lock is released.
pub type ResponseHook<'a> = Box<dyn FnOnce(Outcome) + Send + 'a>;

/// How often a blocked transaction retries the cross-process claim.
const CLAIM_POLL: Duration = Duration::from_millis(50);

/// Give up on the cross-process claim after this long.
const CLAIM_TIMEOUT: Duration = Duration::from_secs(30);

/// Where a write transaction stages its new record for `path`.
pub fn staging_path(path: &Path) -> PathBuf {
    sibling(path, " new")
}

/// The file write transactions claim to exclude other processes.
pub fn lock_file_path(path: &Path) -> PathBuf {
    sibling(path, " lock")
}

// Usernames cannot contain spaces, so these never name another vault.
fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(suffix);
    PathBuf::from(name)
}

/// A decoded, authenticated vault handed to read closures.
#[derive(Debug)]
pub struct VaultView<'a> {
    pub username: &'a str,
    pub record: &'a VaultRecord,
    pub last_modified: SystemTime,
}

impl VaultView<'_> {
    pub fn payload(&self) -> &[u8] {
        self.record.payload().unwrap_or_default()
    }
}

/// Handle given to write and create closures.
///
/// Changes are made to the in-memory record and reach the staged file
/// only through `encode`, which may run once, after all changes.
pub struct WriteContext<'s> {
    username: &'s str,
    record: &'s mut VaultRecord,
    file: &'s mut ByteFile,
    policy: &'s dyn Policy,
    payload_action: Action,
    last_modified: Option<SystemTime>,
    encoded: bool,
    completed: bool,
}

impl<'s> WriteContext<'s> {
    fn new(
        username: &'s str,
        record: &'s mut VaultRecord,
        file: &'s mut ByteFile,
        policy: &'s dyn Policy,
        payload_action: Action,
        last_modified: Option<SystemTime>,
    ) -> Self {
        Self {
            username,
            record,
            file,
            policy,
            payload_action,
            last_modified,
            encoded: false,
            completed: false,
        }
    }

    pub fn username(&self) -> &str {
        self.username
    }

    pub fn record(&self) -> &VaultRecord {
        &*self.record
    }

    /// Modification time of the record being replaced. `None` on create.
    pub fn last_modified(&self) -> Option<SystemTime> {
        self.last_modified
    }

    /// Replace the payload, subject to the policy's create or update hook.
    pub fn set_payload(&mut self, payload: Vec<u8>) -> Result<()> {
        self.ensure_unencoded()?;
        policy::enforce(self.policy, self.payload_action, self.username, &payload)?;
        self.record.set_payload(payload);
        Ok(())
    }

    /// Change the password. On an existing vault the policy's
    /// password-change hook sees the payload as it stands now, so set the
    /// new payload first when replacing both.
    pub fn set_password(&mut self, password: &[u8]) -> Result<()> {
        self.ensure_unencoded()?;
        if self.payload_action == Action::Update {
            let payload = self.record.payload().unwrap_or_default();
            policy::enforce(self.policy, Action::ChangePassword, self.username, payload)?;
        }
        self.record.set_password(password);
        Ok(())
    }

    /// Write the record to the staged file.
    pub fn encode(&mut self) -> Result<()> {
        self.ensure_unencoded()?;
        self.record.encode(self.file)?;
        self.encoded = true;
        debug!(user = self.username, "record encoded");
        Ok(())
    }

    /// Commit even if the closure goes on to return an error.
    pub fn mark_completed(&mut self) -> Result<()> {
        if !self.encoded {
            return Err(VaultError::RecordIncomplete(
                "the record must be encoded before completing",
            ));
        }
        self.completed = true;
        Ok(())
    }

    fn ensure_unencoded(&self) -> Result<()> {
        if self.encoded {
            Err(VaultError::AlreadyEncoded)
        } else {
            Ok(())
        }
    }

    fn is_complete(&self, closure_ok: bool) -> bool {
        self.completed || (closure_ok && self.encoded)
    }
}

// ---------------------------------------------------------------------------
// Session: the handles and lock of one transaction, and their teardown
// ---------------------------------------------------------------------------

enum WriteTarget {
    None,
    /// A staging file that replaces the vault on commit.
    Staging(PathBuf),
    /// The vault itself, being created.
    InPlace,
}

struct Session<'e> {
    engine: &'e VaultEngine,
    path: PathBuf,
    // Dropped before `guard`.
    claim: Option<PathLock>,
    guard: Option<LockGuard<'e, PathBuf>>,
    readable: Option<ByteFile>,
    writable: Option<ByteFile>,
    target: WriteTarget,
    outcome: Outcome,
}

impl<'e> Session<'e> {
    fn new(engine: &'e VaultEngine, path: PathBuf) -> Self {
        Self {
            engine,
            path,
            guard: None,
            claim: None,
            readable: None,
            writable: None,
            target: WriteTarget::None,
            outcome: Outcome::Pending,
        }
    }

    async fn lock(&mut self, mode: LockMode) -> Result<()> {
        let guard = self.engine.locks().acquire(self.path.clone(), mode).await?;
        self.guard = Some(guard);
        Ok(())
    }

    /// Claim the vault against other processes, polling until the
    /// current holder lets go.
    async fn claim(&mut self) -> Result<()> {
        let lock_path = lock_file_path(&self.path);
        let started = Instant::now();
        loop {
            if let Some(claim) = self.engine.source().try_lock(&lock_path)? {
                self.claim = Some(claim);
                return Ok(());
            }
            if started.elapsed() > CLAIM_TIMEOUT {
                return Err(VaultError::LockTimeout(lock_path));
            }
            debug!(path = %lock_path.display(), "vault claimed by another process; waiting");
            tokio::time::sleep(CLAIM_POLL).await;
        }
    }

    /// Whether the live vault was replaced since it was opened for reading.
    fn replaced_since_open(&mut self) -> Result<bool> {
        let live = self.engine.source().mtime(&self.path).map_err(|e| match e {
            VaultError::NotFound(_) => VaultError::Auth,
            other => other,
        })?;
        Ok(self.readable()?.mtime()? != live)
    }

    async fn upgrade(&mut self) -> Result<UpgradePath> {
        let guard = self
            .guard
            .as_mut()
            .ok_or_else(|| VaultError::LockUsage("upgrade before acquiring".into()))?;
        guard.upgrade(LockPriority::PreventNewAcquisitions).await
    }

    fn readable(&mut self) -> Result<&mut ByteFile> {
        if self.readable.is_none() {
            let file = self
                .engine
                .source()
                .open(&self.path, OpenMode::Read)
                .map_err(|e| match e {
                    VaultError::NotFound(_) => VaultError::Auth,
                    other => other,
                })?;
            debug!(path = %self.path.display(), "opened vault for reading");
            self.readable = Some(file);
        }
        self.readable.as_mut().ok_or(VaultError::Closed)
    }

    fn reopen_readable(&mut self) -> Result<()> {
        if let Some(mut file) = self.readable.take() {
            file.close()?;
        }
        Ok(())
    }

    /// Decode the record header and check `password` against it.
    fn authenticate(&mut self, password: &[u8]) -> Result<VaultRecord> {
        let record = VaultRecord::decode(self.readable()?)?;
        if !record.verify_password(password) {
            debug!("password rejected");
            return Err(VaultError::Auth);
        }
        Ok(record)
    }

    /// Open a fresh staging file. Requires the claim, so a leftover
    /// staging file can only come from a process that died mid-write.
    fn open_staging(&mut self) -> Result<&mut ByteFile> {
        let staging = staging_path(&self.path);
        let source = self.engine.source();
        if source.exists(&staging) {
            warn!(path = %staging.display(), "removing staging file left by an earlier run");
            source.remove(&staging)?;
        }
        let file = source.open(&staging, OpenMode::CreateNew)?;
        debug!(path = %staging.display(), "opened staging file");
        self.target = WriteTarget::Staging(staging);
        Ok(self.writable.insert(file))
    }

    fn open_in_place(&mut self) -> Result<&mut ByteFile> {
        let file = self.engine.source().open(&self.path, OpenMode::CreateNew)?;
        debug!(path = %self.path.display(), "opened new vault");
        self.target = WriteTarget::InPlace;
        Ok(self.writable.insert(file))
    }

    /// Tear the transaction down.
    ///
    /// Returns what happened on disk, plus an error from teardown itself
    /// that should replace an `Ok` result.
    fn finish(
        mut self,
        completed: bool,
        hook: Option<ResponseHook<'_>>,
    ) -> (Outcome, Option<VaultError>) {
        let mut failure = None;

        if let Some(mut file) = self.readable.take() {
            if let Err(e) = file.close() {
                error!(error = %e, "failed to close vault after reading");
            }
        }

        let mut commit = completed;
        if let Some(mut file) = self.writable.take() {
            if let Err(e) = file.close() {
                error!(error = %e, "failed to close written vault");
                if commit {
                    commit = false;
                    failure = Some(e);
                }
            }
        }

        let source = self.engine.source();
        let target = std::mem::replace(&mut self.target, WriteTarget::None);
        let outcome = match (target, commit) {
            (WriteTarget::None, true) => Outcome::Committed,
            (WriteTarget::None, false) => Outcome::RolledBack,
            (WriteTarget::Staging(staging), true) => {
                match source.rename_replacing(&staging, &self.path) {
                    Ok(()) => {
                        info!(path = %self.path.display(), "vault updated");
                        Outcome::Committed
                    }
                    Err(e) => {
                        error!(error = %e, "failed to move staged vault into place");
                        discard(source, &staging);
                        failure.get_or_insert(e);
                        Outcome::RolledBack
                    }
                }
            }
            (WriteTarget::Staging(staging), false) => {
                discard(source, &staging);
                Outcome::RolledBack
            }
            (WriteTarget::InPlace, true) => {
                info!(path = %self.path.display(), "vault created");
                Outcome::Committed
            }
            (WriteTarget::InPlace, false) => {
                discard(source, &self.path);
                Outcome::RolledBack
            }
        };

        self.outcome = outcome;
        if let Some(hook) = hook {
            hook(outcome);
        }

        self.claim = None;
        if let Some(guard) = self.guard.take() {
            if let Err(e) = guard.release() {
                error!(error = %e, "failed to release vault lock");
                failure.get_or_insert(e);
            }
        }
        (outcome, failure)
    }
}

impl Drop for Session<'_> {
    fn drop(&mut self) {
        if self.outcome != Outcome::Pending {
            return;
        }
        warn!(path = %self.path.display(), "transaction abandoned before teardown");
        self.readable = None;
        self.writable = None;
        match std::mem::replace(&mut self.target, WriteTarget::None) {
            WriteTarget::None => {}
            WriteTarget::Staging(staging) => discard(self.engine.source(), &staging),
            WriteTarget::InPlace => discard(self.engine.source(), &self.path),
        }
    }
}

fn discard(source: &dyn FileSource, path: &Path) {
    match source.remove(path) {
        Ok(()) => debug!(path = %path.display(), "rolled back"),
        Err(e) => warn!(path = %path.display(), error = %e, "rollback could not remove file"),
    }
}

/// Apply the completion rules to a closure's result.
fn reconcile<T>(result: Result<T>, completed: bool) -> Result<T> {
    match result {
        Ok(_) if !completed => {
            warn!("closure returned without completing the transaction");
            Err(VaultError::Incomplete)
        }
        Err(e) if completed => {
            warn!(error = %e, "closure failed after completing; committing anyway");
            Err(e)
        }
        result => result,
    }
}

// ---------------------------------------------------------------------------
// Read
// ---------------------------------------------------------------------------

/// Authenticated read of a vault under a shared lock.
#[must_use = "a transaction does nothing until `run` is awaited"]
pub struct ReadTxn<'a> {
    engine: &'a VaultEngine,
    username: &'a str,
    password: &'a [u8],
    hook: Option<ResponseHook<'a>>,
}

impl<'a> ReadTxn<'a> {
    pub(super) fn new(engine: &'a VaultEngine, username: &'a str, password: &'a [u8]) -> Self {
        Self {
            engine,
            username,
            password,
            hook: None,
        }
    }

    pub fn on_response(mut self, hook: impl FnOnce(Outcome) + Send + 'a) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub async fn run<T, F>(self, op: F) -> Finished<T>
    where
        F: FnOnce(&VaultView<'_>) -> Result<T>,
    {
        let span = info_span!("vault_txn", kind = "read", user = self.username);
        self.execute(op).instrument(span).await
    }

    async fn execute<T, F>(self, op: F) -> Finished<T>
    where
        F: FnOnce(&VaultView<'_>) -> Result<T>,
    {
        let path = match self.engine.vault_path(self.username) {
            Ok(path) => path,
            Err(e) => return Finished::rejected(e, self.hook),
        };
        let mut session = Session::new(self.engine, path);
        let result = read_body(&mut session, self.username, self.password, op).await;
        let (outcome, failure) = session.finish(result.is_ok(), self.hook);
        Finished::settle(outcome, result, failure)
    }
}

async fn read_body<T, F>(
    session: &mut Session<'_>,
    username: &str,
    password: &[u8],
    op: F,
) -> Result<T>
where
    F: FnOnce(&VaultView<'_>) -> Result<T>,
{
    let engine = session.engine;
    session.lock(LockMode::Shared).await?;
    let mut record = session.authenticate(password)?;
    let file = session.readable()?;
    record.load_payload(file)?;
    let last_modified = file.mtime()?;
    policy::enforce(
        engine.policy(),
        Action::Read,
        username,
        record.payload().unwrap_or_default(),
    )?;
    op(&VaultView {
        username,
        record: &record,
        last_modified,
    })
}

// ---------------------------------------------------------------------------
// Write
// ---------------------------------------------------------------------------

/// Authenticated replacement of an existing vault.
#[must_use = "a transaction does nothing until `run` is awaited"]
pub struct WriteTxn<'a> {
    engine: &'a VaultEngine,
    username: &'a str,
    password: &'a [u8],
    conditions: Conditions,
    locking: WriteLocking,
    hook: Option<ResponseHook<'a>>,
}

impl<'a> WriteTxn<'a> {
    pub(super) fn new(engine: &'a VaultEngine, username: &'a str, password: &'a [u8]) -> Self {
        Self {
            engine,
            username,
            password,
            conditions: Conditions::none(),
            locking: WriteLocking::default(),
            hook: None,
        }
    }

    /// Preconditions checked against the current record's mtime.
    pub fn conditions(mut self, conditions: Conditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn locking(mut self, locking: WriteLocking) -> Self {
        self.locking = locking;
        self
    }

    pub fn on_response(mut self, hook: impl FnOnce(Outcome) + Send + 'a) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    pub async fn run<T, F>(self, op: F) -> Finished<T>
    where
        F: FnOnce(&mut WriteContext<'_>) -> Result<T>,
    {
        let span = info_span!("vault_txn", kind = "write", user = self.username);
        self.execute(op).instrument(span).await
    }

    async fn execute<T, F>(self, op: F) -> Finished<T>
    where
        F: FnOnce(&mut WriteContext<'_>) -> Result<T>,
    {
        let path = match self.engine.vault_path(self.username) {
            Ok(path) => path,
            Err(e) => return Finished::rejected(e, self.hook),
        };
        let mut session = Session::new(self.engine, path);
        let mut completed = false;
        let result = write_body(
            &mut session,
            self.username,
            self.password,
            &self.conditions,
            self.locking,
            op,
            &mut completed,
        )
        .await;
        let result = reconcile(result, completed);
        let (outcome, failure) = session.finish(completed, self.hook);
        Finished::settle(outcome, result, failure)
    }
}

async fn write_body<T, F>(
    session: &mut Session<'_>,
    username: &str,
    password: &[u8],
    conditions: &Conditions,
    locking: WriteLocking,
    op: F,
    completed: &mut bool,
) -> Result<T>
where
    F: FnOnce(&mut WriteContext<'_>) -> Result<T>,
{
    let engine = session.engine;
    let mode = match locking {
        WriteLocking::Exclusive => LockMode::Exclusive,
        WriteLocking::UpgradeFromShared => LockMode::Shared,
    };
    session.lock(mode).await?;
    if locking == WriteLocking::Exclusive {
        session.claim().await?;
    }
    let mut record = session.authenticate(password)?;

    if locking == WriteLocking::UpgradeFromShared {
        let upgraded = session.upgrade().await?;
        session.claim().await?;
        // Someone else may have written in between.
        if upgraded == UpgradePath::Queued || session.replaced_since_open()? {
            debug!(?upgraded, "vault may have changed during upgrade; authenticating again");
            session.reopen_readable()?;
            record = session.authenticate(password)?;
        }
    }

    let readable = session.readable()?;
    let last_modified = readable.mtime()?;
    let failed = conditions.check(last_modified);
    if !failed.is_empty() {
        debug!(?failed, "precondition failed");
        return Err(VaultError::Precondition(failed));
    }
    record.load_payload(readable)?;

    let staging = session.open_staging()?;
    let mut ctx = WriteContext::new(
        username,
        &mut record,
        staging,
        engine.policy(),
        Action::Update,
        Some(last_modified),
    );
    let result = op(&mut ctx);
    *completed = ctx.is_complete(result.is_ok());
    result
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

/// Creation of a vault for a username that has none.
#[must_use = "a transaction does nothing until `run` is awaited"]
pub struct CreateTxn<'a> {
    engine: &'a VaultEngine,
    username: &'a str,
    payload: &'a [u8],
    hook: Option<ResponseHook<'a>>,
}

impl<'a> CreateTxn<'a> {
    pub(super) fn new(engine: &'a VaultEngine, username: &'a str, payload: &'a [u8]) -> Self {
        Self {
            engine,
            username,
            payload,
            hook: None,
        }
    }

    pub fn on_response(mut self, hook: impl FnOnce(Outcome) + Send + 'a) -> Self {
        self.hook = Some(Box::new(hook));
        self
    }

    /// Run `op` against a fresh record that already carries the initial
    /// payload. `op` must at least set a password and encode.
    pub async fn run<T, F>(self, op: F) -> Finished<T>
    where
        F: FnOnce(&mut WriteContext<'_>) -> Result<T>,
    {
        let span = info_span!("vault_txn", kind = "create", user = self.username);
        self.execute(op).instrument(span).await
    }

    async fn execute<T, F>(self, op: F) -> Finished<T>
    where
        F: FnOnce(&mut WriteContext<'_>) -> Result<T>,
    {
        let path = match self.engine.vault_path(self.username) {
            Ok(path) => path,
            Err(e) => return Finished::rejected(e, self.hook),
        };
        let mut session = Session::new(self.engine, path);
        let mut completed = false;
        let result = create_body(&mut session, self.username, self.payload, op, &mut completed).await;
        let result = reconcile(result, completed);
        let (outcome, failure) = session.finish(completed, self.hook);
        Finished::settle(outcome, result, failure)
    }
}

async fn create_body<T, F>(
    session: &mut Session<'_>,
    username: &str,
    payload: &[u8],
    op: F,
    completed: &mut bool,
) -> Result<T>
where
    F: FnOnce(&mut WriteContext<'_>) -> Result<T>,
{
    let engine = session.engine;
    session.lock(LockMode::Exclusive).await?;
    session.claim().await?;
    if engine.source().exists(&session.path) {
        return Err(VaultError::UsernameTaken);
    }
    policy::enforce(engine.policy(), Action::Create, username, payload)?;

    let file = session.open_in_place()?;
    let mut record = VaultRecord::new();
    record.set_payload(payload.to_vec());
    let mut ctx = WriteContext::new(
        username,
        &mut record,
        file,
        engine.policy(),
        Action::Create,
        None,
    );
    let result = op(&mut ctx);
    *completed = ctx.is_complete(result.is_ok());
    result
}
