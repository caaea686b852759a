//! Integration tests for vault transactions over the in-memory file source.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use passvault::conditions::{format_http_date, ConditionalHeader, Conditions};
use passvault::errors::VaultError;
use passvault::lock::LockState;
use passvault::policy::{DenyPolicy, LimitPolicy};
use passvault::storage::{FileSource, MemorySource};
use passvault::vault::{lock_file_path, staging_path, Outcome, VaultEngine, WriteLocking};

const PASSWORD: &[u8] = b"correct horse battery";

/// Helper: an engine over a fresh in-memory source rooted at `/vaults`.
fn memory_engine() -> (MemorySource, VaultEngine) {
    let fs = MemorySource::new();
    let engine = VaultEngine::new(Arc::new(fs.clone()), "/vaults");
    (fs, engine)
}

fn live(user: &str) -> PathBuf {
    Path::new("/vaults").join(user)
}

async fn created(user: &str, payload: &[u8]) -> (MemorySource, VaultEngine) {
    let (fs, engine) = memory_engine();
    engine
        .create_vault(user, PASSWORD, payload)
        .await
        .expect("create vault");
    (fs, engine)
}

// ---------------------------------------------------------------------------
// Create and read
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_then_read_returns_payload() {
    let (fs, engine) = created("alice", b"ciphertext").await;

    let snapshot = engine.read_vault("alice", PASSWORD).await.unwrap();
    assert_eq!(snapshot.payload, b"ciphertext");
    assert_eq!(snapshot.last_modified, fs.mtime(&live("alice")).unwrap());
    assert_eq!(fs.paths(), vec![live("alice")]);
    assert_eq!(engine.locks().held_keys(), 0);
}

#[tokio::test]
async fn creating_an_existing_user_is_rejected() {
    let (fs, engine) = created("alice", b"first").await;
    let before = fs.contents(&live("alice")).unwrap();

    let err = engine
        .create_vault("alice", b"another password", b"second")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::UsernameTaken));
    assert_eq!(err.code(), "E_USER");
    assert_eq!(fs.contents(&live("alice")).unwrap(), before);
}

#[tokio::test]
async fn wrong_password_and_missing_user_look_the_same() {
    let (_fs, engine) = created("alice", b"x").await;

    let wrong = engine.read_vault("alice", b"nope").await.unwrap_err();
    let missing = engine.read_vault("bob", PASSWORD).await.unwrap_err();
    assert!(matches!(wrong, VaultError::Auth));
    assert!(matches!(missing, VaultError::Auth));
    assert_eq!(wrong.to_string(), missing.to_string());
}

#[tokio::test]
async fn invalid_username_never_reaches_storage() {
    let (fs, engine) = memory_engine();
    let err = engine
        .create_vault("../etc/passwd", PASSWORD, b"")
        .await
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidUsername(_)));
    assert!(fs.paths().is_empty());
}

#[tokio::test]
async fn failed_create_removes_partial_file() {
    let (fs, engine) = memory_engine();
    let finished = engine
        .create("alice", b"payload")
        .run(|_ctx| -> passvault::errors::Result<()> {
            Err(VaultError::CommandFailed("client went away".into()))
        })
        .await;

    assert_eq!(finished.outcome, Outcome::RolledBack);
    assert!(matches!(finished.result, Err(VaultError::CommandFailed(_))));
    assert!(!fs.exists(&live("alice")));
}

// ---------------------------------------------------------------------------
// Write commit / rollback
// ---------------------------------------------------------------------------

#[tokio::test]
async fn update_commits_through_staging_file() {
    let (fs, engine) = created("alice", b"old").await;

    engine
        .update_payload("alice", PASSWORD, b"new".to_vec(), Conditions::none())
        .await
        .unwrap();

    assert_eq!(engine.read_vault("alice", PASSWORD).await.unwrap().payload, b"new");
    assert!(!fs.exists(&staging_path(&live("alice"))));
}

#[tokio::test]
async fn leftover_staging_file_is_replaced() {
    let (fs, engine) = created("alice", b"old").await;
    fs.insert(staging_path(&live("alice")), b"half-written garbage from a crash".to_vec());

    engine
        .update_payload("alice", PASSWORD, b"new".to_vec(), Conditions::none())
        .await
        .unwrap();

    assert_eq!(engine.read_vault("alice", PASSWORD).await.unwrap().payload, b"new");
    assert_eq!(fs.paths(), vec![live("alice")]);
}

#[tokio::test]
async fn claimed_vault_holds_off_writers_until_released() {
    let (fs, engine) = created("alice", b"old").await;
    let claim = fs
        .try_lock(&lock_file_path(&live("alice")))
        .unwrap()
        .expect("nobody else holds the claim");

    let attempt = tokio::time::timeout(
        Duration::from_millis(200),
        engine.update_payload("alice", PASSWORD, b"blocked".to_vec(), Conditions::none()),
    )
    .await;
    assert!(attempt.is_err(), "write should wait for the claim");
    assert_eq!(engine.read_vault("alice", PASSWORD).await.unwrap().payload, b"old");

    drop(claim);
    engine
        .update_payload("alice", PASSWORD, b"released".to_vec(), Conditions::none())
        .await
        .unwrap();
    assert_eq!(engine.read_vault("alice", PASSWORD).await.unwrap().payload, b"released");
}

#[tokio::test]
async fn reserved_trailing_bytes_survive_updates() {
    let (fs, engine) = created("alice", b"old").await;
    let mut bytes = fs.contents(&live("alice")).unwrap();
    bytes.extend_from_slice(b"reserved");
    fs.insert(live("alice"), bytes);

    engine
        .update_payload("alice", PASSWORD, b"new".to_vec(), Conditions::none())
        .await
        .unwrap();

    let bytes = fs.contents(&live("alice")).unwrap();
    assert!(bytes.ends_with(b"reserved"));
    assert_eq!(&bytes[bytes.len() - 15..bytes.len() - 8], b"\x03\0\0\0new");
}

#[tokio::test]
async fn closure_error_before_completion_rolls_back() {
    let (fs, engine) = created("alice", b"old").await;
    let before = fs.contents(&live("alice")).unwrap();

    let finished = engine
        .write("alice", PASSWORD)
        .run(|ctx| {
            ctx.set_payload(b"half".to_vec())?;
            ctx.encode()?;
            Err::<(), _>(VaultError::CommandFailed("client went away".into()))
        })
        .await;

    assert_eq!(finished.outcome, Outcome::RolledBack);
    assert!(finished.result.is_err());
    assert_eq!(fs.contents(&live("alice")).unwrap(), before);
    assert!(!fs.exists(&staging_path(&live("alice"))));
}

#[tokio::test]
async fn closure_error_after_completion_still_commits() {
    let (_fs, engine) = created("alice", b"old").await;

    let finished = engine
        .write("alice", PASSWORD)
        .run(|ctx| {
            ctx.set_payload(b"kept".to_vec())?;
            ctx.encode()?;
            ctx.mark_completed()?;
            Err::<(), _>(VaultError::CommandFailed("response failed".into()))
        })
        .await;

    assert_eq!(finished.outcome, Outcome::Committed);
    assert!(matches!(finished.result, Err(VaultError::CommandFailed(_))));
    assert_eq!(engine.read_vault("alice", PASSWORD).await.unwrap().payload, b"kept");
}

#[tokio::test]
async fn ok_without_encoding_is_an_incomplete_rollback() {
    let (fs, engine) = created("alice", b"old").await;

    let finished = engine
        .write("alice", PASSWORD)
        .run(|ctx| ctx.set_payload(b"never written".to_vec()))
        .await;

    assert_eq!(finished.outcome, Outcome::RolledBack);
    let err = finished.into_result().unwrap_err();
    assert!(matches!(err, VaultError::Incomplete));
    assert_eq!(err.status(), 500);
    assert_eq!(err.code(), "E_UNKNOWN");
    assert!(!fs.exists(&staging_path(&live("alice"))));
}

#[tokio::test]
async fn encoding_twice_is_refused() {
    let (_fs, engine) = created("alice", b"old").await;

    let finished = engine
        .write("alice", PASSWORD)
        .run(|ctx| {
            ctx.encode()?;
            ctx.set_payload(b"late".to_vec())
        })
        .await;

    // The closure's own error means nothing was completed.
    assert!(matches!(finished.result, Err(VaultError::AlreadyEncoded)));
    assert_eq!(finished.outcome, Outcome::RolledBack);
    assert_eq!(engine.read_vault("alice", PASSWORD).await.unwrap().payload, b"old");
}

#[tokio::test]
async fn short_write_to_staging_rolls_back() {
    let (fs, engine) = created("alice", b"old").await;
    let before = fs.contents(&live("alice")).unwrap();
    fs.set_capacity(Some(16));

    let err = engine
        .update_payload("alice", PASSWORD, vec![7; 64], Conditions::none())
        .await
        .unwrap_err();

    assert!(matches!(err, VaultError::ShortIo { .. }));
    assert!(!err.is_client_error());
    assert_eq!(fs.contents(&live("alice")).unwrap(), before);
    assert!(!fs.exists(&staging_path(&live("alice"))));
}

#[tokio::test]
async fn upgrade_locking_writes_like_exclusive() {
    let (_fs, engine) = created("alice", b"old").await;

    let finished = engine
        .write("alice", PASSWORD)
        .locking(WriteLocking::UpgradeFromShared)
        .run(|ctx| {
            ctx.set_payload(b"upgraded".to_vec())?;
            ctx.encode()
        })
        .await;

    assert!(finished.is_committed());
    assert_eq!(
        engine.read_vault("alice", PASSWORD).await.unwrap().payload,
        b"upgraded"
    );
}

#[tokio::test]
async fn upgrading_write_rechecks_a_vault_replaced_while_claimed() {
    let (fs, engine) = created("alice", b"old").await;
    let engine = Arc::new(engine);

    // The same user as written by another process under another password.
    let (other_fs, other) = memory_engine();
    other
        .create_vault("alice", b"someone else's password", b"theirs")
        .await
        .unwrap();
    let theirs = other_fs.contents(&live("alice")).unwrap();

    let claim = fs.try_lock(&lock_file_path(&live("alice"))).unwrap().unwrap();
    let writer = tokio::spawn({
        let engine = Arc::clone(&engine);
        async move {
            engine
                .write("alice", PASSWORD)
                .locking(WriteLocking::UpgradeFromShared)
                .run(|ctx| {
                    ctx.set_payload(b"mine".to_vec())?;
                    ctx.encode()
                })
                .await
                .into_result()
        }
    });
    // Upgraded in place, now waiting on the claim.
    while engine.locks().state(&live("alice")) != Some(LockState::Exclusive { waiting: 0 }) {
        tokio::task::yield_now().await;
    }

    fs.insert(live("alice"), theirs.clone());
    fs.set_mtime(&live("alice"), SystemTime::UNIX_EPOCH + Duration::from_secs(1_000_000))
        .unwrap();
    drop(claim);

    assert!(matches!(writer.await.unwrap(), Err(VaultError::Auth)));
    assert_eq!(fs.contents(&live("alice")).unwrap(), theirs);
    assert!(!fs.exists(&staging_path(&live("alice"))));
}

// ---------------------------------------------------------------------------
// Preconditions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stale_if_unmodified_since_fails_without_staging() {
    let (fs, engine) = created("alice", b"old").await;
    let mtime = SystemTime::UNIX_EPOCH + Duration::from_secs(1_660_066_162);
    fs.set_mtime(&live("alice"), mtime).unwrap();

    let stale = Conditions::from_headers([(
        "If-Unmodified-Since",
        "Mon, 08 Aug 2022 17:29:22 GMT",
    )])
    .unwrap();
    let called = AtomicBool::new(false);
    let finished = engine
        .write("alice", PASSWORD)
        .conditions(stale)
        .run(|ctx| {
            called.store(true, Ordering::SeqCst);
            ctx.encode()
        })
        .await;

    let err = finished.into_result().unwrap_err();
    assert!(matches!(
        err,
        VaultError::Precondition(ref failed) if failed == &[ConditionalHeader::IfUnmodifiedSince]
    ));
    assert_eq!(err.status(), 412);
    assert!(!called.load(Ordering::SeqCst));
    assert_eq!(fs.paths(), vec![live("alice")]);
}

#[tokio::test]
async fn matching_if_unmodified_since_allows_the_write() {
    let (fs, engine) = created("alice", b"old").await;
    let last_modified = engine.read_vault("alice", PASSWORD).await.unwrap().last_modified;

    let header = format_http_date(last_modified);
    let conditions = Conditions::from_headers([("if-unmodified-since", header.as_str())]).unwrap();
    engine
        .update_payload("alice", PASSWORD, b"new".to_vec(), conditions)
        .await
        .unwrap();

    assert!(fs.contents(&live("alice")).unwrap().ends_with(b"new"));
}

// ---------------------------------------------------------------------------
// Password rotation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn change_password_rotates_credentials() {
    let (_fs, engine) = created("alice", b"sealed under old").await;

    engine
        .change_password(
            "alice",
            PASSWORD,
            b"new password!",
            Some(b"sealed under new".to_vec()),
        )
        .await
        .unwrap();

    assert!(matches!(
        engine.read_vault("alice", PASSWORD).await,
        Err(VaultError::Auth)
    ));
    let snapshot = engine.read_vault("alice", b"new password!").await.unwrap();
    assert_eq!(snapshot.payload, b"sealed under new");
}

// ---------------------------------------------------------------------------
// Policy
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deny_policy_blocks_create_before_touching_storage() {
    let fs = MemorySource::new();
    let engine = VaultEngine::new(Arc::new(fs.clone()), "/vaults").with_policy(Arc::new(DenyPolicy));

    let err = engine.create_vault("alice", PASSWORD, b"x").await.unwrap_err();
    assert!(matches!(
        err,
        VaultError::PolicyRejected {
            action: "createAccount"
        }
    ));
    assert!(fs.paths().is_empty());
}

#[tokio::test]
async fn payload_limit_blocks_oversized_update() {
    let fs = MemorySource::new();
    let engine = VaultEngine::new(Arc::new(fs.clone()), "/vaults")
        .with_policy(Arc::new(LimitPolicy { max_payload_bytes: 8 }));
    engine.create_vault("alice", PASSWORD, b"small").await.unwrap();

    let err = engine
        .update_payload("alice", PASSWORD, vec![0; 9], Conditions::none())
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        VaultError::PolicyRejected {
            action: "updateAccount"
        }
    ));
    assert_eq!(engine.read_vault("alice", PASSWORD).await.unwrap().payload, b"small");
}

// ---------------------------------------------------------------------------
// Response hook
// ---------------------------------------------------------------------------

#[tokio::test]
async fn response_hook_runs_after_commit_and_before_unlock() {
    let (fs, engine) = created("alice", b"old").await;
    let path = live("alice");
    let seen = Mutex::new(None);

    let finished = engine
        .write("alice", PASSWORD)
        .on_response(|outcome| {
            let locked = engine.locks().is_locked(&path);
            let staged = fs.exists(&staging_path(&path));
            *seen.lock().unwrap() = Some((outcome, locked, staged));
        })
        .run(|ctx| {
            ctx.set_payload(b"new".to_vec())?;
            ctx.encode()
        })
        .await;

    assert!(finished.is_committed());
    assert_eq!(
        seen.lock().unwrap().take(),
        Some((Outcome::Committed, true, false))
    );
    assert!(!engine.locks().is_locked(&path));
}

#[tokio::test]
async fn response_hook_sees_rejections() {
    let (_fs, engine) = created("alice", b"old").await;
    let seen = Mutex::new(Vec::new());

    let finished = engine
        .read("alice", b"wrong")
        .on_response(|outcome| seen.lock().unwrap().push(outcome))
        .run(|view| Ok(view.payload().to_vec()))
        .await;

    assert!(matches!(finished.result, Err(VaultError::Auth)));
    assert_eq!(*seen.lock().unwrap(), vec![Outcome::RolledBack]);
}
