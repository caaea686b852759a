//! Integration tests for the PassVault CLI.
//!
//! These tests exercise the binary end-to-end using `assert_cmd`.
//! Passwords are supplied through `PASSVAULT_PASSWORD` and
//! `PASSVAULT_NEW_PASSWORD` so no prompt ever appears.

use assert_cmd::Command;
use assert_fs::prelude::*;
use assert_fs::TempDir;
use predicates::prelude::*;

const PASSWORD: &str = "correct horse battery";

/// Helper: get a Command pointing at the passvault binary, configured
/// from `dir`.
fn passvault(dir: &TempDir) -> Command {
    #[allow(deprecated)]
    let mut cmd = Command::cargo_bin("passvault").expect("binary should exist");
    cmd.arg("--config")
        .arg(dir.path())
        .env_remove("RUST_LOG")
        .env_remove("PASSVAULT_NEW_PASSWORD")
        .env("PASSVAULT_PASSWORD", PASSWORD);
    cmd
}

/// Helper: create `user` with the payload `hello`.
fn create_user(dir: &TempDir, user: &str) {
    let data = dir.child("payload.bin");
    data.write_binary(b"hello").unwrap();
    passvault(dir)
        .args(["create", user, "--data"])
        .arg(data.path())
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "Created vault for '{user}' (5 byte payload)"
        )));
}

#[test]
fn help_flag_shows_usage() {
    #[allow(deprecated)]
    Command::cargo_bin("passvault")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Per-user password vault storage"))
        .stdout(predicate::str::contains("create"))
        .stdout(predicate::str::contains("read"))
        .stdout(predicate::str::contains("write"))
        .stdout(predicate::str::contains("passwd"))
        .stdout(predicate::str::contains("info"));
}

#[test]
fn version_flag_shows_version() {
    #[allow(deprecated)]
    Command::cargo_bin("passvault")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("passvault"));
}

#[test]
fn no_args_shows_help() {
    #[allow(deprecated)]
    Command::cargo_bin("passvault")
        .unwrap()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage"));
}

#[test]
fn create_then_read_prints_hex_payload() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");

    tmp.child("server-data/alice").assert(predicate::path::is_file());

    passvault(&tmp)
        .args(["read", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("68656c6c6f"))
        .stdout(predicate::str::contains("Last-Modified:"))
        .stdout(predicate::str::contains("GMT"));
}

#[test]
fn read_with_output_writes_raw_payload() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");
    let out = tmp.child("out.bin");

    passvault(&tmp)
        .args(["read", "alice", "--output"])
        .arg(out.path())
        .assert()
        .success();

    out.assert(predicate::path::eq_file(tmp.child("payload.bin").path()));
}

#[test]
fn wrong_password_is_rejected() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");

    passvault(&tmp)
        .env("PASSVAULT_PASSWORD", "not the password")
        .args(["read", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("username or password is incorrect"));
}

#[test]
fn unknown_user_gets_the_same_error() {
    let tmp = TempDir::new().unwrap();

    passvault(&tmp)
        .args(["read", "nobody"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("username or password is incorrect"));
}

#[test]
fn duplicate_create_fails() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");

    passvault(&tmp)
        .args(["create", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("username already taken"));
}

#[test]
fn invalid_username_is_rejected() {
    let tmp = TempDir::new().unwrap();

    passvault(&tmp)
        .args(["create", ".hidden"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid username"));
}

#[test]
fn short_new_password_is_rejected() {
    let tmp = TempDir::new().unwrap();

    passvault(&tmp)
        .env("PASSVAULT_PASSWORD", "short")
        .args(["create", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least 8"));
}

#[test]
fn write_replaces_payload() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");
    let data = tmp.child("new.hex");
    data.write_str("c0ffee\n").unwrap();

    passvault(&tmp)
        .args(["write", "alice", "--hex", "--data"])
        .arg(data.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Updated vault for 'alice' (3 byte payload)"));

    passvault(&tmp)
        .args(["read", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("c0ffee"));
    tmp.child("server-data/alice new")
        .assert(predicate::path::missing());
}

#[test]
fn write_with_upgrade_replaces_payload() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");
    let data = tmp.child("new.bin");
    data.write_binary(b"\x01\x02").unwrap();

    passvault(&tmp)
        .args(["write", "alice", "--upgrade", "--data"])
        .arg(data.path())
        .assert()
        .success();

    passvault(&tmp)
        .args(["read", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0102"));
}

#[test]
fn stale_precondition_blocks_write() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");
    let data = tmp.child("new.bin");
    data.write_binary(b"overwrite").unwrap();

    passvault(&tmp)
        .args([
            "write",
            "alice",
            "--if-unmodified-since",
            "Mon, 01 Jan 2001 00:00:00 GMT",
            "--data",
        ])
        .arg(data.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "precondition failed: if-unmodified-since",
        ));

    passvault(&tmp)
        .args(["read", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("68656c6c6f"));
}

#[test]
fn malformed_date_is_rejected() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");
    let data = tmp.child("new.bin");
    data.write_binary(b"x").unwrap();

    passvault(&tmp)
        .args(["write", "alice", "--if-modified-since", "yesterday", "--data"])
        .arg(data.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains(
            "invalid conditional header: if-modified-since",
        ));
}

#[test]
fn passwd_switches_credentials() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");

    passvault(&tmp)
        .env("PASSVAULT_NEW_PASSWORD", "a brand new password")
        .args(["passwd", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Password changed for 'alice'"));

    passvault(&tmp)
        .args(["read", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("username or password is incorrect"));

    passvault(&tmp)
        .env("PASSVAULT_PASSWORD", "a brand new password")
        .args(["read", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("68656c6c6f"));
}

#[test]
fn info_shows_details_table() {
    let tmp = TempDir::new().unwrap();
    create_user(&tmp, "alice");

    passvault(&tmp)
        .args(["info", "alice"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Payload bytes"))
        .stdout(predicate::str::contains("Last-Modified"));
}

#[test]
fn config_file_moves_data_dir() {
    let tmp = TempDir::new().unwrap();
    tmp.child("passvault.toml")
        .write_str("data_dir = \"vaults\"\n")
        .unwrap();
    create_user(&tmp, "alice");

    tmp.child("vaults/alice").assert(predicate::path::is_file());
    tmp.child("server-data").assert(predicate::path::missing());
}

#[test]
fn deny_policy_blocks_create() {
    let tmp = TempDir::new().unwrap();
    tmp.child("passvault.toml")
        .write_str("policy = \"deny\"\n")
        .unwrap();

    passvault(&tmp)
        .args(["create", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("blocked by server policy"));
    tmp.child("server-data/alice")
        .assert(predicate::path::missing());
}

#[test]
fn broken_config_file_is_reported() {
    let tmp = TempDir::new().unwrap();
    tmp.child("passvault.toml")
        .write_str("data_dir = [unterminated\n")
        .unwrap();

    passvault(&tmp)
        .args(["read", "alice"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Config file error"));
}
