//! Integration tests for the burrow CLI.
//!
//! These run the real binary and check output, exit codes and file system
//! effects. Nothing here needs Docker.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

// -----------------------------------------------------------------------------
// Test helpers
// -----------------------------------------------------------------------------

#[allow(deprecated)]
fn burrow() -> Command {
    Command::cargo_bin("burrow").expect("failed to find burrow binary")
}

fn burrow_in(dir: &TempDir) -> Command {
    let mut cmd = burrow();
    cmd.current_dir(dir.path()).env_remove("RUST_LOG");
    cmd
}

fn write_config(dir: &TempDir, content: &str) {
    fs::write(dir.path().join("burrow.toml"), content).unwrap();
}

// -----------------------------------------------------------------------------
// Help and version
// -----------------------------------------------------------------------------

#[test]
fn test_help_shows_all_commands() {
    burrow()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("init"))
        .stdout(predicate::str::contains("up"))
        .stdout(predicate::str::contains("setup"))
        .stdout(predicate::str::contains("attach"))
        .stdout(predicate::str::contains("proxy"))
        .stdout(predicate::str::contains("sandboxes"));
}

#[test]
fn test_version_shows_version() {
    burrow()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("burrow"));
}

#[test]
fn test_up_help_shows_options() {
    burrow()
        .args(["up", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--sandbox"))
        .stdout(predicate::str::contains("--attach"))
        .stdout(predicate::str::contains("--env"))
        .stdout(predicate::str::contains("--keep"))
        .stdout(predicate::str::contains("--continue-on-error"));
}

#[test]
fn test_attach_requires_sandbox_id() {
    burrow()
        .arg("attach")
        .env_remove("BURROW_SANDBOX")
        .assert()
        .failure()
        .stderr(predicate::str::contains("<ID>"));
}

// -----------------------------------------------------------------------------
// Init
// -----------------------------------------------------------------------------

#[test]
fn test_init_creates_config() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("initialized successfully"));

    let content = fs::read_to_string(dir.path().join("burrow.toml")).unwrap();
    assert!(content.contains("[sandbox]"));
    assert!(content.contains("[bridge]"));
    assert!(content.contains("[setup]"));
}

#[test]
fn test_init_skips_existing_without_force() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "# existing");

    burrow_in(&dir)
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("already exists"))
        .stdout(predicate::str::contains("--force"));

    let content = fs::read_to_string(dir.path().join("burrow.toml")).unwrap();
    assert_eq!(content, "# existing");
}

#[test]
fn test_init_force_overwrites_existing() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "# existing");

    burrow_in(&dir)
        .args(["init", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("overwritten"));

    let content = fs::read_to_string(dir.path().join("burrow.toml")).unwrap();
    assert!(content.contains("[sandbox]"));
}

// -----------------------------------------------------------------------------
// Setup
// -----------------------------------------------------------------------------

#[test]
fn test_setup_without_repositories() {
    let dir = TempDir::new().unwrap();

    burrow_in(&dir)
        .arg("setup")
        .assert()
        .success()
        .stdout(predicate::str::contains("No repositories configured"));
}

#[test]
fn test_setup_streams_output_and_succeeds() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[[repos]]
name = "demo"
path = "."
setup = "echo hello-from-setup"
"#,
    );

    burrow_in(&dir)
        .arg("setup")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello-from-setup"))
        .stdout(predicate::str::contains("All repositories set up"));
}

#[test]
fn test_setup_passes_merged_environment() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[setup.env]
GREETING = "base"
TARGET = "world"

[[repos]]
name = "demo"
path = "."
setup = "echo $GREETING-$TARGET"

[repos.env]
GREETING = "hello"
"#,
    );

    burrow_in(&dir)
        .arg("setup")
        .assert()
        .success()
        .stdout(predicate::str::contains("hello-world"));
}

#[test]
fn test_setup_failure_names_repository() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[[repos]]
name = "broken"
path = "."
setup = "exit 3"

[[repos]]
name = "never"
path = "."
setup = "echo should-not-run"
"#,
    );

    burrow_in(&dir)
        .arg("setup")
        .assert()
        .failure()
        .stdout(predicate::str::contains("should-not-run").not())
        .stdout(predicate::str::contains("not attempted"))
        .stderr(predicate::str::contains("'broken'"))
        .stderr(predicate::str::contains("exited with code 3"));
}

#[test]
fn test_setup_continue_on_error_runs_remaining() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[[repos]]
name = "broken"
path = "."
setup = "exit 3"

[[repos]]
name = "fine"
path = "."
setup = "echo still-ran"
"#,
    );

    burrow_in(&dir)
        .args(["setup", "--continue-on-error"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("still-ran"))
        .stderr(predicate::str::contains("Setup failed for broken"));
}

#[test]
fn test_setup_retries_until_success() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[setup]
attempts = 2
delay_secs = 0

[[repos]]
name = "flaky"
path = "."
setup = "if [ -f marker ]; then echo recovered; else touch marker; exit 1; fi"
"#,
    );

    burrow_in(&dir)
        .arg("setup")
        .assert()
        .success()
        .stdout(predicate::str::contains("retrying as attempt 2"))
        .stdout(predicate::str::contains("recovered"));
}

#[test]
fn test_setup_unknown_repository() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        r#"
[[repos]]
name = "demo"
path = "."
"#,
    );

    burrow_in(&dir)
        .args(["setup", "--repo", "other"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("'other'"));
}

// -----------------------------------------------------------------------------
// Proxy
// -----------------------------------------------------------------------------

#[test]
fn test_proxy_rejects_invalid_url() {
    burrow()
        .args(["proxy", "not a url"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid WebSocket URL"));
}
