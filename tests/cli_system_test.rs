//! Integration tests for system commands via the CLI.

mod common;

use common::TestEnv;
use predicates::prelude::*;

#[test]
fn test_init_creates_storage() {
    let env = TestEnv::new();

    env.kn()
        .args(["system", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"initialized\":true"));

    assert!(env.data_path().join("knell.db").exists());
}

#[test]
fn test_init_human_readable() {
    let env = TestEnv::new();

    env.kn()
        .args(["system", "init", "-H"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Initialized knell"));
}

#[test]
fn test_init_already_initialized() {
    let env = TestEnv::init();

    env.kn()
        .args(["system", "init"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"initialized\":false"));
}

#[test]
fn test_commands_require_init() {
    let env = TestEnv::new();

    env.kn()
        .args(["task", "list"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Not initialized"));
}
