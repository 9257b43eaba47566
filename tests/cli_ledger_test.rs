//! Integration tests for ledger maintenance via the CLI.

mod common;

use common::TestEnv;
use predicates::prelude::*;

#[test]
fn test_sweep_on_fresh_ledger_removes_nothing() {
    let env = TestEnv::init();

    env.kn()
        .args(["ledger", "sweep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\":0"));
}

#[test]
fn test_sweep_keeps_recent_records() {
    let env = TestEnv::init();

    // A tick commits a ledger record for the due reminder.
    env.add_task(&[
        "Renew passport",
        "--remind",
        "2020-01-01T09:00:00Z",
        "--due",
        "2099-01-01T10:00:00Z",
    ]);
    env.kn().args(["agent", "tick"]).assert().success();

    // The record was committed just now, well inside the 90-day
    // retention window, so the sweep leaves it alone and the duplicate
    // suppression still holds.
    env.kn()
        .args(["ledger", "sweep"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"removed\":0"));

    env.kn()
        .args(["agent", "tick"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"duplicates\":1"));
}
