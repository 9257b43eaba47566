//! Integration tests for the push path via `kn event submit`.

mod common;

use common::TestEnv;
use predicates::prelude::*;

fn completed_event(task_id: &str, event_id: &str) -> String {
    format!(
        r#"{{"event_type":"task.completed","event_id":"{}","schema_version":"1.0","task_id":"{}","occurred_at":"2026-01-14T09:00:00Z"}}"#,
        event_id, task_id
    )
}

#[test]
fn test_completed_event_advances_recurrence_once() {
    let env = TestEnv::init();

    let id = env.add_task(&[
        "Standup",
        "--due",
        "2026-01-15T09:00:00Z",
        "--every",
        "weekly:mon,wed",
    ]);

    let payload = completed_event(&id, "E1");
    env.kn()
        .args(["event", "submit", &payload])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"applied\":true"))
        .stdout(predicate::str::contains("\"occurrence_id\""));

    // Redelivery of the same event id: suppressed, no second occurrence.
    env.kn()
        .args(["event", "submit", &payload])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"applied\":false"))
        .stdout(predicate::str::contains("occurrence_id").not());

    // Exactly one open occurrence, due the following Monday.
    env.kn()
        .args(["task", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2026-01-19T09:00:00Z"));
}

#[test]
fn test_malformed_event_rejected() {
    let env = TestEnv::init();

    env.kn()
        .args(["event", "submit", r#"{"event_type":"task.archived"}"#])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid event"));
}

#[test]
fn test_wrong_schema_version_rejected() {
    let env = TestEnv::init();

    let id = env.add_task(&["Solo", "--due", "2099-01-01T10:00:00Z"]);
    let payload = format!(
        r#"{{"event_type":"task.completed","event_id":"E9","schema_version":"9.9","task_id":"{}","occurred_at":"2026-01-14T09:00:00Z"}}"#,
        id
    );

    env.kn()
        .args(["event", "submit", &payload])
        .assert()
        .failure()
        .stderr(predicate::str::contains("schema version"));
}

#[test]
fn test_event_for_missing_task_fails_and_can_retry() {
    let env = TestEnv::init();

    let payload = completed_event("kn-0000", "E1");
    env.kn()
        .args(["event", "submit", &payload])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"));

    // The ledger key was released; once the task exists, the same event
    // id goes through.
    let id = env.add_task(&["Late arrival", "--due", "2099-01-01T10:00:00Z"]);
    let payload = completed_event(&id, "E1");
    env.kn()
        .args(["event", "submit", &payload])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"applied\":true"));
}

#[test]
fn test_created_event_acknowledged() {
    let env = TestEnv::init();

    let id = env.add_task(&["New one", "--due", "2099-01-01T10:00:00Z"]);
    let payload = format!(
        r#"{{"event_type":"task.created","event_id":"E2","schema_version":"1.0","task_id":"{}","occurred_at":"2026-01-14T09:00:00Z"}}"#,
        id
    );

    env.kn()
        .args(["event", "submit", &payload])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"applied\":true"));
}
