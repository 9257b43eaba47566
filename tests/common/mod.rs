//! Common test utilities for knell integration tests.
//!
//! Provides `TestEnv` for isolated test environments that don't pollute
//! the user's `~/.local/share/knell/` directory.

#![allow(dead_code)]

use assert_cmd::Command;
pub use tempfile::TempDir;

/// A test environment with an isolated data directory.
///
/// The `kn()` method returns a `Command` that sets `KN_DATA_DIR`
/// per-invocation, making tests parallel-safe.
pub struct TestEnv {
    pub data_dir: TempDir,
}

impl TestEnv {
    /// Create a new test environment with an isolated directory.
    pub fn new() -> Self {
        Self {
            data_dir: TempDir::new().unwrap(),
        }
    }

    /// Create a new test environment and initialize knell.
    pub fn init() -> Self {
        let env = Self::new();
        env.kn().args(["system", "init"]).assert().success();
        env
    }

    /// Get a Command for the kn binary with isolated data directory.
    pub fn kn(&self) -> Command {
        let mut cmd = Command::new(env!("CARGO_BIN_EXE_kn"));
        cmd.env("KN_DATA_DIR", self.data_dir.path());
        cmd
    }

    /// Get the path to the data directory.
    pub fn data_path(&self) -> &std::path::Path {
        self.data_dir.path()
    }

    /// Extract a task ID from `kn task add` JSON output.
    pub fn add_task(&self, args: &[&str]) -> String {
        let output = self.kn().args(["task", "add"]).args(args).output().unwrap();
        assert!(
            output.status.success(),
            "task add failed: {}",
            String::from_utf8_lossy(&output.stderr)
        );
        let json: serde_json::Value =
            serde_json::from_slice(&output.stdout).expect("task add emits JSON");
        json["id"].as_str().expect("task has an id").to_string()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
