//! Integration tests for the gantry binary.
//!
//! These tests drive the CLI end to end against temporary directories.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a gantry Command
fn gantry() -> Command {
    cargo_bin_cmd!("gantry")
}

/// Helper to create a temporary working directory
fn create_temp_dir() -> TempDir {
    TempDir::new().unwrap()
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_gantry_help() {
        gantry().arg("--help").assert().success();
    }

    #[test]
    fn test_gantry_version() {
        gantry().arg("--version").assert().success();
    }

    #[test]
    fn test_serve_help_lists_flags() {
        gantry()
            .arg("serve")
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("--port"))
            .stdout(predicate::str::contains("--db-path"))
            .stdout(predicate::str::contains("--budget-secs"))
            .stdout(predicate::str::contains("--heartbeat-secs"))
            .stdout(predicate::str::contains("--sweep-secs"))
            .stdout(predicate::str::contains("--stale-secs"))
            .stdout(predicate::str::contains("--dev"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        gantry().arg("frobnicate").assert().failure();
    }
}

// =============================================================================
// Database Initialization Tests
// =============================================================================

mod init_db {
    use super::*;

    #[test]
    fn test_init_db_creates_database() {
        let dir = create_temp_dir();
        let db_path = dir.path().join("gantry.db");

        gantry()
            .current_dir(dir.path())
            .arg("init-db")
            .arg("--db-path")
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("initialized"));

        assert!(db_path.exists());
    }

    #[test]
    fn test_init_db_default_path() {
        let dir = create_temp_dir();

        gantry()
            .current_dir(dir.path())
            .arg("init-db")
            .assert()
            .success();

        assert!(dir.path().join(".gantry/gantry.db").exists());
    }

    #[test]
    fn test_init_db_idempotent() {
        let dir = create_temp_dir();
        let db_path = dir.path().join("gantry.db");

        for _ in 0..2 {
            gantry()
                .current_dir(dir.path())
                .arg("init-db")
                .arg("--db-path")
                .arg(&db_path)
                .assert()
                .success();
        }

        assert!(db_path.exists());
    }
}

// =============================================================================
// Configuration Layer Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_serve_rejects_invalid_env_port() {
        let dir = create_temp_dir();

        gantry()
            .current_dir(dir.path())
            .env("GANTRY_PORT", "not-a-port")
            .arg("serve")
            .assert()
            .failure()
            .stderr(predicate::str::contains("GANTRY_PORT"));
    }

    #[test]
    fn test_serve_rejects_malformed_config_file() {
        let dir = create_temp_dir();
        fs::write(dir.path().join("gantry.toml"), "[server]\nport = \"nope\"").unwrap();

        gantry()
            .current_dir(dir.path())
            .arg("serve")
            .assert()
            .failure()
            .stderr(predicate::str::contains("gantry.toml"));
    }
}
