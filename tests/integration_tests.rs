//! Integration tests for the roundtable CLI.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a roundtable Command with a clean provider environment
fn roundtable() -> Command {
    let mut cmd = cargo_bin_cmd!("roundtable");
    for var in [
        "ACTIVE_LLM_CONFIG",
        "ROUNDTABLE_DB_PATH",
        "ROUNDTABLE_PORT",
        "ROUNDTABLE_LOG",
        "OPENAI_API_KEY",
        "AZURE_OPENAI_API_KEY",
        "AZURE_OPENAI_ENDPOINT",
        "KAMIWAZA_HOST",
        "KAMIWAZA_PORT",
        "KAMIWAZA_MODEL",
        "KAMIWAZA_API_URI",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_roundtable_help() {
        roundtable()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("serve"))
            .stdout(predicate::str::contains("init-db"));
    }

    #[test]
    fn test_roundtable_version() {
        roundtable()
            .arg("--version")
            .assert()
            .success()
            .stdout(predicate::str::contains("roundtable"));
    }

    #[test]
    fn test_unknown_subcommand_fails() {
        roundtable().arg("moderate").assert().failure();
    }

    #[test]
    fn test_serve_help_lists_flags() {
        roundtable()
            .args(["serve", "--help"])
            .assert()
            .success()
            .stdout(predicate::str::contains("--port"))
            .stdout(predicate::str::contains("--db-path"))
            .stdout(predicate::str::contains("--dev"));
    }
}

// =============================================================================
// Database Tests
// =============================================================================

mod database {
    use super::*;

    #[test]
    fn test_init_db_creates_file() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("data").join("roundtable.db");

        roundtable()
            .current_dir(dir.path())
            .arg("init-db")
            .arg("--db-path")
            .arg(&db_path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Database initialized"));

        assert!(db_path.exists());
    }

    #[test]
    fn test_init_db_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("roundtable.db");

        for _ in 0..2 {
            roundtable()
                .current_dir(dir.path())
                .args(["init-db", "--db-path"])
                .arg(&db_path)
                .assert()
                .success();
        }
    }

    #[test]
    fn test_init_db_uses_env_path() {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("from-env.db");

        roundtable()
            .current_dir(dir.path())
            .env("ROUNDTABLE_DB_PATH", &db_path)
            .arg("init-db")
            .assert()
            .success();

        assert!(db_path.exists());
    }
}

// =============================================================================
// Configuration Tests
// =============================================================================

mod configuration {
    use super::*;

    #[test]
    fn test_config_init_creates_file() {
        let dir = TempDir::new().unwrap();

        roundtable()
            .current_dir(dir.path())
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created"));

        let content = fs::read_to_string(dir.path().join("roundtable.toml")).unwrap();
        assert!(content.contains("[server]"));
        assert!(content.contains("[llm]"));
    }

    #[test]
    fn test_config_show_defaults() {
        let dir = TempDir::new().unwrap();

        roundtable()
            .current_dir(dir.path())
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("using defaults"))
            .stdout(predicate::str::contains("provider = \"echo\""))
            .stdout(predicate::str::contains("port = 8000"));
    }

    #[test]
    fn test_config_show_reads_custom_path_and_masks_key() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("custom.toml");
        fs::write(
            &path,
            "[server]\nport = 9100\n\n[llm]\nprovider = \"openai\"\napi_key = \"sk-test-abcdef9876\"\n",
        )
        .unwrap();

        roundtable()
            .current_dir(dir.path())
            .arg("--config")
            .arg(&path)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("port = 9100"))
            .stdout(predicate::str::contains("****9876"))
            .stdout(predicate::str::contains("sk-test").not());
    }

    #[test]
    fn test_config_env_selects_provider() {
        let dir = TempDir::new().unwrap();

        roundtable()
            .current_dir(dir.path())
            .env("ACTIVE_LLM_CONFIG", "local")
            .env("KAMIWAZA_HOST", "10.0.0.5")
            .env("KAMIWAZA_PORT", "8080")
            .env("KAMIWAZA_MODEL", "llama-3")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("provider = \"kamiwaza\""))
            .stdout(predicate::str::contains("http://10.0.0.5:8080/v1"));
    }

    #[test]
    fn test_config_validate_reports_missing_key() {
        let dir = TempDir::new().unwrap();

        roundtable()
            .current_dir(dir.path())
            .env("ACTIVE_LLM_CONFIG", "openai")
            .args(["config", "validate"])
            .assert()
            .failure()
            .stdout(predicate::str::contains("Configuration invalid"));
    }

    #[test]
    fn test_invalid_config_file_fails_serve() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("roundtable.toml"), "[llm]\nprovider = \"nope\"\n").unwrap();

        roundtable()
            .current_dir(dir.path())
            .arg("serve")
            .assert()
            .failure()
            .stderr(predicate::str::contains("roundtable.toml"));
    }
}
