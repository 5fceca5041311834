//! CLI integration tests
//!
//! Run the built binary against an unreachable backend so no Ollama server
//! is needed: hardware probing, listing and configuration errors still work.

use std::io::Write;
use std::process::{Command, Output};
use tempfile::NamedTempFile;

fn localmind() -> Command {
    let mut command = Command::new(env!("CARGO_BIN_EXE_localmind"));
    // Nothing listens on port 9; inventory sync fails fast and is tolerated
    command
        .env("LOCALMIND_OLLAMA_PORT", "9")
        .env("LOCALMIND_OLLAMA_TIMEOUT", "2")
        .env_remove("LOCALMIND_CLOUD_URL")
        .env_remove("RUST_LOG");
    command
}

fn run(args: &[&str]) -> Output {
    localmind()
        .args(args)
        .output()
        .expect("Failed to execute localmind")
}

#[test]
fn test_cli_help() {
    let output = run(&["--help"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["probe", "status", "models", "download", "infer"] {
        assert!(stdout.contains(subcommand), "help lacks {}", subcommand);
    }
}

#[test]
fn test_cli_version() {
    let output = run(&["--version"]);
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains("localmind"));
}

#[test]
fn test_probe_json() {
    let output = run(&["-q", "--format", "json", "probe"]);
    assert!(output.status.success());

    let snapshot: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert!(snapshot["memory_total_gb"].as_f64().unwrap() > 0.0);
    assert!(
        snapshot["memory_available_gb"].as_f64().unwrap()
            <= snapshot["memory_total_gb"].as_f64().unwrap()
    );
    assert!(snapshot["tier"].is_string());
}

#[test]
fn test_models_lists_configured_catalog() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(
        config,
        r#"
[[models]]
id = "tiny"
display_name = "Tiny"
memory_gb = 0.1
tags = ["general"]

[[models]]
id = "huge"
display_name = "Huge"
memory_gb = 4096.0
tags = ["analysis"]
"#
    )
    .unwrap();

    let output = run(&[
        "-q",
        "--format",
        "json",
        "--config",
        config.path().to_str().unwrap(),
        "models",
    ]);
    assert!(output.status.success());

    let models: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    let models = models.as_array().unwrap();
    assert_eq!(models.len(), 2);
    let huge = models.iter().find(|m| m["id"] == "huge").unwrap();
    assert_eq!(huge["recommended"], false);
    assert_eq!(huge["available"], false);
}

#[test]
fn test_status_human() {
    let output = run(&["-q", "status"]);
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("Orchestrator Status"));
    assert!(stdout.contains("Slot:            EMPTY"));
}

#[test]
fn test_invalid_config_exits_with_error() {
    let mut config = NamedTempFile::new().unwrap();
    writeln!(config, "[local_ai]\nmax_concurrent_requests = 0").unwrap();

    let output = run(&["--config", config.path().to_str().unwrap(), "status"]);
    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("max_concurrent_requests"));
}

#[test]
fn test_download_unknown_model_fails() {
    let output = run(&["-q", "--format", "json", "download", "no-such-model"]);
    assert_eq!(output.status.code(), Some(1));

    let response: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["success"], false);
    assert!(response["error"].as_str().unwrap().contains("no-such-model"));
}

#[test]
fn test_infer_without_backend_or_cloud_fails() {
    let output = run(&["-q", "--format", "json", "infer", "--timeout", "5", "hello"]);
    assert_eq!(output.status.code(), Some(1));

    let response: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["success"], false);
    assert!(response["error_kind"].is_string());
}

#[test]
fn test_infer_with_huge_timeout_fails_cleanly() {
    let output = run(&["-q", "--format", "json", "infer", "--timeout", "1e20", "hello"]);
    assert_eq!(output.status.code(), Some(1));

    let response: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(response["success"], false);
}
