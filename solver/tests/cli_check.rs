//! CLI tests: spawn the solver binary and check output and exit codes.

use std::fs;
use std::process::{Command, Output};

use serde_json::Value;

use solver::exit_codes;

fn solver(dir: &std::path::Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_solver"))
        .current_dir(dir)
        .env_remove("RUST_LOG")
        .args(args)
        .output()
        .expect("spawn solver")
}

fn decision(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).expect("decision json")
}

#[test]
fn check_denies_destructive_commands() {
    let temp = tempfile::tempdir().expect("tempdir");
    for args in [
        vec!["check", "rm", "-rf", "/"],
        vec!["check", "/bin/rm", "file"],
        vec!["check", "bash", "-c", "id"],
    ] {
        let output = solver(temp.path(), &args);
        assert_eq!(output.status.code(), Some(exit_codes::INVALID), "{args:?}");
        let json = decision(&output);
        assert_eq!(json["verdict"], "DENY");
        assert_eq!(json["reason"]["code"], "deny_listed");
    }
}

#[test]
fn check_allows_listed_and_audits_heuristic_matches() {
    let temp = tempfile::tempdir().expect("tempdir");

    let output = solver(temp.path(), &["check", "strings", "-n", "8", "a.bin"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let json = decision(&output);
    assert_eq!(json["verdict"], "ALLOW");
    assert_eq!(json["args"], serde_json::json!(["-n", "8", "a.bin"]));

    let output = solver(temp.path(), &["check", "zip2john", "archive.zip"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let json = decision(&output);
    assert_eq!(json["verdict"], "ALLOW_AUDIT");
    assert_eq!(json["reason"]["pattern"], "2john");
}

#[test]
fn check_is_default_closed_for_unknown_commands() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = solver(temp.path(), &["check", "frobnicate"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert_eq!(decision(&output)["reason"]["code"], "default_closed");
}

#[test]
fn check_uses_policy_from_config() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(
        temp.path().join("policy.toml"),
        "deny = [\"strings\"]\n[allow]\ntools = [\"frobnicate\"]\n",
    )
    .expect("write policy");
    fs::write(temp.path().join("solver.toml"), "policy_path = \"policy.toml\"\n")
        .expect("write config");

    let output = solver(temp.path(), &["check", "frobnicate"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let output = solver(temp.path(), &["check", "strings"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
}

#[test]
fn config_prints_defaults_without_credentials() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = Command::new(env!("CARGO_BIN_EXE_solver"))
        .current_dir(temp.path())
        .env_remove("DEEPSEEK_API_KEY")
        .arg("config")
        .output()
        .expect("spawn solver");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("step_budget = 30"));
    assert!(stdout.contains("DEEPSEEK_API_KEY is not set"));
}

#[test]
fn config_redacts_the_credential() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = Command::new(env!("CARGO_BIN_EXE_solver"))
        .current_dir(temp.path())
        .env("DEEPSEEK_API_KEY", "sk-very-secret")
        .arg("config")
        .output()
        .expect("spawn solver");
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("<redacted>"));
    assert!(!stdout.contains("sk-very-secret"));
}

#[test]
fn invalid_config_is_rejected() {
    let temp = tempfile::tempdir().expect("tempdir");
    fs::write(temp.path().join("solver.toml"), "[session]\nstep_budget = 0\n")
        .expect("write config");
    let output = solver(temp.path(), &["config"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("step_budget"));
}

#[test]
fn run_rejects_missing_challenge_directory() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = solver(temp.path(), &["run", "does-not-exist"]);
    assert_eq!(output.status.code(), Some(exit_codes::INVALID));
    assert!(String::from_utf8_lossy(&output.stderr).contains("does-not-exist"));
}

#[test]
fn config_write_creates_a_loadable_file() {
    let temp = tempfile::tempdir().expect("tempdir");
    let output = solver(temp.path(), &["config", "--write"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
    let written = fs::read_to_string(temp.path().join("solver.toml")).expect("read config");
    assert!(written.contains("step_budget = 30"));

    let output = solver(temp.path(), &["config"]);
    assert_eq!(output.status.code(), Some(exit_codes::OK));
}
