use assert_cmd::prelude::*;
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::process::Command;

fn agentguard(workdir: &Path) -> Command {
    let bin = assert_cmd::cargo::cargo_bin!("agentguard");
    let mut cmd = Command::new(bin);
    // keep developer config files out of the way
    cmd.current_dir(workdir)
        .env("XDG_CONFIG_HOME", workdir)
        .env_remove("AGENTGUARD_BEARER_TOKEN")
        .env("RUST_LOG", "warn");
    cmd
}

fn fixture(name: &str) -> String {
    Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests/fixtures")
        .join(name)
        .to_string_lossy()
        .into_owned()
}

#[test]
fn validate_accepts_well_formed_policies() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("allow.rego");
    fs::write(
        &policy,
        "package agentguard\n\nimport rego.v1\n\ndefault decision := false\n",
    )
    .unwrap();

    let assert = agentguard(dir.path())
        .args(["validate", policy.to_str().unwrap()])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(stdout.contains("allow.rego"));
    assert!(stdout.contains("1 policies compiled"));
}

#[test]
fn validate_fails_on_syntax_errors() {
    let dir = tempfile::tempdir().unwrap();
    let policy = dir.path().join("broken.rego");
    fs::write(&policy, "package agentguard\n\ndecision := {\n").unwrap();

    let assert = agentguard(dir.path())
        .args(["validate", policy.to_str().unwrap()])
        .assert()
        .failure();
    let stderr = String::from_utf8(assert.get_output().stderr.clone()).unwrap();
    assert!(stderr.contains("broken.rego"), "stderr: {stderr}");
}

#[test]
fn eval_applies_builtin_policies_and_data() {
    let dir = tempfile::tempdir().unwrap();
    let data = fixture("allowed_tools.json");

    let allowed = agentguard(dir.path())
        .args([
            "eval",
            "--builtin",
            "--data",
            &data,
            "--input",
            &fixture("search_request.json"),
        ])
        .assert()
        .success();
    let decision: Value = serde_json::from_slice(&allowed.get_output().stdout).unwrap();
    assert_eq!(decision["allow"], true, "decision: {decision}");

    let denied = agentguard(dir.path())
        .args([
            "eval",
            "--builtin",
            "--data",
            &data,
            "--input",
            &fixture("shell_request.json"),
        ])
        .assert()
        .success();
    let decision: Value = serde_json::from_slice(&denied.get_output().stdout).unwrap();
    assert_eq!(decision["allow"], false);
    assert!(!decision["reasons"].as_array().unwrap().is_empty());
}

#[test]
fn eval_without_policies_fails_closed() {
    let dir = tempfile::tempdir().unwrap();
    let assert = agentguard(dir.path())
        .args(["eval", "--input", &fixture("search_request.json")])
        .assert()
        .success();
    let decision: Value = serde_json::from_slice(&assert.get_output().stdout).unwrap();
    assert_eq!(decision["allow"], false);
    assert_eq!(decision["metadata"]["outcome"], "unavailable");
}

#[test]
fn config_show_redacts_the_bearer_token() {
    let dir = tempfile::tempdir().unwrap();
    let assert = agentguard(dir.path())
        .env("AGENTGUARD_BEARER_TOKEN", "very-secret-token-value-0123456789")
        .env("AGENTGUARD__RATE_LIMIT__REQUESTS", "12")
        .args(["config", "show"])
        .assert()
        .success();
    let stdout = String::from_utf8(assert.get_output().stdout.clone()).unwrap();
    assert!(!stdout.contains("very-secret-token-value"));
    assert!(stdout.contains("requests: 12"));
}
