#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn cli(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("claude-session").unwrap();
    cmd.current_dir(dir.path())
        .env_remove("CLAUDE_SESSION_CONFIG")
        .env_remove("RUST_LOG");
    cmd
}

fn config_text(dir: &TempDir) -> String {
    std::fs::read_to_string(dir.path().join(".claude-session.yaml")).unwrap()
}

fn write_config(dir: &TempDir, yaml: &str) {
    std::fs::write(dir.path().join(".claude-session.yaml"), yaml).unwrap();
}

// ---------------------------------------------------------------------------
// run --scripted
// ---------------------------------------------------------------------------

#[test]
fn scripted_run_prints_transcript_and_usage() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["run", "anything", "--scripted"])
        .assert()
        .success()
        .stdout(predicate::str::contains("done"))
        .stdout(predicate::str::contains("Tokens: 5 in / 10 out"));
}

#[test]
fn scripted_run_json_emits_one_object_per_message() {
    let dir = TempDir::new().unwrap();
    let out = cli(&dir)
        .args(["run", "anything", "--scripted", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let lines: Vec<serde_json::Value> = String::from_utf8(out)
        .unwrap()
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 2);
    assert_eq!(lines[0]["message"]["type"], "assistant");
    assert_eq!(lines[1]["message"]["type"], "result");
    assert_eq!(lines[1]["message"]["usage"]["output_tokens"], 10);
    assert!(lines[0]["received_at"].is_string());
}

#[test]
fn mapped_prompt_selects_error_scenario_and_fails() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["scenario", "map", "bug", "error"])
        .assert()
        .success();

    cli(&dir)
        .args(["run", "fix this bug", "--scripted"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("error result (error_during_execution)"));

    cli(&dir)
        .args(["run", "add feature", "--scripted"])
        .assert()
        .success();
}

#[test]
fn policy_denial_without_interrupt_lets_session_finish() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "scripted:\n  default: tool-use\n");
    cli(&dir)
        .args(["run", "write it", "--scripted"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[tool_use t1] write_file"))
        .stdout(predicate::str::contains("File written."));
}

#[test]
fn policy_denial_with_interrupt_aborts() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        "permission:\n  deny: [write_file]\n  interrupt_on_deny: true\nscripted:\n  default: tool-use\n",
    );
    cli(&dir)
        .args(["run", "write it", "--scripted"])
        .assert()
        .failure()
        .stdout(predicate::str::contains("File written.").not())
        .stderr(predicate::str::contains("Tool 'write_file' (t1) denied"));
}

#[test]
fn missing_executable_lists_searched_paths() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        "executable_paths:\n  - /usr/bin/agent\n  - /opt/agent\n",
    );
    cli(&dir)
        .args(["run", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not found"))
        .stderr(predicate::str::contains("/usr/bin/agent, /opt/agent"));
}

// ---------------------------------------------------------------------------
// scenario
// ---------------------------------------------------------------------------

#[test]
fn scenario_list_shows_builtins() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["scenario", "list"])
        .assert()
        .success()
        .stdout(predicate::str::contains("quick-success *"))
        .stdout(predicate::str::contains("multi-turn"))
        .stdout(predicate::str::contains("Patterns: (none)"));
}

#[test]
fn set_default_persists_and_is_listed() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["scenario", "set-default", "slow"])
        .assert()
        .success();
    assert!(config_text(&dir).contains("default: slow"));

    let out = cli(&dir)
        .args(["scenario", "list", "--json"])
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let v: serde_json::Value = serde_json::from_slice(&out).unwrap();
    assert_eq!(v["default"], "slow");
    let slow = v["scenarios"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["id"] == "slow")
        .unwrap();
    assert_eq!(slow["is_default"], true);
}

#[test]
fn unknown_scenario_is_rejected_and_nothing_written() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["scenario", "map", "bug", "no-such-scenario"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown scenario: no-such-scenario"));
    assert!(!dir.path().join(".claude-session.yaml").exists());

    cli(&dir)
        .args(["scenario", "set-default", "no-such-scenario"])
        .assert()
        .failure();
}

#[test]
fn invalid_pattern_is_rejected() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["scenario", "map", "(unclosed", "error"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid scenario pattern"));
}

#[test]
fn unmap_unknown_pattern_is_a_noop() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["scenario", "map", "bug", "error"])
        .assert()
        .success();
    cli(&dir)
        .args(["scenario", "unmap", "never-mapped"])
        .assert()
        .success()
        .stdout(predicate::str::contains("No mapping"));
    assert!(config_text(&dir).contains("pattern: bug"));

    cli(&dir)
        .args(["scenario", "unmap", "bug"])
        .assert()
        .success();
    assert!(!config_text(&dir).contains("pattern: bug"));
}

#[test]
fn reset_drops_routes_and_default() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["scenario", "map", "bug", "error"])
        .assert()
        .success();
    cli(&dir)
        .args(["scenario", "set-default", "slow"])
        .assert()
        .success();
    cli(&dir).args(["scenario", "reset"]).assert().success();

    let text = config_text(&dir);
    assert!(!text.contains("bug"));
    assert!(!text.contains("slow"));
}

#[test]
fn config_flag_selects_another_file() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["--config", "alt.yaml", "scenario", "map", "bug", "error"])
        .assert()
        .success();
    assert!(dir.path().join("alt.yaml").exists());
    assert!(!dir.path().join(".claude-session.yaml").exists());
}

// ---------------------------------------------------------------------------
// config show
// ---------------------------------------------------------------------------

#[test]
fn config_show_reports_defaults_when_missing() {
    let dir = TempDir::new().unwrap();
    cli(&dir)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("not found; using defaults"))
        .stdout(predicate::str::contains("default: deny"));
}

#[test]
fn config_show_rejects_broken_routing() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "scripted:\n  default: gone\n");
    cli(&dir)
        .args(["config", "show"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid scripted.default"));
}
