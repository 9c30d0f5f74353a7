//! End-to-end runs of the `actprobe` binary against script targets.

#![cfg(unix)]

use std::path::Path;
use std::process::{Command, Output};

use actprobe_test_utils::{smoke_target_script, workflow_target_script};

fn actprobe(config_home: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_actprobe"))
        .args(args)
        .env("XDG_CONFIG_HOME", config_home)
        .env("ACTPROBE_MASTER_KEY", "00".repeat(32))
        .env_remove("ACTPROBE_TARGET_COMMAND")
        .env_remove("ACTPROBE_DATABASE_URL")
        .env("RUST_LOG", "warn")
        .output()
        .expect("failed to run actprobe")
}

#[test]
fn smoke_passes_against_script_target() {
    let tmp = tempfile::tempdir().unwrap();
    let script = smoke_target_script(tmp.path());

    let out = actprobe(tmp.path(), &["smoke", "--target", script.to_str().unwrap()]);

    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(out.status.success(), "stdout:\n{stdout}\nstderr:\n{}", String::from_utf8_lossy(&out.stderr));
    assert!(stdout.contains("Smoke run #1"));
    assert!(stdout.contains("Session: PASSED"));
}

#[test]
fn run_emits_json_for_every_run() {
    let tmp = tempfile::tempdir().unwrap();
    let script = workflow_target_script(tmp.path());

    let out = actprobe(
        tmp.path(),
        &["run", "--runs", "2", "--json", "--target", script.to_str().unwrap()],
    );

    assert!(out.status.success(), "stderr:\n{}", String::from_utf8_lossy(&out.stderr));
    let session: serde_json::Value = serde_json::from_slice(&out.stdout).unwrap();
    assert_eq!(session["passed"], true);
    let reports = session["reports"].as_array().unwrap();
    assert_eq!(reports.len(), 2);
    assert_eq!(reports[1]["final_phase"], "done");
}

#[test]
fn failing_target_exits_non_zero() {
    let tmp = tempfile::tempdir().unwrap();

    let out = actprobe(tmp.path(), &["smoke", "--target", "/nonexistent/actprobe-target"]);

    assert!(!out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("Target did not start"));
    assert!(stdout.contains("Session: FAILED"));
}

#[test]
fn init_then_code_round_trip() {
    let tmp = tempfile::tempdir().unwrap();

    let init = actprobe(tmp.path(), &["init"]);
    assert!(init.status.success());
    assert!(tmp.path().join("actprobe").join("config.toml").exists());

    let handoff = tmp.path().join("code.txt");
    std::fs::write(&handoff, "captured-code\n").unwrap();
    let code = actprobe(tmp.path(), &["code", "--output", handoff.to_str().unwrap()]);
    assert!(code.status.success());
    assert_eq!(String::from_utf8_lossy(&code.stdout).trim(), "captured-code");
    assert!(!handoff.exists());

    let empty = actprobe(tmp.path(), &["code", "--output", handoff.to_str().unwrap()]);
    assert!(!empty.status.success());
}
