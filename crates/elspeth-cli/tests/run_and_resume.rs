// crates/elspeth-cli/tests/run_and_resume.rs
// ============================================================================
// Module: CLI Run/Resume Integration Tests
// Description: Drives the compiled `elspeth` binary against a small
//              memory_source -> uppercase -> jsonl_sink pipeline.
// Purpose: Exercise the demo plugin set, config loading, and the audit
//          store together, the way a real invocation would.
// Dependencies: elspeth-cli binary
// ============================================================================

//! ## Overview
//! Writes a pipeline config and a JSON-lines input file to a temp
//! directory, runs `elspeth run` against them, and checks the sink output
//! and exit status. A second test asserts the CLI fails closed on a
//! structurally invalid configuration before it ever opens the audit
//! store.

#![allow(
    clippy::panic,
    clippy::print_stdout,
    clippy::print_stderr,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::use_debug,
    clippy::dbg_macro,
    clippy::panic_in_result_fn,
    clippy::unwrap_in_result,
    reason = "Test-only output and panic-based assertions are permitted."
)]

use std::fs;
use std::io::Write;
use std::process::Command;

fn elspeth_bin() -> std::path::PathBuf {
    std::path::PathBuf::from(env!("CARGO_BIN_EXE_elspeth"))
}

const PIPELINE_TOML: &str = r#"
[run]
name = "cli-smoke-test"

[[node]]
id = 1
kind = "source"
plugin_name = "memory_source"
determinism = "DETERMINISTIC"
config = { path = "input.jsonl" }

[[node]]
id = 2
kind = "transform"
plugin_name = "uppercase"
determinism = "DETERMINISTIC"
sequence_index = 0

[[node]]
id = 3
kind = "sink"
name = "out"
plugin_name = "jsonl_sink"
determinism = "IO_WRITE"
config = { path = "output.jsonl" }

[[edge]]
id = 1
from = 1
to = 2
label = "default"
mode = "move"

[[edge]]
id = 2
from = 2
to = 3
label = "success"
mode = "move"
"#;

// ============================================================================
// SECTION: Tests
// ============================================================================

#[test]
fn run_processes_every_row_to_the_jsonl_sink() {
    let dir = tempfile::tempdir().expect("create temp dir");
    fs::write(dir.path().join("elspeth.toml"), PIPELINE_TOML).expect("write config");

    let mut input = fs::File::create(dir.path().join("input.jsonl")).expect("create input file");
    writeln!(input, r#"{{"name": "ada"}}"#).expect("write row");
    writeln!(input, r#"{{"name": "grace"}}"#).expect("write row");
    drop(input);

    let output = Command::new(elspeth_bin())
        .current_dir(dir.path())
        .args([
            "run",
            "--config",
            "elspeth.toml",
            "--db",
            "audit.db",
            "--payload-dir",
            "payloads",
        ])
        .output()
        .expect("run elspeth");

    assert!(output.status.success(), "stderr: {}", String::from_utf8_lossy(&output.stderr));
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("succeeded=2"), "unexpected stdout: {stdout}");

    let sink_contents = fs::read_to_string(dir.path().join("output.jsonl")).expect("read sink output");
    let names: Vec<String> = sink_contents
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).expect("sink line is JSON"))
        .map(|value| value["name"].as_str().expect("name field").to_string())
        .collect();
    assert_eq!(names, vec!["ADA".to_string(), "GRACE".to_string()]);

    assert!(dir.path().join("audit.db").exists());
}

#[test]
fn run_rejects_a_config_missing_its_source_node() {
    let dir = tempfile::tempdir().expect("create temp dir");
    let broken = r#"
[run]
name = "no-source"

[[node]]
id = 1
kind = "sink"
name = "out"
plugin_name = "jsonl_sink"
determinism = "IO_WRITE"
config = { path = "output.jsonl" }
"#;
    fs::write(dir.path().join("elspeth.toml"), broken).expect("write config");

    let output = Command::new(elspeth_bin())
        .current_dir(dir.path())
        .args([
            "run",
            "--config",
            "elspeth.toml",
            "--db",
            "audit.db",
            "--payload-dir",
            "payloads",
        ])
        .output()
        .expect("run elspeth");

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("source"), "unexpected stderr: {stderr}");
    assert!(!dir.path().join("audit.db").exists(), "invalid config must fail before opening the audit store");
}
