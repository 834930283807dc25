#![cfg(all(unix, feature = "cli"))]

use std::path::Path;
use std::process::{Command, Output};
use std::time::{Duration, Instant};

const BIN: &str = env!("CARGO_BIN_EXE_modelwire");

fn write(dir: &Path, name: &str, content: &str) {
    std::fs::write(dir.join(name), content).expect("fixture should be writable");
}

fn modelwire(dir: &Path, args: &[&str]) -> Output {
    Command::new(BIN)
        .args(args)
        .current_dir(dir)
        .env("MW", BIN)
        .env_remove("MODELWIRE_LOG_LEVEL")
        .output()
        .expect("modelwire should start")
}

fn summary(output: &Output) -> serde_json::Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "summary is not JSON ({err}); stdout={} stderr={}",
            String::from_utf8_lossy(&output.stdout),
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn two_models_feed_a_table_file() {
    let dir = tempfile::tempdir().expect("temp dir");
    let out = dir.path().join("mass.txt");

    write(dir.path(), "a.sh", "\"$MW\" send A_out '{\"out_val\": 10}'\n");
    write(
        dir.path(),
        "b.sh",
        r#"set -e
v=$("$MW" recv B_in --count 1)
"$MW" send B_out "{\"in_val_copy\": $v, \"out_val\": $((v + 10))}"
"#,
    );
    write(
        dir.path(),
        "graph.yaml",
        &format!(
            r#"
run: {{grace_period_ms: 2000, recv_timeout_ms: 10000}}
models:
  - name: A
    language: shell
    args: [a.sh]
    outputs: [{{name: A_out, format: json}}]
  - name: B
    language: shell
    args: [b.sh]
    inputs:
      - {{name: B_in, format: table, fields: [{{name: in_val}}], row_format: "%g\n"}}
    outputs: [{{name: B_out, format: json}}]
connections:
  - from: A_out
    to: [{{input: B_in, transform: "%x% * 5"}}]
  - from: B_out
    to:
      - file:
          path: {}
          filetype: table
          field_names: [InputMassRate, OuputMassRate]
          format: "%.1lf\t%.1lf\n"
"#,
            out.display()
        ),
    );

    let output = modelwire(dir.path(), &["run", "graph.yaml", "--format", "json"]);
    let summary = summary(&output);
    assert!(output.status.success(), "{summary}");
    assert_eq!(summary["success"], true);
    for model in summary["models"].as_array().expect("models") {
        assert_eq!(model["state"], "stopped", "{model}");
        assert_eq!(model["exit_code"], 0, "{model}");
    }

    let table = std::fs::read_to_string(&out).expect("table file should exist");
    assert_eq!(table, "# InputMassRate\tOuputMassRate\n50.0\t60.0\n");
}

#[test]
fn one_crash_tears_down_the_graph() {
    let dir = tempfile::tempdir().expect("temp dir");
    write(
        dir.path(),
        "graph.yaml",
        r#"
run: {grace_period_ms: 500}
models:
  - {name: crash, language: shell, args: ["-c", "sleep 0.2; exit 3"]}
  - {name: sleeper, language: shell, args: ["-c", "sleep 30"]}
"#,
    );

    let started = Instant::now();
    let output = modelwire(dir.path(), &["run", "graph.yaml", "--format", "json"]);
    assert!(started.elapsed() < Duration::from_secs(15));
    assert_eq!(output.status.code(), Some(1));

    let summary = summary(&output);
    assert_eq!(summary["success"], false);
    assert_eq!(summary["first_failure"]["component"], "crash");
    assert_eq!(summary["first_failure"]["kind"], "ProcessExitError");

    let sleeper = summary["models"]
        .as_array()
        .and_then(|models| models.iter().find(|m| m["name"] == "sleeper"))
        .expect("sleeper summary");
    assert_eq!(sleeper["state"], "stopped");
    assert!(sleeper["history"]
        .as_array()
        .expect("history")
        .contains(&serde_json::json!("stopping")));
}

#[test]
fn model_logs_are_captured() {
    let dir = tempfile::tempdir().expect("temp dir");
    write(
        dir.path(),
        "graph.yaml",
        r#"
models:
  - {name: talker, language: shell, args: ["-c", "echo hello; echo oops >&2"]}
"#,
    );

    let output = modelwire(
        dir.path(),
        &["run", "graph.yaml", "--format", "json", "--log-dir", "logs"],
    );
    assert!(output.status.success(), "{}", summary(&output));

    let logs = dir.path().join("logs");
    assert_eq!(
        std::fs::read_to_string(logs.join("talker.stdout.log")).expect("stdout log"),
        "hello\n"
    );
    assert_eq!(
        std::fs::read_to_string(logs.join("talker.stderr.log")).expect("stderr log"),
        "oops\n"
    );
}

#[test]
fn validate_reports_graph_issues() {
    let dir = tempfile::tempdir().expect("temp dir");
    write(
        dir.path(),
        "graph.yaml",
        r#"
models:
  - {name: a, language: shell, args: ["-c", "true"], inputs: [{name: a_in}]}
connections:
  - from: nowhere
    to: [{input: a_in}]
"#,
    );

    let output = modelwire(dir.path(), &["validate", "graph.yaml", "--format", "json"]);
    assert_eq!(output.status.code(), Some(60));
    let report = summary(&output);
    assert_eq!(report["valid"], false);
    assert!(report["issues"]
        .as_array()
        .expect("issues")
        .iter()
        .any(|issue| issue.as_str().is_some_and(|s| s.contains("nowhere"))));
}

#[test]
fn invalid_graph_never_launches() {
    let dir = tempfile::tempdir().expect("temp dir");
    write(
        dir.path(),
        "graph.yaml",
        r#"
models:
  - {name: twin, language: shell, args: ["-c", "touch launched"]}
  - {name: twin, language: shell, args: ["-c", "touch launched"]}
"#,
    );

    let output = modelwire(dir.path(), &["run", "graph.yaml"]);
    assert_eq!(output.status.code(), Some(60));
    assert!(!dir.path().join("launched").exists());
}
