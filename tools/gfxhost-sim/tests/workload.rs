#![cfg(not(target_arch = "wasm32"))]

use std::fs;

use serde_json::Value;
use tempfile::tempdir;

fn run(args: &[&str]) -> Value {
    let output = assert_cmd::cargo::cargo_bin_cmd!("gfxhost-sim")
        .env_remove("GFXHOST_CONFIG")
        .args(args)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    serde_json::from_slice(&output).unwrap()
}

fn assert_drained(summary: &Value) {
    assert_eq!(summary["failures"], Value::Array(Vec::new()));
    assert_eq!(summary["completed"], summary["jobs"]);
    for sp in summary["syncpts"].as_array().unwrap() {
        assert_eq!(sp["current"], sp["max"], "syncpoint {sp}");
    }
}

#[test]
fn default_workload_drains() {
    let summary = run(&["--threads", "3", "--jobs", "40"]);
    assert_eq!(summary["jobs"], 120);
    assert_drained(&summary);

    let workers = summary["syncpts"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|sp| sp["name"].as_str().is_some_and(|n| n.starts_with("worker")))
        .count();
    assert_eq!(workers, 3);
}

#[test]
fn config_file_and_generation_override() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.json");
    fs::write(
        &path,
        r#"{"syncpts": 16, "push_buffer_words": 32, "channels": [{"name": "vic", "class_id": 93}]}"#,
    )
    .unwrap();

    let summary = run(&[
        "--config",
        path.to_str().unwrap(),
        "--generation",
        "v2",
        "--threads",
        "2",
        "--jobs",
        "30",
        "--null-kickoff-every",
        "5",
    ]);
    assert_eq!(summary["generation"], "v2");
    assert!(summary["channels"].get("vic").is_some());
    assert_eq!(summary["channels"]["vic"]["submits"], 60);
    assert_drained(&summary);
}

#[test]
fn rejects_bad_config() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("host.json");
    fs::write(&path, r#"{"push_buffer_words": 100}"#).unwrap();

    assert_cmd::cargo::cargo_bin_cmd!("gfxhost-sim")
        .args(["--config", path.to_str().unwrap()])
        .assert()
        .failure();
}
