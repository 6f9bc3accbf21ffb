#![allow(deprecated)] // cargo_bin is deprecated but still functional

use assert_cmd::Command;
use predicates::str::contains;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn write_config(temp: &TempDir) -> PathBuf {
    let config_path = temp.path().join("stager.toml");
    let db_path = temp.path().join("stager.db");
    fs::write(
        &config_path,
        format!(
            "[metadata]\ntype = \"sqlite\"\npath = \"{}\"\n\n[staging]\nreplica_type = \"Stage\"\n",
            db_path.display()
        ),
    )
    .unwrap();
    config_path
}

fn stagerctl(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("stagerctl").unwrap();
    cmd.env_remove("STAGER_CONFIG")
        .env("RUST_LOG", "warn")
        .arg("--config")
        .arg(config);
    cmd
}

fn run_json(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.assert().success().get_output().stdout.clone();
    serde_json::from_slice(&output).unwrap()
}

fn submit(config: &Path, source_task_id: &str, file: &str) -> i64 {
    let value = run_json(stagerctl(config).args([
        "submit",
        "--source",
        "System",
        "--callback",
        "cb",
        "--source-task-id",
        source_task_id,
        "--file",
        file,
    ]));
    value["task_id"].as_i64().unwrap()
}

#[test]
fn shared_replica_is_collected_after_last_task_is_removed() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    let t1 = submit(&config, "src1", "SE1=/a/b");
    let t2 = submit(&config, "src2", "SE1=/a/b");
    assert_ne!(t1, t2);

    let replicas = run_json(stagerctl(&config).args(["replica", "list", "--task", t1.to_string().as_str()]));
    let replicas = replicas.as_array().unwrap();
    assert_eq!(replicas.len(), 1);
    assert_eq!(replicas[0]["links"], 2);
    assert_eq!(replicas[0]["status"], "New");
    let replica_id = replicas[0]["replica_id"].as_i64().unwrap();

    let resolved = run_json(stagerctl(&config).args([
        "replica",
        "resolve",
        replica_id.to_string().as_str(),
        "pfn1",
        "1000",
    ]));
    assert_eq!(resolved["updated"], 1);

    let waiting = run_json(stagerctl(&config).args(["replica", "waiting"]));
    let entry = &waiting[replica_id.to_string()];
    assert_eq!(entry["lfn"], "/a/b");
    assert_eq!(entry["size"], 1000);

    run_json(stagerctl(&config).args(["task", "remove", t1.to_string().as_str()]));
    let gc = run_json(stagerctl(&config).arg("gc"));
    assert_eq!(gc["removed"], serde_json::json!([]));

    run_json(stagerctl(&config).args(["task", "remove", t2.to_string().as_str()]));
    let gc = run_json(stagerctl(&config).arg("gc"));
    assert_eq!(gc["removed"], serde_json::json!([replica_id]));
}

#[test]
fn task_summary_lists_replicas_across_storage_elements() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    let value = run_json(stagerctl(&config).args([
        "submit",
        "--source",
        "System",
        "--callback",
        "cb",
        "--source-task-id",
        "multi",
        "--file",
        "SE1=/x",
        "--file",
        "SE2=/y",
    ]));
    let task_id = value["task_id"].as_i64().unwrap();

    let summary = run_json(stagerctl(&config).args(["task", "summary", task_id.to_string().as_str()]));
    assert_eq!(summary["task"]["status"], "Submitted");
    assert_eq!(summary["task"]["source_task_id"], "multi");
    assert_eq!(summary["replicas"].as_array().unwrap().len(), 2);

    let report = run_json(stagerctl(&config).arg("verify-links"));
    assert_eq!(report["replicas_verified"], 2);
    assert_eq!(report["discrepancies"], serde_json::json!([]));
}

#[test]
fn unknown_task_reports_not_found() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    stagerctl(&config)
        .args(["task", "info", "999"])
        .assert()
        .failure()
        .stderr(contains("not found"));
}

#[test]
fn malformed_file_spec_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = write_config(&temp);

    stagerctl(&config)
        .args([
            "submit",
            "--source",
            "System",
            "--callback",
            "cb",
            "--source-task-id",
            "bad",
            "--file",
            "/no/storage/element",
        ])
        .assert()
        .failure()
        .stderr(contains("expected SE=LFN"));
}
