#![allow(deprecated)]
use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const SECRET_VARS: &[&str] = &[
    "GOOGLE_CLIENT_ID",
    "GOOGLE_CLIENT_SECRET",
    "OUTLOOK_CLIENT_ID",
    "OUTLOOK_CLIENT_SECRET",
    "TWILIO_ACCOUNT_SID",
    "TWILIO_AUTH_TOKEN",
    "ANTHROPIC_API_KEY",
];

fn followupd(dir: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("followupd").unwrap();
    cmd.current_dir(dir.path())
        .env("FOLLOWUP_CONFIG", dir.path().join("followup.yaml"))
        .env_remove("RUST_LOG");
    for var in SECRET_VARS {
        cmd.env_remove(var);
    }
    cmd
}

fn write_config(dir: &TempDir, extra: &str) {
    let yaml = format!(
        "storage:\n  state_path: {}\n  queue_path: {}\n{extra}",
        dir.path().join("state.redb").display(),
        dir.path().join("queue.redb").display(),
    );
    std::fs::write(dir.path().join("followup.yaml"), yaml).unwrap();
}

fn json_stdout(cmd: &mut Command) -> serde_json::Value {
    let output = cmd.output().unwrap();
    assert!(
        output.status.success(),
        "command failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
    serde_json::from_slice(&output.stdout).unwrap()
}

// ---------------------------------------------------------------------------
// followupd check
// ---------------------------------------------------------------------------

#[test]
fn help_lists_commands() {
    let dir = TempDir::new().unwrap();
    followupd(&dir)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("serve"))
        .stdout(predicate::str::contains("run-once"))
        .stdout(predicate::str::contains("enqueue"))
        .stdout(predicate::str::contains("jobs"));
}

#[test]
fn check_missing_file_uses_defaults() {
    let dir = TempDir::new().unwrap();
    followupd(&dir)
        .arg("check")
        .assert()
        .success()
        .stdout(predicate::str::contains("ok"));
}

#[test]
fn check_reports_invalid_schedule() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "schedule:\n  hour: 25\n");
    followupd(&dir)
        .arg("check")
        .assert()
        .failure()
        .stdout(predicate::str::contains("not a valid time of day"))
        .stderr(predicate::str::contains("configuration error"));
}

#[test]
fn invalid_config_blocks_other_commands() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "schedule:\n  hour: 25\n");
    followupd(&dir)
        .arg("enqueue")
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid configuration"));
}

// ---------------------------------------------------------------------------
// followupd enqueue / jobs
// ---------------------------------------------------------------------------

#[test]
fn enqueue_then_list() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "queue:\n  attempts: 5\n");

    let job = json_stdout(followupd(&dir).args(["enqueue", "--json"]));
    assert_eq!(job["name"], "process-follow-ups");
    assert_eq!(job["state"], "waiting");
    assert_eq!(job["options"]["attempts"], 5);
    assert_eq!(job["payload"]["source"], "cli");

    let listing = json_stdout(followupd(&dir).args(["jobs", "--json"]));
    assert_eq!(listing["counts"]["waiting"], 1);
    assert_eq!(listing["jobs"][0]["id"], job["id"]);

    followupd(&dir)
        .arg("jobs")
        .assert()
        .success()
        .stdout(predicate::str::contains("process-follow-ups"))
        .stdout(predicate::str::contains("waiting 1"));
}

#[test]
fn jobs_state_filter() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "");
    followupd(&dir).arg("enqueue").assert().success();

    let failed = json_stdout(followupd(&dir).args(["jobs", "--state", "failed", "--json"]));
    assert!(failed["jobs"].as_array().unwrap().is_empty());

    followupd(&dir)
        .args(["jobs", "--state", "paused"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("unknown job state 'paused'"));
}

// ---------------------------------------------------------------------------
// followupd run-once
// ---------------------------------------------------------------------------

#[test]
fn run_once_on_empty_store_reports_nothing_done() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "");
    let report = json_stdout(followupd(&dir).args(["run-once", "--json"]));
    assert_eq!(report["tenants_seen"], 0);
    assert_eq!(report["sent"], 0);
}

#[test]
fn run_once_plain_output() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "");
    followupd(&dir)
        .arg("run-once")
        .assert()
        .success()
        .stdout(predicate::str::contains("tenants"))
        .stdout(predicate::str::contains("sent"));
}
