use std::fs;
use std::path::Path;
use std::process::Stdio;
use std::thread;
use std::time::{Duration, Instant};

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn run_without_configuration_fails() {
    let dir = tempdir().unwrap();
    Command::cargo_bin("lockdown")
        .unwrap()
        .current_dir(dir.path())
        .args(["run", "--config", "missing.tbl", "--journal"])
        .arg(dir.path().join("journal.jsonl"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to load configuration"));
}

#[test]
fn run_with_missing_root_fails() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("template.tbl");
    fs::write(
        &config,
        format!(
            "$argon2id$v=19$m=1024,t=1,p=1$c2FsdHNhbHRzYWx0$YWJjZGVmZ2hpamtsbW5vcA\n{}\n*.lock\n",
            dir.path().join("gone").display()
        ),
    )
    .unwrap();
    Command::cargo_bin("lockdown")
        .unwrap()
        .current_dir(dir.path())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--journal")
        .arg(dir.path().join("journal.jsonl"))
        .assert()
        .failure();
}

#[test]
fn init_writes_a_loadable_configuration() {
    let dir = tempdir().unwrap();
    let root = dir.path().join("protected");
    fs::create_dir(&root).unwrap();
    let config = dir.path().join("template.tbl");

    Command::cargo_bin("lockdown")
        .unwrap()
        .env("LOCKDOWN_CREDENTIAL", "admin-secret")
        .env("LOCKDOWN_CREDENTIAL_CONFIRM", "admin-secret")
        .arg("init")
        .arg("--config")
        .arg(&config)
        .arg("--root")
        .arg(&root)
        .args(["*.lock", "secret?.txt"])
        .assert()
        .success()
        .stdout(predicate::str::contains("2 patterns"));

    let text = fs::read_to_string(&config).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert!(lines[0].starts_with("$argon2id$"));
    assert_eq!(lines[1], root.canonicalize().unwrap().display().to_string());
    assert_eq!(&lines[2..], ["*.lock", "secret?.txt"]);
}

#[test]
fn init_refuses_to_overwrite() {
    let dir = tempdir().unwrap();
    let config = dir.path().join("template.tbl");
    fs::write(&config, "existing\n").unwrap();

    Command::cargo_bin("lockdown")
        .unwrap()
        .env("LOCKDOWN_CREDENTIAL", "admin-secret")
        .arg("init")
        .arg("--config")
        .arg(&config)
        .arg("--root")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("already exists"));
    assert_eq!(fs::read_to_string(&config).unwrap(), "existing\n");
}

#[test]
fn init_rejects_mismatched_confirmation() {
    let dir = tempdir().unwrap();
    Command::cargo_bin("lockdown")
        .unwrap()
        .env("LOCKDOWN_CREDENTIAL", "one")
        .env("LOCKDOWN_CREDENTIAL_CONFIRM", "two")
        .arg("init")
        .arg("--config")
        .arg(dir.path().join("template.tbl"))
        .arg("--root")
        .arg(dir.path())
        .assert()
        .failure()
        .stderr(predicate::str::contains("mismatch"));
    assert!(!dir.path().join("template.tbl").exists());
}

fn init_config(dir: &Path) -> std::path::PathBuf {
    let root = dir.join("protected");
    fs::create_dir(&root).unwrap();
    let config = dir.join("template.tbl");
    Command::cargo_bin("lockdown")
        .unwrap()
        .env("LOCKDOWN_CREDENTIAL", "admin-secret")
        .arg("init")
        .arg("--config")
        .arg(&config)
        .arg("--root")
        .arg(&root)
        .arg("*.lock")
        .assert()
        .success();
    config
}

fn wait_for_log(path: &Path, needle: &str, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if fs::read_to_string(path).is_ok_and(|text| text.contains(needle)) {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

#[test]
fn run_stops_cleanly_on_stop_command() {
    let dir = tempdir().unwrap();
    let config = init_config(dir.path());

    Command::cargo_bin("lockdown")
        .unwrap()
        .current_dir(dir.path())
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--journal")
        .arg(dir.path().join("journal.jsonl"))
        .write_stdin("status\nstop\n")
        .assert()
        .success()
        .stdout(predicate::str::contains("Protection status: Disabled"))
        .stdout(predicate::str::contains("Stopping file protection system"));
    assert!(dir.path().join("file_protection.log").exists());
}

#[test]
fn interrupt_exits_while_stdin_stays_open() {
    let dir = tempdir().unwrap();
    let config = init_config(dir.path());
    let log = dir.path().join("file_protection.log");

    let mut child = std::process::Command::new(assert_cmd::cargo::cargo_bin("lockdown"))
        .current_dir(dir.path())
        .env_remove("RUST_LOG")
        .arg("run")
        .arg("--config")
        .arg(&config)
        .arg("--journal")
        .arg(dir.path().join("journal.jsonl"))
        .stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .unwrap();
    // keep the write end alive so stdin never reaches EOF
    let _stdin = child.stdin.take().unwrap();

    assert!(wait_for_log(&log, "file protection system started", Duration::from_secs(10)));
    thread::sleep(Duration::from_millis(200));
    assert_eq!(unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGINT) }, 0);

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        if Instant::now() >= deadline {
            child.kill().unwrap();
            panic!("service still running after SIGINT");
        }
        thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success());
    assert!(fs::read_to_string(&log).unwrap().contains("interrupt received"));
}
