//! Binary-level checks that need no running driver.

use quarry_core::CorruptionMarker;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tempfile::TempDir;

fn setup() -> (TempDir, PathBuf) {
    let dir = TempDir::new().unwrap();
    let config = dir.path().join("quarry.toml");
    // Port 9 is discard; nothing answers there.
    std::fs::write(
        &config,
        "[database]\npath = \"data/index.db\"\n\n[client]\ndriver_url = \"http://127.0.0.1:9\"\nmax_retries = 0\n",
    )
    .unwrap();
    std::fs::create_dir_all(dir.path().join("data")).unwrap();
    (dir, config)
}

fn quarry(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_quarry"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .output()
        .unwrap()
}

fn mark_corrupt(dir: &Path) {
    CorruptionMarker::new("page checksum mismatch", vec![])
        .write(&dir.join("data").join("index.db"))
        .unwrap();
}

#[test]
fn test_safe_mode_refuses_queries_with_error_code() {
    let (dir, config) = setup();
    mark_corrupt(dir.path());

    let output = quarry(&config, &["stats"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[database_corrupted]"), "stderr: {stderr}");
    assert!(stderr.contains("page checksum mismatch"));
}

#[test]
fn test_json_errors_print_the_envelope() {
    let (dir, config) = setup();
    mark_corrupt(dir.path());

    let output = quarry(&config, &["--json", "project", "list"]);
    assert!(!output.status.success());
    let envelope: serde_json::Value = serde_json::from_slice(&output.stderr).unwrap();
    assert_eq!(envelope["code"], "database_corrupted");
    assert!(envelope["hint"].as_str().unwrap().contains("repair"));
}

#[test]
fn test_recreate_needs_force_even_in_safe_mode() {
    let (dir, config) = setup();
    mark_corrupt(dir.path());

    let output = quarry(&config, &["repair", "--recreate"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[confirmation_required]"), "stderr: {stderr}");
    assert!(CorruptionMarker::exists(&dir.path().join("data").join("index.db")));
}

#[test]
fn test_unreachable_driver_is_reported() {
    let (_dir, config) = setup();
    let output = quarry(&config, &["project", "list"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("error[driver_unavailable]"), "stderr: {stderr}");
}

#[test]
fn test_unknown_worker_type_is_rejected() {
    let (_dir, config) = setup();
    let output = quarry(&config, &["worker", "start", "indexer"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("unknown worker type"));
}

#[test]
fn test_worker_exits_cleanly_on_sigterm() {
    use nix::sys::signal::{kill, Signal};
    use nix::unistd::Pid;
    use std::time::{Duration, Instant};

    let (_dir, config) = setup();
    let mut child = Command::new(env!("CARGO_BIN_EXE_quarry"))
        .arg("--config")
        .arg(&config)
        .args(["worker", "run", "repair"])
        .env("NO_COLOR", "1")
        .env_remove("RUST_LOG")
        .stderr(std::process::Stdio::null())
        .spawn()
        .unwrap();

    // Let the worker reach its poll loop.
    std::thread::sleep(Duration::from_secs(1));
    kill(Pid::from_raw(child.id() as i32), Signal::SIGTERM).unwrap();

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "worker ignored SIGTERM");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert!(status.success(), "worker exited with {status}");
}
