//! Integration tests for the `relayd` binary.

use std::io::{BufRead, BufReader};
use std::process::{Command, Stdio};
use std::sync::mpsc;
use std::time::{Duration, Instant};

const RELAYD: &str = env!("CARGO_BIN_EXE_relayd");

/// A command with a private config home and no inherited relayd settings.
fn relayd(config_home: &std::path::Path) -> Command {
    let mut cmd = Command::new(RELAYD);
    cmd.env("XDG_CONFIG_HOME", config_home);
    for (key, _) in std::env::vars() {
        if key.starts_with("RELAYD_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

#[test]
fn generate_markdown_prints_options() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = relayd(tmp.path()).arg("--generate-markdown").output().unwrap();
    assert!(out.status.success());
    let text = String::from_utf8(out.stdout).unwrap();
    assert!(text.starts_with("# relayd"));
    assert!(text.contains("--broker <URL>"));
}

#[test]
fn generate_completion_prints_script() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = relayd(tmp.path())
        .args(["--generate-completion", "bash"])
        .output()
        .unwrap();
    assert!(out.status.success());
    assert!(String::from_utf8(out.stdout).unwrap().contains("relayd"));
}

#[test]
fn invalid_log_level_exits_with_one() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = relayd(tmp.path())
        .args(["--log-level", "shouty", "--client-id", "h"])
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(stderr.contains("invalid log level"), "{stderr}");
}

#[test]
fn missing_broker_exits_with_one() {
    let tmp = tempfile::TempDir::new().unwrap();
    let out = relayd(tmp.path())
        .args(["--client-id", "h", "--dispatch-addr", "127.0.0.1:0"])
        .arg("--worker-dir")
        .arg(tmp.path().join("workers"))
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(stderr.contains("broker"), "{stderr}");
}

#[test]
fn sigterm_stops_a_running_daemon_cleanly() {
    let tmp = tempfile::TempDir::new().unwrap();
    let mut child = relayd(tmp.path())
        .args([
            "--broker",
            "memory://local",
            "--client-id",
            "cli-test",
            "--dispatch-addr",
            "127.0.0.1:0",
            "--log-level",
            "info",
        ])
        .arg("--worker-dir")
        .arg(tmp.path().join("workers"))
        .env("RUST_LOG", "info")
        .env("NO_COLOR", "1")
        .stderr(Stdio::piped())
        .stdout(Stdio::null())
        .spawn()
        .unwrap();

    let stderr = child.stderr.take().unwrap();
    let (tx, rx) = mpsc::channel();
    std::thread::spawn(move || {
        for line in BufReader::new(stderr).lines().map_while(Result::ok) {
            let _ = tx.send(line);
        }
    });

    let deadline = Instant::now() + Duration::from_secs(10);
    let mut subscribed = false;
    while Instant::now() < deadline {
        match rx.recv_timeout(Duration::from_millis(100)) {
            Ok(line) if line.contains("subscribed to inbound topic") => {
                subscribed = true;
                break;
            }
            _ => {}
        }
    }
    assert!(subscribed, "daemon never subscribed");

    // SAFETY: the pid belongs to the child spawned above.
    unsafe { libc::kill(child.id() as i32, libc::SIGTERM) };

    let deadline = Instant::now() + Duration::from_secs(10);
    let status = loop {
        if let Some(status) = child.try_wait().unwrap() {
            break status;
        }
        assert!(Instant::now() < deadline, "daemon did not exit after SIGTERM");
        std::thread::sleep(Duration::from_millis(50));
    };
    assert_eq!(status.code(), Some(0));
    assert!(tmp.path().join("workers").is_dir(), "worker dir not created");
}
