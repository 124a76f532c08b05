//! Shared test utilities for relayd integration tests.
//!
//! Worker fixtures are tiny shell scripts written into a temporary worker
//! directory. The control surface is exercised with a minimal HTTP/1.1
//! client over a raw TCP stream, the same way a worker would talk to it.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use uuid::Uuid;

use relayd_core::bus::{Event, Subscription};
use relayd_core::daemon::DaemonConfig;
use relayd_core::dispatch::DispatcherConfig;

/// Upper bound for any single wait in a test.
pub const TEST_TIMEOUT: Duration = Duration::from_secs(10);

// -----------------------------------------------------------------------
// Worker fixtures
// -----------------------------------------------------------------------

/// Write an executable `/bin/sh` script named `name` into `dir`.
pub fn write_worker_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).expect("write worker script");
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))
        .expect("chmod worker script");
    path
}

/// A worker that records its environment into `<dir>/<name>.env` and then
/// sleeps until it is terminated.
pub fn write_recording_worker(dir: &Path, name: &str) -> PathBuf {
    let env_file = dir.join(format!("{name}.env"));
    let body = format!(
        "printf '%s\\n%s\\n%s\\n' \"$RELAYD_WORKER_NAME\" \"$RELAYD_WORKER_TOKEN\" \"$RELAYD_DISPATCH_ADDR\" > '{}.tmp'\n\
         mv '{}.tmp' '{}'\n\
         exec sleep 30",
        env_file.display(),
        env_file.display(),
        env_file.display(),
    );
    write_worker_script(dir, name, &body)
}

/// Environment captured by [`write_recording_worker`].
#[derive(Debug, Clone)]
pub struct RecordedEnv {
    pub name: String,
    pub token: String,
    pub dispatch_addr: String,
}

/// Wait for the environment file of a recording worker to appear.
pub async fn read_recorded_env(dir: &Path, name: &str) -> RecordedEnv {
    let path = dir.join(format!("{name}.env"));
    let deadline = tokio::time::Instant::now() + TEST_TIMEOUT;
    loop {
        if let Ok(contents) = std::fs::read_to_string(&path) {
            let mut lines = contents.lines().map(str::to_string);
            return RecordedEnv {
                name: lines.next().unwrap_or_default(),
                token: lines.next().unwrap_or_default(),
                dispatch_addr: lines.next().unwrap_or_default(),
            };
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "worker {name} never wrote {}",
            path.display()
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

// -----------------------------------------------------------------------
// Daemon config
// -----------------------------------------------------------------------

/// Daemon config bound to an ephemeral port with short timeouts.
pub fn test_config(worker_dir: &Path) -> DaemonConfig {
    let mut config = DaemonConfig::new(format!("test-{}", Uuid::new_v4().simple()), worker_dir);
    config.dispatcher = DispatcherConfig {
        listen_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
        pending_timeout: Duration::from_secs(5),
        max_poll_wait: Duration::from_secs(5),
        ..DispatcherConfig::default()
    };
    config.connect_timeout = Duration::from_secs(2);
    config.termination_grace = Duration::from_millis(500);
    config
}

// -----------------------------------------------------------------------
// Bus helpers
// -----------------------------------------------------------------------

/// Next event on `sub`, panicking after [`TEST_TIMEOUT`].
pub async fn next_event(sub: &mut Subscription) -> Event {
    tokio::time::timeout(TEST_TIMEOUT, sub.recv())
        .await
        .unwrap_or_else(|_| panic!("no {} event within {TEST_TIMEOUT:?}", sub.signal().name()))
        .unwrap_or_else(|| panic!("{} subscription closed", sub.signal().name()))
}

/// Serialized inbound `data` envelope. Returns its `message_id`.
pub fn data_envelope(directive: &str, content: serde_json::Value) -> (Uuid, Vec<u8>) {
    let id = Uuid::new_v4();
    let json = serde_json::json!({
        "type": "data",
        "message_id": id,
        "version": 1,
        "directive": directive,
        "metadata": {},
        "content": content,
    });
    (id, json.to_string().into_bytes())
}

// -----------------------------------------------------------------------
// Control surface client
// -----------------------------------------------------------------------

/// Status and body of one HTTP exchange.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    pub body: String,
}

impl HttpResponse {
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_str(&self.body)
            .unwrap_or_else(|e| panic!("invalid JSON body {:?}: {e}", self.body))
    }
}

/// Send one request with `Connection: close` and read the whole response.
pub async fn http_request(
    addr: SocketAddr,
    method: &str,
    path: &str,
    token: Option<&str>,
    body: Option<&serde_json::Value>,
) -> HttpResponse {
    let mut stream = TcpStream::connect(addr).await.expect("connect control surface");

    let body = body.map(|b| b.to_string()).unwrap_or_default();
    let mut request = format!("{method} {path} HTTP/1.1\r\nHost: {addr}\r\nConnection: close\r\n");
    if let Some(token) = token {
        request.push_str(&format!("Authorization: Bearer {token}\r\n"));
    }
    if !body.is_empty() {
        request.push_str("Content-Type: application/json\r\n");
    }
    request.push_str(&format!("Content-Length: {}\r\n\r\n{body}", body.len()));
    stream.write_all(request.as_bytes()).await.expect("send request");

    let mut raw = Vec::new();
    tokio::time::timeout(TEST_TIMEOUT, stream.read_to_end(&mut raw))
        .await
        .expect("response timed out")
        .expect("read response");
    let raw = String::from_utf8(raw).expect("utf-8 response");

    let (head, body) = raw.split_once("\r\n\r\n").unwrap_or((raw.as_str(), ""));
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|s| s.parse().ok())
        .unwrap_or_else(|| panic!("malformed status line: {head:?}"));
    HttpResponse {
        status,
        body: body.to_string(),
    }
}
