//! Worker supervisor.
//!
//! Each launched worker is owned by a monitor task. The monitor is the only
//! holder of the [`Child`] handle: it either observes an exit (and publishes
//! `process-die`), or receives a stop request from [`ProcessManager::kill_all_workers`]
//! and performs the SIGTERM / grace / SIGKILL sequence itself.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures::future::join_all;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{Mutex, oneshot};
use tracing::{Instrument, debug, info, info_span, warn};

use super::scan::{ensure_worker_dir, scan_worker_dir};
use super::{
    BootstrapReport, ENV_DISPATCH_ADDR, ENV_WORKER_NAME, ENV_WORKER_TOKEN, ProcessExit,
    WorkerInfo, WorkerState,
};
use crate::bus::{Bus, Event};
use crate::error::{BootstrapError, LaunchFailure, ShutdownError};
use crate::token::{TokenConfig, generate_token};

/// How long a worker gets to exit after SIGTERM before it is killed.
pub const DEFAULT_TERMINATION_GRACE: Duration = Duration::from_secs(5);

/// Sent to a monitor task to make it terminate its worker.
struct StopRequest {
    grace: Duration,
    /// Receives the exit description, or why termination failed.
    reply: oneshot::Sender<Result<String, String>>,
}

struct WorkerRecord {
    path: PathBuf,
    pid: Option<u32>,
    state: WorkerState,
    /// `None` once a stop was requested or the monitor has finished.
    stop: Option<oneshot::Sender<StopRequest>>,
}

struct Inner {
    bus: Bus,
    tokens: TokenConfig,
    termination_grace: Duration,
    records: Mutex<HashMap<String, WorkerRecord>>,
    /// Set by the first `kill_all_workers`; exits after this are expected.
    stopping: AtomicBool,
    kill_calls: AtomicUsize,
}

impl Inner {
    async fn mark_exited(&self, name: &str) {
        if let Some(record) = self.records.lock().await.get_mut(name) {
            record.state = WorkerState::Exited;
            record.stop = None;
        }
    }
}

/// Owns every worker process the daemon launches.
#[derive(Clone)]
pub struct ProcessManager {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for ProcessManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessManager")
            .field("termination_grace", &self.inner.termination_grace)
            .field("stopping", &self.inner.stopping.load(Ordering::Relaxed))
            .finish()
    }
}

impl ProcessManager {
    pub fn new(bus: Bus, tokens: TokenConfig) -> Self {
        Self::with_termination_grace(bus, tokens, DEFAULT_TERMINATION_GRACE)
    }

    pub fn with_termination_grace(bus: Bus, tokens: TokenConfig, grace: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                bus,
                tokens,
                termination_grace: grace,
                records: Mutex::new(HashMap::new()),
                stopping: AtomicBool::new(false),
                kill_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Create `dir` if needed, then launch every executable in it.
    ///
    /// Workers that start are left running even when another launch fails;
    /// the error lists both sets. `process-bootstrap` is emitted only when
    /// every launch succeeded.
    pub async fn bootstrap_workers(
        &self,
        dir: &Path,
        dispatch_addr: SocketAddr,
    ) -> Result<BootstrapReport, BootstrapError> {
        let started_at = Instant::now();
        info!(dir = %dir.display(), %dispatch_addr, "bootstrapping workers");

        let dir_error = |source: std::io::Error| BootstrapError::Directory {
            path: dir.to_path_buf(),
            source,
        };
        ensure_worker_dir(dir).map_err(dir_error)?;
        let executables = scan_worker_dir(dir).map_err(dir_error)?;

        let mut launched = Vec::new();
        let mut failed = Vec::new();

        for path in executables {
            let name = worker_name(&path);
            if self.is_supervised(&name).await {
                warn!(worker = %name, "worker already running, not launching again");
                continue;
            }
            match self.launch(&name, &path, dispatch_addr).await {
                Ok(pid) => {
                    info!(worker = %name, pid, "worker launched");
                    launched.push(name);
                }
                Err(error) => {
                    warn!(worker = %name, path = %path.display(), %error, "worker failed to launch");
                    failed.push(LaunchFailure {
                        worker: name,
                        path,
                        error,
                    });
                }
            }
        }

        if !failed.is_empty() {
            return Err(BootstrapError::Launch { launched, failed });
        }

        let report = BootstrapReport {
            dir: dir.to_path_buf(),
            launched,
            started_at,
            finished_at: Instant::now(),
        };
        info!(count = report.launched.len(), "worker bootstrap complete");
        self.inner
            .bus
            .emit(Event::ProcessBootstrap(Arc::new(report.clone())))
            .await;
        Ok(report)
    }

    async fn is_supervised(&self, name: &str) -> bool {
        self.inner
            .records
            .lock()
            .await
            .get(name)
            .is_some_and(|r| r.state != WorkerState::Exited)
    }

    async fn launch(
        &self,
        name: &str,
        path: &Path,
        dispatch_addr: SocketAddr,
    ) -> std::io::Result<u32> {
        {
            let mut records = self.inner.records.lock().await;
            records.insert(
                name.to_string(),
                WorkerRecord {
                    path: path.to_path_buf(),
                    pid: None,
                    state: WorkerState::Starting,
                    stop: None,
                },
            );
        }

        let mut cmd = Command::new(path);
        cmd.env(ENV_WORKER_NAME, name)
            .env(ENV_WORKER_TOKEN, generate_token(&self.inner.tokens, name))
            .env(ENV_DISPATCH_ADDR, dispatch_addr.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let spawned = cmd.spawn().and_then(|child| {
            let pid = child
                .id()
                .ok_or_else(|| std::io::Error::other("worker exited before supervision began"))?;
            Ok((child, pid))
        });
        let (mut child, pid) = match spawned {
            Ok(spawned) => spawned,
            Err(e) => {
                self.inner.records.lock().await.remove(name);
                return Err(e);
            }
        };

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_lines(name.to_string(), stdout, false));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_lines(name.to_string(), stderr, true));
        }

        let (stop_tx, stop_rx) = oneshot::channel();
        {
            let mut records = self.inner.records.lock().await;
            if let Some(record) = records.get_mut(name) {
                record.pid = Some(pid);
                record.state = WorkerState::Running;
                record.stop = Some(stop_tx);
            }
        }

        let span = info_span!("worker_monitor", worker = %name, pid);
        tokio::spawn(
            monitor(Arc::clone(&self.inner), name.to_string(), pid, child, stop_rx).instrument(span),
        );
        Ok(pid)
    }

    /// Terminate every running worker and wait for them to exit.
    ///
    /// SIGTERM first; anything still alive after the grace period gets
    /// SIGKILL. Returns how many workers were terminated. A second call
    /// finds nothing left to stop and returns `Ok(0)`.
    pub async fn kill_all_workers(&self) -> Result<usize, ShutdownError> {
        self.inner.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.inner.stopping.store(true, Ordering::SeqCst);

        let pending: Vec<(String, oneshot::Receiver<Result<String, String>>)> = {
            let mut records = self.inner.records.lock().await;
            records
                .iter_mut()
                .filter(|(_, record)| record.state != WorkerState::Exited)
                .filter_map(|(name, record)| {
                    let stop = record.stop.take()?;
                    let (reply, rx) = oneshot::channel();
                    stop.send(StopRequest {
                        grace: self.inner.termination_grace,
                        reply,
                    })
                    .ok()?;
                    Some((name.clone(), rx))
                })
                .collect()
        };

        if pending.is_empty() {
            debug!("no running workers to terminate");
            return Ok(0);
        }
        info!(count = pending.len(), "terminating workers");

        let results = join_all(
            pending
                .into_iter()
                .map(|(name, rx)| async move { (name, rx.await) }),
        )
        .await;

        let mut terminated = 0;
        let mut failures = Vec::new();
        for (name, result) in results {
            match result {
                Ok(Ok(status)) => {
                    debug!(worker = %name, %status, "worker terminated");
                    terminated += 1;
                }
                Ok(Err(reason)) => failures.push((name, reason)),
                // The monitor saw the exit first; nothing left to stop.
                Err(_) => debug!(worker = %name, "worker exited before stop was delivered"),
            }
        }

        if failures.is_empty() {
            Ok(terminated)
        } else {
            Err(ShutdownError::Workers(failures))
        }
    }

    /// Snapshot of every worker record, sorted by name.
    pub async fn workers(&self) -> Vec<WorkerInfo> {
        let records = self.inner.records.lock().await;
        let mut list: Vec<WorkerInfo> = records
            .iter()
            .map(|(name, r)| WorkerInfo {
                name: name.clone(),
                path: r.path.clone(),
                pid: r.pid,
                state: r.state,
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }

    /// Number of times `kill_all_workers` has been called.
    pub fn kill_invocations(&self) -> usize {
        self.inner.kill_calls.load(Ordering::SeqCst)
    }

    pub fn termination_grace(&self) -> Duration {
        self.inner.termination_grace
    }
}

fn worker_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string())
}

// ---------------------------------------------------------------------------
// Monitor task
// ---------------------------------------------------------------------------

async fn monitor(
    inner: Arc<Inner>,
    name: String,
    pid: u32,
    mut child: Child,
    stop_rx: oneshot::Receiver<StopRequest>,
) {
    tokio::select! {
        status = child.wait() => {
            let (code, status) = match status {
                Ok(status) => (status.code(), status.to_string()),
                Err(e) => (None, format!("unknown ({e})")),
            };
            inner.mark_exited(&name).await;

            if inner.stopping.load(Ordering::SeqCst) {
                debug!(%status, "worker exited during shutdown");
                return;
            }

            warn!(%status, "worker exited unexpectedly");
            inner
                .bus
                .emit(Event::ProcessDie(Arc::new(ProcessExit {
                    worker: name,
                    pid,
                    code,
                    status,
                })))
                .await;
        }
        request = stop_rx => {
            match request {
                Ok(request) => {
                    let outcome = terminate(&mut child, pid, request.grace).await;
                    inner.mark_exited(&name).await;
                    let _ = request.reply.send(outcome);
                }
                Err(_) => {
                    // Manager dropped without stopping us.
                    let _ = child.kill().await;
                }
            }
        }
    }
}

async fn terminate(child: &mut Child, pid: u32, grace: Duration) -> Result<String, String> {
    #[cfg(unix)]
    {
        // SAFETY: pid belongs to a child we spawned and have not yet reaped.
        let ret = unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) };
        if ret != 0 {
            warn!(
                pid,
                error = %std::io::Error::last_os_error(),
                "SIGTERM failed, proceeding to SIGKILL"
            );
        }
    }

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => Ok(status.to_string()),
        Ok(Err(e)) => Err(format!("wait failed: {e}")),
        Err(_) => {
            debug!(pid, "worker ignored SIGTERM, sending SIGKILL");
            child
                .kill()
                .await
                .map_err(|e| format!("SIGKILL failed: {e}"))?;
            Ok("killed".to_string())
        }
    }
}

async fn forward_lines<R>(worker: String, reader: R, is_stderr: bool)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) if is_stderr => warn!(worker = %worker, %line, "worker stderr"),
            Ok(Some(line)) => debug!(worker = %worker, %line, "worker stdout"),
            Ok(None) => break,
            Err(e) => {
                debug!(worker = %worker, error = %e, "stopped reading worker output");
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
