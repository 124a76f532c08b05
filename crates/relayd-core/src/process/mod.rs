//! Worker process lifecycle: discovery, launch, supervision, termination.
//!
//! Workers are plain executables in a well-known directory. Each one is
//! launched with its identity, a worker token and the dispatcher address in
//! its environment, then supervised by a dedicated monitor task until it
//! exits or is told to stop.

mod manager;
mod scan;

use std::path::PathBuf;
use std::time::Instant;

pub use manager::{DEFAULT_TERMINATION_GRACE, ProcessManager};
pub use scan::scan_worker_dir;

/// Environment variable carrying the worker's name.
pub const ENV_WORKER_NAME: &str = "RELAYD_WORKER_NAME";
/// Environment variable carrying the worker's bearer token.
pub const ENV_WORKER_TOKEN: &str = "RELAYD_WORKER_TOKEN";
/// Environment variable carrying the dispatcher's `host:port`.
pub const ENV_DISPATCH_ADDR: &str = "RELAYD_DISPATCH_ADDR";

/// Liveness of a supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerState {
    Starting,
    Running,
    Exited,
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WorkerState::Starting => "starting",
            WorkerState::Running => "running",
            WorkerState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of one worker record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerInfo {
    pub name: String,
    pub path: PathBuf,
    pub pid: Option<u32>,
    pub state: WorkerState,
}

/// Published on `process-bootstrap` once every worker has been launched.
#[derive(Debug, Clone)]
pub struct BootstrapReport {
    pub dir: PathBuf,
    /// Names of launched workers, in launch order.
    pub launched: Vec<String>,
    /// When bootstrap began, before the directory was touched.
    pub started_at: Instant,
    /// When the last worker was launched, just before the event was emitted.
    pub finished_at: Instant,
}

/// Published on `process-die` when a worker exits without being asked to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub worker: String,
    pub pid: u32,
    /// Exit code, when the process exited normally.
    pub code: Option<i32>,
    /// Human-readable exit status, e.g. `exit status: 3` or `signal: 9`.
    pub status: String,
}
