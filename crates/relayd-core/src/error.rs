//! Error taxonomy for the coordination core.
//!
//! Errors fall into three groups:
//! - per-message / per-assignment errors ([`MalformedPayloadError`],
//!   [`NoWorkerError`]) that are handled where they occur and never escalate;
//! - component errors ([`BootstrapError`], [`ConnectionError`],
//!   [`SubscribeError`], [`DispatchError`], receive-loop failures) that are
//!   fatal to the daemon and collected into [`DaemonError`];
//! - [`ShutdownError`], which only ever becomes the final exit status.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Failure while preparing or launching worker processes.
#[derive(Debug, thiserror::Error)]
pub enum BootstrapError {
    #[error("cannot prepare worker directory {}: {source}", .path.display())]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "failed to launch {} worker(s) ({}); {} already running",
        .failed.len(),
        .failed.iter().map(|f| f.worker.as_str()).collect::<Vec<_>>().join(", "),
        .launched.len()
    )]
    Launch {
        /// Workers that started successfully and were left running.
        launched: Vec<String>,
        failed: Vec<LaunchFailure>,
    },
}

/// A single worker that could not be started.
#[derive(Debug)]
pub struct LaunchFailure {
    pub worker: String,
    pub path: PathBuf,
    pub error: std::io::Error,
}

/// Broker transport or authentication failure while connecting.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("no broker addresses configured")]
    NoBrokers,

    #[error("invalid broker address {address:?}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("broker connection failed: {0}")]
    Transport(String),

    #[error("broker connection timed out after {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, thiserror::Error)]
pub enum PublishError {
    #[error("cannot publish to {topic}: broker not connected")]
    NotConnected { topic: String },

    #[error("broker rejected message on {topic}: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("failed to encode message for {topic}: {source}")]
    Encode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    #[error("cannot subscribe: broker not connected")]
    NotConnected,

    #[error("broker rejected subscription to {topic}: {reason}")]
    Rejected { topic: String, reason: String },
}

/// An inbound broker payload that could not be turned into work.
#[derive(Debug, thiserror::Error)]
pub enum MalformedPayloadError {
    #[error("payload on {topic} is not a valid envelope: {source}")]
    Json {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("payload on {topic} has unsupported type {kind:?}")]
    UnsupportedType { topic: String, kind: String },

    #[error("data message {message_id} on {topic} names no directive")]
    MissingDirective { topic: String, message_id: Uuid },
}

/// No registered worker took an assignment in time.
#[derive(Debug, Clone, thiserror::Error)]
pub enum NoWorkerError {
    #[error("no worker {worker:?} registered within {waited:?}")]
    Timeout { worker: String, waited: Duration },

    #[error("pending queue for worker {worker:?} is full ({capacity} assignments)")]
    QueueFull { worker: String, capacity: usize },

    #[error("dispatcher is shutting down")]
    ShuttingDown,
}

/// Fatal failure of the dispatcher's accept surface.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("cannot bind control surface on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("control surface failed: {0}")]
    Serve(#[source] std::io::Error),
}

/// One or more workers could not be terminated during shutdown.
#[derive(Debug, thiserror::Error)]
pub enum ShutdownError {
    #[error(
        "failed to terminate {} worker(s): {}",
        .0.len(),
        .0.iter().map(|(w, e)| format!("{w}: {e}")).collect::<Vec<_>>().join("; ")
    )]
    Workers(Vec<(String, String)>),
}

/// Any error that tears the whole daemon down.
#[derive(Debug, thiserror::Error)]
pub enum DaemonError {
    #[error(transparent)]
    Bootstrap(#[from] BootstrapError),

    #[error(transparent)]
    Connection(#[from] ConnectionError),

    #[error("handshake failed: {0}")]
    Handshake(#[from] PublishError),

    #[error(transparent)]
    Subscribe(#[from] SubscribeError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),

    #[error("broker receive loop failed: {0}")]
    Receive(String),

    #[error("cannot collect canonical facts: {0}")]
    Facts(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn launch_error_lists_failed_workers() {
        let err = BootstrapError::Launch {
            launched: vec!["echo".to_string()],
            failed: vec![LaunchFailure {
                worker: "broken".to_string(),
                path: PathBuf::from("/tmp/broken"),
                error: std::io::Error::from_raw_os_error(8),
            }],
        };
        let msg = err.to_string();
        assert!(msg.contains("broken"), "unexpected message: {msg}");
        assert!(msg.contains("1 already running"), "unexpected message: {msg}");
    }

    #[test]
    fn shutdown_error_joins_worker_causes() {
        let err = ShutdownError::Workers(vec![
            ("a".to_string(), "still alive".to_string()),
            ("b".to_string(), "no such process".to_string()),
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("failed to terminate 2 worker(s)"));
        assert!(msg.contains("a: still alive; b: no such process"));
    }

    #[test]
    fn daemon_error_wraps_component_errors() {
        let err: DaemonError = ConnectionError::Timeout(Duration::from_secs(3)).into();
        assert!(matches!(err, DaemonError::Connection(_)));
        assert!(err.to_string().contains("timed out"));
    }
}
