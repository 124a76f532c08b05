//! Canonical host facts announced in the broker handshake.

use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::error::DaemonError;

const MACHINE_ID_PATHS: [&str; 2] = ["/etc/machine-id", "/var/lib/dbus/machine-id"];

/// Immutable snapshot of host identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CanonicalFacts {
    pub client_id: String,
    pub hostname: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub machine_id: Option<String>,
    pub os: String,
    pub arch: String,
    pub agent_version: String,
    pub collected_at: DateTime<Utc>,
}

impl CanonicalFacts {
    /// Collect facts for this host. Only the hostname is mandatory.
    pub fn collect(client_id: &str) -> Result<Self, DaemonError> {
        Ok(Self {
            client_id: client_id.to_string(),
            hostname: hostname()?,
            machine_id: machine_id(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
            agent_version: env!("CARGO_PKG_VERSION").to_string(),
            collected_at: Utc::now(),
        })
    }
}

#[cfg(unix)]
pub fn hostname() -> Result<String, DaemonError> {
    let mut buf = [0u8; 256];
    // SAFETY: buf is valid for writes of buf.len() bytes.
    let ret = unsafe { libc::gethostname(buf.as_mut_ptr().cast(), buf.len()) };
    if ret != 0 {
        return Err(DaemonError::Facts(format!(
            "gethostname failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let end = buf.iter().position(|&b| b == 0).unwrap_or(buf.len());
    let name = String::from_utf8_lossy(&buf[..end]).into_owned();
    if name.is_empty() {
        return Err(DaemonError::Facts("hostname is empty".to_string()));
    }
    Ok(name)
}

#[cfg(not(unix))]
pub fn hostname() -> Result<String, DaemonError> {
    std::env::var("COMPUTERNAME")
        .map_err(|_| DaemonError::Facts("COMPUTERNAME is not set".to_string()))
}

fn machine_id() -> Option<String> {
    MACHINE_ID_PATHS.iter().find_map(|path| {
        let id = std::fs::read_to_string(path).ok()?;
        let id = id.trim();
        (!id.is_empty()).then(|| id.to_string())
    })
}
