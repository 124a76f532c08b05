//! Configuration for the relayd binary.
//!
//! Reads an optional TOML file at `~/.config/relayd/config.toml` and resolves
//! every setting through the chain: CLI flag > `RELAYD_*` env var > config
//! file > default. The result is an immutable [`Settings`] value handed to
//! the daemon.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

use relayd_core::daemon::DaemonConfig;
use relayd_core::dispatch::DEFAULT_LISTEN_ADDR;

/// Where workers live when nothing else is configured.
pub const DEFAULT_WORKER_DIR: &str = "/usr/libexec/relayd";

// -----------------------------------------------------------------------
// Config file types
// -----------------------------------------------------------------------

/// On-disk configuration. Keys mirror the long flag names.
#[derive(Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConfigFile {
    pub log_level: Option<String>,
    pub broker: Option<Vec<String>>,
    pub client_id: Option<String>,
    pub topic_prefix: Option<String>,
    pub worker_dir: Option<PathBuf>,
    pub dispatch_addr: Option<String>,
    pub connect_timeout_secs: Option<u64>,
    pub pending_timeout_secs: Option<u64>,
    pub termination_grace_secs: Option<u64>,
}

// -----------------------------------------------------------------------
// Paths
// -----------------------------------------------------------------------

/// Return the relayd config directory.
///
/// Always uses XDG layout: `$XDG_CONFIG_HOME/relayd` or `~/.config/relayd`.
pub fn config_dir() -> PathBuf {
    if let Ok(xdg) = std::env::var("XDG_CONFIG_HOME") {
        return PathBuf::from(xdg).join("relayd");
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".config")
        .join("relayd")
}

/// Return the path to the default config file.
pub fn config_path() -> PathBuf {
    config_dir().join("config.toml")
}

// -----------------------------------------------------------------------
// Read
// -----------------------------------------------------------------------

/// Load and parse the config file at `path`.
pub fn load_config(path: &Path) -> Result<ConfigFile> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file at {}", path.display()))?;
    toml::from_str(&contents)
        .with_context(|| format!("failed to parse config file at {}", path.display()))
}

/// Load the explicitly requested file, or the default one if it exists.
fn load_file(explicit: Option<&Path>) -> Result<ConfigFile> {
    if let Some(path) = explicit {
        return load_config(path);
    }
    if let Some(path) = env_var("RELAYD_CONFIG") {
        return load_config(Path::new(&path));
    }
    let path = config_path();
    if path.exists() {
        load_config(&path)
    } else {
        Ok(ConfigFile::default())
    }
}

// -----------------------------------------------------------------------
// Log level
// -----------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

impl FromStr for LogLevel {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "trace" => Ok(LogLevel::Trace),
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => bail!("invalid log level {other:?}; expected trace, debug, info, warn or error"),
        }
    }
}

// -----------------------------------------------------------------------
// Resolved config
// -----------------------------------------------------------------------

/// Values given on the command line. `None` / empty means "not given".
#[derive(Debug, Default, Clone)]
pub struct CliOverrides {
    pub config: Option<PathBuf>,
    pub log_level: Option<String>,
    pub brokers: Vec<String>,
    pub client_id: Option<String>,
    pub worker_dir: Option<PathBuf>,
    pub dispatch_addr: Option<String>,
}

/// Fully resolved configuration, ready for use.
#[derive(Debug)]
pub struct Settings {
    pub log_level: LogLevel,
    pub brokers: Vec<String>,
    pub daemon: DaemonConfig,
}

impl Settings {
    /// Resolve configuration using the chain: CLI flag > env var > config file > default.
    ///
    /// - Brokers: `--broker` > `RELAYD_BROKER` (comma-separated) > `broker` > none
    /// - Client id: `--client-id` > `RELAYD_CLIENT_ID` > `client-id` > host name
    /// - Worker dir: `--worker-dir` > `RELAYD_WORKER_DIR` > `worker-dir` > [`DEFAULT_WORKER_DIR`]
    pub fn resolve(cli: &CliOverrides) -> Result<Self> {
        let file = load_file(cli.config.as_deref())?;

        let log_level = pick(cli.log_level.clone(), "RELAYD_LOG_LEVEL", file.log_level)
            .unwrap_or_else(|| "info".to_string())
            .parse::<LogLevel>()?;

        let brokers = if !cli.brokers.is_empty() {
            cli.brokers.clone()
        } else if let Some(list) = env_var("RELAYD_BROKER") {
            list.split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect()
        } else {
            file.broker.unwrap_or_default()
        };

        let client_id = match pick(cli.client_id.clone(), "RELAYD_CLIENT_ID", file.client_id) {
            Some(id) => id,
            None => relayd_core::facts::hostname()
                .context("no client id configured and the host name is unavailable")?,
        };

        let worker_dir = pick(
            cli.worker_dir.clone(),
            "RELAYD_WORKER_DIR",
            file.worker_dir,
        )
        .unwrap_or_else(|| PathBuf::from(DEFAULT_WORKER_DIR));

        let dispatch_addr: SocketAddr = pick(
            cli.dispatch_addr.clone(),
            "RELAYD_DISPATCH_ADDR",
            file.dispatch_addr,
        )
        .unwrap_or_else(|| DEFAULT_LISTEN_ADDR.to_string())
        .parse()
        .context("invalid dispatch address")?;

        let mut daemon = DaemonConfig::new(client_id, worker_dir);
        daemon.dispatcher.listen_addr = dispatch_addr;
        if let Some(prefix) = pick(None, "RELAYD_TOPIC_PREFIX", file.topic_prefix) {
            daemon.topic_prefix = prefix;
        }
        if let Some(t) = secs("RELAYD_CONNECT_TIMEOUT_SECS", file.connect_timeout_secs)? {
            daemon.connect_timeout = t;
        }
        if let Some(t) = secs("RELAYD_PENDING_TIMEOUT_SECS", file.pending_timeout_secs)? {
            daemon.dispatcher.pending_timeout = t;
        }
        if let Some(t) = secs("RELAYD_TERMINATION_GRACE_SECS", file.termination_grace_secs)? {
            daemon.termination_grace = t;
        }

        Ok(Self {
            log_level,
            brokers,
            daemon,
        })
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn pick<T: From<String>>(cli: Option<T>, env: &str, file: Option<T>) -> Option<T> {
    cli.or_else(|| env_var(env).map(T::from)).or(file)
}

fn secs(env: &str, file: Option<u64>) -> Result<Option<Duration>> {
    let value = match env_var(env) {
        Some(raw) => Some(
            raw.trim()
                .parse::<u64>()
                .with_context(|| format!("{env} must be a whole number of seconds"))?,
        ),
        None => file,
    };
    Ok(value.map(Duration::from_secs))
}

// -----------------------------------------------------------------------
// Tests
// -----------------------------------------------------------------------
