mod config;
mod docs;
mod signals;
#[cfg(test)]
mod test_util;

use std::path::PathBuf;

use anyhow::Context;
use clap::{CommandFactory, Parser};
use clap_complete::Shell;
use tracing::{error, info};

use relayd_core::Daemon;
use relayd_core::router::create_broker;

use config::{CliOverrides, LogLevel, Settings};
use signals::ShutdownSignals;

#[derive(Parser, Debug)]
#[command(
    name = "relayd",
    version,
    about = "Host agent bridging a message broker and local worker processes"
)]
struct Cli {
    /// Path to the TOML config file (default: ~/.config/relayd/config.toml)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error (RUST_LOG wins when set)
    #[arg(long, value_name = "LEVEL")]
    log_level: Option<String>,

    /// Broker address, e.g. nats://broker.example:4222 or memory://local
    #[arg(long = "broker", value_name = "URL", action = clap::ArgAction::Append)]
    brokers: Vec<String>,

    /// Identity used in broker topics and the handshake (default: host name)
    #[arg(long, value_name = "ID")]
    client_id: Option<String>,

    /// Directory whose executables are launched as workers
    #[arg(long, value_name = "DIR")]
    worker_dir: Option<PathBuf>,

    /// Loopback address of the worker control surface
    #[arg(long, value_name = "ADDR")]
    dispatch_addr: Option<String>,

    #[arg(long, hide = true)]
    generate_man_page: bool,

    #[arg(long, hide = true, conflicts_with = "generate_man_page")]
    generate_markdown: bool,

    #[arg(long, hide = true, value_name = "SHELL")]
    generate_completion: Option<Shell>,
}

impl Cli {
    fn overrides(&self) -> CliOverrides {
        CliOverrides {
            config: self.config.clone(),
            log_level: self.log_level.clone(),
            brokers: self.brokers.clone(),
            client_id: self.client_id.clone(),
            worker_dir: self.worker_dir.clone(),
            dispatch_addr: self.dispatch_addr.clone(),
        }
    }
}

/// What this invocation produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum OutputMode {
    ManPage,
    Markdown,
    Completion(Shell),
    Daemon,
}

impl OutputMode {
    fn from_cli(cli: &Cli) -> Self {
        if cli.generate_man_page {
            OutputMode::ManPage
        } else if cli.generate_markdown {
            OutputMode::Markdown
        } else if let Some(shell) = cli.generate_completion {
            OutputMode::Completion(shell)
        } else {
            OutputMode::Daemon
        }
    }
}

fn init_tracing(level: LogLevel) {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level.as_str())),
        )
        .with_writer(std::io::stderr)
        .init();
}

/// Run the daemon until a signal or a fatal error. Returns the exit code.
async fn run_daemon(settings: Settings) -> anyhow::Result<i32> {
    let mut signals = ShutdownSignals::install().context("failed to install signal handlers")?;
    let broker = create_broker(&settings.brokers).context("invalid broker configuration")?;

    info!(
        client_id = %settings.daemon.client_id,
        worker_dir = %settings.daemon.worker_dir.display(),
        brokers = ?settings.brokers,
        "starting relayd"
    );
    let daemon = Daemon::new(settings.daemon, broker);
    let handle = daemon.handle();
    daemon.start();

    let report = tokio::select! {
        report = daemon.wait() => report,
        signal = signals.recv() => {
            info!(signal, "termination signal received");
            handle.terminate();
            daemon.wait().await
        }
    };

    if let Some(cause) = &report.cause {
        error!(error = %cause, "relayd stopped on a fatal error");
    }
    if let Some(err) = &report.error {
        error!(error = %err, "some workers could not be terminated");
    }
    Ok(report.exit_code())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match OutputMode::from_cli(&cli) {
        OutputMode::ManPage => {
            print!("{}", docs::man_page(&Cli::command()));
            return Ok(());
        }
        OutputMode::Markdown => {
            print!("{}", docs::markdown(&Cli::command()));
            return Ok(());
        }
        OutputMode::Completion(shell) => {
            clap_complete::generate(shell, &mut Cli::command(), "relayd", &mut std::io::stdout());
            return Ok(());
        }
        OutputMode::Daemon => {}
    }

    let settings = match Settings::resolve(&cli.overrides()) {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("relayd: {e:#}");
            std::process::exit(1);
        }
    };
    init_tracing(settings.log_level);

    match run_daemon(settings).await {
        Ok(0) => Ok(()),
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!("relayd: {e:#}");
            std::process::exit(1);
        }
    }
}
