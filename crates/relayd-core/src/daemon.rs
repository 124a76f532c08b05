//! Startup and shutdown choreography.
//!
//! ```text
//! dispatcher task ──listen_and_serve──► dispatcher-listen
//!                                             │
//! bootstrap task  ◄───────────────────────────┘
//!     bootstrap_workers ──► process-bootstrap
//!                                  │
//! router task     ◄────────────────┘
//!     connect_client ─► announce ─► subscribe
//! ```
//!
//! Every subscription is created before any task is spawned, so no gating
//! event can be published into an empty signal. A fatal error on any path
//! fires the shared [`ShutdownTrigger`]; [`Daemon::wait`] then runs exactly
//! one shutdown sequence no matter how many callers or triggers race.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::OnceCell;
use tokio::task::JoinHandle;
use tracing::{Instrument, info, info_span, warn};

use crate::bus::{Bus, DEFAULT_CAPACITY, Event, Signal, Subscription};
use crate::dispatch::{Dispatcher, DispatcherConfig, ListenInfo};
use crate::error::{DaemonError, DispatchError, ShutdownError};
use crate::facts::CanonicalFacts;
use crate::payload::PayloadProcessor;
use crate::process::{DEFAULT_TERMINATION_GRACE, ProcessManager};
use crate::router::{
    Broker, DEFAULT_CONNECT_TIMEOUT, DEFAULT_TOPIC_PREFIX, MessageRouter, Topics,
};
use crate::shutdown::ShutdownTrigger;
use crate::token::TokenConfig;

/// Everything the daemon needs, resolved by the caller.
#[derive(Debug, Clone)]
pub struct DaemonConfig {
    pub client_id: String,
    pub topic_prefix: String,
    pub worker_dir: PathBuf,
    pub dispatcher: DispatcherConfig,
    pub connect_timeout: Duration,
    pub termination_grace: Duration,
    pub bus_capacity: usize,
}

impl DaemonConfig {
    pub fn new(client_id: impl Into<String>, worker_dir: impl Into<PathBuf>) -> Self {
        Self {
            client_id: client_id.into(),
            topic_prefix: DEFAULT_TOPIC_PREFIX.to_string(),
            worker_dir: worker_dir.into(),
            dispatcher: DispatcherConfig::default(),
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            termination_grace: DEFAULT_TERMINATION_GRACE,
            bus_capacity: DEFAULT_CAPACITY,
        }
    }
}

/// Outcome of the one shutdown sequence.
#[derive(Debug)]
pub struct ShutdownReport {
    /// The first fatal error, if shutdown was error-triggered.
    pub cause: Option<DaemonError>,
    /// Workers terminated during shutdown.
    pub terminated: usize,
    /// Workers that could not be terminated.
    pub error: Option<ShutdownError>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.cause.is_none() && self.error.is_none()
    }

    pub fn exit_code(&self) -> i32 {
        if self.is_clean() { 0 } else { 1 }
    }
}

/// Cloneable remote control for a running daemon.
#[derive(Debug, Clone)]
pub struct DaemonHandle {
    trigger: ShutdownTrigger,
}

impl DaemonHandle {
    /// Request a clean shutdown (the OS signal path).
    pub fn terminate(&self) {
        self.trigger.terminate();
    }

    /// Report a fatal error from outside the core.
    pub fn fail(&self, err: DaemonError) {
        self.trigger.fire(err);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.trigger.is_triggered()
    }
}

struct DaemonInner {
    config: DaemonConfig,
    bus: Bus,
    trigger: ShutdownTrigger,
    processes: ProcessManager,
    dispatcher: Dispatcher,
    router: MessageRouter,
    processor: Arc<PayloadProcessor>,
    started: AtomicBool,
    /// Startup tasks that may still be launching workers or connecting.
    startup: Mutex<Vec<JoinHandle<()>>>,
    /// Signal handler loops; they end when the bus closes.
    handlers: Mutex<Vec<JoinHandle<()>>>,
    report: OnceCell<Arc<ShutdownReport>>,
}

#[derive(Clone)]
pub struct Daemon {
    inner: Arc<DaemonInner>,
}

impl std::fmt::Debug for Daemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Daemon")
            .field("client_id", &self.inner.config.client_id)
            .field("started", &self.inner.started.load(Ordering::Relaxed))
            .finish()
    }
}

impl Daemon {
    /// Build the bus and every component. Nothing runs until [`start`](Self::start).
    pub fn new(config: DaemonConfig, broker: Arc<dyn Broker>) -> Self {
        let bus = Bus::with_capacity(config.bus_capacity);
        let tokens = TokenConfig::generate();
        let trigger = ShutdownTrigger::new();

        let processes = ProcessManager::with_termination_grace(
            bus.clone(),
            tokens.clone(),
            config.termination_grace,
        );
        let dispatcher = Dispatcher::new(config.dispatcher.clone(), bus.clone(), tokens);
        let router = MessageRouter::new(
            broker,
            bus.clone(),
            Topics::new(&config.topic_prefix, &config.client_id),
            config.connect_timeout,
        );
        let processor = Arc::new(PayloadProcessor::new(bus.clone()));

        Self {
            inner: Arc::new(DaemonInner {
                config,
                bus,
                trigger,
                processes,
                dispatcher,
                router,
                processor,
                started: AtomicBool::new(false),
                startup: Mutex::new(Vec::new()),
                handlers: Mutex::new(Vec::new()),
                report: OnceCell::new(),
            }),
        }
    }

    pub fn handle(&self) -> DaemonHandle {
        DaemonHandle {
            trigger: self.inner.trigger.clone(),
        }
    }

    pub fn bus(&self) -> &Bus {
        &self.inner.bus
    }

    pub fn process_manager(&self) -> &ProcessManager {
        &self.inner.processes
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.inner.dispatcher
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    /// Wire every signal pairing and spawn the startup chain. Calling it a
    /// second time does nothing.
    pub fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("daemon already started");
            return;
        }
        let inner = &self.inner;
        let bus = &inner.bus;

        // Subscriptions first, tasks second.
        let process_die = bus.connect(Signal::ProcessDie);
        let message_recv = bus.connect(Signal::MessageRecv);
        let assignment_create = bus.connect(Signal::AssignmentCreate);
        let work_complete = bus.connect(Signal::WorkComplete);
        let assignment_return = bus.connect(Signal::AssignmentReturn);
        let listen_ready = bus.connect(Signal::DispatcherListen);
        let bootstrapped = bus.connect(Signal::ProcessBootstrap);

        let mut handlers = Vec::new();
        {
            let dispatcher = inner.dispatcher.clone();
            handlers.push(tokio::spawn(
                async move { dispatcher.handle_process_die_signal(process_die).await }
                    .instrument(info_span!("dispatcher_routine", signal = "process-die")),
            ));
        }
        {
            let processor = Arc::clone(&inner.processor);
            handlers.push(tokio::spawn(
                async move { processor.handle_message_recv_signal(message_recv).await }
                    .instrument(info_span!("payload_processor_routine", signal = "message-recv")),
            ));
        }
        {
            let dispatcher = inner.dispatcher.clone();
            handlers.push(tokio::spawn(
                async move {
                    dispatcher
                        .handle_assignment_create_signal(assignment_create)
                        .await
                }
                .instrument(info_span!("dispatcher_routine", signal = "assignment-create")),
            ));
        }
        {
            let processor = Arc::clone(&inner.processor);
            handlers.push(tokio::spawn(
                async move { processor.handle_work_complete_signal(work_complete).await }
                    .instrument(info_span!("payload_processor_routine", signal = "work-complete")),
            ));
        }
        {
            let router = inner.router.clone();
            handlers.push(tokio::spawn(
                async move { router.handle_assignment_return_signal(assignment_return).await }
                    .instrument(info_span!(
                        "message_router_routine",
                        signal = "assignment-return"
                    )),
            ));
        }
        handlers.push(tokio::spawn(
            serve(inner.dispatcher.clone(), inner.trigger.clone())
                .instrument(info_span!("dispatcher_routine", step = "listen")),
        ));

        let startup = vec![
            tokio::spawn(
                bootstrap(
                    inner.processes.clone(),
                    inner.config.worker_dir.clone(),
                    listen_ready,
                    inner.trigger.clone(),
                )
                .instrument(info_span!("process_manager_routine")),
            ),
            tokio::spawn(
                connect_router(
                    inner.router.clone(),
                    inner.config.client_id.clone(),
                    bootstrapped,
                    inner.trigger.clone(),
                )
                .instrument(info_span!("message_router_routine", step = "connect")),
            ),
        ];

        *lock(&inner.handlers) = handlers;
        *lock(&inner.startup) = startup;
        info!(client_id = %inner.config.client_id, "daemon started");
    }

    /// Block until shutdown is requested, then run the shutdown sequence.
    ///
    /// Concurrent and repeated callers all receive the report of the single
    /// sequence that ran.
    pub async fn wait(&self) -> Arc<ShutdownReport> {
        self.inner.trigger.triggered().await;
        self.inner
            .report
            .get_or_init(|| self.shutdown())
            .await
            .clone()
    }

    async fn shutdown(&self) -> Arc<ShutdownReport> {
        let inner = &self.inner;
        info!("shutting down");

        // Nothing may launch or connect once teardown begins.
        let startup = std::mem::take(&mut *lock(&inner.startup));
        for task in &startup {
            task.abort();
        }
        for task in startup {
            let _ = task.await;
        }

        inner.dispatcher.stop();
        inner.router.disconnect().await;

        let (terminated, error) = match inner.processes.kill_all_workers().await {
            Ok(n) => (n, None),
            Err(e) => {
                warn!(error = %e, "worker termination incomplete");
                (0, Some(e))
            }
        };

        inner.bus.close();
        let handlers = std::mem::take(&mut *lock(&inner.handlers));
        for mut task in handlers {
            if tokio::time::timeout(Duration::from_secs(1), &mut task)
                .await
                .is_err()
            {
                warn!("signal handler did not finish after bus close");
                task.abort();
            }
        }

        let report = ShutdownReport {
            cause: inner.trigger.take_cause(),
            terminated,
            error,
        };
        match &report.cause {
            Some(cause) => warn!(error = %cause, terminated, "daemon stopped on error"),
            None => info!(terminated, "daemon stopped"),
        }
        Arc::new(report)
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

// ---------------------------------------------------------------------------
// Startup routines
// ---------------------------------------------------------------------------

async fn serve(dispatcher: Dispatcher, trigger: ShutdownTrigger) {
    match dispatcher.listen_and_serve().await {
        Err(e) => trigger.fire(e.into()),
        Ok(()) if !trigger.is_triggered() => trigger.fire(DaemonError::Dispatch(
            DispatchError::Serve(std::io::Error::other("control surface stopped unexpectedly")),
        )),
        Ok(()) => {}
    }
}

/// Wait for the first event on `sub`, or `None` if shutdown came first.
async fn gate(sub: &mut Subscription, trigger: &ShutdownTrigger) -> Option<Event> {
    tokio::select! {
        event = sub.recv() => event,
        _ = trigger.triggered() => None,
    }
}

async fn bootstrap(
    processes: ProcessManager,
    worker_dir: PathBuf,
    mut listen_ready: Subscription,
    trigger: ShutdownTrigger,
) {
    let Some(Event::DispatcherListen(ListenInfo { addr, .. })) =
        gate(&mut listen_ready, &trigger).await
    else {
        return;
    };
    drop(listen_ready);

    if let Err(e) = processes.bootstrap_workers(&worker_dir, addr).await {
        trigger.fire(e.into());
    }
}

async fn connect_router(
    router: MessageRouter,
    client_id: String,
    mut bootstrapped: Subscription,
    trigger: ShutdownTrigger,
) {
    let Some(Event::ProcessBootstrap(_)) = gate(&mut bootstrapped, &trigger).await else {
        return;
    };
    drop(bootstrapped);

    if let Err(e) = start_router(&router, &client_id, &trigger).await {
        trigger.fire(e);
    }
}

async fn start_router(
    router: &MessageRouter,
    client_id: &str,
    trigger: &ShutdownTrigger,
) -> Result<(), DaemonError> {
    router.connect_client().await?;
    let facts = CanonicalFacts::collect(client_id)?;
    router.announce(&facts).await?;
    router.subscribe(trigger.clone()).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_code_reflects_cause_and_shutdown_error() {
        let clean = ShutdownReport {
            cause: None,
            terminated: 2,
            error: None,
        };
        assert_eq!(clean.exit_code(), 0);

        let failed = ShutdownReport {
            cause: Some(DaemonError::Receive("boom".into())),
            terminated: 0,
            error: None,
        };
        assert_eq!(failed.exit_code(), 1);

        let stuck = ShutdownReport {
            cause: None,
            terminated: 0,
            error: Some(ShutdownError::Workers(vec![("w".into(), "alive".into())])),
        };
        assert_eq!(stuck.exit_code(), 1);
    }

    #[test]
    fn config_defaults() {
        let config = DaemonConfig::new("host-1", "/tmp/w");
        assert_eq!(config.topic_prefix, "relayd");
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.termination_grace, Duration::from_secs(5));
        assert_eq!(config.bus_capacity, 64);
        assert_eq!(config.dispatcher.pending_capacity, 64);
    }
}
