//! Work dispatcher and the local control surface workers talk to.
//!
//! Assignments are queued per worker name. A worker registers, long-polls
//! for its next assignment and posts the result back; the dispatcher turns
//! every assignment into exactly one `work-complete` event, whether the
//! worker answered, died, never showed up, or the queue was full.

mod routes;

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, OnceLock, PoisonError};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::bus::{Bus, Event, Subscription};
use crate::error::{DispatchError, NoWorkerError};
use crate::model::{Assignment, WorkCompletion, WorkOutcome};
use crate::process::ProcessExit;
use crate::recent::RecentIds;
use crate::token::TokenConfig;

pub use routes::AppError;

pub const DEFAULT_LISTEN_ADDR: &str = "127.0.0.1:7630";
pub const DEFAULT_PENDING_CAPACITY: usize = 64;
pub const DEFAULT_PENDING_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MAX_POLL_WAIT: Duration = Duration::from_secs(30);

/// How many finished assignment ids are remembered for duplicate detection.
const COMPLETED_MEMORY: usize = 4096;

/// Published on `dispatcher-listen` once the control surface is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenInfo {
    pub addr: SocketAddr,
    pub ready_at: Instant,
}

#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    pub listen_addr: SocketAddr,
    /// Per-worker queue bound.
    pub pending_capacity: usize,
    /// How long an assignment waits for an unregistered worker.
    pub pending_timeout: Duration,
    /// Upper bound on a single long poll.
    pub max_poll_wait: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7630)),
            pending_capacity: DEFAULT_PENDING_CAPACITY,
            pending_timeout: DEFAULT_PENDING_TIMEOUT,
            max_poll_wait: DEFAULT_MAX_POLL_WAIT,
        }
    }
}

/// Why a result submission was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ResultError {
    #[error("assignment {0} already has a result")]
    Duplicate(Uuid),

    #[error("assignment {id} is not outstanding for worker {worker:?}")]
    Unknown { id: Uuid, worker: String },
}

/// Why a poll was refused.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PollError {
    #[error("worker {0:?} is not registered")]
    NotRegistered(String),
}

/// Externally visible view of one worker slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkerSummary {
    pub name: String,
    pub registered: bool,
    pub registered_at: Option<DateTime<Utc>>,
    pub pid: Option<u32>,
    pub queued: usize,
    pub in_flight: usize,
}

// ---------------------------------------------------------------------------
// State
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
struct Registration {
    at: DateTime<Utc>,
    pid: Option<u32>,
}

struct Pending {
    assignment: Arc<Assignment>,
    queued_at: Instant,
}

struct WorkerSlot {
    registration: Option<Registration>,
    queue: VecDeque<Pending>,
    ready: Arc<Notify>,
}

impl WorkerSlot {
    fn new() -> Self {
        Self {
            registration: None,
            queue: VecDeque::new(),
            ready: Arc::new(Notify::new()),
        }
    }
}

struct DispatchState {
    accepting: bool,
    workers: HashMap<String, WorkerSlot>,
    /// Delivered to a worker, waiting for its result.
    in_flight: HashMap<Uuid, Arc<Assignment>>,
    completed: RecentIds,
}

impl DispatchState {
    /// Drop slots nobody can use: unregistered, nothing queued and nothing
    /// delivered. Broker input names workers freely, so slots for names
    /// that never register must not accumulate.
    fn prune_idle_slots(&mut self) {
        let busy: HashSet<&str> = self.in_flight.values().map(|a| a.worker.as_str()).collect();
        self.workers.retain(|name, slot| {
            slot.registration.is_some() || !slot.queue.is_empty() || busy.contains(name.as_str())
        });
    }
}

struct DispatcherInner {
    config: DispatcherConfig,
    bus: Bus,
    tokens: TokenConfig,
    state: Mutex<DispatchState>,
    shutdown: CancellationToken,
    local_addr: OnceLock<SocketAddr>,
}

/// Routes assignments to workers and tracks outstanding work.
///
/// Cheap to clone; clones share state. State is guarded by a plain mutex
/// that is never held across an await, and completions are emitted only
/// after it is released.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("local_addr", &self.inner.local_addr.get())
            .finish()
    }
}

enum Enqueued {
    Queued,
    Rejected(NoWorkerError),
}

impl Dispatcher {
    pub fn new(config: DispatcherConfig, bus: Bus, tokens: TokenConfig) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                config,
                bus,
                tokens,
                state: Mutex::new(DispatchState {
                    accepting: true,
                    workers: HashMap::new(),
                    in_flight: HashMap::new(),
                    completed: RecentIds::new(COMPLETED_MEMORY),
                }),
                shutdown: CancellationToken::new(),
                local_addr: OnceLock::new(),
            }),
        }
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub(crate) fn tokens(&self) -> &TokenConfig {
        &self.inner.tokens
    }

    /// Address the control surface is bound to, once listening.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.local_addr.get().copied()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, DispatchState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // -----------------------------------------------------------------------
    // Accept surface
    // -----------------------------------------------------------------------

    /// Bind the control surface, announce `dispatcher-listen`, and serve
    /// until [`stop`](Self::stop) is called.
    pub async fn listen_and_serve(&self) -> Result<(), DispatchError> {
        let addr = self.inner.config.listen_addr;
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| DispatchError::Bind { addr, source })?;
        let local = listener.local_addr().map_err(DispatchError::Serve)?;
        let _ = self.inner.local_addr.set(local);

        info!(addr = %local, "control surface listening");
        self.inner
            .bus
            .emit(Event::DispatcherListen(ListenInfo {
                addr: local,
                ready_at: Instant::now(),
            }))
            .await;

        let reaper = tokio::spawn(self.clone().run_reaper());

        let shutdown = self.inner.shutdown.clone();
        let served = axum::serve(listener, self.router())
            .with_graceful_shutdown(async move { shutdown.cancelled().await })
            .await;

        self.inner.shutdown.cancel();
        let _ = reaper.await;
        info!("control surface stopped");
        served.map_err(DispatchError::Serve)
    }

    /// The HTTP routes, without a listener. Used by `listen_and_serve` and
    /// by tests driving requests directly.
    pub fn router(&self) -> axum::Router {
        routes::build_router(self.clone())
    }

    /// Stop accepting work and shut the control surface down. Queued
    /// assignments are abandoned; later assignments are failed.
    pub fn stop(&self) {
        let abandoned = {
            let mut state = self.state();
            state.accepting = false;
            state.workers.values().map(|s| s.queue.len()).sum::<usize>()
        };
        if abandoned > 0 {
            warn!(abandoned, "dispatcher stopping with queued assignments");
        }
        self.inner.shutdown.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    async fn run_reaper(self) {
        let period = (self.inner.config.pending_timeout / 4)
            .clamp(Duration::from_millis(10), Duration::from_secs(1));
        let mut tick = tokio::time::interval(period);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = self.inner.shutdown.cancelled() => break,
                _ = tick.tick() => {
                    self.expire_pending().await;
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Signal handlers
    // -----------------------------------------------------------------------

    pub async fn handle_assignment_create_signal(&self, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            if let Event::AssignmentCreate(assignment) = event {
                self.dispatch(assignment).await;
            }
        }
        debug!("assignment-create subscription closed");
    }

    pub async fn handle_process_die_signal(&self, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            if let Event::ProcessDie(exit) = event {
                self.worker_died(&exit).await;
            }
        }
        debug!("process-die subscription closed");
    }

    /// Queue `assignment` for its worker, or fail it right away.
    pub async fn dispatch(&self, assignment: Arc<Assignment>) {
        match self.enqueue(Arc::clone(&assignment)) {
            Enqueued::Queued => {
                debug!(
                    assignment_id = %assignment.id,
                    worker = %assignment.worker,
                    "assignment queued"
                );
            }
            Enqueued::Rejected(err) => {
                warn!(assignment_id = %assignment.id, error = %err, "assignment rejected");
                self.emit_completion(WorkCompletion::failed(&assignment, err.to_string()))
                    .await;
            }
        }
    }

    fn enqueue(&self, assignment: Arc<Assignment>) -> Enqueued {
        let capacity = self.inner.config.pending_capacity;
        let mut state = self.state();
        if !state.accepting {
            return Enqueued::Rejected(NoWorkerError::ShuttingDown);
        }
        let slot = state
            .workers
            .entry(assignment.worker.clone())
            .or_insert_with(WorkerSlot::new);
        if slot.queue.len() >= capacity {
            return Enqueued::Rejected(NoWorkerError::QueueFull {
                worker: assignment.worker.clone(),
                capacity,
            });
        }
        slot.queue.push_back(Pending {
            assignment,
            queued_at: Instant::now(),
        });
        slot.ready.notify_one();
        Enqueued::Queued
    }

    /// Fail every outstanding assignment of a worker that exited.
    pub async fn worker_died(&self, exit: &ProcessExit) {
        let failed: Vec<Arc<Assignment>> = {
            let mut state = self.state();
            let mut failed = Vec::new();
            if let Some(slot) = state.workers.get_mut(&exit.worker) {
                slot.registration = None;
                failed.extend(slot.queue.drain(..).map(|p| p.assignment));
            }
            let delivered: Vec<Uuid> = state
                .in_flight
                .iter()
                .filter(|(_, a)| a.worker == exit.worker)
                .map(|(id, _)| *id)
                .collect();
            for id in delivered {
                if let Some(assignment) = state.in_flight.remove(&id) {
                    failed.push(assignment);
                }
            }
            for assignment in &failed {
                state.completed.insert(assignment.id);
            }
            state.prune_idle_slots();
            failed
        };

        warn!(
            worker = %exit.worker,
            status = %exit.status,
            outstanding = failed.len(),
            "worker died"
        );
        let reason = format!("worker {} exited ({})", exit.worker, exit.status);
        for assignment in failed {
            self.emit_completion(WorkCompletion::failed(&assignment, reason.clone()))
                .await;
        }
    }

    /// Fail assignments that waited too long for an unregistered worker.
    /// Returns how many were expired.
    pub async fn expire_pending(&self) -> usize {
        let timeout = self.inner.config.pending_timeout;
        let expired: Vec<(Arc<Assignment>, NoWorkerError)> = {
            let mut state = self.state();
            let mut expired = Vec::new();
            for (name, slot) in state.workers.iter_mut() {
                if slot.registration.is_some() {
                    continue;
                }
                while slot
                    .queue
                    .front()
                    .is_some_and(|p| p.queued_at.elapsed() >= timeout)
                {
                    if let Some(pending) = slot.queue.pop_front() {
                        expired.push((
                            pending.assignment,
                            NoWorkerError::Timeout {
                                worker: name.clone(),
                                waited: timeout,
                            },
                        ));
                    }
                }
            }
            for (assignment, _) in &expired {
                state.completed.insert(assignment.id);
            }
            state.prune_idle_slots();
            expired
        };

        let count = expired.len();
        for (assignment, err) in expired {
            warn!(assignment_id = %assignment.id, error = %err, "assignment expired");
            self.emit_completion(WorkCompletion::failed(&assignment, err.to_string()))
                .await;
        }
        count
    }

    async fn emit_completion(&self, completion: WorkCompletion) {
        self.inner
            .bus
            .emit(Event::WorkComplete(Arc::new(completion)))
            .await;
    }

    // -----------------------------------------------------------------------
    // Worker operations
    // -----------------------------------------------------------------------

    /// Mark `worker` ready to receive assignments. Returns its queue depth.
    pub fn register(&self, worker: &str, pid: Option<u32>) -> usize {
        let mut state = self.state();
        let slot = state
            .workers
            .entry(worker.to_string())
            .or_insert_with(WorkerSlot::new);
        slot.registration = Some(Registration {
            at: Utc::now(),
            pid,
        });
        let queued = slot.queue.len();
        if queued > 0 {
            slot.ready.notify_one();
        }
        info!(worker, ?pid, queued, "worker registered");
        queued
    }

    /// Take the next assignment for `worker`, waiting up to `wait` for one
    /// to arrive. `Ok(None)` means nothing arrived in time.
    pub async fn next_assignment(
        &self,
        worker: &str,
        wait: Duration,
    ) -> Result<Option<Arc<Assignment>>, PollError> {
        let wait = wait.min(self.inner.config.max_poll_wait);
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            let ready = {
                let mut guard = self.state();
                let state = &mut *guard;
                let Some(slot) = state
                    .workers
                    .get_mut(worker)
                    .filter(|s| s.registration.is_some())
                else {
                    return Err(PollError::NotRegistered(worker.to_string()));
                };
                if let Some(pending) = slot.queue.pop_front() {
                    let assignment = pending.assignment;
                    state
                        .in_flight
                        .insert(assignment.id, Arc::clone(&assignment));
                    debug!(assignment_id = %assignment.id, worker, "assignment delivered");
                    return Ok(Some(assignment));
                }
                Arc::clone(&slot.ready)
            };

            tokio::select! {
                _ = ready.notified() => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
                _ = self.inner.shutdown.cancelled() => return Ok(None),
            }
        }
    }

    /// Record `worker`'s result for assignment `id` and publish exactly one
    /// completion for it.
    pub async fn submit_result(
        &self,
        worker: &str,
        id: Uuid,
        outcome: WorkOutcome,
    ) -> Result<(), ResultError> {
        let assignment = {
            let mut state = self.state();
            match state.in_flight.get(&id) {
                Some(a) if a.worker == worker => {}
                _ if state.completed.contains(&id) => return Err(ResultError::Duplicate(id)),
                _ => {
                    return Err(ResultError::Unknown {
                        id,
                        worker: worker.to_string(),
                    });
                }
            }
            let assignment = state.in_flight.remove(&id);
            state.completed.insert(id);
            assignment
        };

        if let Some(assignment) = assignment {
            debug!(
                assignment_id = %id,
                worker,
                success = outcome.is_success(),
                "result received"
            );
            self.emit_completion(WorkCompletion::new(&assignment, outcome))
                .await;
        }
        Ok(())
    }

    /// Queue work submitted through the control surface.
    pub fn submit_local(&self, assignment: Assignment) -> Result<Arc<Assignment>, NoWorkerError> {
        let assignment = Arc::new(assignment);
        match self.enqueue(Arc::clone(&assignment)) {
            Enqueued::Queued => Ok(assignment),
            Enqueued::Rejected(err) => Err(err),
        }
    }

    /// Every known worker slot, sorted by name.
    pub fn workers(&self) -> Vec<WorkerSummary> {
        let state = self.state();
        let mut list: Vec<WorkerSummary> = state
            .workers
            .iter()
            .map(|(name, slot)| WorkerSummary {
                name: name.clone(),
                registered: slot.registration.is_some(),
                registered_at: slot.registration.map(|r| r.at),
                pid: slot.registration.and_then(|r| r.pid),
                queued: slot.queue.len(),
                in_flight: state
                    .in_flight
                    .values()
                    .filter(|a| &a.worker == name)
                    .count(),
            })
            .collect();
        list.sort_by(|a, b| a.name.cmp(&b.name));
        list
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
