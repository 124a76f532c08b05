//! Named, fan-out signal bus connecting the daemon's components.
//!
//! Components never call each other directly. A component publishes an
//! [`Event`] and every current subscriber of the event's [`Signal`] receives
//! its own clone, in publish order.
//!
//! ```text
//! ProcessManager --process-die-------> Dispatcher
//! MessageRouter  --message-recv------> PayloadProcessor
//! Processor      --assignment-create-> Dispatcher
//! Dispatcher     --work-complete-----> PayloadProcessor
//! Processor      --assignment-return-> MessageRouter
//! Dispatcher     --dispatcher-listen-> bootstrap routine
//! ProcessManager --process-bootstrap-> router connect routine
//! ```
//!
//! # Buffering
//!
//! Each subscription owns a bounded channel ([`DEFAULT_CAPACITY`] by
//! default). A publisher waits while a subscriber's buffer is full, so
//! nothing is lost under normal load and a stalled subscriber shows up as a
//! stalled publisher. Publishing to a signal with no subscribers drops the
//! value immediately; subscribers must connect before the publish they care
//! about.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc;
use tracing::trace;

use crate::dispatch::ListenInfo;
use crate::model::{Assignment, InboundMessage, OutboundMessage, WorkCompletion};
use crate::process::{BootstrapReport, ProcessExit};

/// Per-subscriber buffer size.
pub const DEFAULT_CAPACITY: usize = 64;

/// Name of a fan-out channel on the bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Signal {
    /// Workers have been launched.
    ProcessBootstrap,
    /// A supervised worker exited without being asked to.
    ProcessDie,
    /// The dispatcher's control surface is accepting connections.
    DispatcherListen,
    /// The broker delivered a message.
    MessageRecv,
    /// A new assignment needs dispatching.
    AssignmentCreate,
    /// An assignment finished, successfully or not.
    WorkComplete,
    /// A translated result is ready to go back to the broker.
    AssignmentReturn,
}

impl Signal {
    pub const ALL: [Signal; 7] = [
        Signal::ProcessBootstrap,
        Signal::ProcessDie,
        Signal::DispatcherListen,
        Signal::MessageRecv,
        Signal::AssignmentCreate,
        Signal::WorkComplete,
        Signal::AssignmentReturn,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Signal::ProcessBootstrap => "process-bootstrap",
            Signal::ProcessDie => "process-die",
            Signal::DispatcherListen => "dispatcher-listen",
            Signal::MessageRecv => "message-recv",
            Signal::AssignmentCreate => "assignment-create",
            Signal::WorkComplete => "work-complete",
            Signal::AssignmentReturn => "assignment-return",
        }
    }
}

impl fmt::Display for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A value published on the bus.
///
/// Every variant belongs to exactly one [`Signal`], so an event cannot be
/// published under the wrong name.
#[derive(Debug, Clone)]
pub enum Event {
    ProcessBootstrap(Arc<BootstrapReport>),
    ProcessDie(Arc<ProcessExit>),
    DispatcherListen(ListenInfo),
    MessageRecv(Arc<InboundMessage>),
    AssignmentCreate(Arc<Assignment>),
    WorkComplete(Arc<WorkCompletion>),
    AssignmentReturn(Arc<OutboundMessage>),
}

impl Event {
    pub fn signal(&self) -> Signal {
        match self {
            Event::ProcessBootstrap(_) => Signal::ProcessBootstrap,
            Event::ProcessDie(_) => Signal::ProcessDie,
            Event::DispatcherListen(_) => Signal::DispatcherListen,
            Event::MessageRecv(_) => Signal::MessageRecv,
            Event::AssignmentCreate(_) => Signal::AssignmentCreate,
            Event::WorkComplete(_) => Signal::WorkComplete,
            Event::AssignmentReturn(_) => Signal::AssignmentReturn,
        }
    }
}

/// Receive side of one subscription.
///
/// Owned by whichever task called [`Bus::connect`]. `recv` returns `None`
/// once the bus is closed and the buffer is drained.
#[derive(Debug)]
pub struct Subscription {
    signal: Signal,
    rx: mpsc::Receiver<Event>,
}

impl Subscription {
    pub fn signal(&self) -> Signal {
        self.signal
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.rx.recv().await
    }

    /// Non-blocking receive; `None` when nothing is buffered.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }
}

struct BusInner {
    capacity: usize,
    closed: AtomicBool,
    subscribers: Mutex<HashMap<Signal, Vec<mpsc::Sender<Event>>>>,
}

/// The signal registry. Cheap to clone; all clones share one registry.
#[derive(Clone)]
pub struct Bus {
    inner: Arc<BusInner>,
}

impl Bus {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create a bus whose subscriptions buffer `capacity` events each
    /// (clamped to at least 1).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(BusInner {
                capacity: capacity.max(1),
                closed: AtomicBool::new(false),
                subscribers: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Register interest in `signal` and get a dedicated delivery channel.
    ///
    /// The subscription sees every event emitted after this call returns.
    pub fn connect(&self, signal: Signal) -> Subscription {
        let (tx, rx) = mpsc::channel(self.inner.capacity);
        if !self.inner.closed.load(Ordering::Acquire) {
            self.registry().entry(signal).or_default().push(tx);
        }
        Subscription { signal, rx }
    }

    /// Fan `event` out to every current subscriber of its signal.
    ///
    /// Subscribers are snapshotted under the registry lock and then sent to
    /// with the lock released, so a slow subscriber never blocks `connect`.
    pub async fn emit(&self, event: Event) {
        let signal = event.signal();
        let senders = self.registry().get(&signal).cloned().unwrap_or_default();

        if senders.is_empty() {
            trace!(%signal, "no subscribers, dropping event");
            return;
        }

        let mut saw_closed = false;
        for tx in &senders {
            if tx.send(event.clone()).await.is_err() {
                saw_closed = true;
            }
        }

        if saw_closed {
            if let Some(list) = self.registry().get_mut(&signal) {
                list.retain(|tx| !tx.is_closed());
            }
        }
    }

    pub fn subscriber_count(&self, signal: Signal) -> usize {
        self.registry()
            .get(&signal)
            .map(|list| list.iter().filter(|tx| !tx.is_closed()).count())
            .unwrap_or(0)
    }

    /// Tear the bus down: every subscription drains and then yields `None`.
    /// Later `connect` calls return already-closed subscriptions.
    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.registry().clear();
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<Signal, Vec<mpsc::Sender<Event>>>> {
        self.inner
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for Bus {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Bus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let counts: Vec<(&'static str, usize)> = Signal::ALL
            .iter()
            .map(|s| (s.name(), self.subscriber_count(*s)))
            .filter(|(_, n)| *n > 0)
            .collect();
        f.debug_struct("Bus")
            .field("capacity", &self.inner.capacity)
            .field("subscribers", &counts)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn inbound(n: usize) -> Event {
        Event::MessageRecv(Arc::new(InboundMessage {
            topic: "t".to_string(),
            payload: n.to_string().into_bytes(),
        }))
    }

    fn payload_of(event: Event) -> String {
        match event {
            Event::MessageRecv(msg) => String::from_utf8(msg.payload.clone()).unwrap(),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn every_event_maps_to_its_signal_name() {
        let names: Vec<&str> = Signal::ALL.iter().map(|s| s.name()).collect();
        assert_eq!(
            names,
            vec![
                "process-bootstrap",
                "process-die",
                "dispatcher-listen",
                "message-recv",
                "assignment-create",
                "work-complete",
                "assignment-return",
            ]
        );
        assert_eq!(inbound(1).signal(), Signal::MessageRecv);
    }

    #[tokio::test]
    async fn connect_twice_yields_independent_channels() {
        let bus = Bus::new();
        let mut a = bus.connect(Signal::MessageRecv);
        let mut b = bus.connect(Signal::MessageRecv);
        assert_eq!(bus.subscriber_count(Signal::MessageRecv), 2);

        bus.emit(inbound(7)).await;

        assert_eq!(payload_of(a.recv().await.unwrap()), "7");
        assert_eq!(payload_of(b.recv().await.unwrap()), "7");
        assert!(a.try_recv().is_none());
    }

    #[tokio::test]
    async fn dropped_subscribers_are_pruned() {
        let bus = Bus::new();
        let keep = bus.connect(Signal::MessageRecv);
        drop(bus.connect(Signal::MessageRecv));

        bus.emit(inbound(1)).await;
        assert_eq!(bus.subscriber_count(Signal::MessageRecv), 1);
        drop(keep);
    }

    #[tokio::test]
    async fn close_ends_subscriptions() {
        let bus = Bus::new();
        let mut sub = bus.connect(Signal::WorkComplete);
        bus.close();
        assert!(sub.recv().await.is_none());

        let mut late = bus.connect(Signal::WorkComplete);
        assert!(late.recv().await.is_none());
        assert!(bus.is_closed());
    }

    #[tokio::test]
    async fn emit_without_subscribers_returns_immediately() {
        let bus = Bus::new();
        let _other = bus.connect(Signal::WorkComplete);
        for n in 0..(DEFAULT_CAPACITY * 2) {
            tokio::time::timeout(Duration::from_millis(100), bus.emit(inbound(n)))
                .await
                .expect("emit blocked with no subscribers");
        }
    }

    #[tokio::test]
    async fn full_buffer_blocks_publisher_until_drained() {
        let bus = Bus::new();
        let mut sub = bus.connect(Signal::MessageRecv);
        for n in 0..DEFAULT_CAPACITY {
            bus.emit(inbound(n)).await;
        }

        let overflow = tokio::time::timeout(
            Duration::from_millis(50),
            bus.emit(inbound(DEFAULT_CAPACITY)),
        )
        .await;
        assert!(overflow.is_err(), "emit into a full buffer did not wait");

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move { bus.emit(inbound(DEFAULT_CAPACITY)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!publisher.is_finished());

        assert_eq!(payload_of(sub.recv().await.unwrap()), "0");
        tokio::time::timeout(Duration::from_secs(1), publisher)
            .await
            .expect("publisher still blocked after a drain")
            .unwrap();
    }

    #[tokio::test]
    async fn every_subscriber_sees_each_event_once_in_order() {
        let bus = Bus::new();
        let mut subs: Vec<Subscription> =
            (0..3).map(|_| bus.connect(Signal::MessageRecv)).collect();
        for n in 0..10 {
            bus.emit(inbound(n)).await;
        }

        let expected: Vec<String> = (0..10).map(|n| n.to_string()).collect();
        for sub in &mut subs {
            let mut got = Vec::new();
            while let Some(event) = sub.try_recv() {
                got.push(payload_of(event));
            }
            assert_eq!(got, expected);
        }
    }

    #[test]
    fn capacity_is_clamped() {
        let bus = Bus::with_capacity(0);
        assert_eq!(bus.inner.capacity, 1);
    }
}
