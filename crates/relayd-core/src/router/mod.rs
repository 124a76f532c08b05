//! Broker-facing message router.
//!
//! Owns the broker connection and its state machine:
//!
//! ```text
//! Disconnected --connect_client--> Connecting --ok--> Connected --subscribe--> Subscribed
//!       ^                              |                                          |
//!       +-------- error / timeout -----+------------ receive failure -------------+
//! ```
//!
//! Inbound messages become `message-recv` events; `assignment-return`
//! events are published on the outbound topic.

mod broker;
mod memory;
mod nats;

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use futures::StreamExt;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::bus::{Bus, Event, Subscription};
use crate::error::{ConnectionError, DaemonError, PublishError, SubscribeError};
use crate::facts::CanonicalFacts;
use crate::payload::handshake_envelope;
use crate::shutdown::ShutdownTrigger;

pub use broker::{Broker, InboundStream, MEMORY_SCHEME, create_broker};
pub use memory::{MemoryBroker, PublishedMessage};
pub use nats::NatsBroker;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_TOPIC_PREFIX: &str = "relayd";

/// Connection state, ordered by progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RouterState {
    Disconnected,
    Connecting,
    Connected,
    Subscribed,
}

/// Broker subjects for one client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Topics {
    /// Presence announcement.
    pub handshake: String,
    /// Work arriving for this host.
    pub inbound: String,
    /// Results leaving this host.
    pub outbound: String,
}

impl Topics {
    pub fn new(prefix: &str, client_id: &str) -> Self {
        Self {
            handshake: format!("{prefix}.{client_id}.control.out"),
            inbound: format!("{prefix}.{client_id}.data.in"),
            outbound: format!("{prefix}.{client_id}.data.out"),
        }
    }
}

struct RouterInner {
    broker: Arc<dyn Broker>,
    bus: Bus,
    topics: Topics,
    connect_timeout: Duration,
    state: watch::Sender<RouterState>,
    receive_task: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct MessageRouter {
    inner: Arc<RouterInner>,
}

impl std::fmt::Debug for MessageRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageRouter")
            .field("broker", &self.inner.broker.name())
            .field("topics", &self.inner.topics)
            .field("state", &self.state())
            .finish()
    }
}

impl MessageRouter {
    pub fn new(
        broker: Arc<dyn Broker>,
        bus: Bus,
        topics: Topics,
        connect_timeout: Duration,
    ) -> Self {
        let (state, _) = watch::channel(RouterState::Disconnected);
        Self {
            inner: Arc::new(RouterInner {
                broker,
                bus,
                topics,
                connect_timeout,
                state,
                receive_task: Mutex::new(None),
            }),
        }
    }

    pub fn topics(&self) -> &Topics {
        &self.inner.topics
    }

    pub fn state(&self) -> RouterState {
        *self.inner.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<RouterState> {
        self.inner.state.subscribe()
    }

    fn set_state(&self, next: RouterState) {
        let prev = self.inner.state.send_replace(next);
        if prev != next {
            debug!(from = ?prev, to = ?next, "router state changed");
        }
    }

    /// Connect to the broker, bounded by the connect timeout. No retry.
    /// Calling it while already connected is a no-op.
    pub async fn connect_client(&self) -> Result<(), ConnectionError> {
        if self.state() != RouterState::Disconnected {
            return Ok(());
        }
        self.set_state(RouterState::Connecting);
        info!(broker = self.inner.broker.name(), "connecting to broker");

        let timeout = self.inner.connect_timeout;
        let result = match tokio::time::timeout(timeout, self.inner.broker.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ConnectionError::Timeout(timeout)),
        };

        match result {
            Ok(()) => {
                self.set_state(RouterState::Connected);
                info!("broker connected");
                Ok(())
            }
            Err(e) => {
                self.set_state(RouterState::Disconnected);
                Err(e)
            }
        }
    }

    pub async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        if self.state() < RouterState::Connected {
            return Err(PublishError::NotConnected {
                topic: topic.to_string(),
            });
        }
        self.inner.broker.publish(topic, payload).await
    }

    /// Publish the presence handshake carrying `facts`.
    pub async fn announce(&self, facts: &CanonicalFacts) -> Result<(), PublishError> {
        let topic = &self.inner.topics.handshake;
        let payload =
            serde_json::to_vec(&handshake_envelope(facts)).map_err(|source| PublishError::Encode {
                topic: topic.clone(),
                source,
            })?;
        self.publish(topic, payload).await?;
        info!(topic = %topic, "handshake published");
        Ok(())
    }

    /// Subscribe to the inbound topic and start the receive loop.
    ///
    /// The loop runs until [`disconnect`](Self::disconnect). If the
    /// subscription fails or ends on its own, the state drops to
    /// `Disconnected` and the failure is reported through `trigger`.
    pub async fn subscribe(&self, trigger: ShutdownTrigger) -> Result<(), SubscribeError> {
        if self.state() < RouterState::Connected {
            return Err(SubscribeError::NotConnected);
        }
        let topic = self.inner.topics.inbound.clone();
        let stream = self.inner.broker.subscribe(&topic).await?;
        self.set_state(RouterState::Subscribed);
        info!(topic = %topic, "subscribed to inbound topic");

        let span = info_span!("message_router_receive", topic = %topic);
        let handle = tokio::spawn(self.clone().receive_loop(stream, trigger).instrument(span));
        if let Some(previous) = self.receive_task().replace(handle) {
            previous.abort();
        }
        Ok(())
    }

    async fn receive_loop(self, mut stream: InboundStream, trigger: ShutdownTrigger) {
        let reason = loop {
            match stream.next().await {
                Some(Ok(msg)) => {
                    debug!(bytes = msg.payload.len(), "message received");
                    self.inner.bus.emit(Event::MessageRecv(Arc::new(msg))).await;
                }
                Some(Err(reason)) => break reason,
                None => break "inbound subscription ended".to_string(),
            }
        };

        if self.state() == RouterState::Disconnected {
            // Disconnect raced the failure; nothing to report.
            return;
        }
        self.set_state(RouterState::Disconnected);
        trigger.fire(DaemonError::Receive(reason));
    }

    /// Publish every translated result on the outbound topic. Failures are
    /// logged; the loop keeps going.
    pub async fn handle_assignment_return_signal(&self, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            let Event::AssignmentReturn(msg) = event else {
                continue;
            };
            let topic = &self.inner.topics.outbound;
            match self.publish(topic, msg.payload.clone()).await {
                Ok(()) => debug!(
                    assignment_id = %msg.assignment_id,
                    correlation_id = %msg.correlation_id,
                    "result published"
                ),
                Err(e) => warn!(
                    assignment_id = %msg.assignment_id,
                    error = %e,
                    "failed to publish result"
                ),
            }
        }
        debug!("assignment-return subscription closed");
    }

    /// Stop the receive loop and close the broker connection.
    pub async fn disconnect(&self) {
        self.set_state(RouterState::Disconnected);
        if let Some(handle) = self.receive_task().take() {
            handle.abort();
        }
        self.inner.broker.disconnect().await;
        info!("broker disconnected");
    }

    fn receive_task(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.inner
            .receive_task
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::Signal;

    fn router(broker: &MemoryBroker, bus: &Bus, timeout: Duration) -> MessageRouter {
        MessageRouter::new(
            Arc::new(broker.clone()),
            bus.clone(),
            Topics::new("relayd", "host-1"),
            timeout,
        )
    }

    #[test]
    fn topics_follow_prefix_and_client() {
        let topics = Topics::new("yg", "abc");
        assert_eq!(topics.handshake, "yg.abc.control.out");
        assert_eq!(topics.inbound, "yg.abc.data.in");
        assert_eq!(topics.outbound, "yg.abc.data.out");
    }

    #[tokio::test]
    async fn connect_walks_state_machine() {
        let broker = MemoryBroker::new();
        let r = router(&broker, &Bus::new(), Duration::from_secs(1));
        let mut states = r.watch_state();
        assert_eq!(r.state(), RouterState::Disconnected);

        r.connect_client().await.unwrap();
        assert_eq!(r.state(), RouterState::Connected);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), RouterState::Connected);

        // Second call is a no-op.
        r.connect_client().await.unwrap();
        assert_eq!(broker.connect_calls(), 1);
    }

    #[tokio::test]
    async fn connect_timeout_is_reported() {
        let broker = MemoryBroker::new();
        broker.set_connect_delay(Duration::from_millis(200));
        let r = router(&broker, &Bus::new(), Duration::from_millis(20));

        let err = r.connect_client().await.unwrap_err();
        assert!(matches!(err, ConnectionError::Timeout(_)));
        assert_eq!(r.state(), RouterState::Disconnected);
    }

    #[tokio::test]
    async fn connect_failure_resets_state() {
        let broker = MemoryBroker::new();
        broker.fail_next_connect("bad credentials");
        let r = router(&broker, &Bus::new(), Duration::from_secs(1));
        assert!(matches!(
            r.connect_client().await,
            Err(ConnectionError::Transport(_))
        ));
        assert_eq!(r.state(), RouterState::Disconnected);
    }

    #[tokio::test]
    async fn publish_and_subscribe_need_connection() {
        let broker = MemoryBroker::new();
        let r = router(&broker, &Bus::new(), Duration::from_secs(1));
        assert!(matches!(
            r.publish("x", vec![]).await,
            Err(PublishError::NotConnected { .. })
        ));
        assert!(matches!(
            r.subscribe(ShutdownTrigger::new()).await,
            Err(SubscribeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn inbound_messages_become_events() {
        let broker = MemoryBroker::new();
        let bus = Bus::new();
        let mut recv = bus.connect(Signal::MessageRecv);
        let r = router(&broker, &bus, Duration::from_secs(1));

        r.connect_client().await.unwrap();
        r.subscribe(ShutdownTrigger::new()).await.unwrap();
        assert_eq!(r.state(), RouterState::Subscribed);

        broker.inject("relayd.host-1.data.in", b"{}".to_vec());
        match recv.recv().await.unwrap() {
            Event::MessageRecv(msg) => assert_eq!(msg.payload, b"{}"),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[tokio::test]
    async fn receive_failure_fires_trigger() {
        let broker = MemoryBroker::new();
        let r = router(&broker, &Bus::new(), Duration::from_secs(1));
        let trigger = ShutdownTrigger::new();

        r.connect_client().await.unwrap();
        r.subscribe(trigger.clone()).await.unwrap();
        broker.sever("connection reset by peer");

        tokio::time::timeout(Duration::from_secs(2), trigger.triggered())
            .await
            .unwrap();
        let cause = trigger.take_cause().unwrap();
        assert!(matches!(cause, DaemonError::Receive(ref r) if r.contains("reset")));
        assert_eq!(r.state(), RouterState::Disconnected);
    }

    #[tokio::test]
    async fn disconnect_is_not_a_failure() {
        let broker = MemoryBroker::new();
        let r = router(&broker, &Bus::new(), Duration::from_secs(1));
        let trigger = ShutdownTrigger::new();

        r.connect_client().await.unwrap();
        r.subscribe(trigger.clone()).await.unwrap();
        r.disconnect().await;

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!trigger.is_triggered());
        assert!(!broker.is_connected());
    }
}
