//! In-process broker.
//!
//! Selected by `memory://` addresses. Topics match exactly; there are no
//! wildcards. Also the broker every integration test runs against: it can
//! inject inbound messages, record publishes, fail a connect and sever live
//! subscriptions.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::sync::{Notify, mpsc};
use tokio_stream::wrappers::UnboundedReceiverStream;

use super::broker::{Broker, InboundStream};
use crate::error::{ConnectionError, PublishError, SubscribeError};
use crate::model::InboundMessage;

/// One message published through the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// How many published messages are kept by default; older ones are
/// discarded first.
pub const DEFAULT_PUBLISH_HISTORY: usize = 1024;

type Delivery = mpsc::UnboundedSender<Result<InboundMessage, String>>;

#[derive(Default)]
struct MemoryState {
    connected: bool,
    connected_at: Option<Instant>,
    connect_calls: usize,
    fail_next_connect: Option<String>,
    connect_delay: Option<Duration>,
    history: usize,
    published: VecDeque<PublishedMessage>,
    subscribers: HashMap<String, Vec<Delivery>>,
}

#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<MemoryState>>,
    publish_notify: Arc<Notify>,
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state();
        f.debug_struct("MemoryBroker")
            .field("connected", &state.connected)
            .field("published", &state.published.len())
            .finish()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::with_history(DEFAULT_PUBLISH_HISTORY)
    }
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep at most `history` published messages (at least one).
    pub fn with_history(history: usize) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                history: history.max(1),
                ..MemoryState::default()
            })),
            publish_notify: Arc::new(Notify::new()),
        }
    }

    fn state(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Deliver a message to every subscriber of `topic`. Returns how many
    /// subscriptions received it.
    pub fn inject(&self, topic: &str, payload: impl Into<Vec<u8>>) -> usize {
        let msg = InboundMessage {
            topic: topic.to_string(),
            payload: payload.into(),
        };
        let mut state = self.state();
        let Some(list) = state.subscribers.get_mut(topic) else {
            return 0;
        };
        list.retain(|tx| tx.send(Ok(msg.clone())).is_ok());
        list.len()
    }

    /// Break every live subscription with `reason`.
    pub fn sever(&self, reason: &str) {
        let mut state = self.state();
        for (_, list) in state.subscribers.drain() {
            for tx in list {
                let _ = tx.send(Err(reason.to_string()));
            }
        }
    }

    /// Make the next `connect` fail with a transport error.
    pub fn fail_next_connect(&self, reason: &str) {
        self.state().fail_next_connect = Some(reason.to_string());
    }

    /// Make every `connect` take at least `delay`.
    pub fn set_connect_delay(&self, delay: Duration) {
        self.state().connect_delay = Some(delay);
    }

    /// The retained publish history, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.state().published.iter().cloned().collect()
    }

    pub fn published_on(&self, topic: &str) -> Vec<PublishedMessage> {
        self.state()
            .published
            .iter()
            .filter(|m| m.topic == topic)
            .cloned()
            .collect()
    }

    /// Wait until at least `count` messages were published on `topic`.
    /// Returns them, or `None` on timeout.
    pub async fn wait_for_published(
        &self,
        topic: &str,
        count: usize,
        timeout: Duration,
    ) -> Option<Vec<PublishedMessage>> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            let notified = self.publish_notify.notified();
            let found = self.published_on(topic);
            if found.len() >= count {
                return Some(found);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return None;
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state().connected
    }

    /// When the most recent successful `connect` started.
    pub fn connected_at(&self) -> Option<Instant> {
        self.state().connected_at
    }

    pub fn connect_calls(&self) -> usize {
        self.state().connect_calls
    }

    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state()
            .subscribers
            .get(topic)
            .map_or(0, |list| list.iter().filter(|tx| !tx.is_closed()).count())
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn name(&self) -> &str {
        "memory"
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        let started = Instant::now();
        let (delay, failure) = {
            let mut state = self.state();
            state.connect_calls += 1;
            (state.connect_delay, state.fail_next_connect.take())
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(reason) = failure {
            return Err(ConnectionError::Transport(reason));
        }
        let mut state = self.state();
        state.connected = true;
        state.connected_at = Some(started);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        {
            let mut state = self.state();
            if !state.connected {
                return Err(PublishError::NotConnected {
                    topic: topic.to_string(),
                });
            }
            if state.published.len() >= state.history {
                state.published.pop_front();
            }
            state.published.push_back(PublishedMessage {
                topic: topic.to_string(),
                payload,
            });
        }
        self.publish_notify.notify_waiters();
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<InboundStream, SubscribeError> {
        let mut state = self.state();
        if !state.connected {
            return Err(SubscribeError::NotConnected);
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state
            .subscribers
            .entry(topic.to_string())
            .or_default()
            .push(tx);
        Ok(Box::pin(UnboundedReceiverStream::new(rx)))
    }

    async fn disconnect(&self) {
        let mut state = self.state();
        state.connected = false;
        state.subscribers.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn inject_reaches_subscribers() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        let mut stream = broker.subscribe("in").await.unwrap();

        assert_eq!(broker.inject("in", b"hello".to_vec()), 1);
        assert_eq!(broker.inject("other", b"nobody".to_vec()), 0);

        let msg = stream.next().await.unwrap().unwrap();
        assert_eq!(msg.payload, b"hello");
    }

    #[tokio::test]
    async fn publish_requires_connection() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("out", vec![1]).await,
            Err(PublishError::NotConnected { .. })
        ));
        broker.connect().await.unwrap();
        broker.publish("out", vec![1]).await.unwrap();
        assert_eq!(broker.published_on("out").len(), 1);
    }

    #[tokio::test]
    async fn publish_history_is_bounded() {
        let broker = MemoryBroker::with_history(3);
        broker.connect().await.unwrap();
        for n in 0u8..5 {
            broker.publish("out", vec![n]).await.unwrap();
        }
        let kept: Vec<Vec<u8>> = broker.published().into_iter().map(|m| m.payload).collect();
        assert_eq!(kept, vec![vec![2], vec![3], vec![4]]);
    }

    #[tokio::test]
    async fn sever_breaks_subscription() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        let mut stream = broker.subscribe("in").await.unwrap();
        broker.sever("connection reset");
        assert_eq!(
            stream.next().await.unwrap().unwrap_err(),
            "connection reset"
        );
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn failed_connect_is_one_shot() {
        let broker = MemoryBroker::new();
        broker.fail_next_connect("auth rejected");
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_calls(), 2);
    }

    #[tokio::test]
    async fn wait_for_published_sees_later_publish() {
        let broker = MemoryBroker::new();
        broker.connect().await.unwrap();
        let waiter = {
            let b = broker.clone();
            tokio::spawn(async move {
                b.wait_for_published("out", 1, Duration::from_secs(2)).await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        broker.publish("out", b"x".to_vec()).await.unwrap();
        assert_eq!(waiter.await.unwrap().unwrap().len(), 1);
    }
}
