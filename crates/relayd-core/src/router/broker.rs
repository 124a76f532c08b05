//! The `Broker` trait: the transport interface behind the message router.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use futures::Stream;

use super::memory::MemoryBroker;
use super::nats::NatsBroker;
use crate::error::{ConnectionError, PublishError, SubscribeError};
use crate::model::InboundMessage;

/// Address scheme selecting the in-process broker.
pub const MEMORY_SCHEME: &str = "memory://";

/// Messages delivered on a subscription. An `Err` item means the
/// subscription broke and no further messages will arrive.
pub type InboundStream = Pin<Box<dyn Stream<Item = Result<InboundMessage, String>> + Send>>;

/// Publish/subscribe transport to the remote broker.
///
/// Object-safe, so the router can hold `Arc<dyn Broker>` and tests can swap
/// in [`MemoryBroker`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Short name for logs (e.g. "nats").
    fn name(&self) -> &str;

    /// Open the transport. Fails with [`ConnectionError`] on transport or
    /// authentication errors.
    async fn connect(&self) -> Result<(), ConnectionError>;

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError>;

    async fn subscribe(&self, topic: &str) -> Result<InboundStream, SubscribeError>;

    /// Close the transport. Safe to call when not connected.
    async fn disconnect(&self);
}

// Compile-time assertion: Broker must be object-safe.
const _: () = {
    fn _assert_object_safe(_: &dyn Broker) {}
};

/// Factory: pick a broker implementation from the configured addresses.
///
/// `memory://` addresses select the in-process broker; anything else is
/// treated as a NATS server URL.
pub fn create_broker(addrs: &[String]) -> Result<Arc<dyn Broker>, ConnectionError> {
    if addrs.is_empty() {
        return Err(ConnectionError::NoBrokers);
    }

    let memory = addrs.iter().filter(|a| a.starts_with(MEMORY_SCHEME)).count();
    match memory {
        0 => Ok(Arc::new(NatsBroker::new(addrs)?)),
        n if n == addrs.len() => Ok(Arc::new(MemoryBroker::new())),
        _ => Err(ConnectionError::InvalidAddress {
            address: addrs.join(","),
            reason: format!("cannot mix {MEMORY_SCHEME} with network brokers"),
        }),
    }
}
