//! NATS transport.

use std::sync::Arc;

use async_nats::{ConnectOptions, Event, ServerAddr};
use async_trait::async_trait;
use futures::{StreamExt, stream};
use tokio::sync::{RwLock, watch};
use tracing::{debug, warn};

use super::broker::{Broker, InboundStream};
use crate::error::{ConnectionError, PublishError, SubscribeError};
use crate::model::InboundMessage;

/// NATS client wrapper. The connection is never re-established: once the
/// client reports a disconnect, every open subscription yields an `Err` and
/// ends.
pub struct NatsBroker {
    /// Comma-joined server list, already validated.
    servers: String,
    server_count: usize,
    client: RwLock<Option<async_nats::Client>>,
    /// Set to the loss reason by the client's event callback.
    lost: Arc<watch::Sender<Option<String>>>,
}

impl std::fmt::Debug for NatsBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NatsBroker")
            .field("servers", &self.servers)
            .finish()
    }
}

impl NatsBroker {
    /// Validate every address up front so a typo is reported before the
    /// daemon starts launching workers.
    pub fn new(addrs: &[String]) -> Result<Self, ConnectionError> {
        if addrs.is_empty() {
            return Err(ConnectionError::NoBrokers);
        }
        for address in addrs {
            address
                .parse::<ServerAddr>()
                .map_err(|e| ConnectionError::InvalidAddress {
                    address: address.clone(),
                    reason: e.to_string(),
                })?;
        }
        let (lost, _) = watch::channel(None);
        Ok(Self {
            servers: addrs.join(","),
            server_count: addrs.len(),
            client: RwLock::new(None),
            lost: Arc::new(lost),
        })
    }

    fn options(&self) -> ConnectOptions {
        let lost = Arc::clone(&self.lost);
        // One pass over the server list covers the initial connect; the
        // attempt counter is shared with reconnects.
        ConnectOptions::new()
            .max_reconnects(self.server_count)
            .event_callback(move |event| {
                let lost = Arc::clone(&lost);
                async move {
                    let reason = match event {
                        Event::Disconnected => "broker connection lost",
                        Event::Closed => "broker connection closed",
                        Event::Connected => return,
                        other => {
                            debug!(event = ?other, "nats client event");
                            return;
                        }
                    };
                    warn!(reason, "nats connection ended");
                    lost.send_if_modified(|current| {
                        if current.is_some() {
                            return false;
                        }
                        *current = Some(reason.to_string());
                        true
                    });
                }
            })
    }

    /// Yields a single `Err` once the connection is lost, then ends.
    fn loss_stream(&self) -> InboundStream {
        let rx = self.lost.subscribe();
        let loss = stream::unfold(Some(rx), |rx| async move {
            let mut rx = rx?;
            let reason = match rx.wait_for(Option::is_some).await {
                Ok(reason) => reason.clone().unwrap_or_default(),
                Err(_) => return None,
            };
            Some((Err::<InboundMessage, String>(reason), None))
        });
        Box::pin(loss)
    }

    async fn client(&self) -> Option<async_nats::Client> {
        self.client.read().await.clone()
    }
}

#[async_trait]
impl Broker for NatsBroker {
    fn name(&self) -> &str {
        "nats"
    }

    async fn connect(&self) -> Result<(), ConnectionError> {
        self.lost.send_replace(None);
        let client = self
            .options()
            .connect(self.servers.as_str())
            .await
            .map_err(|e| ConnectionError::Transport(e.to_string()))?;
        debug!(servers = %self.servers, "nats connected");
        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), PublishError> {
        let client = self.client().await.ok_or_else(|| PublishError::NotConnected {
            topic: topic.to_string(),
        })?;
        client
            .publish(topic.to_string(), payload.into())
            .await
            .map_err(|e| PublishError::Rejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
    }

    async fn subscribe(&self, topic: &str) -> Result<InboundStream, SubscribeError> {
        let client = self.client().await.ok_or(SubscribeError::NotConnected)?;
        let subscriber =
            client
                .subscribe(topic.to_string())
                .await
                .map_err(|e| SubscribeError::Rejected {
                    topic: topic.to_string(),
                    reason: e.to_string(),
                })?;

        let messages = subscriber.map(|msg| {
            Ok(InboundMessage {
                topic: msg.subject.to_string(),
                payload: msg.payload.to_vec(),
            })
        });
        Ok(Box::pin(stream::select(messages, self.loss_stream())))
    }

    async fn disconnect(&self) {
        if let Some(client) = self.client.write().await.take() {
            if let Err(e) = client.flush().await {
                debug!(error = %e, "flush before disconnect failed");
            }
        }
    }
}
