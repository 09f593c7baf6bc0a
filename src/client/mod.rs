//! Request/reply client over a single broker connection.
//!
//! `RmqClient` publishes requests to a work queue and multiplexes every
//! reply back through one consumer on the reply queue, matched by
//! correlation id. Connections are opened lazily and rebuilt on the next
//! call after a disconnect.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

mod channel;
mod publisher;
mod replies;
mod stream;
mod supervisor;

pub use publisher::ReplyCallback;
pub use replies::{ReplyHandle, ReplyListener, ReplyRegistry};
pub use stream::ReplyStream;
pub use supervisor::LinkStatus;

use publisher::Publisher;
use supervisor::ConnectionSupervisor;

#[cfg(feature = "amqp")]
use crate::broker::AmqpConnector;
use crate::broker::Connector;
use crate::codec::{
    Deserializer, IncomingResponseDeserializer, PacketData, ReadPacket, RecordSerializer,
    Serializer, WritePacket,
};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Client publishing to one work queue and multiplexing replies.
pub struct RmqClient {
    config: Arc<ClientConfig>,
    replies: ReplyRegistry,
    supervisor: Arc<ConnectionSupervisor>,
    publisher: Publisher,
}

impl RmqClient {
    /// Client speaking AMQP through lapin.
    #[cfg(feature = "amqp")]
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::with_connector(config, Arc::new(AmqpConnector::new()))
    }

    /// Client over an arbitrary broker connector.
    pub fn with_connector(config: ClientConfig, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let replies = ReplyRegistry::new();
        let supervisor =
            ConnectionSupervisor::new(Arc::clone(&config), connector, replies.clone());
        let publisher = Publisher::new(
            Arc::clone(&config),
            replies.clone(),
            Arc::new(RecordSerializer),
            Arc::new(IncomingResponseDeserializer),
        );

        Ok(Self {
            config,
            replies,
            supervisor,
            publisher,
        })
    }

    /// Replace the outbound packet serializer.
    pub fn with_serializer(mut self, serializer: impl Serializer + 'static) -> Self {
        self.publisher.serializer = Arc::new(serializer);
        self
    }

    /// Replace the reply deserializer.
    pub fn with_deserializer(mut self, deserializer: impl Deserializer + 'static) -> Self {
        self.publisher.deserializer = Arc::new(deserializer);
        self
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Connect if needed and wait until the reply consumer is active.
    ///
    /// Concurrent callers share a single attempt. Safe to call repeatedly.
    pub async fn connect(&self) -> Result<()> {
        self.supervisor.connect().await.map(|_| ())
    }

    pub async fn status(&self) -> LinkStatus {
        self.supervisor.status().await
    }

    /// Close the channel and connection.
    ///
    /// Requests still registered stay registered; their replies cannot
    /// arrive until a later call reconnects.
    pub async fn close(&self) {
        self.supervisor.close().await;
    }

    /// Number of requests still waiting for replies.
    pub fn pending_requests(&self) -> usize {
        self.replies.pending()
    }

    /// Publish a request and route its replies to `on_reply`.
    ///
    /// Connection and send failures are delivered to `on_reply` as a
    /// terminal packet before this returns. The returned handle
    /// deregisters the request when cancelled.
    pub async fn request<F>(&self, packet: ReadPacket, on_reply: F) -> ReplyHandle
    where
        F: Fn(WritePacket) + Send + Sync + 'static,
    {
        let callback: ReplyCallback = Arc::new(on_reply);
        let correlation_id = Publisher::next_correlation_id();

        let session = match self.supervisor.connect().await {
            Ok(session) => session,
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Request not sent");
                callback(WritePacket::failed(e));
                return ReplyHandle::inert(correlation_id);
            }
        };

        self.publisher
            .request(&session, correlation_id, packet, callback)
            .await
    }

    /// Publish a fire-and-forget event and wait for the broker to accept it.
    pub async fn emit(&self, pattern: impl Into<Value>, data: impl Into<PacketData>) -> Result<()> {
        self.dispatch_event(ReadPacket::new(pattern, data)).await
    }

    pub async fn dispatch_event(&self, packet: ReadPacket) -> Result<()> {
        let session = self.supervisor.connect().await?;
        self.publisher.event(&session, packet).await
    }

    /// Publish a request and stream its replies.
    pub async fn send(&self, pattern: impl Into<Value>, data: impl Into<PacketData>) -> ReplyStream {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self
            .request(ReadPacket::new(pattern, data), move |packet| {
                let _ = tx.send(packet);
            })
            .await;
        ReplyStream::new(rx, handle)
    }

    /// Publish a request and wait for its final response value.
    ///
    /// The deadline covers connecting, publishing and every reply. When it
    /// expires the request is deregistered and late replies are dropped.
    pub async fn call(
        &self,
        pattern: impl Into<Value>,
        data: impl Into<PacketData>,
        timeout: Duration,
    ) -> Result<Value> {
        let pattern = pattern.into();
        let data = data.into();
        let exchange = async {
            let mut replies = self.send(pattern, data).await;
            let mut last = None;
            while let Some(reply) = replies.next().await {
                last = Some(reply?);
            }
            last.ok_or(ClientError::NoResponse)
        };

        match tokio::time::timeout(timeout, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ClientError::Timeout(timeout)),
        }
    }
}
