//! Broker seam.
//!
//! This module contains:
//! - `Connector` / `BrokerConnection` / `BrokerChannel` traits: the narrow
//!   surface the client needs from an AMQP library
//! - Frame metadata types shared by every implementation
//! - Implementations: AMQP via lapin, scripted in-memory mock

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::config::QueueOptions;

// Implementation modules
#[cfg(feature = "amqp")]
pub mod amqp;
#[cfg(any(test, feature = "test-utils"))]
pub mod mock;

// Re-exports
#[cfg(feature = "amqp")]
pub use amqp::AmqpConnector;
#[cfg(any(test, feature = "test-utils"))]
pub use mock::MockBroker;

/// String headers attached to a frame.
pub type Headers = BTreeMap<String, String>;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors reported by a broker implementation.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Channel operation failed: {0}")]
    Channel(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Broker rejected message: {0}")]
    Rejected(String),

    #[error("Channel closed")]
    Closed,
}

/// Signal raised by a live connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    /// A recoverable error; the connection is still usable.
    Error(String),
    /// The session was lost.
    Disconnected(String),
    /// The broker closed the channel, or its reply consumer stopped, while
    /// the connection stayed up.
    ChannelLost(String),
}

/// Observer attached to a connection.
pub type ConnectionObserver = Box<dyn Fn(ConnectionEvent) + Send + Sync>;

/// Handler invoked for each delivery on the reply queue.
pub type DeliveryHandler = Arc<dyn Fn(InboundReply) + Send + Sync>;

/// Resolves once the broker has acknowledged (or refused) a published frame.
pub type PublishConfirm = BoxFuture<'static, Result<()>>;

/// Broker properties attached to an outbound frame.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageProperties {
    pub reply_to: Option<String>,
    pub correlation_id: Option<String>,
    pub persistent: bool,
    /// Explicit AMQP delivery mode; takes precedence over `persistent`.
    pub delivery_mode: Option<u8>,
    pub headers: Option<Headers>,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
}

impl MessageProperties {
    /// AMQP delivery mode: 2 for persistent, 1 otherwise.
    pub fn effective_delivery_mode(&self) -> u8 {
        self.delivery_mode
            .unwrap_or(if self.persistent { 2 } else { 1 })
    }
}

/// A frame delivered on the reply queue.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InboundReply {
    pub correlation_id: Option<String>,
    pub body: Vec<u8>,
    pub headers: Option<Headers>,
}

impl InboundReply {
    pub fn new(correlation_id: impl Into<String>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            correlation_id: Some(correlation_id.into()),
            body: body.into(),
            headers: None,
        }
    }
}

/// Opens broker sessions.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session against a single endpoint URL.
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>>;
}

/// A live broker session.
#[async_trait]
pub trait BrokerConnection: Send + Sync {
    /// Open a channel on this session.
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>>;

    /// Attach an observer for error and disconnect signals.
    fn observe(&self, observer: ConnectionObserver);

    /// Close the session.
    async fn close(&self) -> Result<()>;
}

/// A channel on a broker session.
#[async_trait]
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue with the given options.
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()>;

    /// Set the prefetch window.
    async fn prefetch(&self, count: u16, global: bool) -> Result<()>;

    /// Start consuming `queue`. Resolves once the subscription is active.
    ///
    /// With `no_ack` false, each delivery is acknowledged after `handler`
    /// returns.
    async fn consume(&self, queue: &str, no_ack: bool, handler: DeliveryHandler) -> Result<()>;

    /// Publish `payload` to `queue` through the default exchange.
    ///
    /// Resolves once the frame is written; the returned confirm resolves on
    /// the broker's acknowledgment.
    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishConfirm>;

    /// Close the channel.
    async fn close(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_delivery_mode_follows_persistent_flag() {
        let mut props = MessageProperties::default();
        assert_eq!(props.effective_delivery_mode(), 1);

        props.persistent = true;
        assert_eq!(props.effective_delivery_mode(), 2);

        props.delivery_mode = Some(1);
        assert_eq!(props.effective_delivery_mode(), 1);
    }
}
