//! Client configuration types.

use std::time::Duration;

use serde::Deserialize;

use super::endpoint::BrokerEndpoint;
use crate::broker::Headers;
use crate::error::{ClientError, Result};

/// Default work queue name.
pub const DEFAULT_QUEUE: &str = "default";
/// RabbitMQ direct reply-to pseudo queue.
pub const DEFAULT_REPLY_QUEUE: &str = "amq.rabbitmq.reply-to";
/// Default prefetch window (one unacknowledged delivery at a time).
pub const DEFAULT_PREFETCH_COUNT: u16 = 1;

/// Configuration for an `RmqClient`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Candidate broker endpoints, tried in order.
    pub urls: Vec<BrokerEndpoint>,
    /// Work queue that receives requests and events.
    pub queue: String,
    /// Options used when asserting the work queue.
    pub queue_options: QueueOptions,
    /// Queue that every reply for this client is delivered to.
    pub reply_queue: String,
    /// Mark outbound frames persistent.
    pub persistent: bool,
    /// Prefetch window for the reply consumer.
    pub prefetch_count: u16,
    /// Apply the prefetch window to the whole channel instead of per consumer.
    pub is_global_prefetch_count: bool,
    /// Consume replies with automatic acknowledgment.
    pub no_ack: bool,
    /// Skip asserting the work queue.
    pub no_assert: bool,
    /// Headers sent with every frame; call-site headers override these.
    pub headers: Option<Headers>,
    /// Delay between failover attempts.
    pub failover: FailoverConfig,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            urls: vec![BrokerEndpoint::default()],
            queue: DEFAULT_QUEUE.to_string(),
            queue_options: QueueOptions::default(),
            reply_queue: DEFAULT_REPLY_QUEUE.to_string(),
            persistent: false,
            prefetch_count: DEFAULT_PREFETCH_COUNT,
            is_global_prefetch_count: false,
            no_ack: true,
            no_assert: false,
            headers: None,
            failover: FailoverConfig::default(),
        }
    }
}

impl ClientConfig {
    /// Config targeting the given endpoints with defaults elsewhere.
    pub fn with_urls<I, E>(urls: I) -> Self
    where
        I: IntoIterator<Item = E>,
        E: Into<BrokerEndpoint>,
    {
        Self {
            urls: urls.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    /// Set the work queue.
    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Whether the work queue assertion is skipped.
    pub fn skip_assert(&self) -> bool {
        self.no_assert || self.queue_options.no_assert
    }

    /// Reject configurations the client cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(ClientError::Config(
                "at least one broker endpoint is required".to_string(),
            ));
        }
        if self.queue.is_empty() {
            return Err(ClientError::Config("queue name is empty".to_string()));
        }
        if self.reply_queue.is_empty() {
            return Err(ClientError::Config("reply queue name is empty".to_string()));
        }
        if self.failover.min_delay_ms > self.failover.max_delay_ms {
            return Err(ClientError::Config(format!(
                "failover.min_delay_ms ({}) exceeds failover.max_delay_ms ({})",
                self.failover.min_delay_ms, self.failover.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Work queue declaration options.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct QueueOptions {
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Skip asserting the queue (same effect as `ClientConfig::no_assert`).
    pub no_assert: bool,
    /// `x-message-ttl` in milliseconds.
    pub message_ttl: Option<u32>,
    /// `x-expires` in milliseconds.
    pub expires: Option<u32>,
    /// `x-dead-letter-exchange`.
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`.
    pub dead_letter_routing_key: Option<String>,
    /// `x-max-length`.
    pub max_length: Option<u32>,
    /// `x-max-priority`.
    pub max_priority: Option<u8>,
}

/// Backoff between failover attempts across candidate endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FailoverConfig {
    pub min_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for FailoverConfig {
    fn default() -> Self {
        Self {
            min_delay_ms: 100,
            max_delay_ms: 5_000,
        }
    }
}

impl FailoverConfig {
    /// No delay between attempts.
    pub fn immediate() -> Self {
        Self {
            min_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    pub fn min_delay(&self) -> Duration {
        Duration::from_millis(self.min_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_config_defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.urls, vec![BrokerEndpoint::from("amqp://localhost:5672")]);
        assert_eq!(config.queue, "default");
        assert_eq!(config.reply_queue, "amq.rabbitmq.reply-to");
        assert_eq!(config.prefetch_count, 1);
        assert!(config.no_ack);
        assert!(!config.persistent);
        assert!(!config.is_global_prefetch_count);
        assert!(!config.queue_options.durable);
        assert!(!config.queue_options.auto_delete);
        assert!(config.headers.is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_skip_assert_from_either_flag() {
        let mut config = ClientConfig::default();
        assert!(!config.skip_assert());

        config.queue_options.no_assert = true;
        assert!(config.skip_assert());

        config.queue_options.no_assert = false;
        config.no_assert = true;
        assert!(config.skip_assert());
    }

    #[test]
    fn test_validate_rejects_empty_endpoint_list() {
        let config = ClientConfig::with_urls(Vec::<String>::new());
        assert!(matches!(config.validate(), Err(ClientError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_inverted_failover_window() {
        let mut config = ClientConfig::default();
        config.failover = FailoverConfig {
            min_delay_ms: 10,
            max_delay_ms: 1,
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_helpers() {
        let config = ClientConfig::with_urls(["amqp://a", "amqp://b"]).queue("orders");
        assert_eq!(config.urls.len(), 2);
        assert_eq!(config.queue, "orders");
    }
}
