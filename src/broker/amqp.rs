//! AMQP (RabbitMQ) broker implementation.
//!
//! Publishes through the default exchange straight to the work queue and
//! consumes the reply queue on the same channel, which is what RabbitMQ's
//! direct reply-to requires.

use std::sync::{Arc, Mutex as StdMutex};

use async_trait::async_trait;
use futures::{FutureExt, StreamExt};
use lapin::{
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions,
        ConfirmSelectOptions, QueueDeclareOptions,
    },
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, ConnectionObserver, Connector,
    DeliveryHandler, Headers, InboundReply, MessageProperties, PublishConfirm, Result,
};
use crate::config::{redact_url, QueueOptions};

/// Consumer tag used on the reply queue.
const CONSUMER_TAG: &str = "replymux-replies";

/// AMQP reply code for a normal close.
const REPLY_SUCCESS: u16 = 200;

/// Opens lapin connections.
#[derive(Clone, Default)]
pub struct AmqpConnector {
    properties: ConnectionProperties,
}

impl AmqpConnector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Use custom connection properties (client name, locale, executor).
    pub fn with_properties(properties: ConnectionProperties) -> Self {
        Self { properties }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>> {
        let connection = Connection::connect(url, self.properties.clone())
            .await
            .map_err(|e| BrokerError::Connection(format!("{}: {}", redact_url(url), e)))?;

        let observers = Observers::default();
        let status = connection.status().clone();
        let sink = observers.clone();
        connection.on_error(move |err| {
            let event = if is_connection_lost(&err) || !status.connected() {
                ConnectionEvent::Disconnected(err.to_string())
            } else {
                ConnectionEvent::Error(err.to_string())
            };
            sink.notify(event);
        });

        info!(url = %redact_url(url), "Connected to AMQP");
        Ok(Box::new(AmqpConnection {
            inner: connection,
            observers,
        }))
    }
}

/// Observers of one connection, shared with its channels.
#[derive(Clone, Default)]
struct Observers(Arc<StdMutex<Vec<Arc<dyn Fn(ConnectionEvent) + Send + Sync>>>>);

impl Observers {
    fn add(&self, observer: ConnectionObserver) {
        self.0
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::from(observer));
    }

    fn notify(&self, event: ConnectionEvent) {
        let observers = self.0.lock().unwrap_or_else(|e| e.into_inner()).clone();
        for observer in observers {
            observer(event.clone());
        }
    }
}

struct AmqpConnection {
    inner: Connection,
    observers: Observers,
}

/// Errors after which the session cannot be used any more.
fn is_connection_lost(err: &lapin::Error) -> bool {
    matches!(
        err,
        lapin::Error::IOError(_)
            | lapin::Error::InvalidConnectionState(_)
            | lapin::Error::ProtocolError(_)
    )
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .inner
            .create_channel()
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to create channel: {}", e)))?;

        // Publisher confirms back the event acknowledgment
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to enable confirms: {}", e)))?;

        // Channel-level closes (e.g. PRECONDITION_FAILED) leave the connection up
        let sink = self.observers.clone();
        channel.on_error(move |err| {
            sink.notify(ConnectionEvent::ChannelLost(err.to_string()));
        });

        Ok(Arc::new(AmqpChannel {
            inner: channel,
            observers: self.observers.clone(),
            consumer_task: Mutex::new(None),
        }))
    }

    fn observe(&self, observer: ConnectionObserver) {
        self.observers.add(observer);
    }

    async fn close(&self) -> Result<()> {
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "client closing")
            .await
            .map_err(|e| BrokerError::Connection(format!("Failed to close connection: {}", e)))
    }
}

struct AmqpChannel {
    inner: Channel,
    observers: Observers,
    consumer_task: Mutex<Option<JoinHandle<()>>>,
}

impl AmqpChannel {
    fn queue_arguments(options: &QueueOptions) -> FieldTable {
        let mut args = FieldTable::default();
        if let Some(ttl) = options.message_ttl {
            args.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
        }
        if let Some(expires) = options.expires {
            args.insert("x-expires".into(), AMQPValue::LongUInt(expires));
        }
        if let Some(exchange) = &options.dead_letter_exchange {
            args.insert(
                "x-dead-letter-exchange".into(),
                AMQPValue::LongString(LongString::from(exchange.clone())),
            );
        }
        if let Some(key) = &options.dead_letter_routing_key {
            args.insert(
                "x-dead-letter-routing-key".into(),
                AMQPValue::LongString(LongString::from(key.clone())),
            );
        }
        if let Some(max) = options.max_length {
            args.insert("x-max-length".into(), AMQPValue::LongUInt(max));
        }
        if let Some(max) = options.max_priority {
            args.insert("x-max-priority".into(), AMQPValue::ShortShortUInt(max));
        }
        args
    }

    async fn drive_consumer(
        mut consumer: lapin::Consumer,
        queue: String,
        no_ack: bool,
        handler: DeliveryHandler,
        observers: Observers,
    ) {
        while let Some(delivery) = consumer.next().await {
            match delivery {
                Ok(delivery) => {
                    let reply = InboundReply {
                        correlation_id: delivery
                            .properties
                            .correlation_id()
                            .as_ref()
                            .map(|id| id.as_str().to_string()),
                        body: delivery.data.clone(),
                        headers: delivery.properties.headers().as_ref().map(headers_from_table),
                    };
                    handler(reply);

                    if !no_ack {
                        if let Err(e) = delivery.ack(BasicAckOptions::default()).await {
                            error!(error = %e, "Failed to ack reply");
                        }
                    }
                }
                Err(e) => {
                    error!(queue = %queue, error = %e, "Reply consumer delivery error");
                    break;
                }
            }
        }
        // Only reached when the broker ends the stream; close() aborts this task first
        debug!(queue = %queue, "Reply consumer stream ended");
        observers.notify(ConnectionEvent::ChannelLost(format!(
            "reply consumer on '{}' stopped",
            queue
        )));
    }
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        self.inner
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                Self::queue_arguments(options),
            )
            .await
            .map(|_| ())
            .map_err(|e| BrokerError::Channel(format!("Failed to declare queue: {}", e)))
    }

    async fn prefetch(&self, count: u16, global: bool) -> Result<()> {
        self.inner
            .basic_qos(count, BasicQosOptions { global })
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to set prefetch: {}", e)))
    }

    async fn consume(&self, queue: &str, no_ack: bool, handler: DeliveryHandler) -> Result<()> {
        let consumer = self
            .inner
            .basic_consume(
                queue,
                CONSUMER_TAG,
                BasicConsumeOptions {
                    no_ack,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to start consumer: {}", e)))?;

        let task = tokio::spawn(Self::drive_consumer(
            consumer,
            queue.to_string(),
            no_ack,
            handler,
            self.observers.clone(),
        ));
        if let Some(previous) = self.consumer_task.lock().await.replace(task) {
            warn!(queue = %queue, "Replacing an active reply consumer");
            previous.abort();
        }
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishConfirm> {
        let confirm = self
            .inner
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &payload,
                basic_properties(&properties),
            )
            .await
            .map_err(|e| BrokerError::Publish(format!("Failed to publish: {}", e)))?;

        Ok(async move {
            match confirm.await {
                Ok(confirmation) if confirmation.is_nack() => Err(BrokerError::Rejected(
                    "broker negatively acknowledged the message".to_string(),
                )),
                Ok(_) => Ok(()),
                Err(e) => Err(BrokerError::Publish(format!(
                    "Publish confirmation failed: {}",
                    e
                ))),
            }
        }
        .boxed())
    }

    async fn close(&self) -> Result<()> {
        if let Some(task) = self.consumer_task.lock().await.take() {
            task.abort();
        }
        if !self.inner.status().connected() {
            return Ok(());
        }
        self.inner
            .close(REPLY_SUCCESS, "client closing")
            .await
            .map_err(|e| BrokerError::Channel(format!("Failed to close channel: {}", e)))
    }
}

fn basic_properties(props: &MessageProperties) -> BasicProperties {
    let mut out = BasicProperties::default().with_delivery_mode(props.effective_delivery_mode());

    if let Some(reply_to) = &props.reply_to {
        out = out.with_reply_to(ShortString::from(reply_to.as_str()));
    }
    if let Some(id) = &props.correlation_id {
        out = out.with_correlation_id(ShortString::from(id.as_str()));
    }
    if let Some(headers) = &props.headers {
        out = out.with_headers(table_from_headers(headers));
    }
    if let Some(priority) = props.priority {
        out = out.with_priority(priority);
    }
    if let Some(expiration) = &props.expiration {
        out = out.with_expiration(ShortString::from(expiration.as_str()));
    }
    if let Some(message_id) = &props.message_id {
        out = out.with_message_id(ShortString::from(message_id.as_str()));
    }
    if let Some(timestamp) = props.timestamp {
        out = out.with_timestamp(timestamp);
    }
    if let Some(kind) = &props.kind {
        out = out.with_type(ShortString::from(kind.as_str()));
    }
    if let Some(user_id) = &props.user_id {
        out = out.with_user_id(ShortString::from(user_id.as_str()));
    }
    if let Some(app_id) = &props.app_id {
        out = out.with_app_id(ShortString::from(app_id.as_str()));
    }
    if let Some(content_type) = &props.content_type {
        out = out.with_content_type(ShortString::from(content_type.as_str()));
    }
    if let Some(encoding) = &props.content_encoding {
        out = out.with_content_encoding(ShortString::from(encoding.as_str()));
    }
    out
}

fn table_from_headers(headers: &Headers) -> FieldTable {
    let mut table = FieldTable::default();
    for (key, value) in headers {
        table.insert(
            ShortString::from(key.as_str()),
            AMQPValue::LongString(LongString::from(value.clone())),
        );
    }
    table
}

fn headers_from_table(table: &FieldTable) -> Headers {
    table
        .inner()
        .iter()
        .filter_map(|(key, value)| {
            let value = match value {
                AMQPValue::LongString(s) => String::from_utf8(s.as_bytes().to_vec()).ok()?,
                AMQPValue::ShortString(s) => s.as_str().to_string(),
                AMQPValue::Boolean(b) => b.to_string(),
                AMQPValue::LongInt(n) => n.to_string(),
                AMQPValue::LongLongInt(n) => n.to_string(),
                _ => return None,
            };
            Some((key.as_str().to_string(), value))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_properties_mapping() {
        let mut headers = Headers::new();
        headers.insert("x-tenant".to_string(), "acme".to_string());
        let props = MessageProperties {
            reply_to: Some("amq.rabbitmq.reply-to".to_string()),
            correlation_id: Some("c1".to_string()),
            persistent: true,
            headers: Some(headers),
            priority: Some(4),
            ..Default::default()
        };

        let basic = basic_properties(&props);

        assert_eq!(basic.delivery_mode(), &Some(2));
        assert_eq!(
            basic.reply_to().as_ref().map(|s| s.as_str()),
            Some("amq.rabbitmq.reply-to")
        );
        assert_eq!(basic.correlation_id().as_ref().map(|s| s.as_str()), Some("c1"));
        assert_eq!(basic.priority(), &Some(4));
        let table = basic.headers().as_ref().unwrap();
        assert_eq!(headers_from_table(table).get("x-tenant").map(String::as_str), Some("acme"));
    }

    #[test]
    fn test_no_headers_field_when_absent() {
        let basic = basic_properties(&MessageProperties::default());
        assert!(basic.headers().is_none());
        assert_eq!(basic.delivery_mode(), &Some(1));
    }

    #[test]
    fn test_queue_arguments() {
        let options = QueueOptions {
            message_ttl: Some(60_000),
            dead_letter_exchange: Some("dlx".to_string()),
            max_priority: Some(10),
            ..Default::default()
        };

        let args = AmqpChannel::queue_arguments(&options);

        assert!(args.inner().contains_key("x-message-ttl"));
        assert!(args.inner().contains_key("x-dead-letter-exchange"));
        assert!(args.inner().contains_key("x-max-priority"));
        assert!(!args.inner().contains_key("x-expires"));
    }
}
