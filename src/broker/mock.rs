//! Scripted in-memory broker for testing.
//!
//! Every connection, channel and published frame is recorded so tests can
//! assert on them, and faults can be scripted per endpoint or per operation.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use async_trait::async_trait;
use futures::FutureExt;
use serde_json::Value;

use super::{
    BrokerChannel, BrokerConnection, BrokerError, ConnectionEvent, ConnectionObserver, Connector,
    DeliveryHandler, InboundReply, MessageProperties, PublishConfirm, Result,
};
use crate::config::QueueOptions;

/// Produces replies for a published frame.
pub type Responder = Arc<dyn Fn(&PublishedMessage) -> Vec<InboundReply> + Send + Sync>;

/// A frame recorded by `MockChannel::send_to_queue`.
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub queue: String,
    pub payload: Vec<u8>,
    pub properties: MessageProperties,
}

impl PublishedMessage {
    /// Decode the payload as JSON.
    pub fn json(&self) -> Value {
        serde_json::from_slice(&self.payload).unwrap_or(Value::Null)
    }

    /// Build a reply frame echoing this message's correlation id.
    pub fn reply(&self, body: &Value) -> InboundReply {
        InboundReply {
            correlation_id: self.properties.correlation_id.clone(),
            body: body.to_string().into_bytes(),
            headers: None,
        }
    }
}

#[derive(Default)]
struct Script {
    refused: HashMap<String, String>,
    fail_create_channel: Option<String>,
    fail_assert: Option<String>,
    fail_prefetch: Option<String>,
    fail_consume: Option<String>,
    fail_publish: Option<String>,
    nack: Option<String>,
    lose_confirms: Option<String>,
    disconnect_during_setup: Option<String>,
    silence_observers: bool,
    responder: Option<Responder>,
}

#[derive(Default)]
struct BrokerState {
    script: Script,
    attempts: Vec<String>,
    operations: Vec<String>,
    connections: Vec<Arc<MockConnection>>,
}

/// Handle to a scripted broker. Clones share state.
#[derive(Clone, Default)]
pub struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Connector that opens sessions against this broker.
    pub fn connector(&self) -> Arc<dyn Connector> {
        Arc::new(MockConnector {
            state: self.state.clone(),
        })
    }

    /// Refuse connections to `url`.
    pub fn refuse(&self, url: &str, cause: &str) {
        lock(&self.state)
            .script
            .refused
            .insert(url.to_string(), cause.to_string());
    }

    /// Accept connections to `url` again.
    pub fn accept(&self, url: &str) {
        lock(&self.state).script.refused.remove(url);
    }

    pub fn fail_create_channel(&self, cause: Option<&str>) {
        lock(&self.state).script.fail_create_channel = cause.map(str::to_string);
    }

    pub fn fail_assert(&self, cause: Option<&str>) {
        lock(&self.state).script.fail_assert = cause.map(str::to_string);
    }

    pub fn fail_prefetch(&self, cause: Option<&str>) {
        lock(&self.state).script.fail_prefetch = cause.map(str::to_string);
    }

    pub fn fail_consume(&self, cause: Option<&str>) {
        lock(&self.state).script.fail_consume = cause.map(str::to_string);
    }

    pub fn fail_publish(&self, cause: Option<&str>) {
        lock(&self.state).script.fail_publish = cause.map(str::to_string);
    }

    /// Negatively acknowledge every published frame.
    pub fn nack_publishes(&self, cause: Option<&str>) {
        lock(&self.state).script.nack = cause.map(str::to_string);
    }

    /// Fail publish confirms without a broker verdict, as when the channel
    /// goes away before the ack arrives.
    pub fn lose_confirms(&self, cause: Option<&str>) {
        lock(&self.state).script.lose_confirms = cause.map(str::to_string);
    }

    /// Drop the session while the channel is being created; channel
    /// creation then never completes.
    pub fn disconnect_during_setup(&self, cause: Option<&str>) {
        lock(&self.state).script.disconnect_during_setup = cause.map(str::to_string);
    }

    /// Discard connection observers as soon as they are attached.
    pub fn silence_observers(&self, silence: bool) {
        lock(&self.state).script.silence_observers = silence;
    }

    /// Answer published frames that carry a reply-to address.
    pub fn respond_with<F>(&self, responder: F)
    where
        F: Fn(&PublishedMessage) -> Vec<InboundReply> + Send + Sync + 'static,
    {
        lock(&self.state).script.responder = Some(Arc::new(responder));
    }

    /// URLs of every connect attempt, in order.
    pub fn connect_attempts(&self) -> Vec<String> {
        lock(&self.state).attempts.clone()
    }

    /// Channel-level operations across all sessions, in order.
    pub fn operations(&self) -> Vec<String> {
        lock(&self.state).operations.clone()
    }

    pub fn connection_count(&self) -> usize {
        lock(&self.state).connections.len()
    }

    pub fn connection(&self, index: usize) -> Option<Arc<MockConnection>> {
        lock(&self.state).connections.get(index).cloned()
    }

    pub fn last_connection(&self) -> Option<Arc<MockConnection>> {
        lock(&self.state).connections.last().cloned()
    }

    /// Most recently opened channel across all sessions.
    pub fn last_channel(&self) -> Option<Arc<MockChannel>> {
        self.last_connection()
            .and_then(|conn| lock(&conn.channels).last().cloned())
    }

    /// Every frame published on every channel.
    pub fn published(&self) -> Vec<PublishedMessage> {
        let connections = lock(&self.state).connections.clone();
        connections
            .iter()
            .flat_map(|conn| lock(&conn.channels).clone())
            .flat_map(|channel| channel.published())
            .collect()
    }
}

struct MockConnector {
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&self, url: &str) -> Result<Box<dyn BrokerConnection>> {
        let mut state = lock(&self.state);
        state.attempts.push(url.to_string());

        if let Some(cause) = state.script.refused.get(url) {
            return Err(BrokerError::Connection(cause.clone()));
        }

        let connection = Arc::new(MockConnection {
            url: url.to_string(),
            broker: self.state.clone(),
            observers: Mutex::new(Vec::new()),
            channels: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        });
        state.connections.push(connection.clone());
        Ok(Box::new(SharedConnection(connection)))
    }
}

/// Recorded broker session.
pub struct MockConnection {
    url: String,
    broker: Arc<Mutex<BrokerState>>,
    observers: Mutex<Vec<ConnectionObserver>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    closed: AtomicBool,
}

impl MockConnection {
    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.channels).len()
    }

    /// Raise a recoverable error signal.
    pub fn emit_error(&self, cause: &str) {
        self.notify(ConnectionEvent::Error(cause.to_string()));
    }

    /// Raise a disconnect signal.
    pub fn disconnect(&self, cause: &str) {
        self.notify(ConnectionEvent::Disconnected(cause.to_string()));
    }

    fn notify(&self, event: ConnectionEvent) {
        for observer in lock(&self.observers).iter() {
            observer(event.clone());
        }
    }
}

/// `Box<dyn BrokerConnection>` view over a recorded connection.
struct SharedConnection(Arc<MockConnection>);

#[async_trait]
impl BrokerConnection for SharedConnection {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>> {
        let conn = &self.0;
        let (fail, disconnect) = {
            let state = lock(&conn.broker);
            (
                state.script.fail_create_channel.clone(),
                state.script.disconnect_during_setup.clone(),
            )
        };

        if let Some(cause) = disconnect {
            conn.disconnect(&cause);
            return futures::future::pending().await;
        }
        if let Some(cause) = fail {
            return Err(BrokerError::Channel(cause));
        }
        if conn.is_closed() {
            return Err(BrokerError::Closed);
        }

        let channel = Arc::new(MockChannel {
            broker: conn.broker.clone(),
            connection: Arc::downgrade(conn),
            state: Mutex::new(ChannelState::default()),
            acked: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        lock(&conn.channels).push(channel.clone());
        Ok(channel)
    }

    fn observe(&self, observer: ConnectionObserver) {
        if lock(&self.0.broker).script.silence_observers {
            return;
        }
        lock(&self.0.observers).push(observer);
    }

    async fn close(&self) -> Result<()> {
        self.0.closed.store(true, Ordering::SeqCst);
        lock(&self.0.observers).clear();
        Ok(())
    }
}

#[derive(Default)]
struct ChannelState {
    asserted: Vec<(String, QueueOptions)>,
    prefetch: Option<(u16, bool)>,
    consumer: Option<(String, bool, DeliveryHandler)>,
    published: Vec<PublishedMessage>,
}

/// Recorded channel.
pub struct MockChannel {
    broker: Arc<Mutex<BrokerState>>,
    connection: Weak<MockConnection>,
    state: Mutex<ChannelState>,
    acked: AtomicUsize,
    closed: AtomicBool,
}

impl MockChannel {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn asserted_queues(&self) -> Vec<(String, QueueOptions)> {
        lock(&self.state).asserted.clone()
    }

    pub fn prefetch_setting(&self) -> Option<(u16, bool)> {
        lock(&self.state).prefetch
    }

    /// Queue and ack mode of the active consumer.
    pub fn consumer(&self) -> Option<(String, bool)> {
        lock(&self.state)
            .consumer
            .as_ref()
            .map(|(queue, no_ack, _)| (queue.clone(), *no_ack))
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        lock(&self.state).published.clone()
    }

    /// Manual acknowledgments sent for deliveries.
    pub fn acked(&self) -> usize {
        self.acked.load(Ordering::SeqCst)
    }

    /// Close the channel from the broker side; the connection stays up.
    pub fn broker_close(&self, cause: &str) {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.state).consumer = None;
        if let Some(connection) = self.connection.upgrade() {
            connection.notify(ConnectionEvent::ChannelLost(cause.to_string()));
        }
    }

    /// Deliver a frame to the consumer. Returns false if nothing is consuming.
    pub fn deliver(&self, reply: InboundReply) -> bool {
        let consumer = lock(&self.state)
            .consumer
            .as_ref()
            .map(|(_, no_ack, handler)| (*no_ack, handler.clone()));

        match consumer {
            Some((no_ack, handler)) if !self.is_closed() => {
                handler(reply);
                if !no_ack {
                    self.acked.fetch_add(1, Ordering::SeqCst);
                }
                true
            }
            _ => false,
        }
    }

    fn record(&self, operation: String) {
        lock(&self.broker).operations.push(operation);
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(BrokerError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl BrokerChannel for MockChannel {
    async fn assert_queue(&self, queue: &str, options: &QueueOptions) -> Result<()> {
        self.ensure_open()?;
        if let Some(cause) = lock(&self.broker).script.fail_assert.clone() {
            return Err(BrokerError::Channel(cause));
        }
        self.record(format!("assert_queue:{}", queue));
        lock(&self.state)
            .asserted
            .push((queue.to_string(), options.clone()));
        Ok(())
    }

    async fn prefetch(&self, count: u16, global: bool) -> Result<()> {
        self.ensure_open()?;
        if let Some(cause) = lock(&self.broker).script.fail_prefetch.clone() {
            return Err(BrokerError::Channel(cause));
        }
        self.record(format!("prefetch:{}:{}", count, global));
        lock(&self.state).prefetch = Some((count, global));
        Ok(())
    }

    async fn consume(&self, queue: &str, no_ack: bool, handler: DeliveryHandler) -> Result<()> {
        self.ensure_open()?;
        if let Some(cause) = lock(&self.broker).script.fail_consume.clone() {
            return Err(BrokerError::Channel(cause));
        }
        self.record(format!("consume:{}", queue));
        lock(&self.state).consumer = Some((queue.to_string(), no_ack, handler));
        Ok(())
    }

    async fn send_to_queue(
        &self,
        queue: &str,
        payload: Vec<u8>,
        properties: MessageProperties,
    ) -> Result<PublishConfirm> {
        self.ensure_open()?;
        let (fail, nack, lost, responder) = {
            let state = lock(&self.broker);
            (
                state.script.fail_publish.clone(),
                state.script.nack.clone(),
                state.script.lose_confirms.clone(),
                state.script.responder.clone(),
            )
        };
        if let Some(cause) = fail {
            return Err(BrokerError::Publish(cause));
        }

        self.record(format!("publish:{}", queue));
        let message = PublishedMessage {
            queue: queue.to_string(),
            payload,
            properties,
        };
        lock(&self.state).published.push(message.clone());

        if let (Some(responder), Some(_)) = (responder, message.properties.reply_to.as_ref()) {
            for reply in responder(&message) {
                self.deliver(reply);
            }
        }

        let outcome = match (nack, lost) {
            (Some(cause), _) => Err(BrokerError::Rejected(cause)),
            (None, Some(cause)) => Err(BrokerError::Publish(cause)),
            (None, None) => Ok(()),
        };
        Ok(async move { outcome }.boxed())
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        lock(&self.state).consumer = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_refused_endpoint() {
        let broker = MockBroker::new();
        broker.refuse("amqp://down", "connection refused");

        let result = broker.connector().connect("amqp://down").await;

        assert!(matches!(result, Err(BrokerError::Connection(_))));
        assert_eq!(broker.connect_attempts(), vec!["amqp://down"]);
        assert_eq!(broker.connection_count(), 0);
    }

    #[tokio::test]
    async fn test_responder_answers_on_consumer() {
        let broker = MockBroker::new();
        broker.respond_with(|msg| vec![msg.reply(&serde_json::json!({"ok": true}))]);

        let conn = broker.connector().connect("amqp://up").await.unwrap();
        let channel = conn.create_channel().await.unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        channel
            .consume(
                "replies",
                true,
                Arc::new(move |reply: InboundReply| lock(&sink).push(reply)),
            )
            .await
            .unwrap();

        let props = MessageProperties {
            reply_to: Some("replies".to_string()),
            correlation_id: Some("c1".to_string()),
            ..Default::default()
        };
        let confirm = channel
            .send_to_queue("work", b"{}".to_vec(), props)
            .await
            .unwrap();
        confirm.await.unwrap();

        let received = lock(&received);
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].correlation_id.as_deref(), Some("c1"));
    }

    #[tokio::test]
    async fn test_nack_resolves_confirm_as_rejected() {
        let broker = MockBroker::new();
        broker.nack_publishes(Some("queue full"));

        let conn = broker.connector().connect("amqp://up").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let confirm = channel
            .send_to_queue("work", Vec::new(), MessageProperties::default())
            .await
            .unwrap();

        assert!(matches!(confirm.await, Err(BrokerError::Rejected(_))));
    }

    #[tokio::test]
    async fn test_closed_channel_refuses_publish() {
        let broker = MockBroker::new();
        let conn = broker.connector().connect("amqp://up").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        channel.close().await.unwrap();

        let result = channel
            .send_to_queue("work", Vec::new(), MessageProperties::default())
            .await;
        assert!(matches!(result, Err(BrokerError::Closed)));
    }

    #[tokio::test]
    async fn test_broker_close_signals_channel_lost() {
        let broker = MockBroker::new();
        let conn = broker.connector().connect("amqp://up").await.unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        conn.observe(Box::new(move |event: ConnectionEvent| lock(&sink).push(event)));
        conn.create_channel().await.unwrap();

        let channel = broker.last_channel().unwrap();
        channel.broker_close("PRECONDITION_FAILED");

        assert!(channel.is_closed());
        assert!(!broker.last_connection().unwrap().is_closed());
        assert_eq!(
            *lock(&events),
            vec![ConnectionEvent::ChannelLost("PRECONDITION_FAILED".to_string())]
        );
    }

    #[tokio::test]
    async fn test_lost_confirm_is_not_a_rejection() {
        let broker = MockBroker::new();
        broker.lose_confirms(Some("channel closed"));

        let conn = broker.connector().connect("amqp://up").await.unwrap();
        let channel = conn.create_channel().await.unwrap();
        let confirm = channel
            .send_to_queue("work", Vec::new(), MessageProperties::default())
            .await
            .unwrap();

        assert!(matches!(confirm.await, Err(BrokerError::Publish(_))));
    }
}
