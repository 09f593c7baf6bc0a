//! Outbound frames: requests that expect replies and fire-and-forget events.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

use super::replies::{ReplyHandle, ReplyListener, ReplyRegistry};
use super::supervisor::Session;
use crate::broker::{BrokerError, Headers, InboundReply, MessageProperties, PublishConfirm};
use crate::codec::{
    Deserializer, IncomingResponse, OutgoingPacket, ReadPacket, ReplyOptions, Serializer,
    WritePacket,
};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Callback receiving every reply for one request.
pub type ReplyCallback = Arc<dyn Fn(WritePacket) + Send + Sync>;

/// Merge client-wide default headers with call-site headers.
///
/// Call-site keys win. Returns `None` only when neither side has headers.
pub(crate) fn merge_headers(
    defaults: Option<&Headers>,
    call_site: Option<&Headers>,
) -> Option<Headers> {
    if defaults.is_none() && call_site.is_none() {
        return None;
    }
    let mut merged = defaults.cloned().unwrap_or_default();
    if let Some(headers) = call_site {
        merged.extend(headers.iter().map(|(k, v)| (k.clone(), v.clone())));
    }
    Some(merged)
}

/// Turn one reply frame into exactly one callback invocation.
///
/// Error replies and disposed replies are terminal; anything else is a
/// partial response of a multi-reply stream.
pub(crate) fn deliver_reply(
    deserializer: &dyn Deserializer,
    reply: &InboundReply,
    callback: &ReplyCallback,
) {
    let options = ReplyOptions {
        correlation_id: reply.correlation_id.clone(),
        headers: reply.headers.clone(),
    };
    let decoded = serde_json::from_slice::<Value>(&reply.body)
        .map_err(|e| ClientError::Deserialization(e.to_string()))
        .and_then(|value| deserializer.deserialize(value, &options));

    let packet = match decoded {
        Err(e) => WritePacket::failed(e),
        Ok(IncomingResponse {
            err: Some(err),
            response,
            ..
        }) => WritePacket {
            err: Some(ClientError::Remote(err)),
            response,
            is_disposed: true,
        },
        Ok(IncomingResponse {
            response,
            is_disposed,
            ..
        }) => WritePacket {
            err: None,
            response,
            is_disposed,
        },
    };
    callback(packet);
}

/// Wrap `callback` so nothing reaches it after the first terminal packet.
///
/// A request can end through its reply, a send failure or a broker nack;
/// whichever lands first is the only terminal packet the caller sees.
pub(crate) fn terminal_once(callback: ReplyCallback) -> ReplyCallback {
    let finished = Arc::new(AtomicBool::new(false));
    Arc::new(move |packet: WritePacket| {
        let done = if packet.is_disposed {
            finished.swap(true, Ordering::SeqCst)
        } else {
            finished.load(Ordering::SeqCst)
        };
        if !done {
            callback(packet);
        }
    })
}

/// Builds frames and publishes them on the session's channel.
pub(crate) struct Publisher {
    config: Arc<ClientConfig>,
    replies: ReplyRegistry,
    pub(crate) serializer: Arc<dyn Serializer>,
    pub(crate) deserializer: Arc<dyn Deserializer>,
}

impl Publisher {
    pub(crate) fn new(
        config: Arc<ClientConfig>,
        replies: ReplyRegistry,
        serializer: Arc<dyn Serializer>,
        deserializer: Arc<dyn Deserializer>,
    ) -> Self {
        Self {
            config,
            replies,
            serializer,
            deserializer,
        }
    }

    pub(crate) fn next_correlation_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Serialize a packet and derive its broker properties.
    ///
    /// Requests carry `correlation_id` and the reply queue; events carry
    /// neither.
    pub(crate) fn frame(
        &self,
        packet: OutgoingPacket,
    ) -> Result<(Vec<u8>, MessageProperties)> {
        let correlation_id = packet.id.clone();
        let record = self.serializer.serialize(packet)?;
        let payload = record.encode()?;

        let mut properties = MessageProperties {
            reply_to: correlation_id
                .as_ref()
                .map(|_| self.config.reply_queue.clone()),
            persistent: self.config.persistent,
            ..Default::default()
        };
        if let Some(options) = &record.options {
            options.apply_to(&mut properties);
        }
        properties.headers = merge_headers(
            self.config.headers.as_ref(),
            record.options.as_ref().and_then(|o| o.headers.as_ref()),
        );
        properties.correlation_id = correlation_id;

        Ok((payload, properties))
    }

    /// Register a listener under `correlation_id`, then publish the request.
    ///
    /// A failed publish removes the listener and hands the error to
    /// `callback` before returning. A later nack does the same unless a
    /// terminal reply got there first; a confirm lost with the channel
    /// leaves the request registered.
    pub(crate) async fn request(
        &self,
        session: &Session,
        correlation_id: String,
        packet: ReadPacket,
        callback: ReplyCallback,
    ) -> ReplyHandle {
        let callback = terminal_once(callback);
        let handle = self
            .replies
            .register(&correlation_id, self.listener(callback.clone()));

        match self.publish_request(session, &correlation_id, packet).await {
            Ok(confirm) => {
                debug!(correlation_id = %correlation_id, queue = %self.config.queue, "Request sent");
                let pending = handle.clone();
                tokio::spawn(async move {
                    match confirm.await {
                        Ok(()) => {}
                        Err(e @ BrokerError::Rejected(_)) => {
                            warn!(
                                correlation_id = %pending.correlation_id(),
                                error = %e,
                                "Request rejected by broker"
                            );
                            pending.cancel();
                            callback(WritePacket::failed(ClientError::Send(e.to_string())));
                        }
                        Err(e) => {
                            warn!(
                                correlation_id = %pending.correlation_id(),
                                error = %e,
                                "Request confirm lost, request stays registered"
                            );
                        }
                    }
                });
            }
            Err(e) => {
                warn!(correlation_id = %correlation_id, error = %e, "Request send failed");
                handle.cancel();
                callback(WritePacket::failed(e));
            }
        }
        handle
    }

    async fn publish_request(
        &self,
        session: &Session,
        correlation_id: &str,
        packet: ReadPacket,
    ) -> Result<PublishConfirm> {
        let (payload, properties) = self.frame(OutgoingPacket::request(correlation_id, packet))?;
        session
            .channel
            .send_to_queue(&self.config.queue, payload, properties)
            .await
            .map_err(|e| ClientError::Send(e.to_string()))
    }

    /// Publish an event and wait for the broker to accept it.
    pub(crate) async fn event(&self, session: &Session, packet: ReadPacket) -> Result<()> {
        let (payload, properties) = self.frame(OutgoingPacket::event(packet))?;
        let confirm = session
            .channel
            .send_to_queue(&self.config.queue, payload, properties)
            .await
            .map_err(|e| ClientError::Send(e.to_string()))?;
        confirm
            .await
            .map_err(|e| ClientError::Send(e.to_string()))?;
        debug!(queue = %self.config.queue, "Event dispatched");
        Ok(())
    }

    fn listener(&self, callback: ReplyCallback) -> ReplyListener {
        let deserializer = Arc::clone(&self.deserializer);
        Arc::new(move |reply: &InboundReply| {
            deliver_reply(deserializer.as_ref(), reply, &callback)
        })
    }
}
