//! Built-in JSON record codec and the record builder.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::{
    Deserializer, IncomingResponse, OutgoingPacket, PacketData, ReplyOptions, Serializer,
    WireRecord,
};
use crate::broker::{Headers, MessageProperties};
use crate::error::{ClientError, Result};

/// Per-message broker options carried alongside a payload.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordOptions {
    pub headers: Option<Headers>,
    pub priority: Option<u8>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub persistent: Option<bool>,
    pub delivery_mode: Option<u8>,
}

impl RecordOptions {
    /// Overlay these options onto `properties`.
    ///
    /// Headers are not applied here; the publisher merges them separately.
    pub fn apply_to(&self, properties: &mut MessageProperties) {
        if let Some(persistent) = self.persistent {
            properties.persistent = persistent;
        }
        if self.delivery_mode.is_some() {
            properties.delivery_mode = self.delivery_mode;
        }
        if self.priority.is_some() {
            properties.priority = self.priority;
        }
        if self.expiration.is_some() {
            properties.expiration = self.expiration.clone();
        }
        if self.message_id.is_some() {
            properties.message_id = self.message_id.clone();
        }
        if self.timestamp.is_some() {
            properties.timestamp = self.timestamp;
        }
        if self.kind.is_some() {
            properties.kind = self.kind.clone();
        }
        if self.user_id.is_some() {
            properties.user_id = self.user_id.clone();
        }
        if self.app_id.is_some() {
            properties.app_id = self.app_id.clone();
        }
        if self.content_type.is_some() {
            properties.content_type = self.content_type.clone();
        }
        if self.content_encoding.is_some() {
            properties.content_encoding = self.content_encoding.clone();
        }
    }
}

/// Payload paired with broker options.
#[derive(Debug, Clone, PartialEq)]
pub struct RmqRecord {
    pub data: Value,
    pub options: Option<RecordOptions>,
}

impl RmqRecord {
    pub fn new(data: Value, options: Option<RecordOptions>) -> Self {
        Self { data, options }
    }
}

/// Builder for `RmqRecord`.
///
/// ```
/// use replymux::codec::RmqRecordBuilder;
/// use serde_json::json;
///
/// let record = RmqRecordBuilder::new(json!({"sku": "A-1"}))
///     .header("x-tenant", "acme")
///     .priority(3)
///     .build();
/// assert_eq!(record.options.unwrap().priority, Some(3));
/// ```
#[derive(Debug, Clone, Default)]
pub struct RmqRecordBuilder {
    data: Value,
    options: RecordOptions,
}

impl RmqRecordBuilder {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            options: RecordOptions::default(),
        }
    }

    pub fn data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn options(mut self, options: RecordOptions) -> Self {
        self.options = options;
        self
    }

    pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.options
            .headers
            .get_or_insert_with(Headers::new)
            .insert(key.into(), value.into());
        self
    }

    pub fn priority(mut self, priority: u8) -> Self {
        self.options.priority = Some(priority);
        self
    }

    /// Per-message TTL in milliseconds.
    pub fn expiration(mut self, millis: u64) -> Self {
        self.options.expiration = Some(millis.to_string());
        self
    }

    pub fn message_id(mut self, id: impl Into<String>) -> Self {
        self.options.message_id = Some(id.into());
        self
    }

    pub fn persistent(mut self, persistent: bool) -> Self {
        self.options.persistent = Some(persistent);
        self
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.options.content_type = Some(content_type.into());
        self
    }

    pub fn build(self) -> RmqRecord {
        let options = (self.options != RecordOptions::default()).then_some(self.options);
        RmqRecord::new(self.data, options)
    }
}

/// Default serializer.
///
/// Unwraps `RmqRecord` data into the body and lifts its options out so the
/// publisher can apply them to the send call.
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordSerializer;

impl Serializer for RecordSerializer {
    fn serialize(&self, packet: OutgoingPacket) -> Result<WireRecord> {
        let (data, options) = match packet.data {
            PacketData::Plain(value) => (value, None),
            PacketData::Record(record) => (record.data, record.options),
        };

        let mut body = Map::new();
        if let Some(id) = packet.id {
            body.insert("id".to_string(), Value::String(id));
        }
        body.insert("pattern".to_string(), packet.pattern);
        body.insert("data".to_string(), data);

        Ok(WireRecord {
            payload: Value::Object(body),
            options,
        })
    }
}

/// Default deserializer.
///
/// Objects carrying any of `err`, `response` or `isDisposed` are read as
/// response envelopes. Anything else is an external reply: the whole value
/// is the response and no more replies follow.
#[derive(Debug, Clone, Copy, Default)]
pub struct IncomingResponseDeserializer;

impl IncomingResponseDeserializer {
    fn is_envelope(map: &Map<String, Value>) -> bool {
        ["err", "response", "isDisposed"]
            .iter()
            .any(|key| map.get(*key).is_some_and(|v| !v.is_null()))
    }
}

impl Deserializer for IncomingResponseDeserializer {
    fn deserialize(&self, value: Value, options: &ReplyOptions) -> Result<IncomingResponse> {
        let value = match value {
            Value::Object(mut map) if Self::is_envelope(&map) => {
                map.retain(|_, v| !v.is_null());
                return serde_json::from_value(Value::Object(map))
                    .map_err(|e| ClientError::Deserialization(e.to_string()));
            }
            other => other,
        };

        let id = value
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_string)
            .or_else(|| options.correlation_id.clone());

        Ok(IncomingResponse {
            id,
            err: None,
            response: Some(value),
            is_disposed: true,
        })
    }
}
