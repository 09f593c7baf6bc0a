//! Packet types and the codec seam.
//!
//! The client hands every outbound packet to a `Serializer` and every
//! decoded reply body to a `Deserializer`. The defaults speak the JSON
//! record format: `{ "id", "pattern", "data" }` out and
//! `{ "id", "err", "response", "isDisposed" }` back.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::broker::Headers;
use crate::error::{ClientError, Result};

mod record;

pub use record::{
    IncomingResponseDeserializer, RecordOptions, RecordSerializer, RmqRecord, RmqRecordBuilder,
};

/// Caller-supplied packet: a routing pattern and its data.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadPacket {
    pub pattern: Value,
    pub data: PacketData,
}

impl ReadPacket {
    pub fn new(pattern: impl Into<Value>, data: impl Into<PacketData>) -> Self {
        Self {
            pattern: pattern.into(),
            data: data.into(),
        }
    }
}

/// Packet data, optionally carrying per-message broker options.
#[derive(Debug, Clone, PartialEq)]
pub enum PacketData {
    Plain(Value),
    Record(RmqRecord),
}

impl From<Value> for PacketData {
    fn from(value: Value) -> Self {
        PacketData::Plain(value)
    }
}

impl From<RmqRecord> for PacketData {
    fn from(record: RmqRecord) -> Self {
        PacketData::Record(record)
    }
}

/// Packet handed to the serializer. `id` is set for requests only.
#[derive(Debug, Clone, PartialEq)]
pub struct OutgoingPacket {
    pub id: Option<String>,
    pub pattern: Value,
    pub data: PacketData,
}

impl OutgoingPacket {
    pub fn request(id: impl Into<String>, packet: ReadPacket) -> Self {
        Self {
            id: Some(id.into()),
            pattern: packet.pattern,
            data: packet.data,
        }
    }

    pub fn event(packet: ReadPacket) -> Self {
        Self {
            id: None,
            pattern: packet.pattern,
            data: packet.data,
        }
    }
}

/// Serializer output: the body to encode plus broker options to merge into
/// the send call.
#[derive(Debug, Clone, PartialEq)]
pub struct WireRecord {
    pub payload: Value,
    pub options: Option<RecordOptions>,
}

impl WireRecord {
    /// Encode the payload body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(&self.payload).map_err(|e| ClientError::Serialization(e.to_string()))
    }
}

/// Decoded reply, as produced by a `Deserializer`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IncomingResponse {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub err: Option<Value>,
    #[serde(default)]
    pub response: Option<Value>,
    #[serde(default)]
    pub is_disposed: bool,
}

/// Reply delivered to a request's callback.
#[derive(Debug, Clone, Default)]
pub struct WritePacket {
    pub err: Option<ClientError>,
    pub response: Option<Value>,
    /// No further replies are expected for this request.
    pub is_disposed: bool,
}

impl WritePacket {
    /// Terminal packet carrying an error.
    pub fn failed(err: ClientError) -> Self {
        Self {
            err: Some(err),
            response: None,
            is_disposed: true,
        }
    }

    /// Non-terminal packet carrying a response.
    pub fn response(value: Value) -> Self {
        Self {
            err: None,
            response: Some(value),
            is_disposed: false,
        }
    }
}

/// Reply metadata passed to the deserializer alongside the body.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReplyOptions {
    pub correlation_id: Option<String>,
    pub headers: Option<Headers>,
}

/// Turns outbound packets into wire records.
pub trait Serializer: Send + Sync {
    fn serialize(&self, packet: OutgoingPacket) -> Result<WireRecord>;
}

/// Turns raw reply values into responses.
pub trait Deserializer: Send + Sync {
    fn deserialize(&self, value: Value, options: &ReplyOptions) -> Result<IncomingResponse>;
}
