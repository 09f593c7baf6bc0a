//! Error types for the replymux client.

use std::time::Duration;

use serde_json::Value;

use crate::broker::BrokerError;

/// Result type for client operations.
pub type Result<T> = std::result::Result<T, ClientError>;

/// Errors that can occur during client operations.
///
/// Cloneable so that a single in-flight connect attempt can hand the same
/// outcome to every caller awaiting it.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ClientError {
    /// Every candidate endpoint failed, or the session was lost during setup.
    #[error("connection failed: {0}")]
    Connection(String),

    /// Queue assertion, prefetch or consumer setup was rejected.
    #[error("channel setup failed: {0}")]
    ChannelSetup(String),

    /// Publishing a frame failed or the broker refused it.
    #[error("send failed: {0}")]
    Send(String),

    /// The outbound packet could not be encoded.
    #[error("serialization failed: {0}")]
    Serialization(String),

    /// A reply frame could not be decoded.
    #[error("deserialization failed: {0}")]
    Deserialization(String),

    /// The responder replied with an error value.
    #[error("remote error: {0}")]
    Remote(Value),

    /// No terminal reply arrived before the caller's deadline.
    #[error("no reply within {0:?}")]
    Timeout(Duration),

    /// The reply stream completed without yielding a value.
    #[error("reply stream completed without a response")]
    NoResponse,

    /// Invalid client configuration.
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl ClientError {
    /// Returns the error message.
    pub fn message(&self) -> String {
        match self {
            ClientError::Connection(msg)
            | ClientError::ChannelSetup(msg)
            | ClientError::Send(msg)
            | ClientError::Serialization(msg)
            | ClientError::Deserialization(msg)
            | ClientError::Config(msg) => msg.clone(),
            ClientError::Remote(value) => match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            },
            ClientError::Timeout(_) | ClientError::NoResponse => self.to_string(),
        }
    }

    /// Returns true if this is a connection or channel setup error.
    ///
    /// These are recoverable by calling `connect()` again.
    pub fn is_connection_error(&self) -> bool {
        matches!(
            self,
            ClientError::Connection(_) | ClientError::ChannelSetup(_)
        )
    }

    /// Returns true if the error came back from the responder.
    pub fn is_remote(&self) -> bool {
        matches!(self, ClientError::Remote(_))
    }

    /// Returns true if the caller's deadline expired.
    pub fn is_timeout(&self) -> bool {
        matches!(self, ClientError::Timeout(_))
    }
}

impl From<BrokerError> for ClientError {
    fn from(err: BrokerError) -> Self {
        match err {
            BrokerError::Connection(msg) => ClientError::Connection(msg),
            BrokerError::Channel(msg) => ClientError::ChannelSetup(msg),
            BrokerError::Publish(msg) | BrokerError::Rejected(msg) => ClientError::Send(msg),
            BrokerError::Closed => ClientError::Send(BrokerError::Closed.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_connection_error_display() {
        let err = ClientError::Connection("refused".to_string());
        assert_eq!(err.to_string(), "connection failed: refused");
        assert!(err.is_connection_error());
    }

    #[test]
    fn test_remote_error_message_unwraps_strings() {
        let err = ClientError::Remote(json!("boom"));
        assert_eq!(err.message(), "boom");
        assert!(err.is_remote());

        let err = ClientError::Remote(json!({"status": "error"}));
        assert_eq!(err.message(), r#"{"status":"error"}"#);
    }

    #[test]
    fn test_timeout_error() {
        let err = ClientError::Timeout(Duration::from_millis(250));
        assert!(err.is_timeout());
        assert_eq!(err.to_string(), "no reply within 250ms");
    }

    #[test]
    fn test_broker_error_mapping() {
        assert!(matches!(
            ClientError::from(BrokerError::Channel("no queue".into())),
            ClientError::ChannelSetup(_)
        ));
        assert!(matches!(
            ClientError::from(BrokerError::Rejected("nack".into())),
            ClientError::Send(_)
        ));
        assert!(matches!(
            ClientError::from(BrokerError::Closed),
            ClientError::Send(_)
        ));
    }
}
