//! Error types for the MQTT session client.

use std::io;

use thiserror::Error;

use crate::types::ConnectReturnCode;

/// Error type for MQTT session operations.
#[derive(Error, Debug)]
pub enum Error {
    /// IO error on the transport.
    #[error("mqtt: io error: {0}")]
    Io(#[from] io::Error),

    /// Connection closed by the broker.
    #[error("mqtt: connection closed")]
    ConnectionClosed,

    /// No PINGRESP arrived within the grace period.
    #[error("mqtt: keep-alive timeout, no ping response within {0:?}")]
    KeepAliveTimeout(std::time::Duration),

    /// Malformed or unexpected packet from the broker.
    #[error("mqtt: protocol error: {0}")]
    Protocol(String),

    /// Broker refused the connection with a non-zero return code.
    #[error("mqtt: connection refused: {0}")]
    ConnectionRefused(ConnectReturnCode),

    /// Connect failed (handshake timeout, reconnect attempts exhausted, ...).
    #[error("mqtt: connect error: {0}")]
    Connect(String),

    /// Broker rejected a subscription.
    #[error("mqtt: subscribe error on {filter}: {reason}")]
    Subscribe { filter: String, reason: String },

    /// No PUBACK arrived, even after retransmitting with DUP set.
    #[error("mqtt: publish timeout for packet {packet_id}")]
    PublishTimeout { packet_id: u16 },

    /// An acknowledgement did not arrive in time.
    #[error("mqtt: timeout: {0}")]
    Timeout(String),

    /// Session is not connected.
    #[error("mqtt: not connected")]
    NotConnected,

    /// The run loop is already running for this session.
    #[error("mqtt: session loop already running")]
    AlreadyRunning,

    /// Session was disconnected while the operation was pending.
    #[error("mqtt: session cancelled")]
    Cancelled,

    /// All 65535 packet identifiers are in flight.
    #[error("mqtt: no free packet identifier")]
    PacketIdsExhausted,

    /// Invalid topic name for publishing.
    #[error("mqtt: invalid topic: {0}")]
    InvalidTopic(String),

    /// Invalid topic filter for subscribing.
    #[error("mqtt: invalid topic filter: {0}")]
    InvalidTopicFilter(String),

    /// Invalid configuration.
    #[error("mqtt: invalid config: {0}")]
    InvalidConfig(String),

    /// Handler error.
    #[error("mqtt: handler error: {0}")]
    Handler(String),
}

impl Error {
    /// Socket-level failures. These trigger the reconnect policy.
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ConnectionClosed | Error::KeepAliveTimeout(_)
        )
    }

    /// Malformed traffic from the broker. Fatal for the connection.
    pub fn is_protocol(&self) -> bool {
        matches!(self, Error::Protocol(_))
    }
}

/// Result type for MQTT session operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification() {
        let io = Error::from(io::Error::new(io::ErrorKind::ConnectionReset, "reset"));
        assert!(io.is_transport());
        assert!(Error::ConnectionClosed.is_transport());
        assert!(!Error::ConnectionClosed.is_protocol());
        assert!(Error::Protocol("bad".into()).is_protocol());
        assert!(!Error::PublishTimeout { packet_id: 1 }.is_transport());
    }

    #[test]
    fn test_display() {
        let err = Error::ConnectionRefused(ConnectReturnCode::NotAuthorized);
        assert_eq!(err.to_string(), "mqtt: connection refused: not authorized");

        let err = Error::Subscribe {
            filter: "a/#".into(),
            reason: "rejected".into(),
        };
        assert!(err.to_string().contains("a/#"));
    }
}
