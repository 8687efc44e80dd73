//! Transport abstraction traits for Orbit.
//!
//! These traits define the interface the core expects from the event broker
//! and the document store, so the routing core stays client-agnostic.

use crate::record::Record;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The handle or connection was already closed.
    #[error("Connection closed")]
    ConnectionClosed,

    /// An operation did not complete in time.
    #[error("Timed out after {0} ms")]
    Timeout(u64),

    /// Failed to establish a connection.
    #[error("Connect failed: {0}")]
    ConnectFailed(String),

    /// Failed to send data.
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Failed to receive data.
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),

    /// Failed to disconnect cleanly.
    #[error("Disconnect failed: {0}")]
    DisconnectFailed(String),

    /// The transport cannot express the requested operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Where a new consumer group starts reading a topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOffset {
    /// Replay from the earliest retained record.
    Earliest,
    /// Only records appended after subscription.
    Latest,
}

/// An event broker client.
///
/// One broker connection is owned by the orchestrator and shared read-only by
/// every stream route. Routes obtain their own admin, consumer and producer
/// handles from it and release them on unbind; only the owner may call
/// [`Broker::connect`] and [`Broker::disconnect`].
#[async_trait]
pub trait Broker: Send + Sync {
    /// Establish the connection to the brokers.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Acquire an administrative handle.
    async fn admin(&self) -> Result<Box<dyn AdminHandle>, TransportError>;

    /// Acquire a consumer in `group_id` subscribed to `topic`.
    async fn consumer(
        &self,
        group_id: &str,
        topic: &str,
        start: StartOffset,
    ) -> Result<Box<dyn ConsumerHandle>, TransportError>;

    /// Acquire a connected producer.
    async fn producer(&self) -> Result<Arc<dyn ProducerHandle>, TransportError>;

    /// Close the broker connection.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Get the transport name (e.g., "memory", "kafka").
    fn name(&self) -> &'static str;
}

/// Administrative access to the broker (topic metadata and the like).
#[async_trait]
pub trait AdminHandle: Send + Sync {
    /// List the topics known to the broker.
    async fn list_topics(&self) -> Result<Vec<String>, TransportError>;

    /// Release the handle.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// A subscription to a single topic.
#[async_trait]
pub trait ConsumerHandle: Send {
    /// The subscribed topic.
    fn topic(&self) -> &str;

    /// Receive the next record.
    ///
    /// Waits until a record is available. Returns `None` once the consumer
    /// has been closed and no further records will arrive.
    async fn recv(&mut self) -> Result<Option<Record>, TransportError>;

    /// Leave the group and release the handle.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

/// A connected producer.
#[async_trait]
pub trait ProducerHandle: Send + Sync {
    /// Append `payload` to `topic`.
    async fn send(&self, topic: &str, payload: Bytes) -> Result<(), TransportError>;

    /// Flush and release the producer.
    async fn disconnect(&self) -> Result<(), TransportError>;
}

/// A document store client.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Connect to the store.
    async fn connect(&self) -> Result<(), TransportError>;

    /// Return any one document from `collection`, if it has one.
    async fn find_one(
        &self,
        database: &str,
        collection: &str,
    ) -> Result<Option<serde_json::Value>, TransportError>;

    /// Close the connection.
    async fn disconnect(&self) -> Result<(), TransportError>;

    /// Get the store name (e.g., "memory", "mongodb").
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(TransportError::Timeout(30_000).to_string(), "Timed out after 30000 ms");
        assert_eq!(
            TransportError::ConnectFailed("refused".into()).to_string(),
            "Connect failed: refused"
        );
    }
}
