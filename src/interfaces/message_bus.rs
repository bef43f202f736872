//! Message delivery interface.

use async_trait::async_trait;

use crate::envelope::EventEnvelope;

/// Result type for bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors that can occur during bus operations.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Send failed: {0}")]
    Send(String),
}

/// Interface for message delivery.
///
/// There is no acknowledgment contract beyond "did not error". Delivery
/// is at-least-once end to end; consumers dedup on the envelope's
/// message id.
///
/// Implementations:
/// - `ChannelMessageBus`: in-process broadcast channel
/// - `MockMessageBus`: recording bus for tests
#[async_trait]
pub trait MessageBus: Send + Sync {
    /// Deliver a single message.
    async fn send(&self, message: EventEnvelope) -> Result<()>;

    /// Deliver a batch of messages, preserving order.
    async fn send_batch(&self, messages: Vec<EventEnvelope>) -> Result<()>;
}
