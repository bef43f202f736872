//! In-memory channel-based message bus for standalone mode.
//!
//! Uses a tokio broadcast channel for delivery within a single process.
//! Ideal for local development and testing without external
//! dependencies.

use async_trait::async_trait;
use tokio::sync::broadcast;
use tracing::{debug, info};

use crate::envelope::EventEnvelope;
use crate::interfaces::message_bus::{BusError, MessageBus, Result};

/// Default channel capacity for broadcast.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// In-memory message bus using a tokio broadcast channel.
///
/// Messages sent while no subscriber is attached are dropped; standalone
/// mode has no durability expectations of the transport itself (the
/// pending partition already carries the durability guarantee).
pub struct ChannelMessageBus {
    sender: broadcast::Sender<EventEnvelope>,
}

impl ChannelMessageBus {
    /// Create a bus with the given channel capacity.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        info!(capacity, "Channel message bus initialized");
        Self { sender }
    }

    /// Subscribe to delivered messages.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.sender.subscribe()
    }
}

impl Default for ChannelMessageBus {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

#[async_trait]
impl MessageBus for ChannelMessageBus {
    async fn send(&self, message: EventEnvelope) -> Result<()> {
        if self.sender.receiver_count() == 0 {
            debug!(message_id = %message.message_id, "No subscribers, message dropped");
            return Ok(());
        }
        self.sender
            .send(message)
            .map(|_| ())
            .map_err(|e| BusError::Send(e.to_string()))
    }

    async fn send_batch(&self, messages: Vec<EventEnvelope>) -> Result<()> {
        for message in messages {
            self.send(message).await?;
        }
        Ok(())
    }
}
