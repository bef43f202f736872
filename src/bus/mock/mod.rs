//! Mock message bus for testing.

use async_trait::async_trait;
use tokio::sync::RwLock;

use crate::envelope::EventEnvelope;
use crate::interfaces::message_bus::{BusError, MessageBus, Result};

/// Mock bus that records every send and can be told to fail.
#[derive(Default)]
pub struct MockMessageBus {
    batches: RwLock<Vec<Vec<EventEnvelope>>>,
    fail_on_send: RwLock<bool>,
}

impl MockMessageBus {
    /// Create a recording bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent send fail.
    pub async fn set_fail_on_send(&self, fail: bool) {
        *self.fail_on_send.write().await = fail;
    }

    /// All recorded batches, in send order. Single sends record as
    /// one-element batches.
    pub async fn batches(&self) -> Vec<Vec<EventEnvelope>> {
        self.batches.read().await.clone()
    }

    /// Total number of send calls.
    pub async fn send_count(&self) -> usize {
        self.batches.read().await.len()
    }
}

#[async_trait]
impl MessageBus for MockMessageBus {
    async fn send(&self, message: EventEnvelope) -> Result<()> {
        self.send_batch(vec![message]).await
    }

    async fn send_batch(&self, messages: Vec<EventEnvelope>) -> Result<()> {
        if *self.fail_on_send.read().await {
            return Err(BusError::Send("injected failure".to_string()));
        }
        self.batches.write().await.push(messages);
        Ok(())
    }
}
