//! Message bus implementations.

use std::sync::Arc;

use tracing::info;

use crate::config::{MessagingConfig, MessagingType};
use crate::interfaces::MessageBus;

#[cfg(feature = "channel")]
pub mod channel;
pub mod mock;

#[cfg(feature = "channel")]
pub use channel::ChannelMessageBus;
pub use mock::MockMessageBus;

/// Initialize a message bus based on configuration.
pub fn init_messaging(
    config: &MessagingConfig,
) -> Result<Arc<dyn MessageBus>, Box<dyn std::error::Error + Send + Sync>> {
    match config.messaging_type {
        #[cfg(feature = "channel")]
        MessagingType::Channel => {
            info!(capacity = config.channel.capacity, "Messaging: channel");
            Ok(Arc::new(ChannelMessageBus::new(config.channel.capacity)))
        }
        #[cfg(not(feature = "channel"))]
        MessagingType::Channel => {
            Err("Channel messaging requested but 'channel' feature is not enabled".into())
        }
    }
}
