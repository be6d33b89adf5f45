//! Channel traits for implementing chat platform adapters.

use crate::message::{InboundEvent, OutgoingMessage};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Result type for channel operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

/// Channel error type.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Message send failed: {0}")]
    SendFailed(String),

    #[error("Channel not ready")]
    NotReady,

    #[error("Internal error: {0}")]
    Internal(String),
}

/// Chat platform adapter.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Get the channel name.
    fn name(&self) -> &'static str;

    /// Initialize the channel (authenticate, resolve the bot identity).
    async fn init(&mut self) -> ChannelResult<()>;

    /// Send a message. Returns the platform message ID.
    async fn send(&self, message: OutgoingMessage) -> ChannelResult<String>;

    /// Receive events until shutdown, forwarding each validated event to `sink`.
    async fn listen(&self, sink: mpsc::Sender<InboundEvent>) -> ChannelResult<()>;

    /// Check if the channel is healthy.
    async fn health_check(&self) -> ChannelResult<()>;

    /// Shutdown the channel gracefully.
    async fn shutdown(&self) -> ChannelResult<()>;
}
