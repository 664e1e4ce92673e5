//! Data channel abstraction.
//!
//! A channel is split into a [`DataChannel`] handle used for sending and
//! closing, and an event stream delivering [`ChannelEvent`]s in order.

use std::fmt;
use std::sync::Arc;

use fireside_transfer::BoxFuture;
use tokio::sync::mpsc;

use crate::error::DataChannelError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// One message on the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelMessage {
    /// JSON control message.
    Text(String),
    /// Framed chunk.
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    Open,
    Message(ChannelMessage),
    Close,
}

/// Sending half of an ordered, reliable, message-based channel.
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    fn ready_state(&self) -> ReadyState;

    /// Queues a message. Fails with [`DataChannelError::Closed`] unless open.
    fn send(&self, message: ChannelMessage) -> BoxFuture<'_, Result<(), DataChannelError>>;

    /// Closes the channel. Closing a closed channel is a no-op.
    fn close(&self);
}

/// A channel together with its inbound events.
pub struct ChannelEndpoint {
    pub channel: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl ChannelEndpoint {
    pub fn new(
        channel: Arc<dyn DataChannel>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
    ) -> Self {
        Self { channel, events }
    }
}

impl fmt::Debug for ChannelEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelEndpoint")
            .field("label", &self.channel.label())
            .field("ready_state", &self.channel.ready_state())
            .finish()
    }
}
