//! Bidirectional message channels between sessions and translation engines.

pub mod memory;
pub mod process;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::BrokerError;
use crate::protocol::OutboundMessage;
use crate::session::LanguagePair;

/// Something arriving on a channel's inbound side.
#[derive(Debug, Clone, PartialEq)]
pub enum PortEvent {
    /// One raw wire message, not yet parsed.
    Message(String),
    /// The transport delivered something that could not be read as a message.
    Error(String),
}

/// The sending half of a channel.
#[async_trait]
pub trait Port: Send + Sync {
    async fn post(&self, message: OutboundMessage) -> Result<(), BrokerError>;

    /// Close the transport. Called exactly once, during session cleanup.
    async fn close(&self) -> Result<(), BrokerError>;
}

/// A freshly opened bidirectional channel. The inbound stream ending means the
/// remote side is gone.
pub struct Channel {
    pub port: Box<dyn Port>,
    pub inbound: mpsc::UnboundedReceiver<PortEvent>,
}

/// Opens channels to translation engines.
#[async_trait]
pub trait ChannelFactory: Send + Sync {
    async fn open(&self, language_pair: &LanguagePair) -> Result<Channel, BrokerError>;
}
