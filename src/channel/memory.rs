//! In-process channels whose engine side is driven by tests or embedders.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{Channel, ChannelFactory, Port, PortEvent};
use crate::error::BrokerError;
use crate::protocol::{InboundMessage, OutboundMessage};
use crate::session::LanguagePair;

/// In-process channels. Each opened channel's far end is handed out as a
/// [`RemoteEnd`] on the receiver returned by [`MemoryChannelFactory::new`],
/// so a test (or an embedded engine) can play the engine's part.
pub struct MemoryChannelFactory {
    remotes: mpsc::UnboundedSender<RemoteEnd>,
    refuse: Option<String>,
    opened: AtomicUsize,
}

impl MemoryChannelFactory {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<RemoteEnd>) {
        let (remotes, rx) = mpsc::unbounded_channel();
        let factory = Self {
            remotes,
            refuse: None,
            opened: AtomicUsize::new(0),
        };
        (factory, rx)
    }

    /// A factory whose every `open` fails with the given reason.
    pub fn refusing(reason: &str) -> Self {
        let (mut factory, _) = Self::new();
        factory.refuse = Some(reason.to_string());
        factory
    }

    /// Number of channels successfully opened so far.
    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ChannelFactory for MemoryChannelFactory {
    async fn open(&self, language_pair: &LanguagePair) -> Result<Channel, BrokerError> {
        if let Some(reason) = &self.refuse {
            return Err(BrokerError::Acquisition(reason.clone()));
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let closed = Arc::new(AtomicBool::new(false));

        let remote = RemoteEnd {
            language_pair: language_pair.clone(),
            outbound: out_rx,
            inbound: in_tx,
            closed: Arc::clone(&closed),
        };
        self.remotes
            .send(remote)
            .map_err(|_| BrokerError::Acquisition("no one is listening for channels".into()))?;
        self.opened.fetch_add(1, Ordering::SeqCst);

        Ok(Channel {
            port: Box::new(MemoryPort {
                outbound: out_tx,
                closed,
            }),
            inbound: in_rx,
        })
    }
}

struct MemoryPort {
    outbound: mpsc::UnboundedSender<OutboundMessage>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl Port for MemoryPort {
    async fn post(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(BrokerError::Channel("port is closed".into()));
        }
        self.outbound
            .send(message)
            .map_err(|_| BrokerError::Channel("remote end is gone".into()))
    }

    async fn close(&self) -> Result<(), BrokerError> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Err(BrokerError::Channel("port already closed".into()));
        }
        Ok(())
    }
}

/// The engine side of an in-memory channel.
pub struct RemoteEnd {
    pub language_pair: LanguagePair,
    outbound: mpsc::UnboundedReceiver<OutboundMessage>,
    inbound: mpsc::UnboundedSender<PortEvent>,
    closed: Arc<AtomicBool>,
}

impl RemoteEnd {
    /// Next message the session sent, or `None` once the session side is dropped.
    pub async fn recv(&mut self) -> Option<OutboundMessage> {
        self.outbound.recv().await
    }

    /// A message the session already sent, without waiting.
    pub fn try_recv(&mut self) -> Option<OutboundMessage> {
        self.outbound.try_recv().ok()
    }

    pub fn send(&self, message: InboundMessage) -> bool {
        self.send_raw(&message.to_json())
    }

    pub fn send_raw(&self, raw: &str) -> bool {
        self.inbound.send(PortEvent::Message(raw.to_string())).is_ok()
    }

    /// Deliver an unreadable message.
    pub fn send_error(&self, reason: &str) -> bool {
        self.inbound.send(PortEvent::Error(reason.to_string())).is_ok()
    }

    /// Whether the session closed its port.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Drop the engine side, ending the session's inbound stream.
    pub fn hang_up(self) {}
}
