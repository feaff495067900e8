//! Channels backed by one translator child process per session.

use async_trait::async_trait;
use tracing::info;

use super::{Channel, ChannelFactory, Port};
use crate::child::JsonLinesChild;
use crate::consts::{ENV_SOURCE_LANGUAGE, ENV_TARGET_LANGUAGE};
use crate::error::BrokerError;
use crate::protocol::OutboundMessage;
use crate::session::LanguagePair;

/// Opens one translator process per session. The process receives the
/// language pair through the environment and exchanges one wire message
/// per line on stdin/stdout.
pub struct ProcessChannelFactory {
    command: Vec<String>,
}

impl ProcessChannelFactory {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl ChannelFactory for ProcessChannelFactory {
    async fn open(&self, language_pair: &LanguagePair) -> Result<Channel, BrokerError> {
        if self.command.is_empty() {
            return Err(BrokerError::Acquisition(
                "no translator command configured".into(),
            ));
        }
        let (child, inbound) = JsonLinesChild::spawn(
            &self.command,
            &[
                (ENV_SOURCE_LANGUAGE, language_pair.source_language.as_str()),
                (ENV_TARGET_LANGUAGE, language_pair.target_language.as_str()),
            ],
        )?;
        info!(
            command = %self.command.join(" "),
            pair = %language_pair,
            "spawned translator"
        );
        Ok(Channel {
            port: Box::new(ProcessPort { child }),
            inbound,
        })
    }
}

struct ProcessPort {
    child: JsonLinesChild,
}

#[async_trait]
impl Port for ProcessPort {
    async fn post(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        self.child.send(&message)
    }

    async fn close(&self) -> Result<(), BrokerError> {
        self.child.shutdown().await
    }
}
