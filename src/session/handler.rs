//! Per-session protocol handler.
//!
//! One task per session reads the channel's inbound side and drives the
//! session: status responses settle readiness, translation responses settle
//! their request, and anything that means the engine is gone runs cleanup
//! with a failure. The task exits when the session detaches it.

use std::sync::{Arc, Weak};

use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use super::Session;
use super::registry::RegistryInner;
use crate::channel::PortEvent;
use crate::consts::DEFAULT_NOT_READY_MESSAGE;
use crate::error::BrokerError;
use crate::protocol::{InboundMessage, STATUS_READY, message_type};

/// Spawn the handler for a freshly opened session.
pub(super) fn attach(
    registry: Weak<RegistryInner>,
    session: Arc<Session>,
    mut inbound: mpsc::UnboundedReceiver<PortEvent>,
    mut detached: watch::Receiver<bool>,
) {
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                biased;
                _ = detached.changed() => break,
                event = inbound.recv() => event,
            };

            let Some(inner) = registry.upgrade() else {
                break;
            };
            handle(&inner, &session, event).await;

            if session.is_tearing_down() {
                break;
            }
        }
        debug!(session = %session.id(), "protocol handler detached");
    });
}

/// Apply one inbound event. `None` means the inbound stream ended.
pub(super) async fn handle(
    registry: &RegistryInner,
    session: &Arc<Session>,
    event: Option<PortEvent>,
) {
    let raw = match event {
        Some(PortEvent::Message(raw)) => raw,
        Some(PortEvent::Error(reason)) => {
            registry
                .cleanup(session, Some(BrokerError::Deserialize(reason)))
                .await;
            return;
        }
        None => {
            registry
                .cleanup(session, Some(BrokerError::TerminatedUnexpectedly))
                .await;
            return;
        }
    };

    let message = match InboundMessage::parse(&raw) {
        Ok(message) => message,
        Err(e) => {
            registry
                .cleanup(session, Some(BrokerError::Deserialize(e.to_string())))
                .await;
            return;
        }
    };

    match message {
        InboundMessage::GetEngineStatusResponse { status, error } => {
            if status == STATUS_READY {
                if session.mark_ready() {
                    info!(session = %session.id(), pair = %session.language_pair(), "session ready");
                }
            } else {
                let reason = BrokerError::NotReady(
                    error.unwrap_or_else(|| DEFAULT_NOT_READY_MESSAGE.to_string()),
                );
                // Cleanup rejects readiness with this reason.
                registry.cleanup(session, Some(reason)).await;
            }
        }
        InboundMessage::TranslationResponse {
            translation_id,
            target_text,
        } => {
            if !session.requests().resolve(translation_id, target_text) {
                debug!(
                    session = %session.id(),
                    translation_id,
                    "response for unknown or settled translation ignored"
                );
            }
        }
        InboundMessage::EngineTerminated => {
            registry
                .cleanup(session, Some(BrokerError::TerminatedUnexpectedly))
                .await;
        }
        InboundMessage::Unrecognized => {
            warn!(
                session = %session.id(),
                message_type = message_type(&raw).as_deref().unwrap_or("?"),
                "unrecognized message from engine"
            );
        }
    }
}
