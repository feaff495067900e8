//! Messages exchanged between a session and its translation engine.
//!
//! Every message is a JSON object discriminated by its `type` field.
//! Inbound messages with a `type` this crate does not know parse as
//! [`InboundMessage::Unrecognized`] rather than failing, so newer engines
//! can add message types without breaking older brokers.

use serde::{Deserialize, Serialize};

/// Status an engine reports once it can accept translation requests.
pub const STATUS_READY: &str = "ready";

/// Session → engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum OutboundMessage {
    GetEngineStatusRequest,
    #[serde(rename_all = "camelCase")]
    TranslationRequest {
        translation_id: u64,
        source_text: String,
        #[serde(rename = "isHTML")]
        is_html: bool,
    },
    DiscardTranslations,
}

/// Engine → session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum InboundMessage {
    GetEngineStatusResponse {
        status: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    TranslationResponse {
        translation_id: u64,
        target_text: String,
    },
    EngineTerminated,
    #[serde(other)]
    Unrecognized,
}

impl InboundMessage {
    /// Parse one raw message. Fails on invalid JSON, a missing `type`, or a
    /// known `type` whose fields do not match.
    pub fn parse(raw: &str) -> serde_json::Result<Self> {
        serde_json::from_str(raw)
    }

    pub fn ready() -> Self {
        Self::GetEngineStatusResponse {
            status: STATUS_READY.to_string(),
            error: None,
        }
    }

    pub fn to_json(&self) -> String {
        // A flat enum of strings and integers always serializes.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// The `type` field of a raw message, for logging messages that did not parse
/// into a known variant.
pub fn message_type(raw: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    value.get("type")?.as_str().map(str::to_string)
}
