//! Translation sessions: one channel to one engine, with its own readiness
//! and in-flight requests.

pub mod correlator;
mod handler;
pub mod registry;

pub use registry::{SessionOptions, SessionRegistry};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;

use crate::channel::Port;
use crate::deferred::Deferred;
use crate::error::BrokerError;
use crate::protocol::OutboundMessage;
use correlator::Correlator;

/// Source and target language of a session, as BCP-47 tags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LanguagePair {
    #[serde(default)]
    pub source_language: String,
    #[serde(default)]
    pub target_language: String,
}

impl LanguagePair {
    pub fn new(source: &str, target: &str) -> Self {
        Self {
            source_language: source.to_string(),
            target_language: target.to_string(),
        }
    }

    /// Both languages must be present and non-blank.
    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.source_language.trim().is_empty() {
            return Err(BrokerError::MissingField("sourceLanguage"));
        }
        if self.target_language.trim().is_empty() {
            return Err(BrokerError::MissingField("targetLanguage"));
        }
        Ok(())
    }
}

impl fmt::Display for LanguagePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} -> {}", self.source_language, self.target_language)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Initializing,
    Ready,
    Failed,
    Terminated,
}

/// What `create_session` hands back.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    pub session_id: String,
    pub status: SessionStatus,
    pub language_pair: LanguagePair,
}

/// A translation request. Either `text` or `sourceText` carries the input.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationInput {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub source_text: Option<String>,
    #[serde(default, rename = "isHTML")]
    pub is_html: bool,
}

impl TranslationInput {
    pub fn text(text: &str) -> Self {
        Self {
            text: Some(text.to_string()),
            ..Self::default()
        }
    }

    /// The text to translate. `text` wins when both are given.
    pub fn source(&self) -> Result<&str, BrokerError> {
        self.text
            .as_deref()
            .or(self.source_text.as_deref())
            .ok_or(BrokerError::MissingField("text"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TranslationOutcome {
    pub session_id: String,
    pub translation_id: u64,
    pub target_text: String,
    pub language_pair: LanguagePair,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyOptions {
    /// Tell the engine to drop queued work before the channel closes.
    #[serde(default = "default_true")]
    pub discard_translations: bool,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            discard_translations: true,
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DestroyOutcome {
    pub session_id: String,
    pub destroyed: bool,
}

/// Live state of one session. Owned by the registry; everything here is
/// mutated only through the registry and the session's protocol handler.
pub struct Session {
    id: String,
    language_pair: LanguagePair,
    status: Mutex<SessionStatus>,
    readiness: Deferred<()>,
    requests: Correlator<String>,
    port: Box<dyn Port>,
    detach: watch::Sender<bool>,
    tearing_down: AtomicBool,
}

impl Session {
    pub(crate) fn new(
        id: String,
        language_pair: LanguagePair,
        port: Box<dyn Port>,
    ) -> (Self, watch::Receiver<bool>) {
        let (detach, detached) = watch::channel(false);
        let session = Self {
            id,
            language_pair,
            status: Mutex::new(SessionStatus::Initializing),
            readiness: Deferred::new(),
            requests: Correlator::new(),
            port,
            detach,
            tearing_down: AtomicBool::new(false),
        };
        (session, detached)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn language_pair(&self) -> &LanguagePair {
        &self.language_pair
    }

    pub fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn pending_requests(&self) -> usize {
        self.requests.pending()
    }

    pub(crate) fn readiness(&self) -> &Deferred<()> {
        &self.readiness
    }

    pub(crate) fn requests(&self) -> &Correlator<String> {
        &self.requests
    }

    fn set_status(&self, status: SessionStatus) {
        *self.status.lock().unwrap_or_else(PoisonError::into_inner) = status;
    }

    /// `initializing -> ready`. Returns `false` if the session already left
    /// `initializing`.
    pub(crate) fn mark_ready(&self) -> bool {
        let mut status = self.status.lock().unwrap_or_else(PoisonError::into_inner);
        if *status != SessionStatus::Initializing {
            return false;
        }
        *status = SessionStatus::Ready;
        self.readiness.resolve(())
    }

    /// Claim the right to tear this session down. Only the first caller wins.
    pub(crate) fn begin_teardown(&self) -> bool {
        !self.tearing_down.swap(true, Ordering::SeqCst)
    }

    pub(crate) fn is_tearing_down(&self) -> bool {
        self.tearing_down.load(Ordering::SeqCst)
    }

    /// Stop the protocol handler. It receives nothing after this.
    pub(crate) fn detach_handler(&self) {
        self.detach.send_replace(true);
    }

    pub(crate) async fn post(&self, message: OutboundMessage) -> Result<(), BrokerError> {
        self.port.post(message).await
    }

    pub(crate) async fn close_port(&self) -> Result<(), BrokerError> {
        self.port.close().await
    }

    /// Send one translation and wait for its response.
    pub(crate) async fn translate(
        &self,
        source_text: &str,
        is_html: bool,
        timeout: Option<Duration>,
    ) -> Result<(u64, String), BrokerError> {
        self.requests
            .issue(
                |translation_id| {
                    self.post(OutboundMessage::TranslationRequest {
                        translation_id,
                        source_text: source_text.to_string(),
                        is_html,
                    })
                },
                timeout,
            )
            .await
    }

    /// Final state after teardown, then reject everyone still waiting.
    pub(crate) fn settle_all(&self, reason: Option<BrokerError>) -> usize {
        let (status, reason) = match reason {
            Some(reason) => (SessionStatus::Failed, reason),
            None => (SessionStatus::Terminated, BrokerError::Destroyed),
        };
        self.set_status(status);
        let rejected = self.requests.close(reason.clone());
        self.readiness.reject(reason);
        rejected
    }
}
