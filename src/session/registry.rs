//! The session registry: creation, lookup, requests, and teardown.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::handler;
use super::{
    DestroyOptions, DestroyOutcome, LanguagePair, Session, SessionDescriptor, TranslationInput,
    TranslationOutcome,
};
use crate::channel::ChannelFactory;
use crate::consts::{DEFAULT_READY_TIMEOUT, DEFAULT_REQUEST_TIMEOUT, TEARDOWN_STEP_TIMEOUT};
use crate::error::BrokerError;
use crate::id;
use crate::protocol::OutboundMessage;

/// Limits on how long callers wait. `None` waits forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    pub ready_timeout: Option<Duration>,
    pub request_timeout: Option<Duration>,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            ready_timeout: Some(DEFAULT_READY_TIMEOUT),
            request_timeout: Some(DEFAULT_REQUEST_TIMEOUT),
        }
    }
}

pub(crate) struct RegistryInner {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    factory: Arc<dyn ChannelFactory>,
    options: SessionOptions,
}

impl RegistryInner {
    fn sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<Session>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn lookup(&self, session_id: &str) -> Option<Arc<Session>> {
        self.sessions().get(session_id).cloned()
    }

    fn fresh_id(&self) -> String {
        let sessions = self.sessions();
        loop {
            let candidate = id::generate();
            if !sessions.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Tear a session down unless someone already is. Safe to call any
    /// number of times.
    pub(crate) async fn cleanup(&self, session: &Arc<Session>, reason: Option<BrokerError>) {
        if session.begin_teardown() {
            self.teardown(session, reason).await;
        }
    }

    /// Detach the handler, close the channel, unregister, then reject every
    /// waiter. Callers must have won [`Session::begin_teardown`].
    async fn teardown(&self, session: &Arc<Session>, reason: Option<BrokerError>) {
        session.detach_handler();

        match tokio::time::timeout(TEARDOWN_STEP_TIMEOUT, session.close_port()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(session = %session.id(), error = %e, "failed to close channel"),
            Err(_) => warn!(session = %session.id(), "channel close timed out"),
        }

        self.sessions().remove(session.id());

        let failure = reason.as_ref().map(ToString::to_string);
        let rejected = session.settle_all(reason);
        match failure {
            Some(error) => warn!(session = %session.id(), %error, rejected, "session failed"),
            None => info!(session = %session.id(), rejected, "session destroyed"),
        }
    }
}

/// Creates, looks up, and removes translation sessions. Cloning shares the
/// same set of live sessions.
#[derive(Clone)]
pub struct SessionRegistry {
    inner: Arc<RegistryInner>,
}

impl SessionRegistry {
    pub fn new(factory: Arc<dyn ChannelFactory>, options: SessionOptions) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                sessions: Mutex::new(HashMap::new()),
                factory,
                options,
            }),
        }
    }

    pub fn options(&self) -> SessionOptions {
        self.inner.options
    }

    pub fn len(&self) -> usize {
        self.inner.sessions().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn ids(&self) -> Vec<String> {
        self.inner.sessions().keys().cloned().collect()
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<Session>> {
        self.inner.lookup(session_id)
    }

    /// Open a channel for `language_pair` and wait until its engine is ready.
    ///
    /// The pair is validated before any channel is opened. If the engine
    /// fails, terminates, or times out first, the session is already torn
    /// down when this returns the error.
    pub async fn create_session(
        &self,
        language_pair: LanguagePair,
    ) -> Result<SessionDescriptor, BrokerError> {
        language_pair.validate()?;

        let channel = self.inner.factory.open(&language_pair).await?;
        let session_id = self.inner.fresh_id();
        let (session, detached) = Session::new(session_id.clone(), language_pair, channel.port);
        let session = Arc::new(session);

        self.inner
            .sessions()
            .insert(session_id.clone(), Arc::clone(&session));
        handler::attach(
            Arc::downgrade(&self.inner),
            Arc::clone(&session),
            channel.inbound,
            detached,
        );
        debug!(session = %session_id, pair = %session.language_pair(), "session initializing");

        if let Err(e) = session.post(OutboundMessage::GetEngineStatusRequest).await {
            self.inner.cleanup(&session, Some(e.clone())).await;
            return Err(e);
        }

        match self.inner.options.ready_timeout {
            Some(after) => {
                if tokio::time::timeout(after, session.readiness().wait())
                    .await
                    .is_err()
                {
                    let reason = BrokerError::TimedOut {
                        what: "engine readiness",
                        after,
                    };
                    // Only fail the session if readiness did not settle in the meantime.
                    if session.readiness().reject(reason.clone()) {
                        self.inner.cleanup(&session, Some(reason)).await;
                    }
                }
                session.readiness().wait().await?;
            }
            None => session.readiness().wait().await?,
        }

        Ok(SessionDescriptor {
            session_id,
            status: session.status(),
            language_pair: session.language_pair().clone(),
        })
    }

    /// Translate through an existing session. Waits for readiness first, so a
    /// request made while the session initializes queues until it is ready.
    pub async fn run_request(
        &self,
        session_id: &str,
        input: TranslationInput,
    ) -> Result<TranslationOutcome, BrokerError> {
        if session_id.is_empty() {
            return Err(BrokerError::MissingArgument("sessionId"));
        }
        let session = self
            .inner
            .lookup(session_id)
            .ok_or_else(|| BrokerError::session_not_found(session_id))?;

        session.readiness().wait().await?;
        let source_text = input.source()?;

        let (translation_id, target_text) = session
            .translate(source_text, input.is_html, self.inner.options.request_timeout)
            .await?;
        debug!(session = %session_id, translation_id, "translation complete");

        Ok(TranslationOutcome {
            session_id: session_id.to_string(),
            translation_id,
            target_text,
            language_pair: session.language_pair().clone(),
        })
    }

    /// Tear a session down. Unknown or already-destroyed sessions report
    /// `destroyed: false` rather than failing.
    pub async fn destroy_session(
        &self,
        session_id: &str,
        options: DestroyOptions,
    ) -> Result<DestroyOutcome, BrokerError> {
        if session_id.is_empty() {
            return Err(BrokerError::MissingArgument("sessionId"));
        }

        let destroyed = match self.inner.lookup(session_id) {
            Some(session) if session.begin_teardown() => {
                if options.discard_translations {
                    let discard = session.post(OutboundMessage::DiscardTranslations);
                    match tokio::time::timeout(TEARDOWN_STEP_TIMEOUT, discard).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => warn!(session = %session_id, error = %e, "failed to send discard"),
                        Err(_) => warn!(session = %session_id, "discard timed out"),
                    }
                }
                self.inner.teardown(&session, None).await;
                true
            }
            _ => false,
        };

        Ok(DestroyOutcome {
            session_id: session_id.to_string(),
            destroyed,
        })
    }

    /// Destroy every live session. Returns how many were destroyed.
    pub async fn destroy_all(&self) -> usize {
        let ids = self.ids();
        let results = futures::future::join_all(
            ids.iter()
                .map(|id| self.destroy_session(id, DestroyOptions::default())),
        )
        .await;
        results
            .into_iter()
            .filter(|r| matches!(r, Ok(outcome) if outcome.destroyed))
            .count()
    }
}
