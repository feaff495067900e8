//! Command dispatch: the request/response surface callers talk to.
//!
//! A request names a command and carries positional arguments. Every
//! outcome is wrapped as `{"name":"success","result":...}` or
//! `{"name":"error","error":{"message","name","stack"}}`, so nothing but
//! plain JSON ever crosses the transport.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::sync::Arc;
use tracing::debug;

use crate::engine::{DestroyEngineOptions, EngineAdapter, EngineOptions, InferenceRequest};
use crate::error::{BrokerError, source_chain};
use crate::extract::PageExtractor;
use crate::session::{DestroyOptions, LanguagePair, SessionRegistry, TranslationInput};

/// One line of input in serve mode.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct Request {
    /// Echoed back on the reply so callers can match concurrent requests.
    #[serde(default)]
    pub id: Option<Value>,
    pub command: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SerializedError {
    pub message: String,
    pub name: String,
    pub stack: String,
}

impl From<&BrokerError> for SerializedError {
    fn from(err: &BrokerError) -> Self {
        Self {
            message: err.to_string(),
            name: err.name().to_string(),
            stack: format!("{}: {}", err.name(), source_chain(err)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "name", rename_all = "lowercase")]
pub enum Envelope {
    Success { result: Value },
    Error { error: SerializedError },
}

impl Envelope {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reply {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<Value>,
    #[serde(flatten)]
    pub envelope: Envelope,
}

/// Positional arguments of one command.
struct Args<'a>(&'a [Value]);

impl Args<'_> {
    fn optional<T: DeserializeOwned>(
        &self,
        index: usize,
        name: &'static str,
    ) -> Result<Option<T>, BrokerError> {
        match self.0.get(index) {
            None | Some(Value::Null) => Ok(None),
            Some(value) => T::deserialize(value)
                .map(Some)
                .map_err(|e| BrokerError::InvalidArgument {
                    name,
                    reason: e.to_string(),
                }),
        }
    }

    fn required<T: DeserializeOwned>(&self, index: usize, name: &'static str) -> Result<T, BrokerError> {
        self.optional(index, name)?
            .ok_or(BrokerError::MissingArgument(name))
    }
}

fn to_json<T: Serialize>(value: T) -> Result<Value, BrokerError> {
    serde_json::to_value(value).map_err(|e| BrokerError::Engine(format!("unserializable result: {e}")))
}

/// Routes commands to the session registry, the engine adapter, and the page
/// extractor.
pub struct Dispatcher {
    sessions: SessionRegistry,
    engines: EngineAdapter,
    extractor: Option<Arc<dyn PageExtractor>>,
}

impl Dispatcher {
    pub fn new(sessions: SessionRegistry, engines: EngineAdapter) -> Self {
        Self {
            sessions,
            engines,
            extractor: None,
        }
    }

    pub fn with_extractor(mut self, extractor: Arc<dyn PageExtractor>) -> Self {
        self.extractor = Some(extractor);
        self
    }

    pub fn sessions(&self) -> &SessionRegistry {
        &self.sessions
    }

    pub fn engines(&self) -> &EngineAdapter {
        &self.engines
    }

    /// Run one command and wrap its outcome.
    pub async fn dispatch(&self, command: &str, args: &[Value]) -> Envelope {
        match self.execute(command, Args(args)).await {
            Ok(result) => Envelope::Success { result },
            Err(e) => {
                debug!(command, error = %e, "command failed");
                Envelope::Error { error: (&e).into() }
            }
        }
    }

    /// Handle one serve-mode line and produce the reply line.
    pub async fn handle_line(&self, line: &str) -> String {
        let reply = match serde_json::from_str::<Request>(line) {
            Ok(request) => Reply {
                envelope: self.dispatch(&request.command, &request.args).await,
                id: request.id,
            },
            Err(e) => Reply {
                id: None,
                envelope: Envelope::Error {
                    error: (&BrokerError::InvalidArgument {
                        name: "request",
                        reason: e.to_string(),
                    })
                        .into(),
                },
            },
        };
        serde_json::to_string(&reply).unwrap_or_else(|e| {
            json!({"name": "error", "error": {"message": e.to_string(), "name": "Error", "stack": ""}})
                .to_string()
        })
    }

    /// Destroy every session and engine. Returns `(sessions, engines)` torn down.
    pub async fn shutdown(&self) -> (usize, usize) {
        tokio::join!(self.sessions.destroy_all(), self.engines.destroy_all())
    }

    fn extractor(&self) -> Result<&dyn PageExtractor, BrokerError> {
        self.extractor
            .as_deref()
            .ok_or_else(|| BrokerError::Extraction("no page extractor is available".into()))
    }

    async fn execute(&self, command: &str, args: Args<'_>) -> Result<Value, BrokerError> {
        match command {
            "create_translations_session" => {
                let raw: Value = args.required(0, "languagePair")?;
                // The pair may come bare or wrapped as {"languagePair": {...}}.
                let raw = raw.get("languagePair").cloned().unwrap_or(raw);
                let pair = LanguagePair::deserialize(&raw).map_err(|e| {
                    BrokerError::InvalidArgument {
                        name: "languagePair",
                        reason: e.to_string(),
                    }
                })?;
                to_json(self.sessions.create_session(pair).await?)
            }
            "run_translations_session" => {
                let session_id: String = args.required(0, "sessionId")?;
                let input: TranslationInput = args.required(1, "request")?;
                to_json(self.sessions.run_request(&session_id, input).await?)
            }
            "destroy_translations_session" => {
                let session_id: String = args.required(0, "sessionId")?;
                let options: DestroyOptions = args.optional(1, "options")?.unwrap_or_default();
                to_json(self.sessions.destroy_session(&session_id, options).await?)
            }
            "create_ml_engine" => {
                let options: EngineOptions = args.required(0, "options")?;
                to_json(self.engines.create(options).await?)
            }
            "run_ml_engine" => {
                let engine_id: String = args.required(0, "engineId")?;
                let request: InferenceRequest = args.required(1, "request")?;
                to_json(self.engines.run(&engine_id, request).await?)
            }
            "destroy_ml_engine" => {
                let engine_id: String = args.required(0, "engineId")?;
                let options: DestroyEngineOptions =
                    args.optional(1, "options")?.unwrap_or_default();
                to_json(self.engines.destroy(&engine_id, options).await?)
            }
            "get_page_text" => {
                let options = args.optional(0, "options")?.unwrap_or_else(|| json!({}));
                self.extractor()?.get_text(options).await
            }
            "get_reader_mode_content" => {
                let force = args.optional(0, "force")?.unwrap_or(false);
                to_json(self.extractor()?.get_reader_mode_content(force).await?)
            }
            "get_page_info" => {
                let options = args.optional(0, "options")?.unwrap_or_else(|| json!({}));
                to_json(self.extractor()?.get_page_info(options).await?)
            }
            "get_selection_text" => to_json(self.extractor()?.get_selection_text().await?),
            "get_headless_page_text" => {
                let url: String = args.required(0, "url")?;
                let options = args.optional(1, "options")?.unwrap_or_else(|| json!({}));
                self.extractor()?.get_headless_page_text(&url, options).await
            }
            other => Err(BrokerError::UnknownCommand(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::memory::MemoryChannelFactory;
    use crate::engine::mock::MockEngineProvider;
    use crate::session::SessionOptions;

    fn dispatcher() -> Dispatcher {
        let (factory, _remotes) = MemoryChannelFactory::new();
        Dispatcher::new(
            SessionRegistry::new(Arc::new(factory), SessionOptions::default()),
            EngineAdapter::new(Arc::new(MockEngineProvider::new())),
        )
    }

    fn error_of(envelope: Envelope) -> SerializedError {
        match envelope {
            Envelope::Error { error } => error,
            other => panic!("expected an error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unknown_command_is_a_validation_error() {
        let error = error_of(dispatcher().dispatch("open_sesame", &[]).await);
        assert_eq!(error.name, "ValidationError");
        assert!(error.message.contains("open_sesame"));
        assert!(error.stack.starts_with("ValidationError: "));
    }

    #[tokio::test]
    async fn missing_required_argument() {
        let error = error_of(dispatcher().dispatch("run_ml_engine", &[]).await);
        assert_eq!(error.message, "missing required argument: engineId");
    }

    #[tokio::test]
    async fn wrongly_typed_argument() {
        let error = error_of(
            dispatcher()
                .dispatch("destroy_translations_session", &[json!(42)])
                .await,
        );
        assert_eq!(error.name, "ValidationError");
        assert!(error.message.starts_with("invalid argument sessionId"));
    }

    #[tokio::test]
    async fn missing_target_language_opens_nothing() {
        let (factory, _remotes) = MemoryChannelFactory::new();
        let factory = Arc::new(factory);
        let dispatcher = Dispatcher::new(
            SessionRegistry::new(factory.clone(), SessionOptions::default()),
            EngineAdapter::new(Arc::new(MockEngineProvider::new())),
        );

        let error = error_of(
            dispatcher
                .dispatch(
                    "create_translations_session",
                    &[json!({"languagePair": {"sourceLanguage": "es"}})],
                )
                .await,
        );
        assert_eq!(error.message, "missing required field: targetLanguage");
        assert_eq!(factory.opened(), 0);
    }

    #[tokio::test]
    async fn engine_commands_round_trip() {
        let dispatcher = dispatcher();
        let created = dispatcher
            .dispatch("create_ml_engine", &[json!({"taskName": "summarization"})])
            .await;
        assert_eq!(
            serde_json::to_value(&created).unwrap(),
            json!({"name": "success", "result": {"engineId": "summarization-1", "status": "ready"}})
        );

        let ran = dispatcher
            .dispatch(
                "run_ml_engine",
                &[json!("summarization-1"), json!({"args": ["long text"]})],
            )
            .await;
        assert_eq!(
            ran,
            Envelope::Success {
                result: json!({"entries": ["long text"], "metrics": null})
            }
        );

        // Options omitted: shutdown defaults to true.
        let destroyed = dispatcher
            .dispatch("destroy_ml_engine", &[json!("summarization-1")])
            .await;
        assert_eq!(
            destroyed,
            Envelope::Success {
                result: json!({"engineId": "summarization-1", "status": "closed"})
            }
        );
    }

    #[tokio::test]
    async fn extraction_without_extractor_fails() {
        let error = error_of(dispatcher().dispatch("get_selection_text", &[]).await);
        assert_eq!(error.name, "RemoteError");
    }

    #[tokio::test]
    async fn handle_line_echoes_id() {
        let reply = dispatcher()
            .handle_line(r#"{"id": 7, "command": "destroy_translations_session", "args": ["nope"]}"#)
            .await;
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(
            reply,
            json!({"id": 7, "name": "success", "result": {"sessionId": "nope", "destroyed": false}})
        );
    }

    #[tokio::test]
    async fn handle_line_rejects_garbage() {
        let reply = dispatcher().handle_line("not json").await;
        let reply: Value = serde_json::from_str(&reply).unwrap();
        assert_eq!(reply["name"], "error");
        assert_eq!(reply["error"]["name"], "ValidationError");
        assert!(reply.get("id").is_none());
    }
}
