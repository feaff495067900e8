use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Value, json};

use courier::channel::memory::MemoryChannelFactory;
use courier::dispatch::{Dispatcher, Envelope};
use courier::engine::EngineAdapter;
use courier::engine::mock::MockEngineProvider;
use courier::error::BrokerError;
use courier::extract::PageExtractor;
use courier::protocol::{InboundMessage, OutboundMessage};
use courier::session::{SessionOptions, SessionRegistry};

/// Serves one fixed page.
struct FixedPage;

#[async_trait]
impl PageExtractor for FixedPage {
    async fn get_text(&self, options: Value) -> Result<Value, BrokerError> {
        Ok(json!({"text": "Hola mundo", "options": options}))
    }

    async fn get_reader_mode_content(&self, force: bool) -> Result<Option<String>, BrokerError> {
        Ok(force.then(|| "<article>Hola</article>".to_string()))
    }

    async fn get_page_info(&self, _options: Value) -> Result<Option<Value>, BrokerError> {
        Ok(None)
    }

    async fn get_selection_text(&self) -> Result<String, BrokerError> {
        Ok("mundo".to_string())
    }

    async fn get_headless_page_text(&self, url: &str, _options: Value) -> Result<Value, BrokerError> {
        if url.starts_with("https://") {
            Ok(json!({"url": url, "text": "headless"}))
        } else {
            Err(BrokerError::Extraction(format!("refusing to load {url}")))
        }
    }
}

fn result_of(envelope: Envelope) -> Value {
    match envelope {
        Envelope::Success { result } => result,
        Envelope::Error { error } => panic!("expected success, got {error:?}"),
    }
}

fn extracting_dispatcher() -> Dispatcher {
    let (factory, _remotes) = MemoryChannelFactory::new();
    Dispatcher::new(
        SessionRegistry::new(Arc::new(factory), SessionOptions::default()),
        EngineAdapter::new(Arc::new(MockEngineProvider::new())),
    )
    .with_extractor(Arc::new(FixedPage))
}

#[tokio::test]
async fn translation_commands_end_to_end() {
    let (factory, mut remotes) = MemoryChannelFactory::new();
    let dispatcher = Dispatcher::new(
        SessionRegistry::new(Arc::new(factory), SessionOptions::default()),
        EngineAdapter::new(Arc::new(MockEngineProvider::new())),
    );

    let engine = async {
        let mut remote = remotes.recv().await.unwrap();
        assert_eq!(
            remote.recv().await,
            Some(OutboundMessage::GetEngineStatusRequest)
        );
        remote.send(InboundMessage::ready());
        remote
    };
    // Wrapped the way browser clients send it.
    let create_args = [json!({"languagePair": {"sourceLanguage": "es", "targetLanguage": "en"}})];
    let (created, mut remote) = tokio::join!(
        dispatcher.dispatch("create_translations_session", &create_args),
        engine
    );
    let created = result_of(created);
    assert_eq!(created["status"], "ready");
    let session_id = created["sessionId"].as_str().unwrap().to_string();

    let engine = async {
        match remote.recv().await {
            Some(OutboundMessage::TranslationRequest {
                translation_id,
                source_text,
                is_html,
            }) => {
                assert_eq!(source_text, "<b>Hola</b>");
                assert!(is_html);
                remote.send(InboundMessage::TranslationResponse {
                    translation_id,
                    target_text: "<b>Hello</b>".to_string(),
                });
            }
            other => panic!("expected a translation request, got {other:?}"),
        }
    };
    let run_args = [json!(session_id), json!({"sourceText": "<b>Hola</b>", "isHTML": true})];
    let (translated, ()) = tokio::join!(
        dispatcher.dispatch("run_translations_session", &run_args),
        engine
    );
    assert_eq!(
        result_of(translated),
        json!({
            "sessionId": session_id,
            "translationId": 1,
            "targetText": "<b>Hello</b>",
            "languagePair": {"sourceLanguage": "es", "targetLanguage": "en"}
        })
    );

    let destroyed = dispatcher
        .dispatch(
            "destroy_translations_session",
            &[json!(session_id), json!({"discardTranslations": false})],
        )
        .await;
    assert_eq!(
        result_of(destroyed),
        json!({"sessionId": session_id, "destroyed": true})
    );
    assert_eq!(remote.try_recv(), None);

    let again = dispatcher
        .dispatch("destroy_translations_session", &[json!(session_id)])
        .await;
    assert_eq!(result_of(again)["destroyed"], false);
}

#[tokio::test]
async fn unknown_session_serializes_not_found() {
    let dispatcher = extracting_dispatcher();
    let envelope = dispatcher
        .dispatch(
            "run_translations_session",
            &[json!("missing"), json!({"text": "Hola"})],
        )
        .await;

    assert_eq!(
        serde_json::to_value(envelope).unwrap(),
        json!({
            "name": "error",
            "error": {
                "message": "session not found: missing",
                "name": "NotFoundError",
                "stack": "NotFoundError: session not found: missing"
            }
        })
    );
}

#[tokio::test]
async fn extraction_commands_forward_to_extractor() {
    let dispatcher = extracting_dispatcher();

    let text = dispatcher.dispatch("get_page_text", &[]).await;
    assert_eq!(result_of(text), json!({"text": "Hola mundo", "options": {}}));

    let reader = dispatcher.dispatch("get_reader_mode_content", &[]).await;
    assert_eq!(result_of(reader), Value::Null);
    let reader = dispatcher
        .dispatch("get_reader_mode_content", &[json!(true)])
        .await;
    assert_eq!(result_of(reader), json!("<article>Hola</article>"));

    let info = dispatcher.dispatch("get_page_info", &[json!({})]).await;
    assert_eq!(result_of(info), Value::Null);

    let selection = dispatcher.dispatch("get_selection_text", &[]).await;
    assert_eq!(result_of(selection), json!("mundo"));

    let headless = dispatcher
        .dispatch("get_headless_page_text", &[json!("https://example.org")])
        .await;
    assert_eq!(result_of(headless)["text"], "headless");
}

#[tokio::test]
async fn extractor_failures_are_remote_errors() {
    let dispatcher = extracting_dispatcher();

    match dispatcher
        .dispatch("get_headless_page_text", &[json!("file:///etc/passwd")])
        .await
    {
        Envelope::Error { error } => {
            assert_eq!(error.name, "RemoteError");
            assert!(error.message.contains("file:///etc/passwd"));
        }
        other => panic!("expected an error, got {other:?}"),
    }

    match dispatcher.dispatch("get_headless_page_text", &[]).await {
        Envelope::Error { error } => assert_eq!(error.message, "missing required argument: url"),
        other => panic!("expected an error, got {other:?}"),
    }
}

#[tokio::test]
async fn serve_lines_round_trip() {
    let dispatcher = extracting_dispatcher();

    let reply = dispatcher
        .handle_line(r#"{"id": "a", "command": "create_ml_engine", "args": [{"taskName": "ner"}]}"#)
        .await;
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(
        reply,
        json!({"id": "a", "name": "success", "result": {"engineId": "ner-1", "status": "ready"}})
    );

    let reply = dispatcher
        .handle_line(r#"{"command": "run_ml_engine", "args": ["ner-1", {"args": ["Ada Lovelace"]}]}"#)
        .await;
    let reply: Value = serde_json::from_str(&reply).unwrap();
    assert_eq!(
        reply,
        json!({"name": "success", "result": {"entries": ["Ada Lovelace"], "metrics": null}})
    );

    assert_eq!(dispatcher.shutdown().await, (0, 1));
    assert_eq!(dispatcher.engines().len().await, 0);
}
