use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use courier::channel::process::ProcessChannelFactory;
use courier::engine::process::ProcessEngineProvider;
use courier::engine::{DestroyEngineOptions, EngineAdapter, EngineOptions, InferenceRequest};
use courier::error::ErrorKind;
use courier::session::{
    DestroyOptions, LanguagePair, SessionOptions, SessionRegistry, TranslationInput,
};

/// Answers readiness, then tags every translation with the target language.
const TRANSLATOR: &str = r#"
while read -r line; do
  case "$line" in
    *GetEngineStatusRequest*)
      echo '{"type":"GetEngineStatusResponse","status":"ready"}' ;;
    *TranslationRequest*)
      id=$(echo "$line" | sed 's/.*"translationId":\([0-9]*\).*/\1/')
      echo "{\"type\":\"TranslationResponse\",\"translationId\":$id,\"targetText\":\"[$COURIER_TARGET_LANGUAGE] ok\"}" ;;
  esac
done
"#;

/// A one-request-at-a-time engine that always returns the same entries.
const ENGINE: &str = r#"
while read -r line; do
  case "$line" in
    *CreateEngineRequest*)
      echo '{"type":"EngineStatus","status":"ready","engineId":"sh-engine"}' ;;
    *RunRequest*)
      echo '{"type":"RunResponse","entries":[{"label":"PER"}],"metrics":{"ms":1}}' ;;
    *TerminateRequest*)
      echo '{"type":"EngineStatus","status":"closed"}' ;;
  esac
done
"#;

/// Reports ready, then never reads stdin again.
const STALLED_TRANSLATOR: &str = r#"
read -r line
echo '{"type":"GetEngineStatusResponse","status":"ready"}'
exec sleep 600
"#;

fn sh(script: &str) -> Vec<String> {
    vec!["sh".to_string(), "-c".to_string(), script.to_string()]
}

fn options() -> SessionOptions {
    SessionOptions {
        ready_timeout: Some(Duration::from_secs(10)),
        request_timeout: Some(Duration::from_secs(10)),
    }
}

#[tokio::test]
async fn translator_process_round_trip() {
    let registry = SessionRegistry::new(Arc::new(ProcessChannelFactory::new(sh(TRANSLATOR))), options());

    let session = registry
        .create_session(LanguagePair::new("es", "fr"))
        .await
        .unwrap();
    let first = registry
        .run_request(&session.session_id, TranslationInput::text("Hola"))
        .await
        .unwrap();
    let second = registry
        .run_request(&session.session_id, TranslationInput::text("Adios"))
        .await
        .unwrap();

    assert_eq!(first.translation_id, 1);
    assert_eq!(first.target_text, "[fr] ok");
    assert_eq!(second.translation_id, 2);

    let outcome = registry
        .destroy_session(&session.session_id, DestroyOptions::default())
        .await
        .unwrap();
    assert!(outcome.destroyed);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn translator_that_exits_fails_creation() {
    let registry = SessionRegistry::new(Arc::new(ProcessChannelFactory::new(sh("exit 0"))), options());

    let err = registry
        .create_session(LanguagePair::new("es", "en"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Protocol);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn missing_translator_is_acquisition_error() {
    let registry = SessionRegistry::new(Arc::new(ProcessChannelFactory::new(Vec::new())), options());
    let err = registry
        .create_session(LanguagePair::new("es", "en"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Acquisition);

    let registry = SessionRegistry::new(
        Arc::new(ProcessChannelFactory::new(vec![
            "/nonexistent/courier-translator".to_string(),
        ])),
        options(),
    );
    let err = registry
        .create_session(LanguagePair::new("es", "en"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Acquisition);
}

#[tokio::test]
async fn engine_process_round_trip() {
    let adapter = EngineAdapter::new(Arc::new(ProcessEngineProvider::new(sh(ENGINE))));

    let engine = adapter
        .create(EngineOptions::new("token-classification"))
        .await
        .unwrap();
    assert_eq!(engine.engine_id, "sh-engine");
    assert_eq!(engine.status, "ready");

    let result = adapter
        .run(
            &engine.engine_id,
            InferenceRequest {
                args: vec![json!("Ada Lovelace")],
                options: None,
            },
        )
        .await
        .unwrap();
    assert_eq!(result.entries, json!([{"label": "PER"}]));
    assert_eq!(result.metrics, Some(json!({"ms": 1})));

    let destroyed = adapter
        .destroy(&engine.engine_id, DestroyEngineOptions::default())
        .await
        .unwrap();
    assert_eq!(destroyed.status, "closed");
}

#[tokio::test]
async fn stalled_translator_cannot_hang_requests_or_destroy() {
    let registry = SessionRegistry::new(
        Arc::new(ProcessChannelFactory::new(sh(STALLED_TRANSLATOR))),
        SessionOptions {
            ready_timeout: Some(Duration::from_secs(10)),
            request_timeout: Some(Duration::from_secs(1)),
        },
    );
    let session = registry
        .create_session(LanguagePair::new("es", "en"))
        .await
        .unwrap();
    let id = session.session_id;

    // Far more than the pipe buffer holds.
    let text = "x".repeat(1 << 20);
    let err = tokio::time::timeout(
        Duration::from_secs(5),
        registry.run_request(&id, TranslationInput::text(&text)),
    )
    .await
    .expect("request outlived its timeout")
    .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        registry.destroy_session(&id, DestroyOptions::default()),
    )
    .await
    .expect("destroy blocked on the translator's stdin")
    .unwrap();
    assert!(outcome.destroyed);
    assert!(registry.is_empty());
}

#[tokio::test]
async fn engines_reporting_the_same_id_stay_separate() {
    let adapter = EngineAdapter::new(Arc::new(ProcessEngineProvider::new(sh(ENGINE))));

    let first = adapter.create(EngineOptions::new("ner")).await.unwrap();
    let second = adapter.create(EngineOptions::new("ner")).await.unwrap();
    assert_eq!(first.engine_id, "sh-engine");
    assert_ne!(second.engine_id, first.engine_id);
    assert_eq!(adapter.len().await, 2);

    for engine in [&first, &second] {
        let destroyed = adapter
            .destroy(&engine.engine_id, DestroyEngineOptions::default())
            .await
            .unwrap();
        assert_eq!(destroyed.status, "closed");
    }
}
