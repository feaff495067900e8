//! Engines backed by child processes, one process per engine.
//!
//! The process reads one JSON request per line on stdin and answers each
//! with one JSON line on stdout:
//!
//! ```text
//! -> {"type":"CreateEngineRequest","options":{"taskName":"summarization",...}}
//! <- {"type":"EngineStatus","status":"ready","engineId":"optional-id"}
//! -> {"type":"RunRequest","request":{"args":["..."],"options":{...}}}
//! <- {"type":"RunResponse","entries":[...],"metrics":{...}}
//! -> {"type":"TerminateRequest","shutdown":true}
//! <- {"type":"EngineStatus","status":"closed"}
//! ```
//!
//! Any request may instead be answered with `{"type":"EngineError","message":"..."}`.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};
use tracing::{debug, warn};

use super::{
    CreatedEngine, EngineOptions, EngineOutput, EngineProvider, Entries, InferenceRequest,
    RemoteEngine,
};
use crate::channel::PortEvent;
use crate::child::JsonLinesChild;
use crate::error::BrokerError;
use crate::id;

#[derive(Serialize)]
#[serde(tag = "type")]
enum EngineRequest<'a> {
    CreateEngineRequest { options: &'a EngineOptions },
    RunRequest { request: &'a InferenceRequest },
    TerminateRequest { shutdown: bool },
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum EngineReply {
    #[serde(rename_all = "camelCase")]
    EngineStatus {
        status: String,
        #[serde(default)]
        engine_id: Option<String>,
    },
    RunResponse {
        entries: Value,
        #[serde(default)]
        metrics: Option<Value>,
    },
    EngineError {
        message: String,
    },
}

pub struct ProcessEngineProvider {
    command: Vec<String>,
}

impl ProcessEngineProvider {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }
}

#[async_trait]
impl EngineProvider for ProcessEngineProvider {
    async fn create(&self, options: &EngineOptions) -> Result<CreatedEngine, BrokerError> {
        if self.command.is_empty() {
            return Err(BrokerError::Acquisition("no engine command configured".into()));
        }
        let (child, replies) = JsonLinesChild::spawn(&self.command, &[])?;
        let engine = ProcessEngine {
            child,
            replies: Mutex::new(replies),
        };

        let reply = engine
            .round_trip(&EngineRequest::CreateEngineRequest { options })
            .await;
        match reply {
            Ok(EngineReply::EngineStatus { status, engine_id }) => {
                let engine_id = engine_id.unwrap_or_else(id::generate);
                debug!(engine = %engine_id, command = %self.command.join(" "), "engine process started");
                Ok(CreatedEngine {
                    engine_id,
                    status,
                    engine: Arc::new(engine),
                })
            }
            Ok(other) => {
                engine.kill().await;
                Err(unexpected(other))
            }
            Err(e) => {
                engine.kill().await;
                Err(e)
            }
        }
    }
}

struct ProcessEngine {
    child: JsonLinesChild,
    replies: Mutex<mpsc::UnboundedReceiver<PortEvent>>,
}

impl ProcessEngine {
    /// Send one request and read its reply. Holding the reply lock for the
    /// whole exchange keeps one request in flight at a time.
    async fn round_trip(&self, request: &EngineRequest<'_>) -> Result<EngineReply, BrokerError> {
        let mut replies = self.replies.lock().await;
        self.child.send(request)?;
        match replies.recv().await {
            Some(PortEvent::Message(raw)) => {
                let reply: EngineReply = serde_json::from_str(&raw)
                    .map_err(|e| BrokerError::Deserialize(e.to_string()))?;
                if let EngineReply::EngineError { message } = reply {
                    return Err(BrokerError::Engine(message));
                }
                Ok(reply)
            }
            Some(PortEvent::Error(reason)) => Err(BrokerError::Deserialize(reason)),
            None => Err(BrokerError::TerminatedUnexpectedly),
        }
    }

    async fn kill(&self) {
        if let Err(e) = self.child.shutdown().await {
            warn!(error = %e, "failed to stop engine process");
        }
    }
}

#[async_trait]
impl RemoteEngine for ProcessEngine {
    async fn run(&self, request: &InferenceRequest) -> Result<EngineOutput, BrokerError> {
        match self.round_trip(&EngineRequest::RunRequest { request }).await? {
            EngineReply::RunResponse { entries, metrics } => Ok(EngineOutput {
                entries: Entries::Json(entries),
                metrics,
            }),
            other => Err(unexpected(other)),
        }
    }

    async fn terminate(&self, shutdown: bool) -> Result<String, BrokerError> {
        let reply = self
            .round_trip(&EngineRequest::TerminateRequest { shutdown })
            .await;
        self.kill().await;
        match reply? {
            EngineReply::EngineStatus { status, .. } => Ok(status),
            other => Err(unexpected(other)),
        }
    }
}

fn unexpected(reply: EngineReply) -> BrokerError {
    BrokerError::Engine(format!("unexpected reply from engine: {reply:?}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn request_wire_shape() {
        let request = InferenceRequest {
            args: vec![json!("some text")],
            options: Some(json!({"max_new_tokens": 10})),
        };
        let v = serde_json::to_value(EngineRequest::RunRequest { request: &request }).unwrap();
        assert_eq!(
            v,
            json!({
                "type": "RunRequest",
                "request": {"args": ["some text"], "options": {"max_new_tokens": 10}}
            })
        );
    }

    #[test]
    fn status_reply_with_engine_id() {
        let reply: EngineReply =
            serde_json::from_str(r#"{"type":"EngineStatus","status":"ready","engineId":"e1"}"#)
                .unwrap();
        assert!(matches!(
            reply,
            EngineReply::EngineStatus { ref status, engine_id: Some(ref id) }
                if status == "ready" && id == "e1"
        ));
    }

    #[test]
    fn run_reply_without_metrics() {
        let reply: EngineReply =
            serde_json::from_str(r#"{"type":"RunResponse","entries":[1,2]}"#).unwrap();
        assert!(matches!(reply, EngineReply::RunResponse { metrics: None, .. }));
    }
}
