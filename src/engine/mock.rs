//! An in-process engine provider that echoes its input back as entries.

use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::{
    CreatedEngine, EngineOptions, EngineOutput, EngineProvider, Entries, InferenceRequest,
    RemoteEngine,
};
use crate::error::BrokerError;

/// A scripted engine provider for tests. Every engine it creates answers
/// each run with the same output, or echoes the request's arguments when
/// no output is scripted.
#[derive(Default)]
pub struct MockEngineProvider {
    output: Option<EngineOutput>,
    refuse: Option<String>,
    created: AtomicUsize,
    terminated: Arc<AtomicUsize>,
}

impl MockEngineProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_output(output: EngineOutput) -> Self {
        Self {
            output: Some(output),
            ..Self::default()
        }
    }

    /// A provider whose every create fails with the given reason.
    pub fn refusing(reason: &str) -> Self {
        Self {
            refuse: Some(reason.to_string()),
            ..Self::default()
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn terminated(&self) -> usize {
        self.terminated.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl EngineProvider for MockEngineProvider {
    async fn create(&self, options: &EngineOptions) -> Result<CreatedEngine, BrokerError> {
        if let Some(reason) = &self.refuse {
            return Err(BrokerError::Engine(reason.clone()));
        }
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(CreatedEngine {
            engine_id: format!("{}-{n}", options.task_name),
            status: "ready".to_string(),
            engine: Arc::new(MockEngine {
                output: self.output.clone(),
                terminated: Arc::clone(&self.terminated),
            }),
        })
    }
}

struct MockEngine {
    output: Option<EngineOutput>,
    terminated: Arc<AtomicUsize>,
}

#[async_trait]
impl RemoteEngine for MockEngine {
    async fn run(&self, request: &InferenceRequest) -> Result<EngineOutput, BrokerError> {
        Ok(self.output.clone().unwrap_or_else(|| EngineOutput {
            entries: Entries::Json(serde_json::Value::Array(request.args.clone())),
            metrics: None,
        }))
    }

    async fn terminate(&self, shutdown: bool) -> Result<String, BrokerError> {
        self.terminated.fetch_add(1, Ordering::SeqCst);
        Ok(if shutdown { "closed" } else { "idle" }.to_string())
    }
}
