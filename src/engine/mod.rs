//! ML engine lifecycle: create, run, destroy against remote engines keyed
//! by the identity their provider hands back.
//!
//! Each remote call is already a single request/response, so there is no
//! correlation state here. The adapter only remembers which identities are
//! live, the same way a tool registry remembers tools by name.

pub mod mock;
pub mod process;

use async_trait::async_trait;
use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::error::BrokerError;
use crate::id;

/// Options for creating an engine. `taskName` is required; everything else
/// is passed to the provider untouched.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineOptions {
    #[serde(default)]
    pub task_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_revision: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl EngineOptions {
    pub fn new(task_name: &str) -> Self {
        Self {
            task_name: task_name.to_string(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), BrokerError> {
        if self.task_name.trim().is_empty() {
            return Err(BrokerError::MissingField("taskName"));
        }
        Ok(())
    }
}

/// One inference call: positional arguments plus optional engine options.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default)]
    pub args: Vec<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<Value>,
}

/// Raw entries as an engine produced them.
#[derive(Debug, Clone, PartialEq)]
pub enum Entries {
    Json(Value),
    Binary(Vec<u8>),
}

#[derive(Debug, Clone, PartialEq)]
pub struct EngineOutput {
    pub entries: Entries,
    pub metrics: Option<Value>,
}

/// Normalized inference result. Binary entries become a base64 string and a
/// missing `metrics` serializes as an explicit `null`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InferenceResult {
    pub entries: Value,
    pub metrics: Option<Value>,
}

impl From<EngineOutput> for InferenceResult {
    fn from(output: EngineOutput) -> Self {
        let entries = match output.entries {
            Entries::Json(value) => value,
            Entries::Binary(bytes) => Value::String(STANDARD.encode(bytes)),
        };
        Self {
            entries,
            metrics: output.metrics,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineDescriptor {
    pub engine_id: String,
    pub status: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct DestroyEngineOptions {
    /// Ask the engine process to shut down, not just drop this engine.
    #[serde(default = "default_true")]
    pub shutdown: bool,
}

impl Default for DestroyEngineOptions {
    fn default() -> Self {
        Self { shutdown: true }
    }
}

fn default_true() -> bool {
    true
}

/// A live engine on the remote side.
#[async_trait]
pub trait RemoteEngine: Send + Sync {
    async fn run(&self, request: &InferenceRequest) -> Result<EngineOutput, BrokerError>;

    /// Stop the engine and report its final status.
    async fn terminate(&self, shutdown: bool) -> Result<String, BrokerError>;
}

/// What a provider returns from a successful create.
pub struct CreatedEngine {
    pub engine_id: String,
    pub status: String,
    pub engine: Arc<dyn RemoteEngine>,
}

/// The remote engine registry: creates engines and names them.
#[async_trait]
pub trait EngineProvider: Send + Sync {
    async fn create(&self, options: &EngineOptions) -> Result<CreatedEngine, BrokerError>;
}

/// Tracks live engines by identity and forwards calls to them.
pub struct EngineAdapter {
    provider: Arc<dyn EngineProvider>,
    engines: RwLock<HashMap<String, Arc<dyn RemoteEngine>>>,
}

impl EngineAdapter {
    pub fn new(provider: Arc<dyn EngineProvider>) -> Self {
        Self {
            provider,
            engines: RwLock::new(HashMap::new()),
        }
    }

    pub async fn create(&self, options: EngineOptions) -> Result<EngineDescriptor, BrokerError> {
        options.validate()?;
        let created = self.provider.create(&options).await?;

        let mut engines = self.engines.write().await;
        // A reported identity that is already live gets a fresh one instead,
        // so the earlier engine keeps its routing.
        let engine_id = if engines.contains_key(&created.engine_id) {
            let fresh = loop {
                let candidate = id::generate();
                if !engines.contains_key(&candidate) {
                    break candidate;
                }
            };
            warn!(reported = %created.engine_id, engine = %fresh, "engine identity already live, reassigned");
            fresh
        } else {
            created.engine_id
        };
        engines.insert(engine_id.clone(), created.engine);
        drop(engines);

        info!(
            engine = %engine_id,
            task = %options.task_name,
            status = %created.status,
            "engine created"
        );
        Ok(EngineDescriptor {
            engine_id,
            status: created.status,
        })
    }

    pub async fn run(
        &self,
        engine_id: &str,
        request: InferenceRequest,
    ) -> Result<InferenceResult, BrokerError> {
        let engine = self.lookup(engine_id).await?;
        let output = engine.run(&request).await?;
        Ok(output.into())
    }

    /// Terminate an engine. It is forgotten even if termination fails, so a
    /// destroyed identity never resolves again.
    pub async fn destroy(
        &self,
        engine_id: &str,
        options: DestroyEngineOptions,
    ) -> Result<EngineDescriptor, BrokerError> {
        Self::require_id(engine_id)?;
        let engine = self
            .engines
            .write()
            .await
            .remove(engine_id)
            .ok_or_else(|| BrokerError::engine_not_found(engine_id))?;

        let status = engine.terminate(options.shutdown).await?;
        info!(engine = %engine_id, %status, "engine destroyed");
        Ok(EngineDescriptor {
            engine_id: engine_id.to_string(),
            status,
        })
    }

    /// Destroy every live engine. Returns how many terminated cleanly.
    pub async fn destroy_all(&self) -> usize {
        let ids = self.ids().await;
        let results = futures::future::join_all(
            ids.iter()
                .map(|id| self.destroy(id, DestroyEngineOptions::default())),
        )
        .await;
        results
            .into_iter()
            .zip(&ids)
            .filter(|(result, id)| match result {
                Ok(_) => true,
                Err(e) => {
                    warn!(engine = %id, error = %e, "engine did not terminate cleanly");
                    false
                }
            })
            .count()
    }

    pub async fn ids(&self) -> Vec<String> {
        self.engines.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.engines.read().await.len()
    }

    async fn lookup(&self, engine_id: &str) -> Result<Arc<dyn RemoteEngine>, BrokerError> {
        Self::require_id(engine_id)?;
        self.engines
            .read()
            .await
            .get(engine_id)
            .cloned()
            .ok_or_else(|| BrokerError::engine_not_found(engine_id))
    }

    fn require_id(engine_id: &str) -> Result<(), BrokerError> {
        if engine_id.is_empty() {
            return Err(BrokerError::MissingArgument("engineId"));
        }
        Ok(())
    }
}
