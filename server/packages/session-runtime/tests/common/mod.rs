#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::Router;
use session_runtime::agent::{Agent, AgentCatalog, CatalogAgentFactory, EchoAgent};
use session_runtime::config::RuntimeConfig;
use session_runtime::conversation::{ConversationLayer, ConversationStore, MemoryConversationStore};
use session_runtime::coordinator::Coordinator;
use session_runtime::router::{build_router, AppState};
use session_runtime::RuntimeError;

/// Defaults with the heartbeat off and rate limiting disabled, so streams
/// only carry what a test produces.
pub fn test_config() -> RuntimeConfig {
    let mut config = RuntimeConfig::default();
    config.hub.heartbeat_interval = Duration::ZERO;
    config.rate_limit.enabled = false;
    config
}

pub struct TestRuntime {
    pub coordinator: Arc<Coordinator>,
    pub catalog: Arc<AgentCatalog>,
}

impl TestRuntime {
    pub fn new(config: RuntimeConfig) -> Self {
        Self::with_parts(
            config,
            Arc::new(MemoryConversationStore::new()),
            Arc::new(EchoAgent::new()),
        )
    }

    pub fn with_parts(
        config: RuntimeConfig,
        store: Arc<dyn ConversationStore>,
        backend: Arc<dyn Agent>,
    ) -> Self {
        let catalog = Arc::new(AgentCatalog::new());
        let factory = Arc::new(CatalogAgentFactory::new(catalog.clone(), backend));
        let coordinator = Arc::new(Coordinator::new(&config, store, factory));
        Self {
            coordinator,
            catalog,
        }
    }

    pub fn router(&self) -> Router {
        build_router(AppState::new(
            self.coordinator.clone(),
            self.catalog.clone(),
        ))
    }
}

/// Every operation fails with a persistence error.
#[derive(Debug, Default)]
pub struct FailingStore;

#[async_trait]
impl ConversationStore for FailingStore {
    async fn save(&self, _session_id: &str, _layer: &ConversationLayer) -> Result<(), RuntimeError> {
        Err(RuntimeError::persistence("disk unavailable"))
    }

    async fn load(&self, _session_id: &str) -> Result<Option<ConversationLayer>, RuntimeError> {
        Err(RuntimeError::persistence("disk unavailable"))
    }

    async fn delete(&self, _session_id: &str) -> Result<(), RuntimeError> {
        Err(RuntimeError::persistence("disk unavailable"))
    }

    async fn exists(&self, _session_id: &str) -> Result<bool, RuntimeError> {
        Err(RuntimeError::persistence("disk unavailable"))
    }
}
