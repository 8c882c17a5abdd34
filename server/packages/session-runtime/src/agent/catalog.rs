use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use session_runtime_error::RuntimeError;
use utoipa::ToSchema;

use super::{Agent, AgentFactory, AgentInstance};

/// Agent id used when a request names none.
pub const DEFAULT_AGENT_ID: &str = "default";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AgentDefinition {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub system_prompt: String,
    #[serde(default)]
    pub allowed_tools: BTreeSet<String>,
}

impl AgentDefinition {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            system_prompt: String::new(),
            allowed_tools: BTreeSet::new(),
        }
    }

    pub fn default_agent() -> Self {
        Self {
            id: DEFAULT_AGENT_ID.to_string(),
            name: "Default Agent".to_string(),
            system_prompt: "You are a helpful assistant.".to_string(),
            allowed_tools: BTreeSet::new(),
        }
    }
}

/// Registered agent definitions, keyed by id.
#[derive(Debug, Default)]
pub struct AgentCatalog {
    definitions: RwLock<BTreeMap<String, AgentDefinition>>,
}

impl AgentCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, definition: AgentDefinition) -> Result<AgentDefinition, RuntimeError> {
        if definition.id.trim().is_empty() {
            return Err(RuntimeError::InvalidRequest {
                message: "agent id must not be empty".to_string(),
            });
        }
        let mut definitions = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if definitions.contains_key(&definition.id) {
            return Err(RuntimeError::AgentAlreadyExists {
                agent_id: definition.id,
            });
        }
        definitions.insert(definition.id.clone(), definition.clone());
        tracing::info!(agent_id = %definition.id, "agent registered");
        Ok(definition)
    }

    pub fn get(&self, agent_id: &str) -> Result<AgentDefinition, RuntimeError> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(agent_id)
            .cloned()
            .ok_or_else(|| RuntimeError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })
    }

    pub fn remove(&self, agent_id: &str) -> Result<AgentDefinition, RuntimeError> {
        let removed = self
            .definitions
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(agent_id)
            .ok_or_else(|| RuntimeError::AgentNotFound {
                agent_id: agent_id.to_string(),
            })?;
        tracing::info!(agent_id = %agent_id, "agent removed");
        Ok(removed)
    }

    /// Sorted by id.
    pub fn list(&self) -> Vec<AgentDefinition> {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    pub fn count(&self) -> usize {
        self.definitions
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Resolves definitions from an [`AgentCatalog`] and binds them to a single
/// backend. Requests without an agent id get `default_definition`.
#[derive(Debug, Clone)]
pub struct CatalogAgentFactory {
    catalog: Arc<AgentCatalog>,
    default_definition: AgentDefinition,
    backend: Arc<dyn Agent>,
}

impl CatalogAgentFactory {
    pub fn new(catalog: Arc<AgentCatalog>, backend: Arc<dyn Agent>) -> Self {
        Self {
            catalog,
            default_definition: AgentDefinition::default_agent(),
            backend,
        }
    }

    pub fn with_default_definition(mut self, definition: AgentDefinition) -> Self {
        self.default_definition = definition;
        self
    }

    pub fn catalog(&self) -> &Arc<AgentCatalog> {
        &self.catalog
    }
}

#[async_trait]
impl AgentFactory for CatalogAgentFactory {
    async fn create(
        &self,
        session_id: &str,
        agent_id: Option<&str>,
    ) -> Result<AgentInstance, RuntimeError> {
        let definition = match agent_id {
            Some(agent_id) => self.catalog.get(agent_id)?,
            None => self.default_definition.clone(),
        };
        tracing::debug!(
            session_id = %session_id,
            agent_id = %definition.id,
            "building agent instance"
        );
        Ok(AgentInstance {
            id: definition.id,
            name: definition.name,
            system_prompt: definition.system_prompt,
            allowed_tools: definition.allowed_tools,
            created_at: Utc::now(),
            agent: self.backend.clone(),
        })
    }
}
