//! The agent capability the pool keeps warm.
//!
//! The pool and coordinator only see [`Agent`]; concrete model or tool
//! bindings live behind it.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use session_runtime_error::RuntimeError;
use tokio::sync::mpsc;

use crate::conversation::ConversationRound;

mod catalog;
mod echo;

pub use catalog::{AgentCatalog, AgentDefinition, CatalogAgentFactory, DEFAULT_AGENT_ID};
pub use echo::EchoAgent;

/// Everything an agent sees for one exchange.
#[derive(Debug, Clone, Default)]
pub struct AgentInput {
    pub system_prompt: String,
    pub summary: String,
    pub recent_rounds: Vec<ConversationRound>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentReply {
    pub content: String,
    /// `None` lets the caller estimate it.
    pub token_count: Option<usize>,
}

/// Receives partial output while an agent runs. Sends never fail: if the
/// consumer is gone the chunk is dropped.
#[derive(Debug, Clone)]
pub struct OutputSink {
    tx: Option<mpsc::Sender<String>>,
}

impl OutputSink {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx: Some(tx) }, rx)
    }

    pub fn discard() -> Self {
        Self { tx: None }
    }

    pub async fn send(&self, chunk: impl Into<String>) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(chunk.into()).await;
        }
    }
}

#[async_trait]
pub trait Agent: Send + Sync + fmt::Debug {
    async fn invoke(&self, input: AgentInput, sink: OutputSink)
        -> Result<AgentReply, RuntimeError>;
}

/// A pooled, session-owned agent handle.
#[derive(Clone)]
pub struct AgentInstance {
    pub id: String,
    pub name: String,
    pub system_prompt: String,
    pub allowed_tools: BTreeSet<String>,
    pub created_at: DateTime<Utc>,
    pub agent: Arc<dyn Agent>,
}

impl fmt::Debug for AgentInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AgentInstance")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("allowed_tools", &self.allowed_tools)
            .field("created_at", &self.created_at)
            .finish_non_exhaustive()
    }
}

impl AgentInstance {
    pub async fn invoke(
        &self,
        input: AgentInput,
        sink: OutputSink,
    ) -> Result<AgentReply, RuntimeError> {
        self.agent.invoke(input, sink).await
    }
}

/// Builds a fresh instance on a pool miss.
#[async_trait]
pub trait AgentFactory: Send + Sync + fmt::Debug {
    async fn create(
        &self,
        session_id: &str,
        agent_id: Option<&str>,
    ) -> Result<AgentInstance, RuntimeError>;
}
