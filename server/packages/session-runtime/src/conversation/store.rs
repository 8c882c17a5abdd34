use std::collections::HashMap;

use async_trait::async_trait;
use session_runtime_error::RuntimeError;
use tokio::sync::RwLock;

use super::ConversationLayer;

/// Storage for per-session conversation memory.
///
/// `save` replaces the stored layer wholesale; concurrent saves for the same
/// session are last-writer-wins, so callers serialize writes per session.
/// `load` returns `Ok(None)` for a session with no stored state; only
/// backend failures are errors.
#[async_trait]
pub trait ConversationStore: Send + Sync + std::fmt::Debug {
    async fn save(&self, session_id: &str, layer: &ConversationLayer) -> Result<(), RuntimeError>;

    async fn load(&self, session_id: &str) -> Result<Option<ConversationLayer>, RuntimeError>;

    /// Idempotent.
    async fn delete(&self, session_id: &str) -> Result<(), RuntimeError>;

    async fn exists(&self, session_id: &str) -> Result<bool, RuntimeError>;
}

/// Process-local store. Layers are kept as-is (no wire conversion).
#[derive(Debug, Default)]
pub struct MemoryConversationStore {
    layers: RwLock<HashMap<String, ConversationLayer>>,
}

impl MemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.layers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.layers.read().await.is_empty()
    }
}

#[async_trait]
impl ConversationStore for MemoryConversationStore {
    async fn save(&self, session_id: &str, layer: &ConversationLayer) -> Result<(), RuntimeError> {
        self.layers
            .write()
            .await
            .insert(session_id.to_string(), layer.clone());
        Ok(())
    }

    async fn load(&self, session_id: &str) -> Result<Option<ConversationLayer>, RuntimeError> {
        Ok(self.layers.read().await.get(session_id).cloned())
    }

    async fn delete(&self, session_id: &str) -> Result<(), RuntimeError> {
        self.layers.write().await.remove(session_id);
        Ok(())
    }

    async fn exists(&self, session_id: &str) -> Result<bool, RuntimeError> {
        Ok(self.layers.read().await.contains_key(session_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ConversationRound;

    #[tokio::test]
    async fn save_then_load_round_trips() {
        let store = MemoryConversationStore::new();
        let mut layer = ConversationLayer::new();
        layer.push_round(ConversationRound::new(Some("hi".into()), Some("hello".into()), 3));
        layer.summary_content = "older".to_string();
        layer.summarized_rounds = 2;

        store.save("s1", &layer).await.unwrap();
        let loaded = store.load("s1").await.unwrap().unwrap();
        assert_eq!(loaded.recent_len(), 1);
        assert_eq!(loaded.summary_content, "older");
        assert_eq!(loaded.summarized_rounds, 2);
        assert!(store.exists("s1").await.unwrap());
    }

    #[tokio::test]
    async fn missing_session_is_absent_not_an_error() {
        let store = MemoryConversationStore::new();
        assert_eq!(store.load("nope").await.unwrap(), None);
        assert!(!store.exists("nope").await.unwrap());
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let store = MemoryConversationStore::new();
        store.save("s1", &ConversationLayer::new()).await.unwrap();
        store.delete("s1").await.unwrap();
        store.delete("s1").await.unwrap();
        assert!(store.is_empty().await);
    }

    #[tokio::test]
    async fn save_replaces_wholesale() {
        let store = MemoryConversationStore::new();
        let mut first = ConversationLayer::new();
        first.push_round(ConversationRound::new(Some("a".into()), None, 1));
        first.push_round(ConversationRound::new(Some("b".into()), None, 1));
        store.save("s1", &first).await.unwrap();

        store.save("s1", &ConversationLayer::new()).await.unwrap();
        assert_eq!(store.load("s1").await.unwrap().unwrap().recent_len(), 0);
        assert_eq!(store.len().await, 1);
    }
}
