//! Layered conversation memory: a verbatim window of recent rounds plus a
//! running summary of everything folded out of that window.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use session_runtime_error::RuntimeError;

use crate::config::{StoreBackend, StoreConfig};

mod file_store;
mod record;
mod store;
mod summarize;

pub use file_store::FileConversationStore;
pub use record::{ConversationRecord, RoundRecord};
pub use store::{ConversationStore, MemoryConversationStore};
pub use summarize::{ExtractiveSummarizer, Summarizer};

/// One user/assistant exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationRound {
    /// `None` when the round has no user turn (e.g. a tool-only continuation).
    pub user_content: Option<String>,
    pub assistant_content: Option<String>,
    pub timestamp: DateTime<Utc>,
    pub token_count: usize,
}

impl ConversationRound {
    pub fn new(
        user_content: Option<String>,
        assistant_content: Option<String>,
        token_count: usize,
    ) -> Self {
        Self {
            user_content,
            assistant_content,
            timestamp: Utc::now(),
            token_count,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConversationLayer {
    /// Oldest first.
    pub recent_rounds: Vec<ConversationRound>,
    pub summary_content: String,
    pub summarized_rounds: usize,
}

impl ConversationLayer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push_round(&mut self, round: ConversationRound) {
        self.recent_rounds.push(round);
    }

    pub fn recent_len(&self) -> usize {
        self.recent_rounds.len()
    }

    /// Rounds ever recorded, summarized or not.
    pub fn total_rounds(&self) -> usize {
        self.summarized_rounds + self.recent_rounds.len()
    }

    /// How many of the oldest rounds must be folded to bring the recent
    /// window down to `max_recent`.
    pub fn excess_rounds(&self, max_recent: usize) -> usize {
        self.recent_rounds.len().saturating_sub(max_recent)
    }

    /// The `count` oldest rounds, i.e. the ones a fold of `count` removes.
    pub fn oldest(&self, count: usize) -> &[ConversationRound] {
        &self.recent_rounds[..count.min(self.recent_rounds.len())]
    }

    /// Replaces the summary with `summary` (which must already cover the
    /// `count` oldest rounds) and drops those rounds from the recent window.
    /// Returns how many rounds were folded.
    pub fn fold_oldest(&mut self, count: usize, summary: String) -> usize {
        let count = count.min(self.recent_rounds.len());
        if count == 0 {
            return 0;
        }
        self.summary_content = summary;
        self.summarized_rounds += count;
        self.recent_rounds.drain(..count);
        count
    }

    pub fn recent_token_count(&self) -> usize {
        self.recent_rounds.iter().map(|round| round.token_count).sum()
    }
}

/// Builds the store selected by `config`.
pub async fn open_store(config: &StoreConfig) -> Result<Arc<dyn ConversationStore>, RuntimeError> {
    match config.backend {
        StoreBackend::Memory => Ok(Arc::new(MemoryConversationStore::new())),
        StoreBackend::File => {
            let store =
                FileConversationStore::open(config.resolved_directory(), config.expiration).await?;
            Ok(Arc::new(store))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn round(n: usize) -> ConversationRound {
        ConversationRound::new(
            Some(format!("question {n}")),
            Some(format!("answer {n}")),
            n,
        )
    }

    #[test]
    fn fold_oldest_keeps_order_and_counts() {
        let mut layer = ConversationLayer::new();
        for n in 0..5 {
            layer.push_round(round(n));
        }
        assert_eq!(layer.excess_rounds(4), 1);

        let folded = layer.fold_oldest(1, "summary of 0".to_string());
        assert_eq!(folded, 1);
        assert_eq!(layer.recent_len(), 4);
        assert_eq!(layer.summarized_rounds, 1);
        assert_eq!(layer.summary_content, "summary of 0");
        assert_eq!(
            layer.recent_rounds[0].user_content.as_deref(),
            Some("question 1")
        );
        assert_eq!(layer.total_rounds(), 5);
    }

    #[test]
    fn fold_of_zero_is_a_no_op() {
        let mut layer = ConversationLayer::new();
        layer.push_round(round(0));
        assert_eq!(layer.fold_oldest(0, "ignored".to_string()), 0);
        assert_eq!(layer.summary_content, "");
        assert_eq!(layer.summarized_rounds, 0);
    }

    #[test]
    fn fold_is_clamped_to_available_rounds() {
        let mut layer = ConversationLayer::new();
        layer.push_round(round(0));
        layer.push_round(round(1));
        assert_eq!(layer.oldest(10).len(), 2);
        assert_eq!(layer.fold_oldest(10, "all".to_string()), 2);
        assert!(layer.recent_rounds.is_empty());
        assert_eq!(layer.summarized_rounds, 2);
    }
}
