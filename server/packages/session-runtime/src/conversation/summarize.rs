use async_trait::async_trait;
use session_runtime_error::RuntimeError;

use super::ConversationRound;

/// Produces the running digest that replaces `previous` once `rounds` are
/// folded out of the recent window. The result must cover both.
#[async_trait]
pub trait Summarizer: Send + Sync + std::fmt::Debug {
    async fn summarize(
        &self,
        previous: &str,
        rounds: &[ConversationRound],
        max_tokens: usize,
    ) -> Result<String, RuntimeError>;
}

/// Concatenates the previous summary with a transcript of the folded rounds,
/// capped at roughly `max_tokens` (4 bytes per token).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExtractiveSummarizer;

#[async_trait]
impl Summarizer for ExtractiveSummarizer {
    async fn summarize(
        &self,
        previous: &str,
        rounds: &[ConversationRound],
        max_tokens: usize,
    ) -> Result<String, RuntimeError> {
        let mut lines = Vec::new();
        if !previous.is_empty() {
            lines.push(previous.to_string());
        }
        for round in rounds {
            if let Some(user) = round.user_content.as_deref() {
                lines.push(format!("User: {user}"));
            }
            if let Some(assistant) = round.assistant_content.as_deref() {
                lines.push(format!("Assistant: {assistant}"));
            }
        }
        Ok(truncate_summary(lines.join("\n"), max_tokens.saturating_mul(4)))
    }
}

fn truncate_summary(mut summary: String, max_bytes: usize) -> String {
    if summary.len() <= max_bytes {
        return summary;
    }
    let mut cut = max_bytes;
    while !summary.is_char_boundary(cut) {
        cut -= 1;
    }
    summary.truncate(cut);
    summary.push_str("...");
    summary
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn transcript_follows_previous_summary() {
        let rounds = vec![
            ConversationRound::new(Some("hi".into()), Some("hello".into()), 2),
            ConversationRound::new(None, Some("tool output".into()), 2),
        ];
        let summary = ExtractiveSummarizer
            .summarize("earlier", &rounds, 500)
            .await
            .unwrap();
        assert_eq!(
            summary,
            "earlier\nUser: hi\nAssistant: hello\nAssistant: tool output"
        );
    }

    #[tokio::test]
    async fn long_transcripts_are_truncated() {
        let rounds = vec![ConversationRound::new(Some("x".repeat(100)), None, 1)];
        let summary = ExtractiveSummarizer.summarize("", &rounds, 2).await.unwrap();
        assert_eq!(summary, "User: xx...");
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        // "你" is 3 bytes; cutting at 4 would split the second char.
        assert_eq!(truncate_summary("你好".to_string(), 4), "你...");
        assert_eq!(truncate_summary("short".to_string(), 10), "short");
    }
}
