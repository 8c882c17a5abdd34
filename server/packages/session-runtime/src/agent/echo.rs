use std::time::Duration;

use async_trait::async_trait;
use session_runtime_error::RuntimeError;

use super::{Agent, AgentInput, AgentReply, OutputSink};

/// Deterministic agent that repeats the user message back, one word per
/// streamed chunk.
#[derive(Debug, Clone, Default)]
pub struct EchoAgent {
    chunk_delay: Option<Duration>,
}

impl EchoAgent {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sleeps before each chunk; useful for exercising timeouts.
    pub fn with_chunk_delay(delay: Duration) -> Self {
        Self {
            chunk_delay: Some(delay),
        }
    }
}

#[async_trait]
impl Agent for EchoAgent {
    async fn invoke(
        &self,
        input: AgentInput,
        sink: OutputSink,
    ) -> Result<AgentReply, RuntimeError> {
        let content = format!("echo: {}", input.message);
        for chunk in content.split_inclusive(' ') {
            if let Some(delay) = self.chunk_delay {
                tokio::time::sleep(delay).await;
            }
            sink.send(chunk).await;
        }
        Ok(AgentReply {
            content,
            token_count: None,
        })
    }
}
