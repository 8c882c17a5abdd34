//! One chat exchange end to end: admission, warm instance, memory, agent
//! execution with streamed output, then persistence and summarization.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::future::join_all;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use session_runtime_error::RuntimeError;
use tokio::sync::OwnedMutexGuard;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::agent::{AgentFactory, AgentInput, AgentInstance, AgentReply, OutputSink};
use crate::config::{
    AdmissionMode, CoordinatorConfig, MemoryFailurePolicy, RuntimeConfig, SummaryConfig,
};
use crate::conversation::{
    ConversationLayer, ConversationRound, ConversationStore, ExtractiveSummarizer, Summarizer,
};
use crate::pool::{make_key, InstancePool, PoolStats};
use crate::ratelimit::RateLimiter;
use crate::stream::{SseEvent, StreamHub};
use crate::tokens::{TokenEstimator, TokenUsage};

#[derive(Debug, Clone)]
pub struct ChatRequest {
    pub user_id: String,
    pub session_id: String,
    pub agent_id: Option<String>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct ChatOutcome {
    pub response: String,
    pub token_count: usize,
    pub duration_ms: u64,
    pub agent_id: String,
}

/// One leg of [`Coordinator::parallel_chat`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
pub struct AgentTask {
    pub agent_id: String,
    pub message: String,
}

#[derive(Debug)]
pub struct Coordinator {
    pool: InstancePool,
    store: Arc<dyn ConversationStore>,
    limiter: RateLimiter,
    hub: StreamHub,
    factory: Arc<dyn AgentFactory>,
    summarizer: Arc<dyn Summarizer>,
    estimator: TokenEstimator,
    config: CoordinatorConfig,
    summary: SummaryConfig,
    delta_capacity: usize,
    session_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    usage: Mutex<HashMap<String, TokenUsage>>,
    closed: AtomicBool,
}

impl Coordinator {
    /// Builds the pool, limiter and hub from `config`. Starts the pool
    /// sweep, so this must run inside a tokio runtime.
    pub fn new(
        config: &RuntimeConfig,
        store: Arc<dyn ConversationStore>,
        factory: Arc<dyn AgentFactory>,
    ) -> Self {
        Self {
            pool: InstancePool::new(&config.pool),
            store,
            limiter: RateLimiter::new(&config.rate_limit),
            hub: StreamHub::new(config.hub.clone()),
            factory,
            summarizer: Arc::new(ExtractiveSummarizer),
            estimator: TokenEstimator,
            config: config.coordinator.clone(),
            summary: config.summary.clone(),
            delta_capacity: config.hub.channel_capacity,
            session_locks: Mutex::new(HashMap::new()),
            usage: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    pub fn with_summarizer(mut self, summarizer: Arc<dyn Summarizer>) -> Self {
        self.summarizer = summarizer;
        self
    }

    pub fn pool(&self) -> &InstancePool {
        &self.pool
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    pub fn hub(&self) -> &StreamHub {
        &self.hub
    }

    pub fn store(&self) -> &Arc<dyn ConversationStore> {
        &self.store
    }

    pub fn pool_stats(&self) -> PoolStats {
        self.pool.stats()
    }

    /// Sessions that currently hold or wait on an execution lock.
    pub fn active_session_locks(&self) -> usize {
        self.session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub async fn chat(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, RuntimeError> {
        self.ensure_open()?;
        validate_session_id(&request.session_id)?;
        let started = Instant::now();

        // Rejected requests never reach the pool or the store.
        self.admit(&request.user_id, cancel).await?;

        match self.exchange(&request, started, cancel).await {
            Ok(outcome) => {
                match SseEvent::json("done", &outcome) {
                    Ok(event) => {
                        self.hub
                            .broadcast_to_session(&request.session_id, &event)
                            .await;
                    }
                    Err(err) => tracing::warn!(error = %err, "failed to encode done event"),
                }
                Ok(outcome)
            }
            Err(err) => {
                self.emit_error(&request.session_id, &err).await;
                Err(err)
            }
        }
    }

    async fn exchange(
        &self,
        request: &ChatRequest,
        started: Instant,
        cancel: &CancellationToken,
    ) -> Result<ChatOutcome, RuntimeError> {
        let _permit = self.lock_session(&request.session_id, cancel).await?;

        let key = make_key(&request.session_id, request.agent_id.as_deref());
        let instance = self
            .resolve_instance(&key, &request.session_id, request.agent_id.as_deref())
            .await?;
        let mut layer = self.load_memory(&request.session_id).await?;

        let input = build_input(&instance, &layer, &request.message);
        let reply = self
            .execute(instance.clone(), input, Some(&request.session_id), cancel)
            .await?;
        let token_count = self.token_count(&request.message, &reply);
        self.record_usage(&request.session_id, |usage| usage.record_exchange(token_count));

        layer.push_round(ConversationRound::new(
            Some(request.message.clone()),
            Some(reply.content.clone()),
            token_count,
        ));
        self.compact(&request.session_id, &mut layer).await;
        self.save_memory(&request.session_id, &layer).await?;

        Ok(ChatOutcome {
            response: reply.content,
            token_count,
            duration_ms: started.elapsed().as_millis() as u64,
            agent_id: instance.id.clone(),
        })
    }

    /// Runs several agents against one session concurrently. All legs see
    /// the same memory snapshot; successful rounds are appended in task
    /// order once every leg has finished. Each leg is admitted on its own,
    /// so the result vector can mix successes and rejections.
    pub async fn parallel_chat(
        &self,
        user_id: &str,
        session_id: &str,
        tasks: Vec<AgentTask>,
        cancel: &CancellationToken,
    ) -> Result<Vec<Result<ChatOutcome, RuntimeError>>, RuntimeError> {
        self.ensure_open()?;
        validate_session_id(session_id)?;
        let started = Instant::now();

        let mut admitted = Vec::with_capacity(tasks.len());
        for _ in 0..tasks.len() {
            admitted.push(self.admit(user_id, cancel).await);
        }

        let _permit = self.lock_session(session_id, cancel).await?;
        let mut layer = self.load_memory(session_id).await?;
        let snapshot = &layer;

        let legs = tasks.iter().zip(admitted).map(|(task, admission)| async move {
            admission?;
            let key = make_key(session_id, Some(&task.agent_id));
            let instance = self
                .resolve_instance(&key, session_id, Some(&task.agent_id))
                .await?;
            let input = build_input(&instance, snapshot, &task.message);
            let reply = self.execute(instance.clone(), input, None, cancel).await?;
            Ok::<_, RuntimeError>((instance, reply))
        });
        let replies = join_all(legs).await;

        let mut results = Vec::with_capacity(replies.len());
        for (task, reply) in tasks.iter().zip(replies) {
            match reply {
                Ok((instance, reply)) => {
                    let token_count = self.token_count(&task.message, &reply);
                    self.record_usage(session_id, |usage| usage.record_exchange(token_count));
                    layer.push_round(ConversationRound::new(
                        Some(task.message.clone()),
                        Some(reply.content.clone()),
                        token_count,
                    ));
                    let outcome = ChatOutcome {
                        response: reply.content,
                        token_count,
                        duration_ms: started.elapsed().as_millis() as u64,
                        agent_id: instance.id.clone(),
                    };
                    if let Ok(event) = SseEvent::json("done", &outcome) {
                        self.hub.broadcast_to_session(session_id, &event).await;
                    }
                    results.push(Ok(outcome));
                }
                Err(err) => {
                    tracing::warn!(
                        session_id = %session_id,
                        agent_id = %task.agent_id,
                        error = %err,
                        "parallel agent task failed"
                    );
                    self.emit_error(session_id, &err).await;
                    results.push(Err(err));
                }
            }
        }

        self.compact(session_id, &mut layer).await;
        self.save_memory(session_id, &layer).await?;
        Ok(results)
    }

    /// Sends the same message to every agent in `agent_ids` at once. Same
    /// semantics as [`Coordinator::parallel_chat`].
    pub async fn broadcast(
        &self,
        user_id: &str,
        session_id: &str,
        agent_ids: &[String],
        message: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<Result<ChatOutcome, RuntimeError>>, RuntimeError> {
        if agent_ids.is_empty() {
            return Err(RuntimeError::InvalidRequest {
                message: "broadcast needs at least one agent id".to_string(),
            });
        }
        let tasks = agent_ids
            .iter()
            .map(|agent_id| AgentTask {
                agent_id: agent_id.clone(),
                message: message.to_string(),
            })
            .collect();
        self.parallel_chat(user_id, session_id, tasks, cancel).await
    }

    /// Folds every round beyond the recent window into the summary now,
    /// whether or not automatic summarization is enabled. Unlike the
    /// automatic path, summarizer and store failures are returned.
    pub async fn force_summarize(&self, session_id: &str) -> Result<ConversationLayer, RuntimeError> {
        self.ensure_open()?;
        validate_session_id(session_id)?;
        let _permit = self
            .lock_session(session_id, &CancellationToken::new())
            .await?;
        let mut layer = self
            .store
            .load(session_id)
            .await?
            .ok_or_else(|| RuntimeError::SessionNotFound {
                session_id: session_id.to_string(),
            })?;
        let keep = self.summary.max_recent_rounds;
        let excess = layer.excess_rounds(keep);
        if excess == 0 {
            return Err(RuntimeError::InvalidRequest {
                message: format!(
                    "session {session_id} has {} recent rounds; summarizing needs more than {keep}",
                    layer.recent_len()
                ),
            });
        }
        self.fold(session_id, &mut layer, excess).await?;
        self.store.save(session_id, &layer).await?;
        Ok(layer)
    }

    /// Token accounting since the session was first seen or last cleared.
    pub fn token_usage(&self, session_id: &str) -> Option<TokenUsage> {
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(session_id)
            .cloned()
    }

    /// Drops every pooled instance of the session (bare and per-agent keys)
    /// and its stored memory. Waits for an in-flight exchange to finish.
    pub async fn clear_session(&self, session_id: &str) -> Result<usize, RuntimeError> {
        validate_session_id(session_id)?;
        let _permit = self
            .lock_session(session_id, &CancellationToken::new())
            .await?;
        let removed = self.pool.delete_session(session_id);
        self.store.delete(session_id).await?;
        self.usage
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(session_id);
        tracing::info!(session_id = %session_id, removed, "session cleared");
        Ok(removed)
    }

    pub async fn memory(&self, session_id: &str) -> Result<Option<ConversationLayer>, RuntimeError> {
        self.store.load(session_id).await
    }

    /// Stops the pool sweep and closes every stream subscriber. Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.pool.close();
        self.hub.close();
        tracing::info!("coordinator closed");
    }

    fn ensure_open(&self) -> Result<(), RuntimeError> {
        if self.is_closed() {
            return Err(RuntimeError::closed("coordinator"));
        }
        Ok(())
    }

    async fn admit(&self, user_id: &str, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        match self.config.admission {
            AdmissionMode::Reject => self.limiter.check_for_user(user_id),
            AdmissionMode::Wait => {
                match tokio::time::timeout(
                    self.config.admission_timeout,
                    self.limiter.wait_for_user(cancel, user_id),
                )
                .await
                {
                    Ok(result) => result,
                    Err(_) => Err(RuntimeError::timeout("timed out waiting for admission")),
                }
            }
        }
    }

    async fn lock_session(
        &self,
        session_id: &str,
        cancel: &CancellationToken,
    ) -> Result<SessionPermit<'_>, RuntimeError> {
        let lock = self
            .session_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(session_id.to_string())
            .or_default()
            .clone();
        let mut permit = SessionPermit {
            locks: &self.session_locks,
            session_id: session_id.to_string(),
            lock: lock.clone(),
            guard: None,
        };
        let guard = tokio::select! {
            _ = cancel.cancelled() => None,
            guard = lock.lock_owned() => Some(guard),
        };
        match guard {
            Some(guard) => {
                permit.guard = Some(guard);
                Ok(permit)
            }
            None => Err(RuntimeError::Cancelled),
        }
    }

    async fn resolve_instance(
        &self,
        key: &str,
        session_id: &str,
        agent_id: Option<&str>,
    ) -> Result<Arc<AgentInstance>, RuntimeError> {
        if let Some(instance) = self.pool.load(key) {
            return Ok(instance);
        }
        let instance = Arc::new(self.factory.create(session_id, agent_id).await?);
        self.pool.store(key, instance.clone());
        Ok(instance)
    }

    async fn load_memory(&self, session_id: &str) -> Result<ConversationLayer, RuntimeError> {
        match self.store.load(session_id).await {
            Ok(layer) => Ok(layer.unwrap_or_default()),
            Err(err) => match self.config.memory_failure {
                MemoryFailurePolicy::Abort => Err(err),
                MemoryFailurePolicy::Degrade => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %err,
                        "memory load failed; continuing with empty memory"
                    );
                    Ok(ConversationLayer::new())
                }
            },
        }
    }

    async fn save_memory(
        &self,
        session_id: &str,
        layer: &ConversationLayer,
    ) -> Result<(), RuntimeError> {
        match self.store.save(session_id, layer).await {
            Ok(()) => Ok(()),
            Err(err) => match self.config.memory_failure {
                MemoryFailurePolicy::Abort => Err(err),
                MemoryFailurePolicy::Degrade => {
                    tracing::warn!(
                        session_id = %session_id,
                        error = %err,
                        "memory save failed; round not persisted"
                    );
                    Ok(())
                }
            },
        }
    }

    /// Folds rounds beyond the recent window into the summary. On failure
    /// the rounds stay in the window and are retried next exchange.
    async fn compact(&self, session_id: &str, layer: &mut ConversationLayer) {
        if !self.summary.enabled {
            return;
        }
        let excess = layer.excess_rounds(self.summary.max_recent_rounds);
        if excess == 0 {
            return;
        }
        if let Err(err) = self.fold(session_id, layer, excess).await {
            tracing::warn!(
                session_id = %session_id,
                error = %err,
                "summarization failed; keeping rounds"
            );
        }
    }

    /// Replaces the `count` oldest recent rounds with a fresh summary. The
    /// layer is untouched when the summarizer fails.
    async fn fold(
        &self,
        session_id: &str,
        layer: &mut ConversationLayer,
        count: usize,
    ) -> Result<usize, RuntimeError> {
        let summary = self
            .summarizer
            .summarize(
                &layer.summary_content,
                layer.oldest(count),
                self.summary.max_summary_tokens,
            )
            .await?;
        let folded_tokens: usize = layer
            .oldest(count)
            .iter()
            .map(|round| round.token_count)
            .sum();
        let summary_tokens = self.estimator.estimate(&summary);
        let folded = layer.fold_oldest(count, summary);
        self.record_usage(session_id, |usage| {
            usage.record_summary(folded, folded_tokens, summary_tokens)
        });
        tracing::info!(
            session_id = %session_id,
            folded,
            folded_tokens,
            summary_tokens,
            remaining = layer.recent_len(),
            "conversation summarized"
        );
        Ok(folded)
    }

    fn record_usage(&self, session_id: &str, update: impl FnOnce(&mut TokenUsage)) {
        let mut usage = self.usage.lock().unwrap_or_else(PoisonError::into_inner);
        update(usage.entry(session_id.to_string()).or_default());
    }

    /// Runs the agent on its own task so a panic cannot escape, forwarding
    /// partial output as `delta` events when `stream_to` is set.
    async fn execute(
        &self,
        instance: Arc<AgentInstance>,
        input: AgentInput,
        stream_to: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<AgentReply, RuntimeError> {
        let agent_id = instance.id.clone();
        let (sink, mut chunks) = match stream_to {
            Some(_) => {
                let (sink, chunks) = OutputSink::channel(self.delta_capacity);
                (sink, Some(chunks))
            }
            None => (OutputSink::discard(), None),
        };

        let task = tokio::spawn(async move { instance.invoke(input, sink).await });
        // Also fires when this future is dropped mid-run.
        let _abort = AbortOnDrop(task.abort_handle());
        let forward = async {
            let (Some(session_id), Some(chunks)) = (stream_to, chunks.as_mut()) else {
                return;
            };
            while let Some(chunk) = chunks.recv().await {
                if !chunk.is_empty() {
                    self.hub
                        .broadcast_to_session(session_id, &SseEvent::typed("delta", chunk))
                        .await;
                }
            }
        };
        let run = async {
            let (joined, ()) = tokio::join!(task, forward);
            joined
        };

        let joined = tokio::select! {
            _ = cancel.cancelled() => {
                tracing::debug!(agent_id = %agent_id, "agent execution cancelled");
                return Err(RuntimeError::Cancelled);
            }
            joined = tokio::time::timeout(self.config.execution_timeout, run) => joined,
        };

        match joined {
            Err(_) => {
                tracing::warn!(agent_id = %agent_id, "agent execution timed out");
                Err(RuntimeError::timeout(format!(
                    "agent {agent_id} did not finish within {}ms",
                    self.config.execution_timeout.as_millis()
                )))
            }
            Ok(Ok(result)) => result,
            Ok(Err(err)) if err.is_panic() => {
                tracing::error!(agent_id = %agent_id, "agent execution panicked");
                Err(RuntimeError::execution(format!("agent {agent_id} panicked")))
            }
            Ok(Err(_)) => Err(RuntimeError::Cancelled),
        }
    }

    fn token_count(&self, message: &str, reply: &AgentReply) -> usize {
        reply
            .token_count
            .unwrap_or_else(|| self.estimator.estimate_all([message, reply.content.as_str()]))
    }

    async fn emit_error(&self, session_id: &str, err: &RuntimeError) {
        if let Ok(event) = SseEvent::json("error", &err.to_problem_details()) {
            self.hub.broadcast_to_session(session_id, &event).await;
        }
    }
}

impl Drop for Coordinator {
    fn drop(&mut self) {
        self.close();
    }
}

fn validate_session_id(session_id: &str) -> Result<(), RuntimeError> {
    if session_id.is_empty() {
        return Err(RuntimeError::InvalidRequest {
            message: "session id must not be empty".to_string(),
        });
    }
    Ok(())
}

fn build_input(instance: &AgentInstance, layer: &ConversationLayer, message: &str) -> AgentInput {
    AgentInput {
        system_prompt: instance.system_prompt.clone(),
        summary: layer.summary_content.clone(),
        recent_rounds: layer.recent_rounds.clone(),
        message: message.to_string(),
    }
}

struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Holds one session's execution lock; drops the map entry once nobody
/// else holds or waits on it.
struct SessionPermit<'a> {
    locks: &'a Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    session_id: String,
    lock: Arc<tokio::sync::Mutex<()>>,
    guard: Option<OwnedMutexGuard<()>>,
}

impl fmt::Debug for SessionPermit<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPermit")
            .field("session_id", &self.session_id)
            .field("held", &self.guard.is_some())
            .finish()
    }
}

impl Drop for SessionPermit<'_> {
    fn drop(&mut self) {
        self.guard.take();
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // One reference in the map, one here.
        if Arc::strong_count(&self.lock) <= 2 {
            locks.remove(&self.session_id);
        }
    }
}
