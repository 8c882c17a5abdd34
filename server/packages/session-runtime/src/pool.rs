//! Warm agent instances keyed by session, evicted after sitting idle.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use utoipa::ToSchema;

use crate::agent::AgentInstance;
use crate::config::{duration_str, PoolConfig};

/// `session_id` alone, or `session_id:agent_id` when an agent id is given.
pub fn make_key(session_id: &str, agent_id: Option<&str>) -> String {
    match agent_id {
        Some(agent_id) if !agent_id.is_empty() => format!("{session_id}:{agent_id}"),
        _ => session_id.to_string(),
    }
}

#[derive(Debug, Clone)]
struct PoolEntry {
    instance: Arc<AgentInstance>,
    session_id: String,
    created_at: Instant,
    last_active: Instant,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PoolStats {
    pub total_instances: usize,
    pub sessions: usize,
    pub max_idle_time: String,
    pub cleanup_interval: String,
    /// Age of the longest-lived entry, in milliseconds.
    pub oldest_entry_ms: Option<u64>,
    pub closed: bool,
}

#[derive(Debug)]
struct PoolInner {
    entries: Mutex<HashMap<String, PoolEntry>>,
    max_idle_time: Duration,
    closed: AtomicBool,
}

impl PoolInner {
    fn entries(&self) -> std::sync::MutexGuard<'_, HashMap<String, PoolEntry>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut evicted = Vec::new();
        self.entries().retain(|key, entry| {
            let keep = now.saturating_duration_since(entry.last_active) <= self.max_idle_time;
            if !keep {
                evicted.push(key.clone());
            }
            keep
        });
        for key in &evicted {
            tracing::info!(key = %key, "evicted idle agent instance");
        }
        evicted.len()
    }
}

#[derive(Debug)]
pub struct InstancePool {
    inner: Arc<PoolInner>,
    cleanup_interval: Duration,
    cancel: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl InstancePool {
    /// Creates the pool and starts its background sweep. Must be called
    /// inside a tokio runtime.
    pub fn new(config: &PoolConfig) -> Self {
        let inner = Arc::new(PoolInner {
            entries: Mutex::new(HashMap::new()),
            max_idle_time: config.max_idle_time,
            closed: AtomicBool::new(false),
        });
        let cancel = CancellationToken::new();
        let sweeper = if config.cleanup_interval.is_zero() {
            tracing::warn!("pool cleanup interval is zero; idle eviction disabled");
            None
        } else {
            Some(spawn_sweeper(
                Arc::downgrade(&inner),
                config.cleanup_interval,
                cancel.clone(),
            ))
        };
        tracing::info!(
            max_idle_time = %duration_str::format(config.max_idle_time),
            cleanup_interval = %duration_str::format(config.cleanup_interval),
            "instance pool started"
        );

        Self {
            inner,
            cleanup_interval: config.cleanup_interval,
            cancel,
            sweeper: Mutex::new(sweeper),
        }
    }

    /// Inserts or replaces the entry for `key`. Ignored once the pool is
    /// closed.
    pub fn store(&self, key: &str, instance: Arc<AgentInstance>) {
        if self.is_closed() {
            tracing::debug!(key = %key, "store on closed pool ignored");
            return;
        }
        let now = Instant::now();
        let session_id = key.split_once(':').map_or(key, |(session, _)| session);
        self.inner.entries().insert(
            key.to_string(),
            PoolEntry {
                instance,
                session_id: session_id.to_string(),
                created_at: now,
                last_active: now,
            },
        );
        tracing::debug!(key = %key, "stored agent instance");
    }

    /// Returns the instance and marks it active.
    pub fn load(&self, key: &str) -> Option<Arc<AgentInstance>> {
        let mut entries = self.inner.entries();
        let entry = entries.get_mut(key)?;
        entry.last_active = Instant::now();
        Some(entry.instance.clone())
    }

    pub fn delete(&self, key: &str) -> bool {
        self.inner.entries().remove(key).is_some()
    }

    /// Removes the bare session key and every `session_id:*` key.
    pub fn delete_session(&self, session_id: &str) -> usize {
        let mut entries = self.inner.entries();
        let before = entries.len();
        entries.retain(|_, entry| entry.session_id != session_id);
        before - entries.len()
    }

    pub fn count(&self) -> usize {
        self.inner.entries().len()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.entries().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn stats(&self) -> PoolStats {
        let now = Instant::now();
        let entries = self.inner.entries();
        let sessions: HashSet<&str> = entries
            .values()
            .map(|entry| entry.session_id.as_str())
            .collect();
        let oldest_entry_ms = entries
            .values()
            .map(|entry| now.saturating_duration_since(entry.created_at).as_millis() as u64)
            .max();
        PoolStats {
            total_instances: entries.len(),
            sessions: sessions.len(),
            max_idle_time: duration_str::format(self.inner.max_idle_time),
            cleanup_interval: duration_str::format(self.cleanup_interval),
            oldest_entry_ms,
            closed: self.is_closed(),
        }
    }

    /// Evicts every entry idle for longer than `max_idle_time`. Runs
    /// periodically on its own; exposed for callers that want an immediate
    /// pass.
    pub fn sweep(&self) -> usize {
        self.inner.sweep()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stops the sweep and drops every entry. Idempotent; the pool is not
    /// reusable afterwards.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cancel.cancel();
        self.sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let dropped = {
            let mut entries = self.inner.entries();
            let dropped = entries.len();
            entries.clear();
            dropped
        };
        tracing::info!(dropped, "instance pool closed");
    }
}

impl Drop for InstancePool {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

fn spawn_sweeper(
    inner: Weak<PoolInner>,
    interval: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately.
        ticker.tick().await;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let Some(inner) = inner.upgrade() else {
                        break;
                    };
                    let evicted = inner.sweep();
                    if evicted > 0 {
                        tracing::debug!(evicted, "pool sweep finished");
                    }
                }
            }
        }
        tracing::debug!("pool sweep stopped");
    })
}
