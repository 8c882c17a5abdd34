//! Admission control: a shared global token bucket plus lazily created
//! per-user buckets.
//!
//! Buckets refill continuously (`elapsed * rate`, clamped to the burst
//! capacity) and each admitted request consumes exactly one token. The
//! global bucket is always consulted first so system-wide backpressure wins
//! over per-user fairness.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;

use session_runtime_error::{RateLimitScope, RuntimeError};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::RateLimitConfig;

#[derive(Debug)]
pub struct TokenBucket {
    rate: f64,
    capacity: f64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

impl TokenBucket {
    /// Creates a bucket that starts full.
    pub fn new(rate: f64, burst: u32) -> Self {
        let capacity = f64::from(burst);
        Self {
            rate: rate.max(0.0),
            capacity,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn rate(&self) -> f64 {
        self.rate
    }

    pub fn capacity(&self) -> f64 {
        self.capacity
    }

    /// Current (fractional) token level after refilling up to now.
    pub fn available(&self) -> f64 {
        let mut state = self.lock_state();
        self.refill(&mut state, Instant::now());
        state.tokens
    }

    /// Takes one token if one is available. Never blocks.
    pub fn try_acquire(&self) -> bool {
        self.reserve().is_ok()
    }

    /// Waits until a token is available or `cancel` fires.
    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        loop {
            if cancel.is_cancelled() {
                return Err(RuntimeError::Cancelled);
            }
            match self.reserve() {
                Ok(()) => return Ok(()),
                Err(Some(delay)) => {
                    tokio::select! {
                        _ = cancel.cancelled() => return Err(RuntimeError::Cancelled),
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
                Err(None) => {
                    // Bucket can never admit; only cancellation ends the wait.
                    cancel.cancelled().await;
                    return Err(RuntimeError::Cancelled);
                }
            }
        }
    }

    /// Returns a previously consumed token, clamped to capacity.
    pub(crate) fn refund(&self) {
        let mut state = self.lock_state();
        self.refill(&mut state, Instant::now());
        state.tokens = (state.tokens + 1.0).min(self.capacity);
    }

    /// `Ok` when a token was taken, otherwise how long until one accrues
    /// (`None` if it never will).
    fn reserve(&self) -> Result<(), Option<Duration>> {
        let mut state = self.lock_state();
        self.refill(&mut state, Instant::now());
        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            return Ok(());
        }
        if self.rate <= 0.0 || self.capacity < 1.0 {
            return Err(None);
        }
        let missing = 1.0 - state.tokens;
        // A rate small enough to overflow `Duration` never refills in practice.
        Err(Duration::try_from_secs_f64(missing / self.rate).ok())
    }

    fn refill(&self, state: &mut BucketState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.rate).min(self.capacity);
        state.last_refill = now;
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, BucketState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Global plus per-user admission.
///
/// Per-user buckets are never evicted; the map grows with the number of
/// distinct users seen over the process lifetime. See
/// [`RateLimiter::user_bucket_count`].
#[derive(Debug)]
pub struct RateLimiter {
    enabled: bool,
    global: TokenBucket,
    users: RwLock<HashMap<String, Arc<TokenBucket>>>,
    user_rate: f64,
    user_burst: u32,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self {
            enabled: config.enabled,
            global: TokenBucket::new(config.global_requests_per_second, config.global_burst),
            users: RwLock::new(HashMap::new()),
            user_rate: config.user_requests_per_second,
            user_burst: config.user_burst,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn global_bucket(&self) -> &TokenBucket {
        &self.global
    }

    pub fn allow(&self) -> bool {
        !self.enabled || self.global.try_acquire()
    }

    pub fn allow_for_user(&self, user_id: &str) -> bool {
        self.check_for_user(user_id).is_ok()
    }

    /// Same as [`allow_for_user`](Self::allow_for_user) but reports which
    /// bucket rejected the request. A global rejection never touches the
    /// user bucket; a user rejection hands the global token back.
    pub fn check_for_user(&self, user_id: &str) -> Result<(), RuntimeError> {
        if !self.enabled {
            return Ok(());
        }
        if !self.global.try_acquire() {
            return Err(RuntimeError::RateLimited {
                scope: RateLimitScope::Global,
                user_id: Some(user_id.to_string()),
            });
        }
        if !self.user_bucket(user_id).try_acquire() {
            self.global.refund();
            return Err(RuntimeError::RateLimited {
                scope: RateLimitScope::User,
                user_id: Some(user_id.to_string()),
            });
        }
        Ok(())
    }

    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), RuntimeError> {
        if !self.enabled {
            return Ok(());
        }
        self.global.acquire(cancel).await
    }

    /// Waits on the global bucket, then on the user's bucket. If the user
    /// wait fails or the future is dropped midway, the global token is
    /// returned so a retry is not charged twice.
    pub async fn wait_for_user(
        &self,
        cancel: &CancellationToken,
        user_id: &str,
    ) -> Result<(), RuntimeError> {
        if !self.enabled {
            return Ok(());
        }
        self.global.acquire(cancel).await?;
        let refund = GlobalRefund {
            bucket: &self.global,
            armed: true,
        };
        let user_bucket = self.user_bucket(user_id);
        user_bucket.acquire(cancel).await?;
        refund.disarm();
        Ok(())
    }

    pub fn user_bucket_count(&self) -> usize {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn user_bucket(&self, user_id: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self
            .users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user_id)
        {
            return bucket.clone();
        }

        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(bucket) = users.get(user_id) {
            return bucket.clone();
        }
        let bucket = Arc::new(TokenBucket::new(self.user_rate, self.user_burst));
        users.insert(user_id.to_string(), bucket.clone());
        tracing::debug!(
            user_id = %user_id,
            user_buckets = users.len(),
            "created per-user rate limit bucket"
        );
        bucket
    }
}

struct GlobalRefund<'a> {
    bucket: &'a TokenBucket,
    armed: bool,
}

impl GlobalRefund<'_> {
    fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for GlobalRefund<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.bucket.refund();
        }
    }
}
