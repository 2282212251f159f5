use crate::error::{AppError, ResourceLimit, Result};
use crate::metrics::RATE_LIMIT_REJECTIONS_TOTAL;
use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket holding at most `capacity` tokens, refilled at `capacity / 60` per second
pub struct TokenBucket {
    name: &'static str,
    capacity: f64,
    refill_per_sec: f64,
    state: Mutex<BucketState>,
}

impl TokenBucket {
    /// Bucket for a per-minute budget, starting full
    pub fn per_minute(name: &'static str, capacity: u64) -> Self {
        let capacity = capacity.max(1) as f64;
        Self {
            name,
            capacity,
            refill_per_sec: capacity / 60.0,
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn capacity(&self) -> u64 {
        self.capacity as u64
    }

    pub fn available(&self) -> f64 {
        let mut state = self.state.lock();
        self.refill(&mut state);
        state.tokens
    }

    fn refill(&self, state: &mut BucketState) {
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        state.last_refill = now;
    }

    /// Take `n` tokens if available, otherwise report how long until they are
    fn try_take(&self, n: f64) -> std::result::Result<(), Duration> {
        let mut state = self.state.lock();
        self.refill(&mut state);
        if state.tokens >= n {
            state.tokens -= n;
            Ok(())
        } else {
            let missing = n - state.tokens;
            Err(Duration::from_secs_f64(missing / self.refill_per_sec))
        }
    }

    /// Wait up to `timeout` for `n` tokens.
    ///
    /// Requests larger than the bucket are clamped to its capacity so they can
    /// eventually proceed.
    pub async fn acquire(&self, n: u64, timeout: Duration) -> Result<()> {
        let n = (n as f64).min(self.capacity);
        let deadline = Instant::now() + timeout;
        loop {
            match self.try_take(n) {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    let now = Instant::now();
                    if now + wait > deadline {
                        RATE_LIMIT_REJECTIONS_TOTAL
                            .with_label_values(&[self.name])
                            .inc();
                        return Err(AppError::exhausted(
                            ResourceLimit::RateLimited,
                            format!(
                                "{} budget exhausted: {} tokens not available within {:?}",
                                self.name, n, timeout
                            ),
                        ));
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }
}

/// Requests-per-minute and tokens-per-minute budgets for LLM calls
pub struct LlmRateLimiter {
    rpm: TokenBucket,
    tpm: TokenBucket,
    timeout: Duration,
}

impl LlmRateLimiter {
    pub fn new(rpm: u64, tpm: u64, timeout: Duration) -> Self {
        Self {
            rpm: TokenBucket::per_minute("rpm", rpm),
            tpm: TokenBucket::per_minute("tpm", tpm),
            timeout,
        }
    }

    /// Reserve one request and `tokens` tokens before calling the model
    pub async fn acquire(&self, tokens: u64) -> Result<()> {
        self.rpm.acquire(1, self.timeout).await?;
        self.tpm.acquire(tokens, self.timeout).await
    }

    pub fn rpm(&self) -> &TokenBucket {
        &self.rpm
    }

    pub fn tpm(&self) -> &TokenBucket {
        &self.tpm
    }
}

/// Rough token estimate used for TPM accounting: a quarter of the characters
/// plus the reply budget
pub fn estimate_tokens(prompt: &str, max_output_tokens: u32) -> u64 {
    (prompt.chars().count() as u64).div_ceil(4) + max_output_tokens as u64
}
