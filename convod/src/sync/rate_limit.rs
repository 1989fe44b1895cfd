use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;

/// Seconds of sustained traffic the bucket may burst.
const BURST_SECS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RateLimitConfig {
    pub capacity: f64,
    pub refill_per_sec: f64,
}

impl RateLimitConfig {
    /// Derives bucket parameters from the remote's published per-minute limit,
    /// scaled by `headroom` (e.g. `0.9` for 90%).
    pub fn from_published(per_minute: u32, headroom: f64) -> Self {
        let headroom = if headroom.is_finite() && headroom > 0.0 {
            headroom.min(1.0)
        } else {
            1.0
        };
        let refill_per_sec = (f64::from(per_minute.max(1)) / 60.0) * headroom;
        Self {
            capacity: (refill_per_sec * BURST_SECS).max(1.0),
            refill_per_sec,
        }
    }
}

#[derive(Debug)]
struct RateLimitState {
    tokens_available: f64,
    last_refill_at: Instant,
    capacity: f64,
    refill_rate: f64,
}

impl RateLimitState {
    fn refill(&mut self, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill_at);
        self.tokens_available = (self.tokens_available
            + elapsed.as_secs_f64() * self.refill_rate)
            .min(self.capacity);
        self.last_refill_at = now;
    }
}

/// Token bucket shared by every outbound call.
///
/// Callers reserve a token under the lock and sleep off any deficit outside
/// it, so waiters are served in lock order and none can be overtaken
/// indefinitely.
#[derive(Clone)]
pub struct TokenBucket {
    state: Arc<Mutex<RateLimitState>>,
}

impl TokenBucket {
    pub fn new(config: RateLimitConfig) -> Self {
        let capacity = config.capacity.max(1.0);
        Self {
            state: Arc::new(Mutex::new(RateLimitState {
                tokens_available: capacity,
                last_refill_at: Instant::now(),
                capacity,
                refill_rate: config.refill_per_sec.max(f64::MIN_POSITIVE),
            })),
        }
    }

    /// Waits until a token is available and consumes it. Returns how long
    /// the caller was held back.
    pub async fn acquire(&self) -> Duration {
        let wait = {
            let mut state = self.state.lock().await;
            state.refill(Instant::now());
            state.tokens_available -= 1.0;
            if state.tokens_available >= 0.0 {
                Duration::ZERO
            } else {
                let deficit = -state.tokens_available;
                Duration::try_from_secs_f64(deficit / state.refill_rate)
                    .unwrap_or(Duration::MAX)
            }
        };
        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limiter throttling");
            tokio::time::sleep(wait).await;
        }
        wait
    }

    pub async fn tokens_available(&self) -> f64 {
        let mut state = self.state.lock().await;
        state.refill(Instant::now());
        state.tokens_available
    }
}
