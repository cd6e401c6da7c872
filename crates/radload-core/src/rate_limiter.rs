use std::time::Duration;
use tokio::time::{sleep, Instant};

/// Token bucket used as an alternative pacing source for a phase.
///
/// Tokens are tracked in nanotokens (1e-9 of a token) so fractional rates
/// such as 0.5 req/s refill exactly. The bucket starts empty, so the first
/// token arrives one interval after creation, same as a ticker.
pub struct TokenBucket {
    /// Target rate in tokens per second
    rate: f64,
    /// Maximum tokens that can accumulate, in nanotokens
    capacity: u128,
    /// Current token count, in nanotokens
    tokens: u128,
    last_refill: Instant,
}

const NANOS_PER_TOKEN: u128 = 1_000_000_000;

impl TokenBucket {
    pub fn new(rate: f64) -> Self {
        Self::with_burst(rate, 1)
    }

    pub fn with_burst(rate: f64, burst: u32) -> Self {
        Self {
            rate: rate.max(0.0),
            capacity: (burst.max(1) as u128) * NANOS_PER_TOKEN,
            tokens: 0,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed_nanos = now.duration_since(self.last_refill).as_nanos();
        if elapsed_nanos == 0 {
            return;
        }

        // rate tokens/s * elapsed ns = rate * elapsed nanotokens
        let earned = (self.rate * elapsed_nanos as f64) as u128;
        self.tokens = self.tokens.saturating_add(earned).min(self.capacity);
        self.last_refill = now;
    }

    pub fn try_acquire(&mut self) -> bool {
        self.refill();

        if self.tokens >= NANOS_PER_TOKEN {
            self.tokens -= NANOS_PER_TOKEN;
            true
        } else {
            false
        }
    }

    /// Time until the next token is available.
    pub fn time_to_next(&mut self) -> Duration {
        self.refill();
        if self.tokens >= NANOS_PER_TOKEN {
            return Duration::ZERO;
        }
        if self.rate <= 0.0 {
            return Duration::from_secs(1);
        }
        let deficit = (NANOS_PER_TOKEN - self.tokens) as f64;
        // Round up so the wakeup lands at or after the token.
        Duration::from_nanos((deficit / self.rate).ceil() as u64).max(Duration::from_nanos(1))
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&mut self) {
        loop {
            if self.try_acquire() {
                return;
            }
            let wait = self.time_to_next();
            sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_starts_empty() {
        let mut bucket = TokenBucket::new(100.0);
        assert!(!bucket.try_acquire());

        sleep(Duration::from_millis(10)).await;
        assert!(bucket.try_acquire());
        assert!(!bucket.try_acquire());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_is_capped() {
        let mut bucket = TokenBucket::with_burst(1000.0, 5);

        sleep(Duration::from_secs(1)).await;

        let mut acquired = 0;
        while bucket.try_acquire() {
            acquired += 1;
        }
        assert_eq!(acquired, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_paces_requests() {
        let mut bucket = TokenBucket::new(200.0);
        let start = Instant::now();

        for _ in 0..200 {
            bucket.acquire().await;
        }

        let elapsed = start.elapsed();
        assert!(
            elapsed >= Duration::from_millis(995) && elapsed <= Duration::from_millis(1005),
            "elapsed: {:?}",
            elapsed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_rate() {
        let mut bucket = TokenBucket::new(0.5);
        assert_eq!(bucket.time_to_next(), Duration::from_secs(2));

        sleep(Duration::from_secs(2)).await;
        assert!(bucket.try_acquire());
    }
}
