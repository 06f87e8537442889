//! Token-bucket pacing for outbound model requests.
//!
//! Wraps a [`leaky_bucket::RateLimiter`] with two behaviours the raw bucket
//! does not have:
//!
//! * **Atomic reconfiguration** — [`update`](RateLimiter::update) replaces
//!   the bucket; waiters parked on the old bucket are woken through a
//!   generation channel and re-park on the new one, so a config change
//!   takes effect for every in-flight `wait`, not just future calls.
//! * **Cooperative cancellation** — [`wait`](RateLimiter::wait) races token
//!   acquisition against the caller's [`CancellationToken`] and a permanent
//!   [`close`](RateLimiter::close).
//!
//! Tokens never accumulate above `burst`; the bucket starts full so a cold
//! engine can issue an initial burst without pacing delay.

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Error returned by [`RateLimiter::wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cancelled;

struct State {
    bucket: Arc<leaky_bucket::RateLimiter>,
    closed: bool,
}

/// Shared token bucket. Cheap to clone via `Arc` at the call sites.
pub struct RateLimiter {
    state: Mutex<State>,
    generation: watch::Sender<u64>,
}

fn build_bucket(interval: Duration, burst: usize) -> Arc<leaky_bucket::RateLimiter> {
    let burst = burst.max(1);
    let interval = interval.max(Duration::from_millis(1));
    Arc::new(
        leaky_bucket::RateLimiter::builder()
            .max(burst)
            .initial(burst)
            .refill(1)
            .interval(interval)
            .build(),
    )
}

impl RateLimiter {
    /// Create a bucket with capacity `burst` refilled one token per
    /// `interval`.
    pub fn new(interval: Duration, burst: usize) -> Self {
        let (generation, _) = watch::channel(0);
        Self {
            state: Mutex::new(State {
                bucket: build_bucket(interval, burst),
                closed: false,
            }),
            generation,
        }
    }

    /// Block until a token is available, the context is cancelled, or the
    /// limiter is closed.
    pub async fn wait(&self, cancel: &CancellationToken) -> Result<(), Cancelled> {
        loop {
            let (bucket, mut epoch) = {
                let state = self.state.lock().expect("limiter lock poisoned");
                if state.closed {
                    return Err(Cancelled);
                }
                // Subscribing under the lock means a reconfigure can never
                // slip between reading the bucket and arming the watch.
                (state.bucket.clone(), self.generation.subscribe())
            };

            tokio::select! {
                _ = cancel.cancelled() => return Err(Cancelled),
                _ = epoch.changed() => {
                    debug!("rate limiter reconfigured; waiter migrating to new bucket");
                    continue;
                }
                _ = bucket.acquire_one() => return Ok(()),
            }
        }
    }

    /// Take a token without blocking.
    pub fn try_acquire(&self) -> bool {
        let state = self.state.lock().expect("limiter lock poisoned");
        if state.closed {
            return false;
        }
        state.bucket.try_acquire(1)
    }

    /// Atomically replace the bucket. In-flight waiters are serviced by the
    /// new bucket; accumulated tokens beyond the new `burst` are discarded.
    pub fn update(&self, interval: Duration, burst: usize) {
        {
            let mut state = self.state.lock().expect("limiter lock poisoned");
            if state.closed {
                return;
            }
            state.bucket = build_bucket(interval, burst);
        }
        self.generation.send_modify(|g| *g += 1);
    }

    /// Permanently close the limiter; current and future waits return
    /// [`Cancelled`].
    pub fn close(&self) {
        {
            let mut state = self.state.lock().expect("limiter lock poisoned");
            state.closed = true;
        }
        self.generation.send_modify(|g| *g += 1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[tokio::test]
    async fn burst_tokens_are_immediate() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 3);
        let cancel = CancellationToken::new();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.wait(&cancel).await.unwrap();
        }
        assert!(start.elapsed() < Duration::from_millis(200));
    }

    #[tokio::test]
    async fn try_acquire_exhausts_burst() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 2);
        assert!(limiter.try_acquire());
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn cancelled_context_stops_wait() {
        let limiter = RateLimiter::new(Duration::from_secs(60), 1);
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap(); // drain the burst
        cancel.cancel();
        assert_eq!(limiter.wait(&cancel).await, Err(Cancelled));
    }

    #[tokio::test]
    async fn close_is_permanent() {
        let limiter = RateLimiter::new(Duration::from_millis(1), 1);
        limiter.close();
        let cancel = CancellationToken::new();
        assert_eq!(limiter.wait(&cancel).await, Err(Cancelled));
        assert!(!limiter.try_acquire());
    }

    #[tokio::test]
    async fn update_services_parked_waiter() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(3600), 1));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap(); // drain; next wait parks ~1h

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!waiter.is_finished());

        // New bucket starts full, so the migrated waiter acquires at once.
        limiter.update(Duration::from_millis(10), 2);
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should finish after update")
            .unwrap();
        assert_eq!(result, Ok(()));
    }

    #[tokio::test]
    async fn close_wakes_parked_waiter() {
        let limiter = Arc::new(RateLimiter::new(Duration::from_secs(3600), 1));
        let cancel = CancellationToken::new();
        limiter.wait(&cancel).await.unwrap();

        let waiter = {
            let limiter = limiter.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { limiter.wait(&cancel).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        limiter.close();
        let result = tokio::time::timeout(Duration::from_secs(2), waiter)
            .await
            .expect("waiter should finish after close")
            .unwrap();
        assert_eq!(result, Err(Cancelled));
    }
}
