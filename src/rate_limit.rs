use std::time::{Duration, Instant};

/// Token-bucket rate limiter.
///
/// Tokens accrue linearly at `max_rate` per second, capped at `bucket_size`.
/// Each event consumes one token; when the bucket is empty the caller waits
/// `(1 - tokens) / max_rate` seconds first. The default bucket size equals
/// `max_rate`, allowing up to one second of burst.
///
/// The timing math lives in [`poll_at`](Self::poll_at), which takes the
/// current instant and returns the required wait; [`next`](Self::next) and
/// [`next_blocking`](Self::next_blocking) layer the actual sleeping on top,
/// for cooperative tasks and capture threads respectively.
#[derive(Debug)]
pub struct BucketRateLimiter {
    max_rate: f64,
    bucket_size: f64,
    tokens: f64,
    last_update: Instant,
}

impl BucketRateLimiter {
    pub fn new(max_rate: f64, bucket_size: Option<f64>) -> Self {
        let bucket_size = bucket_size.unwrap_or(max_rate);
        Self {
            max_rate,
            bucket_size,
            tokens: bucket_size,
            last_update: Instant::now(),
        }
    }

    /// Refill the bucket and start a fresh accounting period.
    pub fn reset(&mut self) {
        self.tokens = self.bucket_size;
        self.last_update = Instant::now();
    }

    pub fn max_rate(&self) -> f64 {
        self.max_rate
    }

    /// Change the rate, reconciling the accrued token count at the old rate
    /// first.
    pub fn set_max_rate(&mut self, max_rate: f64) {
        self.set_max_rate_at(max_rate, Instant::now());
    }

    fn set_max_rate_at(&mut self, max_rate: f64, now: Instant) {
        self.refill(now);
        self.max_rate = max_rate;
    }

    fn refill(&mut self, now: Instant) -> f64 {
        let dt = now.saturating_duration_since(self.last_update).as_secs_f64();
        self.tokens = (self.tokens + dt * self.max_rate).min(self.bucket_size);
        self.last_update = now;
        self.tokens
    }

    /// Consume one token, returning the wait the caller owes before the
    /// event may proceed. The wait is accounted for as if it had already
    /// elapsed, so the caller must actually sleep it.
    pub fn poll_at(&mut self, now: Instant) -> Option<Duration> {
        let tokens = self.refill(now);
        if tokens >= 1.0 {
            self.tokens -= 1.0;
            None
        } else {
            let wait = Duration::from_secs_f64((1.0 - tokens) / self.max_rate);
            self.last_update += wait;
            self.tokens = 0.0;
            Some(wait)
        }
    }

    /// Permit the next event, suspending the task as required.
    pub async fn next(&mut self) {
        if let Some(wait) = self.poll_at(Instant::now()) {
            tokio::time::sleep(wait).await;
        }
    }

    /// Permit the next event, blocking the thread as required.
    pub fn next_blocking(&mut self) {
        if let Some(wait) = self.poll_at(Instant::now()) {
            std::thread::sleep(wait);
        }
    }
}

/// Exponential-backoff rate limiter for reconnect attempts.
///
/// The first event passes immediately; each subsequent event waits until
/// `wait_until`, which recedes by a delay that doubles (by default) up to
/// `max_delay`. A successful attempt should call [`reset`](Self::reset).
#[derive(Debug)]
pub struct BackoffRateLimiter {
    initial_delay: Duration,
    backoff: f64,
    max_delay: Duration,
    delay: Duration,
    wait_until: Option<Instant>,
}

pub const DEFAULT_BACKOFF: f64 = 2.0;
pub const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(300);

impl BackoffRateLimiter {
    pub fn new(initial_delay: Duration) -> Self {
        Self::with_limits(initial_delay, DEFAULT_BACKOFF, DEFAULT_MAX_DELAY)
    }

    pub fn with_limits(initial_delay: Duration, backoff: f64, max_delay: Duration) -> Self {
        Self {
            initial_delay,
            backoff,
            max_delay,
            delay: initial_delay,
            wait_until: None,
        }
    }

    /// Clear the backoff after a successful attempt.
    pub fn reset(&mut self) {
        self.wait_until = None;
        self.delay = self.initial_delay;
    }

    /// Returns the wait the caller owes before the next attempt, and grows
    /// the delay for the attempt after that.
    pub fn poll_at(&mut self, now: Instant) -> Option<Duration> {
        let delay = self.delay;
        let wait = match self.wait_until {
            Some(until) if until > now => {
                self.wait_until = Some(until + delay);
                Some(until - now)
            }
            _ => {
                self.wait_until = Some(now + delay);
                None
            }
        };
        self.delay = Duration::from_secs_f64(
            (delay.as_secs_f64() * self.backoff).min(self.max_delay.as_secs_f64()),
        );
        wait
    }

    /// Permit the next attempt, suspending the task as required.
    pub async fn next(&mut self) {
        if let Some(wait) = self.poll_at(Instant::now()) {
            tokio::time::sleep(wait).await;
        }
    }

    /// Permit the next attempt, blocking the thread as required.
    pub fn next_blocking(&mut self) {
        if let Some(wait) = self.poll_at(Instant::now()) {
            std::thread::sleep(wait);
        }
    }
}
