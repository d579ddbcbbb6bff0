//! Time utilities
//!
//! Every Weft timestamp is a `Duration` since a clock-specific epoch. The
//! protocol core never reads a clock itself; the [`Clock`] trait lets the
//! client and server pick a real clock in production and a manual one in
//! tests.

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Source of the current time
pub trait Clock: Send + Sync {
    /// Time elapsed since this clock's epoch
    fn now(&self) -> Duration;
}

/// Monotonic clock whose epoch is its creation
#[derive(Debug, Clone, Copy)]
pub struct SystemClock {
    epoch: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        SystemClock {
            epoch: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    #[inline]
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Clock following tokio's timer, including paused test time
#[derive(Debug, Clone, Copy)]
pub struct TokioClock {
    epoch: tokio::time::Instant,
}

impl TokioClock {
    pub fn new() -> Self {
        TokioClock {
            epoch: tokio::time::Instant::now(),
        }
    }

    /// Instant at which this clock reads `at`
    pub fn instant_at(&self, at: Duration) -> tokio::time::Instant {
        self.epoch + at
    }
}

impl Default for TokioClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for TokioClock {
    #[inline]
    fn now(&self) -> Duration {
        self.epoch.elapsed()
    }
}

/// Manually advanced clock; clones share the same time
#[derive(Debug, Clone, Default)]
pub struct ManualClock {
    now: Arc<Mutex<Duration>>,
}

impl ManualClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn starting_at(now: Duration) -> Self {
        ManualClock {
            now: Arc::new(Mutex::new(now)),
        }
    }

    pub fn advance(&self, by: Duration) {
        *self.now.lock() += by;
    }

    pub fn set(&self, now: Duration) {
        *self.now.lock() = now;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        *self.now.lock()
    }
}

/// Timer for periodic operations
///
/// Used for buffer-control ticks, padding evaluation and descriptor
/// refreshes. Time is supplied by the caller.
#[derive(Debug, Clone, Copy)]
pub struct Timer {
    interval: Duration,
    last_fire: Duration,
}

impl Timer {
    /// Create a timer that first fires `interval` after `now`
    pub fn new(interval: Duration, now: Duration) -> Self {
        Timer {
            interval,
            last_fire: now,
        }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Check if the timer has expired
    pub fn expired(&self, now: Duration) -> bool {
        now.saturating_sub(self.last_fire) >= self.interval
    }

    /// Reset the timer
    pub fn reset(&mut self, now: Duration) {
        self.last_fire = now;
    }

    /// Get time until next expiration
    pub fn time_until_expiration(&self, now: Duration) -> Duration {
        self.interval
            .saturating_sub(now.saturating_sub(self.last_fire))
    }

    /// Fire the timer if expired, returning true if it fired
    pub fn try_fire(&mut self, now: Duration) -> bool {
        if self.expired(now) {
            self.reset(now);
            true
        } else {
            false
        }
    }
}

/// Rate limiter using token bucket algorithm
///
/// Used for pacing file input to a live-like rate.
#[derive(Debug, Clone)]
pub struct RateLimiter {
    /// Maximum tokens (burst size)
    capacity: u64,
    /// Current token count
    tokens: u64,
    /// Tokens added per microsecond
    rate: f64,
    /// Last refill time
    last_update: Duration,
}

impl RateLimiter {
    /// Create a new rate limiter
    ///
    /// # Arguments
    /// * `rate_bytes_per_sec` - Sustained rate
    /// * `burst_bytes` - Maximum burst size in bytes
    /// * `now` - Current time
    pub fn new(rate_bytes_per_sec: u64, burst_bytes: u64, now: Duration) -> Self {
        RateLimiter {
            capacity: burst_bytes,
            tokens: burst_bytes,
            rate: rate_bytes_per_sec as f64 / 1_000_000.0,
            last_update: now,
        }
    }

    /// Refill tokens based on elapsed time
    fn refill(&mut self, now: Duration) {
        let elapsed_us = now.saturating_sub(self.last_update).as_micros() as f64;
        let new_tokens = (elapsed_us * self.rate) as u64;

        if new_tokens > 0 {
            self.tokens = (self.tokens + new_tokens).min(self.capacity);
            self.last_update = now;
        }
    }

    /// Consume tokens for `bytes`
    ///
    /// Returns true if successful, false if insufficient tokens
    pub fn consume(&mut self, bytes: usize, now: Duration) -> bool {
        self.refill(now);
        if self.tokens >= bytes as u64 {
            self.tokens -= bytes as u64;
            true
        } else {
            false
        }
    }

    /// Get time to wait before `bytes` will be available
    pub fn time_to_available(&mut self, bytes: usize, now: Duration) -> Duration {
        self.refill(now);

        if self.tokens >= bytes as u64 {
            return Duration::ZERO;
        }

        let needed = (bytes as u64) - self.tokens;
        let micros = (needed as f64 / self.rate).ceil() as u64;
        Duration::from_micros(micros)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ms(v: u64) -> Duration {
        Duration::from_millis(v)
    }

    #[test]
    fn test_manual_clock_shared() {
        let clock = ManualClock::starting_at(ms(100));
        let other = clock.clone();
        clock.advance(ms(50));
        assert_eq!(other.now(), ms(150));

        other.set(ms(10));
        assert_eq!(clock.now(), ms(10));
    }

    #[test]
    fn test_system_clock_monotonic() {
        let clock = SystemClock::new();
        let a = clock.now();
        let b = clock.now();
        assert!(b >= a);
    }

    #[test]
    fn test_timer() {
        let mut timer = Timer::new(ms(10), ms(0));
        assert!(!timer.expired(ms(9)));
        assert!(timer.expired(ms(10)));
        assert_eq!(timer.time_until_expiration(ms(4)), ms(6));

        timer.reset(ms(10));
        assert!(!timer.expired(ms(15)));
    }

    #[test]
    fn test_timer_try_fire() {
        let mut timer = Timer::new(ms(10), ms(0));
        assert!(!timer.try_fire(ms(5)));
        assert!(timer.try_fire(ms(11)));
        assert!(!timer.try_fire(ms(12)));
        assert_eq!(timer.time_until_expiration(ms(30)), Duration::ZERO);
    }

    #[test]
    fn test_rate_limiter() {
        // 1 MB/s = 1 byte per microsecond
        let mut limiter = RateLimiter::new(1_000_000, 1000, ms(0));

        assert!(limiter.consume(500, ms(0)));
        assert!(limiter.consume(500, ms(0)));
        assert!(!limiter.consume(100, ms(0)));

        // One millisecond refills the bucket
        assert!(limiter.consume(100, ms(1)));
    }

    #[test]
    fn test_rate_limiter_time_to_available() {
        let mut limiter = RateLimiter::new(1000, 100, ms(0));
        limiter.consume(100, ms(0));

        assert_eq!(limiter.time_to_available(100, ms(0)), ms(100));
        assert_eq!(limiter.time_to_available(50, ms(100)), Duration::ZERO);
    }
}
