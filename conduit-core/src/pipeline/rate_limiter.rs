//! Client-side sliding-window rate limiter for outbound fetch and store calls.
//!
//! Proactively throttles calls to stay within a per-minute budget instead of
//! relying on remote backpressure. One limiter is shared by all item workers
//! of a pipeline.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// A sliding-window limiter that tracks recent calls.
pub struct RateLimiter {
    per_window: usize,
    /// Timestamps of recent calls within the window.
    calls: Mutex<VecDeque<Instant>>,
    window: Duration,
}

impl RateLimiter {
    /// Allow `per_minute` calls in any sliding one-minute window (0 = unlimited).
    pub fn per_minute(per_minute: usize) -> Self {
        Self::new(per_minute, Duration::from_secs(60))
    }

    pub fn new(per_window: usize, window: Duration) -> Self {
        Self {
            per_window,
            calls: Mutex::new(VecDeque::new()),
            window,
        }
    }

    pub fn has_limit(&self) -> bool {
        self.per_window > 0
    }

    /// Check if a call can proceed now.
    ///
    /// Returns `None` if the call can proceed immediately, or `Some(delay)`
    /// indicating how long to wait before checking again.
    pub fn check(&self) -> Option<Duration> {
        if !self.has_limit() {
            return None;
        }
        let now = Instant::now();
        let mut calls = self.calls.lock().ok()?;
        prune(&mut calls, now, self.window);
        if calls.len() >= self.per_window {
            if let Some(&oldest) = calls.front() {
                let wait = self.window.saturating_sub(now.duration_since(oldest));
                if !wait.is_zero() {
                    return Some(wait);
                }
            }
        }
        None
    }

    /// Record a call made now.
    pub fn record(&self) {
        if !self.has_limit() {
            return;
        }
        if let Ok(mut calls) = self.calls.lock() {
            calls.push_back(Instant::now());
        }
    }

    /// Record a call if the window has room, otherwise return how long to wait.
    pub fn try_acquire(&self) -> Option<Duration> {
        if !self.has_limit() {
            return None;
        }
        let now = Instant::now();
        let mut calls = self.calls.lock().ok()?;
        prune(&mut calls, now, self.window);
        if calls.len() < self.per_window {
            calls.push_back(now);
            return None;
        }
        let oldest = calls.front().copied().unwrap_or(now);
        Some(
            self.window
                .saturating_sub(now.duration_since(oldest))
                .max(Duration::from_millis(1)),
        )
    }

    /// Wait until a call is allowed, then record it.
    pub async fn acquire(&self) {
        while let Some(wait) = self.try_acquire() {
            tokio::time::sleep(wait).await;
        }
    }

    /// Calls recorded within the current window.
    pub fn current_usage(&self) -> usize {
        let now = Instant::now();
        match self.calls.lock() {
            Ok(mut calls) => {
                prune(&mut calls, now, self.window);
                calls.len()
            }
            Err(_) => 0,
        }
    }
}

/// Remove entries older than the sliding window.
fn prune(calls: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while calls
        .front()
        .is_some_and(|t| now.duration_since(*t) >= window)
    {
        calls.pop_front();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unlimited_never_waits() {
        let limiter = RateLimiter::per_minute(0);
        assert!(!limiter.has_limit());
        for _ in 0..100 {
            assert!(limiter.check().is_none());
            limiter.record();
        }
        assert_eq!(limiter.current_usage(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocks_when_window_full() {
        let limiter = RateLimiter::per_minute(2);
        limiter.record();
        limiter.record();
        let wait = limiter.check().unwrap();
        assert!(wait <= Duration::from_secs(60));
        assert!(wait > Duration::from_secs(59));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_slides() {
        let limiter = RateLimiter::per_minute(1);
        limiter.record();
        assert!(limiter.check().is_some());
        tokio::time::advance(Duration::from_secs(61)).await;
        assert!(limiter.check().is_none());
        assert_eq!(limiter.current_usage(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_slot() {
        let limiter = RateLimiter::new(2, Duration::from_secs(10));
        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_secs(1));
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(10));
        assert_eq!(limiter.current_usage(), 1);
    }
}
