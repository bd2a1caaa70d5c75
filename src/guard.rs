//! Rate limiting and circuit breaking.
//!
//! [`RateLimiter`] caps requests per key in fixed windows (ingestion per
//! subject, provider calls per provider). [`CircuitBreaker`] stops calling a
//! failing provider until a cooldown has passed, then lets trial calls
//! through before closing again.
//!
//! Both take the current time as an argument so callers and tests control
//! the clock.

use std::time::{Duration, Instant};

use dashmap::DashMap;
use log::{info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Rate limiter
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Requests allowed per key per window (default: 120).
    pub max_requests: u32,
    /// Window length in seconds (default: 60).
    pub window_secs: i64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { max_requests: 120, window_secs: 60 }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    start: i64,
    count: u32,
}

/// Fixed-window counter per key.
#[derive(Debug, Default)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self { config, windows: DashMap::new() }
    }

    /// Count one request for `key` at `now` (Unix seconds).
    pub fn check(&self, key: &str, now: i64) -> Result<()> {
        let window_secs = self.config.window_secs.max(1);
        let start = now - now.rem_euclid(window_secs);

        let mut entry = self.windows.entry(key.to_string()).or_insert(Window { start, count: 0 });
        if entry.start != start {
            *entry = Window { start, count: 0 };
        }
        if entry.count >= self.config.max_requests {
            let retry_after_secs = (start + window_secs - now).max(1) as u64;
            return Err(Error::RateLimited { retry_after_secs });
        }
        entry.count += 1;
        Ok(())
    }

    /// Requests left for `key` in the window containing `now`.
    pub fn remaining(&self, key: &str, now: i64) -> u32 {
        let window_secs = self.config.window_secs.max(1);
        let start = now - now.rem_euclid(window_secs);
        match self.windows.get(key) {
            Some(w) if w.start == start => self.config.max_requests.saturating_sub(w.count),
            _ => self.config.max_requests,
        }
    }

    /// Forget keys whose window has ended.
    pub fn prune(&self, now: i64) {
        let window_secs = self.config.window_secs.max(1);
        self.windows.retain(|_, w| w.start + window_secs > now);
    }
}

// =============================================================================
// Circuit breaker
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open the circuit (default: 5).
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close it again (default: 2).
    pub success_threshold: u32,
    /// Time the circuit stays open before probing (default: 30s).
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, success_threshold: 2, cooldown_secs: 30 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    consecutive_successes: u32,
    opened_at: Option<Instant>,
}

#[derive(Debug)]
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                consecutive_successes: 0,
                opened_at: None,
            }),
        }
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Whether a call may go out at `now`. An open circuit whose cooldown
    /// has passed moves to half-open and lets the call through as a trial.
    pub fn allow(&self, now: Instant) -> Result<()> {
        let mut inner = self.inner.lock();
        if inner.state != BreakerState::Open {
            return Ok(());
        }

        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        let elapsed = inner.opened_at.map_or(cooldown, |t| now.saturating_duration_since(t));
        if elapsed >= cooldown {
            info!("[CircuitBreaker] {} half-open, probing", self.name);
            inner.state = BreakerState::HalfOpen;
            inner.consecutive_successes = 0;
            Ok(())
        } else {
            let retry_in_secs = (cooldown - elapsed).as_secs().max(1);
            Err(Error::CircuitOpen { retry_in_secs })
        }
    }

    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        if inner.state == BreakerState::HalfOpen {
            inner.consecutive_successes += 1;
            if inner.consecutive_successes >= self.config.success_threshold {
                info!("[CircuitBreaker] {} closed", self.name);
                inner.state = BreakerState::Closed;
                inner.consecutive_successes = 0;
                inner.opened_at = None;
            }
        }
    }

    pub fn record_failure(&self, now: Instant) {
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;

        let trip = match inner.state {
            BreakerState::HalfOpen => true,
            BreakerState::Closed => inner.consecutive_failures >= self.config.failure_threshold,
            BreakerState::Open => false,
        };
        if trip {
            warn!(
                "[CircuitBreaker] {} open after {} consecutive failures",
                self.name, inner.consecutive_failures
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(now);
        }
    }
}
