//! Rolling-window circuit breaker for remote rate limiting.
//!
//! The breaker watches the outcome of recent remote calls. Sustained 429s
//! trip it open; after a cooldown it admits traffic again in a half-open
//! state where the recommended concurrency climbs back in steps.
//!
//! State is process-local and rebuilt every run. All methods take `&self`
//! and lock internally, so one breaker can be shared by every upload future
//! of a run.

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::Serialize;

/// Breaker position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        };
        f.write_str(s)
    }
}

/// Tuning knobs for [`CircuitBreaker`].
#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Number of recent outcomes kept in the rolling window.
    pub window_size: usize,
    /// Windowed 429 rate above which the breaker trips.
    pub error_rate_threshold: f64,
    /// The windowed rate is only evaluated once this many outcomes exist.
    pub min_samples: usize,
    /// Consecutive 429s that trip the breaker regardless of the rate.
    pub consecutive_threshold: u32,
    /// Time spent open before moving to half-open.
    pub cooldown: Duration,
    /// Half-open successes needed per extra unit of concurrency.
    pub recovery_increment: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            window_size: 100,
            error_rate_threshold: 0.05,
            min_samples: 20,
            consecutive_threshold: 3,
            cooldown: Duration::from_secs(300),
            recovery_increment: 20,
        }
    }
}

/// Point-in-time view of the breaker, for logs and progress output.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BreakerSnapshot {
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub window_len: usize,
    pub error_rate: f64,
    pub recovery_successes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub opened_at: Option<DateTime<Utc>>,
}

#[derive(Debug)]
struct Inner {
    /// `true` = success, `false` = rate limited.
    window: VecDeque<bool>,
    consecutive_failures: u32,
    state: CircuitState,
    opened_at: Option<Instant>,
    opened_at_wall: Option<DateTime<Utc>>,
    recovery_successes: u32,
}

impl Inner {
    fn push(&mut self, outcome: bool, capacity: usize) {
        if self.window.len() == capacity {
            self.window.pop_front();
        }
        self.window.push_back(outcome);
    }

    fn error_rate(&self) -> f64 {
        if self.window.is_empty() {
            return 0.0;
        }
        let failures = self.window.iter().filter(|ok| !**ok).count();
        failures as f64 / self.window.len() as f64
    }

    fn trip(&mut self) {
        self.state = CircuitState::Open;
        self.opened_at = Some(Instant::now());
        self.opened_at_wall = Some(Utc::now());
        self.recovery_successes = 0;
    }

    fn close(&mut self) {
        self.state = CircuitState::Closed;
        self.window.clear();
        self.opened_at = None;
        self.opened_at_wall = None;
        self.recovery_successes = 0;
    }

    fn advance(&mut self, now: Instant, cooldown: Duration) -> CircuitState {
        if self.state == CircuitState::Open {
            let elapsed = self
                .opened_at
                .map(|at| now.saturating_duration_since(at))
                .unwrap_or(Duration::MAX);
            if elapsed >= cooldown {
                log::info!("Circuit breaker cooldown elapsed, moving to half-open");
                self.state = CircuitState::HalfOpen;
                self.recovery_successes = 0;
            }
        }
        self.state
    }
}

/// Rolling-window circuit breaker.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig) -> Self {
        let capacity = config.window_size.max(1);
        Self {
            config,
            inner: Mutex::new(Inner {
                window: VecDeque::with_capacity(capacity),
                consecutive_failures: 0,
                state: CircuitState::Closed,
                opened_at: None,
                opened_at_wall: None,
                recovery_successes: 0,
            }),
        }
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        // A poisoned breaker still holds valid counters; keep using it.
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Records a successful remote call.
    ///
    /// While half-open, every success counts towards recovery. Once a full
    /// window of clean calls has been observed the breaker closes and its
    /// history is cleared.
    pub fn record_success(&self) {
        let mut inner = self.lock();
        inner.push(true, self.config.window_size.max(1));
        inner.consecutive_failures = 0;

        if inner.advance(Instant::now(), self.config.cooldown) == CircuitState::HalfOpen {
            inner.recovery_successes += 1;
            if inner.recovery_successes as usize >= self.config.window_size.max(1) {
                log::info!(
                    "Circuit breaker closed after {} half-open successes",
                    inner.recovery_successes
                );
                inner.close();
            }
        }
    }

    /// Records a rate-limit (HTTP 429) response.
    pub fn record_429(&self) {
        let mut inner = self.lock();
        inner.push(false, self.config.window_size.max(1));
        inner.consecutive_failures += 1;

        match inner.advance(Instant::now(), self.config.cooldown) {
            CircuitState::HalfOpen => {
                log::warn!("Rate limited while half-open, re-opening circuit breaker");
                inner.trip();
            }
            CircuitState::Closed => {
                let rate = inner.error_rate();
                let rate_exceeded = inner.window.len() >= self.config.min_samples
                    && rate > self.config.error_rate_threshold;
                let streak_exceeded =
                    inner.consecutive_failures >= self.config.consecutive_threshold;
                if rate_exceeded || streak_exceeded {
                    log::warn!(
                        "Circuit breaker opened: {} consecutive 429s, window rate {:.1}%",
                        inner.consecutive_failures,
                        rate * 100.0
                    );
                    inner.trip();
                }
            }
            CircuitState::Open => {}
        }
    }

    /// Records a non-rate-limit failure. Such failures say nothing about
    /// remote load, so they only break the consecutive 429 streak.
    pub fn record_error(&self) {
        let mut inner = self.lock();
        inner.consecutive_failures = 0;
    }

    /// Current state. Moves an open breaker to half-open once the cooldown
    /// has elapsed.
    pub fn state(&self) -> CircuitState {
        self.state_at(Instant::now())
    }

    /// Same as [`state`](Self::state) with an explicit clock reading.
    pub fn state_at(&self, now: Instant) -> CircuitState {
        self.lock().advance(now, self.config.cooldown)
    }

    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.lock().consecutive_failures
    }

    /// Concurrency the caller should use given a configured `max`.
    ///
    /// Closed runs at `max`. Open drops to `max(3, max / 2)`. Half-open
    /// starts at that floor and gains one unit per `recovery_increment`
    /// successes, never exceeding `max`.
    pub fn get_recommended_concurrency(&self, max: usize) -> usize {
        let max = max.max(1);
        let floor = (max / 2).max(3).min(max);
        let mut inner = self.lock();
        match inner.advance(Instant::now(), self.config.cooldown) {
            CircuitState::Closed => max,
            CircuitState::Open => floor,
            CircuitState::HalfOpen => {
                let steps =
                    inner.recovery_successes as usize / self.config.recovery_increment.max(1) as usize;
                (floor + steps).min(max)
            }
        }
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let mut inner = self.lock();
        let state = inner.advance(Instant::now(), self.config.cooldown);
        BreakerSnapshot {
            state,
            consecutive_failures: inner.consecutive_failures,
            window_len: inner.window.len(),
            error_rate: inner.error_rate(),
            recovery_successes: inner.recovery_successes,
            opened_at: inner.opened_at_wall,
        }
    }
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
