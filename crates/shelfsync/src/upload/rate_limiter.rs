//! Adaptive pacing of remote requests.

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::circuit_breaker::{CircuitBreaker, CircuitState};

/// Header names that carry the remote's remaining request quota.
const REMAINING_HEADERS: &[&str] = &["x-ratelimit-remaining", "x-ratelimit-remaining-requests"];

const NO_QUOTA: u64 = u64::MAX;

/// Named remote throughput tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThroughputTier {
    Free,
    Tier1,
    Tier2,
    Tier3,
    /// Explicit requests-per-minute budget.
    Custom(u32),
}

impl ThroughputTier {
    pub fn requests_per_minute(&self) -> u32 {
        match self {
            ThroughputTier::Free => 20,
            ThroughputTier::Tier1 => 300,
            ThroughputTier::Tier2 => 1_000,
            ThroughputTier::Tier3 => 2_000,
            ThroughputTier::Custom(rpm) => *rpm,
        }
    }

    /// Smallest gap between two requests that stays within the tier.
    pub fn min_request_interval(&self) -> Duration {
        let rpm = self.requests_per_minute().max(1);
        Duration::from_secs_f64(60.0 / rpm as f64)
    }
}

impl fmt::Display for ThroughputTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThroughputTier::Free => f.write_str("free"),
            ThroughputTier::Tier1 => f.write_str("tier1"),
            ThroughputTier::Tier2 => f.write_str("tier2"),
            ThroughputTier::Tier3 => f.write_str("tier3"),
            ThroughputTier::Custom(rpm) => write!(f, "{}rpm", rpm),
        }
    }
}

impl FromStr for ThroughputTier {
    type Err = String;

    /// Accepts a tier name or a bare requests-per-minute number.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(ThroughputTier::Free),
            "tier1" => Ok(ThroughputTier::Tier1),
            "tier2" => Ok(ThroughputTier::Tier2),
            "tier3" => Ok(ThroughputTier::Tier3),
            other => {
                let digits = other.trim_end_matches("rpm");
                match digits.parse::<u32>() {
                    Ok(rpm) if rpm > 0 => Ok(ThroughputTier::Custom(rpm)),
                    _ => Err(format!("unknown throughput tier '{}'", s)),
                }
            }
        }
    }
}

/// Spaces out remote requests according to the tier, slowing down while
/// the circuit breaker reports trouble.
#[derive(Debug)]
pub struct AdaptiveRateLimiter {
    tier: ThroughputTier,
    min_request_interval: Duration,
    breaker: Arc<CircuitBreaker>,
    remaining_quota: AtomicU64,
}

impl AdaptiveRateLimiter {
    pub fn new(tier: ThroughputTier, breaker: Arc<CircuitBreaker>) -> Self {
        Self {
            tier,
            min_request_interval: tier.min_request_interval(),
            breaker,
            remaining_quota: AtomicU64::new(NO_QUOTA),
        }
    }

    pub fn tier(&self) -> ThroughputTier {
        self.tier
    }

    pub fn min_request_interval(&self) -> Duration {
        self.min_request_interval
    }

    /// Delay the next request should wait, given the breaker state.
    pub fn current_delay(&self) -> Duration {
        let multiplier = match self.breaker.state() {
            CircuitState::Closed => 1.0,
            CircuitState::HalfOpen => 1.5,
            CircuitState::Open => 3.0,
        };
        self.min_request_interval.mul_f64(multiplier)
    }

    /// Sleeps for the current delay and returns how long it waited.
    pub async fn wait_if_needed(&self) -> Duration {
        let delay = self.current_delay();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        delay
    }

    /// Records the remote-reported remaining quota. Diagnostic only: pacing
    /// never depends on it.
    pub fn observe_headers<'a, I>(&self, headers: I)
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        for (name, value) in headers {
            if !REMAINING_HEADERS
                .iter()
                .any(|known| name.eq_ignore_ascii_case(known))
            {
                continue;
            }
            if let Ok(remaining) = value.trim().parse::<u64>() {
                log::debug!("Remote reports {} requests remaining", remaining);
                self.remaining_quota.store(remaining, Ordering::Relaxed);
            }
        }
    }

    /// Last remaining-quota value reported by the remote, if any.
    pub fn remaining_quota(&self) -> Option<u64> {
        match self.remaining_quota.load(Ordering::Relaxed) {
            NO_QUOTA => None,
            value => Some(value),
        }
    }
}
