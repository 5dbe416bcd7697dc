//! Rate governor gating every fetch
//!
//! The governor combines a GCRA rate limiter per target host with a global
//! cap on in-flight fetches. `acquire` never waits: it either grants a permit
//! or reports `WouldBlock`, so the orchestrator can defer the task and keep
//! dispatching work for other hosts.

use crate::config::RateLimitConfig;
use dashmap::mapref::one::RefMut;
use dashmap::DashMap;
use ::governor::clock::{Clock, DefaultClock, Reference};
use ::governor::middleware::NoOpMiddleware;
use ::governor::state::{InMemoryState, NotKeyed};
use ::governor::{Quota, RateLimiter};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds on the interval between two host tokens
const MIN_PERIOD: Duration = Duration::from_nanos(1);
const MAX_PERIOD: Duration = Duration::from_secs(86_400);

type Limiter<C> = RateLimiter<NotKeyed, InMemoryState, C, NoOpMiddleware<<C as Clock>::Instant>>;

/// Reasons a permit could not be granted right now
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum WouldBlock {
    #[error("host {host} is out of tokens for {retry_after:?}")]
    HostExhausted { host: String, retry_after: Duration },

    #[error("global in-flight cap reached")]
    InFlightCap,
}

/// Permission to send one request to one host
///
/// Holding the permit occupies one global in-flight slot; dropping it frees
/// the slot. The host token is spent when the permit is granted and is not
/// given back, even if the fetch never happens.
#[derive(Debug)]
pub struct Permit {
    host: String,
    _slot: OwnedSemaphorePermit,
}

impl Permit {
    pub fn host(&self) -> &str {
        &self.host
    }
}

/// Limiter state of one host
struct HostLimiter<C: Clock> {
    limiter: Limiter<C>,
    factor: f64,
    /// Earliest instant the last refused request could have been granted
    blocked_until: Option<C::Instant>,
}

/// Per-host rate limiters plus a global in-flight cap
pub struct RateGovernor<C: Clock = DefaultClock> {
    hosts: DashMap<String, HostLimiter<C>>,
    clock: C,
    in_flight: Arc<Semaphore>,
    max_in_flight: usize,
    burst: NonZeroU32,
    refill_rate: f64,
    jitter_min: Duration,
    jitter_max: Duration,
}

impl RateGovernor<DefaultClock> {
    pub fn new(config: &RateLimitConfig) -> Self {
        Self::with_clock(config, DefaultClock::default())
    }
}

impl<C: Clock + Clone> RateGovernor<C> {
    /// Creates a governor whose host limiters read time from `clock`
    pub fn with_clock(config: &RateLimitConfig, clock: C) -> Self {
        let max_in_flight = config.max_in_flight as usize;
        Self {
            hosts: DashMap::new(),
            clock,
            in_flight: Arc::new(Semaphore::new(max_in_flight)),
            max_in_flight,
            burst: NonZeroU32::new(config.capacity).unwrap_or(NonZeroU32::MIN),
            refill_rate: config.refill_rate,
            jitter_min: Duration::from_millis(config.jitter_min_ms),
            jitter_max: Duration::from_millis(config.jitter_max_ms),
        }
    }

    /// Tries to obtain a permit for `host`
    ///
    /// The global slot is taken first; a host refusal releases it again.
    pub fn acquire(&self, host: &str) -> Result<Permit, WouldBlock> {
        let slot = self
            .in_flight
            .clone()
            .try_acquire_owned()
            .map_err(|_| WouldBlock::InFlightCap)?;

        let mut entry = self.host_entry(host);
        match entry.limiter.check() {
            Ok(()) => {
                entry.blocked_until = None;
                tracing::trace!(host, "Granted fetch permit");
                Ok(Permit {
                    host: host.to_string(),
                    _slot: slot,
                })
            }
            Err(not_until) => {
                let now = self.clock.now();
                entry.blocked_until = Some(not_until.earliest_possible());
                Err(WouldBlock::HostExhausted {
                    host: host.to_string(),
                    retry_after: not_until.wait_time_from(now),
                })
            }
        }
    }

    /// Sets the refill multiplier for a host (1.0 restores the configured rate)
    ///
    /// The host gets a new limiter at the scaled rate. It starts drained, so a
    /// rate change never grants a fresh burst.
    pub fn set_rate_factor(&self, host: &str, factor: f64) {
        let mut entry = self.host_entry(host);
        if entry.factor == factor {
            return;
        }

        let limiter = self.limiter(self.refill_rate * factor);
        let _ = limiter.check_n(self.burst);
        entry.limiter = limiter;
        entry.factor = factor;
        tracing::debug!(host, factor, "Updated host rate factor");
    }

    /// Current refill rate for a host in tokens per second
    pub fn effective_rate(&self, host: &str) -> f64 {
        self.hosts
            .get(host)
            .map(|entry| self.refill_rate * entry.factor)
            .unwrap_or(self.refill_rate)
    }

    /// Time until the host's last refused request could be granted
    ///
    /// Zero when the host has not refused anything since its last grant.
    pub fn retry_after(&self, host: &str) -> Duration {
        let Some(until) = self.hosts.get(host).and_then(|entry| entry.blocked_until) else {
            return Duration::ZERO;
        };
        until.duration_since(self.clock.now()).into()
    }

    /// Random hold applied after each dispatch to a host
    pub fn jitter_delay(&self) -> Duration {
        if self.jitter_max <= self.jitter_min {
            return self.jitter_min;
        }
        let millis = rand::thread_rng()
            .gen_range(self.jitter_min.as_millis() as u64..=self.jitter_max.as_millis() as u64);
        Duration::from_millis(millis)
    }

    /// Number of permits currently held
    pub fn in_flight(&self) -> usize {
        self.max_in_flight - self.in_flight.available_permits()
    }

    fn host_entry(&self, host: &str) -> RefMut<'_, String, HostLimiter<C>> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| HostLimiter {
                limiter: self.limiter(self.refill_rate),
                factor: 1.0,
                blocked_until: None,
            })
    }

    fn limiter(&self, rate: f64) -> Limiter<C> {
        RateLimiter::direct_with_clock(host_quota(rate, self.burst), self.clock.clone())
    }
}

/// Quota of `burst` tokens refilled at `rate` tokens per second
fn host_quota(rate: f64, burst: NonZeroU32) -> Quota {
    let period = Duration::try_from_secs_f64(1.0 / rate)
        .unwrap_or(MAX_PERIOD)
        .clamp(MIN_PERIOD, MAX_PERIOD);
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_hour(NonZeroU32::MIN))
        .allow_burst(burst)
}
