//! Identity pool for rotating client fingerprints and egress routes
//!
//! An identity bundles a user-agent, a cookie jar and an optional proxy into a
//! ready-to-use HTTP client. Identities are moved out of the pool on checkout
//! and moved back on release, so two concurrent fetches can never share one
//! identity's cookies.
//!
//! # Rotation
//!
//! - Checkout picks the least-recently-used HEALTHY identity, avoiding one that
//!   hit the same host within `min_host_reuse` when another is free.
//! - A BURNED identity sits out `burn_cooldown`, then becomes COOLING and is
//!   only handed out as a single probe fetch.
//! - Checkout waits at most `checkout_timeout` and then reports `PoolExhausted`.

use crate::config::IdentityConfig;
use crate::state::IdentityHealth;
use rand::Rng;
use reqwest::cookie::Jar;
use reqwest::redirect::Policy;
use reqwest::{Client, Proxy};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;

/// No identity became available before the checkout timeout
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("no identity available within {waited:?}")]
pub struct PoolExhausted {
    pub waited: Duration,
}

/// How the fetch made with an identity ended, as far as rotation cares
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FetchHint {
    Success,
    SoftFailure,
    HardFailure,
}

/// Static description an identity is built from
#[derive(Debug, Clone)]
struct IdentitySpec {
    user_agent: String,
    egress_route: Option<String>,
}

/// A client identity checked out for exactly one fetch
#[derive(Debug)]
pub struct Identity {
    pub id: usize,
    pub egress_route: Option<String>,
    pub user_agent: String,
    pub cookie_jar: Arc<Jar>,
    pub health_state: IdentityHealth,
    pub last_used_at: Option<Instant>,
    burned_at: Option<Instant>,
    client: Client,
}

impl Identity {
    fn build(id: usize, spec: &IdentitySpec, timeout: Duration) -> Result<Self, reqwest::Error> {
        let cookie_jar = Arc::new(Jar::default());

        let mut builder = Client::builder()
            .user_agent(spec.user_agent.as_str())
            .cookie_provider(cookie_jar.clone())
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(10)))
            .redirect(Policy::none())
            .gzip(true)
            .brotli(true);

        if let Some(route) = &spec.egress_route {
            builder = builder.proxy(Proxy::all(route.as_str())?);
        }

        Ok(Self {
            id,
            egress_route: spec.egress_route.clone(),
            user_agent: spec.user_agent.clone(),
            cookie_jar,
            health_state: IdentityHealth::Healthy,
            last_used_at: None,
            burned_at: None,
            client: builder.build()?,
        })
    }

    /// HTTP client carrying this identity's user-agent, cookies and proxy
    pub fn client(&self) -> &Client {
        &self.client
    }
}

struct Slot {
    spec: IdentitySpec,
    /// `None` while the identity is checked out
    identity: Option<Identity>,
    health: IdentityHealth,
    burned_at: Option<Instant>,
    last_used_at: Option<Instant>,
    last_host: Option<String>,
}

impl Slot {
    fn is_free(&self) -> bool {
        self.identity.is_some()
    }
}

/// Fixed-size pool of exclusive client identities
pub struct IdentityPool {
    slots: Mutex<Vec<Slot>>,
    released: Notify,
    checkout_timeout: Duration,
    burn_cooldown: Duration,
    probe_chance: f64,
    min_host_reuse: Duration,
    fetch_timeout: Duration,
}

impl IdentityPool {
    /// Builds `pool_size` identities, assigning user agents and egress routes round-robin
    pub fn new(config: &IdentityConfig, fetch_timeout: Duration) -> Result<Self, reqwest::Error> {
        let mut slots = Vec::with_capacity(config.pool_size as usize);

        for id in 0..config.pool_size as usize {
            let spec = IdentitySpec {
                user_agent: config.user_agents[id % config.user_agents.len()].clone(),
                egress_route: if config.egress_routes.is_empty() {
                    None
                } else {
                    Some(config.egress_routes[id % config.egress_routes.len()].clone())
                },
            };
            let identity = Identity::build(id, &spec, fetch_timeout)?;
            slots.push(Slot {
                spec,
                identity: Some(identity),
                health: IdentityHealth::Healthy,
                burned_at: None,
                last_used_at: None,
                last_host: None,
            });
        }

        tracing::info!(size = slots.len(), "Identity pool ready");

        Ok(Self {
            slots: Mutex::new(slots),
            released: Notify::new(),
            checkout_timeout: config.checkout_timeout(),
            burn_cooldown: config.burn_cooldown(),
            probe_chance: config.probe_chance,
            min_host_reuse: config.min_host_reuse(),
            fetch_timeout,
        })
    }

    /// Checks out an identity for a fetch against `host`
    ///
    /// Waits for a release up to the configured checkout timeout.
    pub async fn checkout(&self, host: &str) -> Result<Identity, PoolExhausted> {
        let deadline = Instant::now() + self.checkout_timeout;

        loop {
            if let Some(identity) = self.try_checkout(host, Instant::now()) {
                return Ok(identity);
            }

            // A release between the failed attempt and this point leaves a
            // stored notification, so the wait below returns immediately.
            if tokio::time::timeout_at(deadline, self.released.notified())
                .await
                .is_err()
            {
                tracing::debug!(host, "Identity checkout timed out");
                return Err(PoolExhausted {
                    waited: self.checkout_timeout,
                });
            }
        }
    }

    /// Attempts a checkout without waiting
    pub fn try_checkout(&self, host: &str, now: Instant) -> Option<Identity> {
        let mut slots = self.lock();

        for slot in slots.iter_mut() {
            if slot.health == IdentityHealth::Burned {
                let cooled = slot
                    .burned_at
                    .map(|at| now.saturating_duration_since(at) >= self.burn_cooldown)
                    .unwrap_or(true);
                if cooled {
                    slot.health = IdentityHealth::Cooling;
                    if let Some(identity) = slot.identity.as_mut() {
                        identity.health_state = IdentityHealth::Cooling;
                    }
                }
            }
        }

        let healthy = self.pick(&slots, host, now, IdentityHealth::Healthy);
        let cooling = self.pick(&slots, host, now, IdentityHealth::Cooling);

        let chosen = match (healthy, cooling) {
            (Some(h), Some(c)) => {
                if rand::thread_rng().gen_bool(self.probe_chance) {
                    c
                } else {
                    h
                }
            }
            (Some(h), None) => h,
            (None, Some(c)) => c,
            (None, None) => return None,
        };

        let slot = &mut slots[chosen];
        let mut identity = slot.identity.take()?;
        slot.last_used_at = Some(now);
        slot.last_host = Some(host.to_string());
        identity.last_used_at = Some(now);
        identity.health_state = slot.health;

        tracing::trace!(
            id = identity.id,
            health = %identity.health_state,
            host,
            "Checked out identity"
        );
        Some(identity)
    }

    /// Least-recently-used free slot in `health`, preferring ones that did not
    /// recently hit `host`
    fn pick(&self, slots: &[Slot], host: &str, now: Instant, health: IdentityHealth) -> Option<usize> {
        slots
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.is_free() && slot.health == health)
            .min_by_key(|(_, slot)| {
                let recent_same_host = slot.last_host.as_deref() == Some(host)
                    && slot
                        .last_used_at
                        .map(|at| now.saturating_duration_since(at) < self.min_host_reuse)
                        .unwrap_or(false);
                (recent_same_host, slot.last_used_at)
            })
            .map(|(index, _)| index)
    }

    /// Returns an identity to the pool and applies the fetch outcome to its health
    pub fn release(&self, mut identity: Identity, hint: FetchHint) {
        let now = Instant::now();
        let before = identity.health_state;
        identity.health_state = before.after_fetch(hint != FetchHint::SoftFailure);

        if before == IdentityHealth::Cooling {
            tracing::info!(
                id = identity.id,
                health = %identity.health_state,
                "Probe fetch finished"
            );
        }
        if identity.health_state == IdentityHealth::Burned && before != IdentityHealth::Burned {
            identity.burned_at = Some(now);
        }

        let mut slots = self.lock();
        if let Some(slot) = slots.get_mut(identity.id) {
            slot.health = identity.health_state;
            slot.burned_at = identity.burned_at;
            slot.identity = Some(identity);
        }
        drop(slots);

        self.released.notify_one();
    }

    /// Marks a checked-out identity as burned; it takes effect on release
    pub fn mark_burned(&self, identity: &mut Identity) {
        if identity.health_state != IdentityHealth::Burned {
            tracing::warn!(
                id = identity.id,
                egress = identity.egress_route.as_deref().unwrap_or("direct"),
                "Identity burned"
            );
        }
        identity.health_state = IdentityHealth::Burned;
        identity.burned_at = Some(Instant::now());
    }

    /// Rebuilds an identity lost while checked out (e.g. its worker crashed)
    ///
    /// The replacement gets a fresh cookie jar and starts burned, since the
    /// state of the lost session is unknown.
    pub fn recover(&self, id: usize) -> Result<(), reqwest::Error> {
        let mut slots = self.lock();
        let Some(slot) = slots.get_mut(id) else {
            return Ok(());
        };
        if slot.is_free() {
            return Ok(());
        }

        let now = Instant::now();
        let mut identity = Identity::build(id, &slot.spec, self.fetch_timeout)?;
        identity.health_state = IdentityHealth::Burned;
        identity.burned_at = Some(now);
        slot.health = IdentityHealth::Burned;
        slot.burned_at = Some(now);
        slot.identity = Some(identity);
        drop(slots);

        tracing::warn!(id, "Recovered lost identity");
        self.released.notify_one();
        Ok(())
    }

    /// Health of every identity, in id order
    pub fn health_snapshot(&self) -> Vec<IdentityHealth> {
        self.lock().iter().map(|slot| slot.health).collect()
    }

    /// Number of identities currently in the pool (not checked out)
    pub fn idle_count(&self) -> usize {
        self.lock().iter().filter(|slot| slot.is_free()).count()
    }

    pub fn size(&self) -> usize {
        self.lock().len()
    }

    /// Arms a guard that recovers `identity` if it is never handed back
    pub fn guard(self: &Arc<Self>, identity: &Identity) -> RecoveryGuard {
        RecoveryGuard {
            pool: Arc::clone(self),
            id: identity.id,
            armed: true,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Slot>> {
        // Slot bookkeeping stays consistent even if a holder panicked
        self.slots.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Recovers a checked-out identity when dropped while still armed
///
/// A fetch worker arms the guard right after checkout and disarms it once
/// the identity is on its way back to the pool. If the worker panics or is
/// dropped in between, the identity is rebuilt via [`IdentityPool::recover`].
pub struct RecoveryGuard {
    pool: Arc<IdentityPool>,
    id: usize,
    armed: bool,
}

impl RecoveryGuard {
    pub fn disarm(mut self) {
        self.armed = false;
    }
}

impl Drop for RecoveryGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Err(e) = self.pool.recover(self.id) {
            tracing::error!(id = self.id, error = %e, "Failed to rebuild lost identity");
        }
    }
}
