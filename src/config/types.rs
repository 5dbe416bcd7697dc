use serde::Deserialize;
use std::time::Duration;

/// Main configuration structure for Listing-Watch
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(rename = "rate-limit", default)]
    pub rate_limit: RateLimitConfig,
    #[serde(rename = "ban-detection", default)]
    pub ban_detection: BanDetectionConfig,
    pub identity: IdentityConfig,
    pub store: StoreConfig,
    #[serde(default, rename = "target")]
    pub targets: Vec<TargetEntry>,
}

/// Crawl orchestration and worker configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct CrawlerConfig {
    /// Number of concurrent fetch workers
    pub max_workers: u32,

    /// Attempts allowed per task before it is dropped
    pub max_attempts: u32,

    /// Base retry delay in milliseconds, doubled per attempt
    pub base_delay_ms: u64,

    /// Hard timeout of a single fetch in seconds
    pub fetch_timeout_secs: u64,

    /// Maximum redirects followed manually per fetch
    pub max_redirects: u32,

    /// Pause between crawl cycles in seconds
    pub cycle_interval_secs: u64,

    /// Substrings of a redirect target that mark a removed listing
    pub removal_markers: Vec<String>,
}

impl CrawlerConfig {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn cycle_interval(&self) -> Duration {
        Duration::from_secs(self.cycle_interval_secs)
    }
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            max_workers: 4,
            max_attempts: 5,
            base_delay_ms: 1000,
            fetch_timeout_secs: 30,
            max_redirects: 5,
            cycle_interval_secs: 900,
            removal_markers: Vec::new(),
        }
    }
}

/// Per-host rate limit and jitter configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct RateLimitConfig {
    /// Burst size per host
    pub capacity: u32,

    /// Tokens added per second per host
    pub refill_rate: f64,

    /// Global cap on in-flight fetches across all hosts
    pub max_in_flight: u32,

    /// Lower bound of the random hold after each dispatch (milliseconds)
    pub jitter_min_ms: u64,

    /// Upper bound of the random hold after each dispatch (milliseconds)
    pub jitter_max_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            capacity: 2,
            refill_rate: 0.5,
            max_in_flight: 8,
            jitter_min_ms: 500,
            jitter_max_ms: 2500,
        }
    }
}

/// Host ban detection configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct BanDetectionConfig {
    /// Number of most recent fetches considered per host
    pub window: usize,

    /// Fetches required in the window before the ratio is trusted
    pub min_samples: usize,

    /// Soft failure ratio above which the host enters backoff
    pub threshold: f64,

    /// Multiplier applied to the host refill rate during backoff
    pub backoff_factor: f64,

    /// Quiet period without soft failures that ends backoff (seconds)
    pub cooldown_secs: u64,
}

impl BanDetectionConfig {
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

impl Default for BanDetectionConfig {
    fn default() -> Self {
        Self {
            window: 20,
            min_samples: 10,
            threshold: 0.4,
            backoff_factor: 0.25,
            cooldown_secs: 300,
        }
    }
}

/// Identity pool configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct IdentityConfig {
    /// Number of identities in the pool
    #[serde(default = "default_pool_size")]
    pub pool_size: u32,

    /// How long a checkout may wait for a free identity (milliseconds)
    #[serde(default = "default_checkout_timeout_ms")]
    pub checkout_timeout_ms: u64,

    /// How long a burned identity is kept out of rotation (seconds)
    #[serde(default = "default_burn_cooldown_secs")]
    pub burn_cooldown_secs: u64,

    /// Chance that a cooling identity is offered as a probe
    #[serde(default = "default_probe_chance")]
    pub probe_chance: f64,

    /// Minimum gap before the same identity hits the same host again (milliseconds)
    #[serde(default = "default_min_host_reuse_ms")]
    pub min_host_reuse_ms: u64,

    /// User-agent strings assigned round-robin to identities
    pub user_agents: Vec<String>,

    /// Proxy URLs assigned round-robin to identities; empty means direct egress
    #[serde(default)]
    pub egress_routes: Vec<String>,
}

impl IdentityConfig {
    pub fn checkout_timeout(&self) -> Duration {
        Duration::from_millis(self.checkout_timeout_ms)
    }

    pub fn burn_cooldown(&self) -> Duration {
        Duration::from_secs(self.burn_cooldown_secs)
    }

    pub fn min_host_reuse(&self) -> Duration {
        Duration::from_millis(self.min_host_reuse_ms)
    }
}

fn default_pool_size() -> u32 {
    3
}

fn default_checkout_timeout_ms() -> u64 {
    2000
}

fn default_burn_cooldown_secs() -> u64 {
    600
}

fn default_probe_chance() -> f64 {
    0.3
}

fn default_min_host_reuse_ms() -> u64 {
    3000
}

/// Change-detection store configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct StoreConfig {
    /// Path to the SQLite database file
    pub database_path: String,

    /// Consecutive missed cycles before a listing is reported removed
    #[serde(default = "default_removal_grace_cycles")]
    pub removal_grace_cycles: u32,

    /// Optional JSON-lines file receiving every emitted change event
    #[serde(default)]
    pub events_path: Option<String>,
}

fn default_removal_grace_cycles() -> u32 {
    3
}

/// A monitored target host with its seed URLs
#[derive(Debug, Clone, Deserialize)]
pub struct TargetEntry {
    /// Host pattern (e.g., "cian.ru" or "*.cian.ru")
    pub host: String,

    /// Listing or index URLs crawled every cycle
    pub seeds: Vec<String>,

    /// Queue priority of this target's seeds (lower is fetched first)
    #[serde(default)]
    pub priority: u32,
}
