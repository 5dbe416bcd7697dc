use crate::config::types::{
    BanDetectionConfig, Config, CrawlerConfig, IdentityConfig, RateLimitConfig, StoreConfig,
    TargetEntry,
};
use crate::url::{extract_host, host_matches};
use crate::ConfigError;
use url::Url;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_rate_limit_config(&config.rate_limit)?;
    validate_ban_detection_config(&config.ban_detection)?;
    validate_identity_config(&config.identity)?;
    validate_store_config(&config.store)?;
    validate_targets(&config.targets)?;
    Ok(())
}

fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_workers < 1 || config.max_workers > 64 {
        return Err(ConfigError::Validation(format!(
            "max_workers must be between 1 and 64, got {}",
            config.max_workers
        )));
    }

    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(
            "max_attempts must be >= 1".to_string(),
        ));
    }

    if config.fetch_timeout_secs == 0 {
        return Err(ConfigError::Validation(
            "fetch_timeout_secs must be >= 1".to_string(),
        ));
    }

    if config.removal_markers.iter().any(|m| m.trim().is_empty()) {
        return Err(ConfigError::Validation(
            "removal_markers cannot contain empty entries".to_string(),
        ));
    }

    Ok(())
}

fn validate_rate_limit_config(config: &RateLimitConfig) -> Result<(), ConfigError> {
    if config.capacity < 1 {
        return Err(ConfigError::Validation(format!(
            "capacity must be >= 1, got {}",
            config.capacity
        )));
    }

    if !config.refill_rate.is_finite() || config.refill_rate <= 0.0 {
        return Err(ConfigError::Validation(format!(
            "refill_rate must be a positive number, got {}",
            config.refill_rate
        )));
    }

    if config.max_in_flight < 1 {
        return Err(ConfigError::Validation(
            "max_in_flight must be >= 1".to_string(),
        ));
    }

    if config.jitter_min_ms > config.jitter_max_ms {
        return Err(ConfigError::Validation(format!(
            "jitter window is inverted: min {}ms > max {}ms",
            config.jitter_min_ms, config.jitter_max_ms
        )));
    }

    Ok(())
}

fn validate_ban_detection_config(config: &BanDetectionConfig) -> Result<(), ConfigError> {
    if config.window == 0 {
        return Err(ConfigError::Validation("window must be >= 1".to_string()));
    }

    if config.min_samples == 0 || config.min_samples > config.window {
        return Err(ConfigError::Validation(format!(
            "min_samples must be between 1 and window ({}), got {}",
            config.window, config.min_samples
        )));
    }

    if !config.threshold.is_finite() || !(0.0..1.0).contains(&config.threshold) {
        return Err(ConfigError::Validation(format!(
            "threshold must be in [0, 1), got {}",
            config.threshold
        )));
    }

    if !config.backoff_factor.is_finite()
        || config.backoff_factor <= 0.0
        || config.backoff_factor > 1.0
    {
        return Err(ConfigError::Validation(format!(
            "backoff_factor must be in (0, 1], got {}",
            config.backoff_factor
        )));
    }

    Ok(())
}

fn validate_identity_config(config: &IdentityConfig) -> Result<(), ConfigError> {
    if config.pool_size < 1 {
        return Err(ConfigError::Validation(
            "pool_size must be >= 1".to_string(),
        ));
    }

    if config.user_agents.is_empty() || config.user_agents.iter().any(|ua| ua.trim().is_empty())
    {
        return Err(ConfigError::Validation(
            "user_agents must list at least one non-empty user agent".to_string(),
        ));
    }

    if !config.probe_chance.is_finite() || !(0.0..=1.0).contains(&config.probe_chance) {
        return Err(ConfigError::Validation(format!(
            "probe_chance must be in [0, 1], got {}",
            config.probe_chance
        )));
    }

    for route in &config.egress_routes {
        Url::parse(route)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid egress route '{}': {}", route, e)))?;
    }

    Ok(())
}

fn validate_store_config(config: &StoreConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.removal_grace_cycles < 1 {
        return Err(ConfigError::Validation(
            "removal_grace_cycles must be >= 1".to_string(),
        ));
    }

    Ok(())
}

fn validate_targets(targets: &[TargetEntry]) -> Result<(), ConfigError> {
    if targets.is_empty() {
        return Err(ConfigError::Validation(
            "at least one [[target]] is required".to_string(),
        ));
    }

    for target in targets {
        validate_host_pattern(&target.host)?;

        if target.seeds.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Target '{}' must have at least one seed URL",
                target.host
            )));
        }

        for seed in &target.seeds {
            let url = Url::parse(seed).map_err(|e| {
                ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed, e))
            })?;

            let host = extract_host(&url).ok_or_else(|| {
                ConfigError::InvalidUrl(format!("Seed URL '{}' has no host", seed))
            })?;

            if !host_matches(&target.host, &host) {
                return Err(ConfigError::Validation(format!(
                    "Seed URL '{}' does not belong to target '{}'",
                    seed, target.host
                )));
            }
        }
    }

    Ok(())
}

/// Validates a host pattern (supports a leading `*.` wildcard)
fn validate_host_pattern(pattern: &str) -> Result<(), ConfigError> {
    let host = pattern.strip_prefix("*.").unwrap_or(pattern);

    if host.is_empty() {
        return Err(ConfigError::InvalidPattern(
            "Host pattern cannot be empty".to_string(),
        ));
    }

    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '-')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' contains invalid characters",
            host
        )));
    }

    if host.starts_with('.') || host.ends_with('.') || host.contains("..") || !host.contains('.')
    {
        return Err(ConfigError::InvalidPattern(format!(
            "Host '{}' is not a dotted host name",
            host
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(host: &str, seeds: &[&str]) -> TargetEntry {
        TargetEntry {
            host: host.to_string(),
            seeds: seeds.iter().map(|s| s.to_string()).collect(),
            priority: 0,
        }
    }

    #[test]
    fn test_validate_host_pattern() {
        assert!(validate_host_pattern("cian.ru").is_ok());
        assert!(validate_host_pattern("*.cian.ru").is_ok());
        assert!(validate_host_pattern("127.0.0.1").is_ok());

        assert!(validate_host_pattern("").is_err());
        assert!(validate_host_pattern("*.").is_err());
        assert!(validate_host_pattern("localhost").is_err());
        assert!(validate_host_pattern(".cian.ru").is_err());
        assert!(validate_host_pattern("cian..ru").is_err());
    }

    #[test]
    fn test_seed_must_match_target_host() {
        let ok = target("*.cian.ru", &["https://spb.cian.ru/sale/flat/1/"]);
        assert!(validate_targets(&[ok]).is_ok());

        let mismatched = target("cian.ru", &["https://avito.ru/items/1"]);
        assert!(matches!(
            validate_targets(&[mismatched]),
            Err(ConfigError::Validation(_))
        ));
    }

    #[test]
    fn test_targets_required() {
        assert!(validate_targets(&[]).is_err());
        assert!(validate_targets(&[target("cian.ru", &[])]).is_err());
    }

    #[test]
    fn test_inverted_jitter_window() {
        let config = RateLimitConfig {
            jitter_min_ms: 3000,
            jitter_max_ms: 1000,
            ..RateLimitConfig::default()
        };
        assert!(validate_rate_limit_config(&config).is_err());
    }

    #[test]
    fn test_min_samples_bounded_by_window() {
        let config = BanDetectionConfig {
            window: 5,
            min_samples: 6,
            ..BanDetectionConfig::default()
        };
        assert!(validate_ban_detection_config(&config).is_err());
        assert!(validate_ban_detection_config(&BanDetectionConfig::default()).is_ok());
    }

    #[test]
    fn test_non_finite_rates_rejected() {
        for bad in [f64::NAN, f64::INFINITY] {
            let rate = RateLimitConfig {
                refill_rate: bad,
                ..RateLimitConfig::default()
            };
            assert!(validate_rate_limit_config(&rate).is_err(), "refill_rate {}", bad);

            let threshold = BanDetectionConfig {
                threshold: bad,
                ..BanDetectionConfig::default()
            };
            assert!(validate_ban_detection_config(&threshold).is_err());

            let backoff = BanDetectionConfig {
                backoff_factor: bad,
                ..BanDetectionConfig::default()
            };
            assert!(validate_ban_detection_config(&backoff).is_err(), "backoff_factor {}", bad);

            let identity = IdentityConfig {
                pool_size: 2,
                checkout_timeout_ms: 1000,
                burn_cooldown_secs: 60,
                probe_chance: bad,
                min_host_reuse_ms: 0,
                user_agents: vec!["test-agent".to_string()],
                egress_routes: Vec::new(),
            };
            assert!(validate_identity_config(&identity).is_err(), "probe_chance {}", bad);
        }

        let zero_burst = RateLimitConfig {
            capacity: 0,
            ..RateLimitConfig::default()
        };
        assert!(validate_rate_limit_config(&zero_burst).is_err());
    }
}
