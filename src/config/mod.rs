//! Configuration module for Listing-Watch
//!
//! This module handles loading, parsing, and validating TOML configuration files.
//!
//! # Example
//!
//! ```no_run
//! use listing_watch::config::load_config;
//! use std::path::Path;
//!
//! let config = load_config(Path::new("watch.toml")).unwrap();
//! println!("Workers: {}", config.crawler.max_workers);
//! ```

mod parser;
mod types;
mod validation;

pub use types::{
    BanDetectionConfig, Config, CrawlerConfig, IdentityConfig, RateLimitConfig, StoreConfig,
    TargetEntry,
};

pub use parser::{compute_config_hash, load_config, load_config_with_hash, parse_config};
