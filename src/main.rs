//! Listing-Watch main entry point
//!
//! This is the command-line interface for the Listing-Watch crawler.

use clap::Parser;
use listing_watch::config::{load_config_with_hash, Config};
use listing_watch::output::{
    consume_events, load_statistics, print_cycle_report, print_statistics, EventSink,
    JsonLinesSink, LogSink,
};
use listing_watch::storage::SqliteStorage;
use listing_watch::Coordinator;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

/// Capacity of the change event channel
const EVENT_BUFFER: usize = 256;

/// Listing-Watch: a marketplace listing crawler with change detection
///
/// Listing-Watch periodically fetches listing pages, normalizes them and
/// reports new listings, price changes, field changes and removals.
#[derive(Parser, Debug)]
#[command(name = "listing-watch")]
#[command(version)]
#[command(about = "Watches marketplace listings for changes", long_about = None)]
struct Cli {
    /// Path to TOML configuration file
    #[arg(value_name = "CONFIG")]
    config: PathBuf,

    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Suppress non-error output
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    /// Run a single crawl cycle and exit
    #[arg(long, conflicts_with_all = ["dry_run", "stats"])]
    once: bool,

    /// Validate config and show what would be crawled without actually crawling
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the database and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    setup_logging(cli.verbose, cli.quiet);

    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (config, config_hash) = match load_config_with_hash(&cli.config) {
        Ok((cfg, hash)) => {
            tracing::info!("Configuration loaded successfully (hash: {})", hash);
            (cfg, hash)
        }
        Err(e) => {
            tracing::error!("Failed to load configuration: {}", e);
            return Err(e.into());
        }
    };

    if cli.dry_run {
        handle_dry_run(&config);
    } else if cli.stats {
        handle_stats(&config)?;
    } else {
        handle_crawl(config, config_hash, cli.once).await?;
    }

    Ok(())
}

/// Sets up the logging/tracing subscriber based on verbosity level
///
/// `RUST_LOG` overrides the verbosity flags when set.
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| match verbose {
            0 => EnvFilter::new("listing_watch=info,warn"),
            1 => EnvFilter::new("listing_watch=debug,info"),
            2 => EnvFilter::new("listing_watch=trace,debug"),
            _ => EnvFilter::new("trace"),
        })
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: validates config and shows what would be crawled
fn handle_dry_run(config: &Config) {
    println!("=== Listing-Watch Dry Run ===\n");

    println!("Crawler:");
    println!("  Workers: {}", config.crawler.max_workers);
    println!("  Max attempts: {}", config.crawler.max_attempts);
    println!("  Base retry delay: {:?}", config.crawler.base_delay());
    println!("  Fetch timeout: {:?}", config.crawler.fetch_timeout());
    println!("  Cycle interval: {:?}", config.crawler.cycle_interval());

    println!("\nRate Limits:");
    println!(
        "  Per host: {} burst, {} tokens/s",
        config.rate_limit.capacity, config.rate_limit.refill_rate
    );
    println!("  Global in-flight cap: {}", config.rate_limit.max_in_flight);
    println!(
        "  Jitter: {}-{}ms",
        config.rate_limit.jitter_min_ms, config.rate_limit.jitter_max_ms
    );

    println!("\nBan Detection:");
    println!(
        "  Backoff above {:.0}% soft failures over the last {} fetches (min {} samples)",
        config.ban_detection.threshold * 100.0,
        config.ban_detection.window,
        config.ban_detection.min_samples
    );

    println!("\nIdentities:");
    println!("  Pool size: {}", config.identity.pool_size);
    println!("  User agents: {}", config.identity.user_agents.len());
    println!("  Egress routes: {}", config.identity.egress_routes.len());

    println!("\nStore:");
    println!("  Database: {}", config.store.database_path);
    println!(
        "  Removal grace: {} cycles",
        config.store.removal_grace_cycles
    );
    if let Some(events_path) = &config.store.events_path {
        println!("  Events file: {}", events_path);
    }

    println!("\nTargets ({}):", config.targets.len());
    for target in &config.targets {
        println!(
            "  - {} (priority {}, {} seeds)",
            target.host,
            target.priority,
            target.seeds.len()
        );
        for seed in &target.seeds {
            println!("    * {}", seed);
        }
    }

    println!("\n✓ Configuration is valid");
    println!(
        "✓ Would crawl {} seed URLs per cycle",
        config.targets.iter().map(|t| t.seeds.len()).sum::<usize>()
    );
}

/// Handles the --stats mode: shows statistics from the database
fn handle_stats(config: &Config) -> Result<(), Box<dyn std::error::Error>> {
    println!("Database: {}\n", config.store.database_path);

    let storage = SqliteStorage::new(Path::new(&config.store.database_path))?;
    let stats = load_statistics(&storage)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main crawl operation
///
/// Runs cycles back to back, pausing `cycle_interval` between them, until
/// Ctrl-C. With `once` a single cycle runs. A Ctrl-C during a cycle lets
/// in-flight fetches finish before exiting.
async fn handle_crawl(
    config: Config,
    config_hash: String,
    once: bool,
) -> Result<(), Box<dyn std::error::Error>> {
    let mut sinks: Vec<Box<dyn EventSink>> = vec![Box::new(LogSink)];
    if let Some(events_path) = &config.store.events_path {
        sinks.push(Box::new(JsonLinesSink::open(Path::new(events_path))?));
    }

    let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
    let consumer = tokio::spawn(consume_events(events_rx, sinks));

    let cancel = CancellationToken::new();
    let signal_token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Received Ctrl-C, shutting down");
            signal_token.cancel();
        }
    });

    let interval = config.crawler.cycle_interval();
    let seed_count: usize = config.targets.iter().map(|t| t.seeds.len()).sum();
    tracing::info!(
        "Watching {} targets with {} seed URLs",
        config.targets.len(),
        seed_count
    );

    let mut coordinator = Coordinator::new(config, config_hash, events_tx)?;

    loop {
        coordinator.submit_targets();

        match coordinator.run(cancel.clone()).await {
            Ok(report) => print_cycle_report(&report),
            Err(e) => {
                tracing::error!("Crawl cycle failed: {}", e);
                return Err(e.into());
            }
        }

        if once || cancel.is_cancelled() {
            break;
        }

        tracing::info!("Next cycle in {:?}", interval);
        tokio::select! {
            _ = tokio::time::sleep(interval) => {}
            _ = cancel.cancelled() => break,
        }
    }

    // Closing the channel lets the consumer flush and finish
    drop(coordinator);
    let consumed = consumer.await?;
    tracing::info!("Delivered {} change events", consumed);

    Ok(())
}
