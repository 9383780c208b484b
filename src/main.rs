//! Listing-Harvest main entry point
//!
//! This is the command-line interface for the Listing-Harvest crawler.

use anyhow::{bail, Context};
use clap::Parser;
use listing_harvest::config::{load_config_with_hash, Config};
use listing_harvest::output::{load_statistics, print_report, print_statistics, write_results};
use listing_harvest::storage::open_ledger;
use listing_harvest::{Orchestrator, StopSignal};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

/// Listing-Harvest: a resumable crawler for paginated listing categories
///
/// Listing-Harvest walks a category page by page with randomised pacing and
/// rotating browsing sessions, writes every listing to a CSV file exactly
/// once, and resumes from its checkpoint after a crash or Ctrl-C.
#[derive(Parser, Debug)]
#[command(name = "listing-harvest")]
#[command(version = "1.0.0")]
#[command(about = "A resumable crawler for paginated listing sites", long_about = None)]
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

    /// Page to start from instead of the checkpoint position
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    start_page: Option<u32>,

    /// Maximum number of pages to visit in this run
    #[arg(long, value_name = "N", value_parser = clap::value_parser!(u32).range(1..))]
    max_pages: Option<u32>,

    /// Proxy URL for all requests (overrides the config file)
    #[arg(long, value_name = "URL")]
    proxy: Option<String>,

    /// Clear existing records, checkpoint and run ledger before crawling
    #[arg(long, visible_alias = "clear-data")]
    fresh: bool,

    /// Validate config and print the effective settings without crawling
    #[arg(long, conflicts_with = "stats")]
    dry_run: bool,

    /// Show statistics from the run ledger and exit
    #[arg(long, conflicts_with = "dry_run")]
    stats: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    // Setup logging based on verbosity
    setup_logging(cli.verbose, cli.quiet);

    // Load and validate configuration
    tracing::info!("Loading configuration from: {}", cli.config.display());
    let (mut config, config_hash) = load_config_with_hash(&cli.config)
        .with_context(|| format!("failed to load {}", cli.config.display()))?;
    tracing::info!("Configuration loaded successfully (hash: {})", config_hash);

    if let Some(proxy) = cli.proxy.as_deref() {
        if let Err(e) = url::Url::parse(proxy) {
            bail!("invalid --proxy URL {}: {}", proxy, e);
        }
        config.transport.proxy_url = Some(proxy.to_string());
    }

    if cli.dry_run {
        handle_dry_run(&config, &cli);
        return Ok(ExitCode::SUCCESS);
    }
    if cli.stats {
        handle_stats(&config)?;
        return Ok(ExitCode::SUCCESS);
    }

    handle_crawl(config, &config_hash, &cli).await
}

/// Sets up the logging/tracing subscriber based on verbosity level
fn setup_logging(verbose: u8, quiet: bool) {
    let filter = if quiet {
        // Only show errors
        EnvFilter::new("error")
    } else {
        match verbose {
            0 => EnvFilter::new("listing_harvest=info,warn"),
            1 => EnvFilter::new("listing_harvest=debug,info"),
            2 => EnvFilter::new("listing_harvest=trace,debug"),
            _ => EnvFilter::new("trace"),
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .init();
}

/// Handles the --dry-run mode: prints the effective configuration
fn handle_dry_run(config: &Config, cli: &Cli) {
    println!("=== Listing-Harvest Dry Run ===\n");

    println!("Target:");
    println!("  Base URL: {}", config.target.base_url);
    println!("  Page parameter: {}", config.target.page_param);
    if let Some(ref_param) = &config.target.ref_param {
        println!("  Ref parameter: {}", ref_param);
    }

    println!("\nCrawl:");
    match config.crawl.page_cap {
        Some(cap) => println!("  Page cap: {}", cap),
        None => println!("  Page cap: none"),
    }
    println!(
        "  Tolerate page failures: {} (max {} consecutive)",
        config.crawl.tolerate_page_failures, config.crawl.max_consecutive_failures
    );
    if let Some(start) = cli.start_page {
        println!("  Start page: {}", start);
    }
    if let Some(max) = cli.max_pages {
        println!("  Max pages this run: {}", max);
    }

    println!("\nPacing:");
    println!(
        "  Delay between requests: {}-{}ms",
        config.rate_limit.min_delay_ms, config.rate_limit.max_delay_ms
    );
    println!(
        "  Retries: {} attempts, base {}ms x{}, cap {}ms",
        config.retry.max_attempts,
        config.retry.base_delay_ms,
        config.retry.backoff_factor,
        config.retry.max_delay_ms
    );

    println!("\nSessions:");
    println!("  Pool size: {}", config.session.pool_size);
    println!(
        "  Retire after {} requests or {}s",
        config.session.max_requests, config.session.max_age_secs
    );
    match &config.transport.proxy_url {
        Some(proxy) => println!("  Proxy: {}", proxy),
        None => println!("  Proxy: none"),
    }

    println!("\nOutput:");
    println!("  Records: {}", config.output.records_path);
    println!("  Checkpoint: {}", config.output.checkpoint_path);
    println!("  Ledger: {}", config.output.ledger_path);
    println!("  Results: {}", config.output.results_path);
    if cli.fresh {
        println!("  (existing data would be cleared)");
    }

    println!("\n✓ Configuration is valid");
}

/// Handles the --stats mode: shows statistics from the run ledger
fn handle_stats(config: &Config) -> anyhow::Result<()> {
    println!("Ledger: {}\n", config.output.ledger_path);

    let ledger = open_ledger(Path::new(&config.output.ledger_path))?;
    let stats = load_statistics(&ledger)?;
    print_statistics(&stats);

    Ok(())
}

/// Handles the main crawl operation
async fn handle_crawl(config: Config, config_hash: &str, cli: &Cli) -> anyhow::Result<ExitCode> {
    if cli.fresh {
        tracing::info!("Starting fresh crawl (clearing previous data)");
    } else {
        tracing::info!("Starting crawl (will resume from checkpoint if present)");
    }

    let results_path = PathBuf::from(&config.output.results_path);
    let mut orchestrator = Orchestrator::from_config(config, config_hash, cli.fresh)?;

    let stop = StopSignal::new();
    let ctrl_c_stop = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, stopping after the current page");
            ctrl_c_stop.stop();
        }
    });

    let report = match orchestrator.run(cli.start_page, cli.max_pages, &stop).await {
        Ok(report) => report,
        Err(e) => {
            tracing::error!("Crawl aborted: {}", e);
            return Err(e.into());
        }
    };

    write_results(&report, &results_path)?;
    if !cli.quiet {
        print_report(&report);
    }

    if report.outcome.is_failure() {
        Ok(ExitCode::FAILURE)
    } else {
        Ok(ExitCode::SUCCESS)
    }
}
