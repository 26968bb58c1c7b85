use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, EnvFilter};

use costmeter::agent::Agent;
use costmeter::config::Config;

/// Attributes cluster infrastructure spend to workloads.
#[derive(Parser)]
#[command(name = "costmeter", about)]
struct Cli {
    /// Path to the YAML configuration file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Logging verbosity level (trace, debug, info, warn, error).
    /// Overrides `log_level` from the configuration file.
    #[arg(long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Price the inventory periodically and export cost records (default).
    Collect,
    /// Receive cost records from collectors and store them in ClickHouse.
    Aggregate,
    /// Load and validate the configuration, then exit.
    CheckConfig,
    /// Print version information and exit.
    Version,
}

/// Build-time version info, injected via build.rs.
mod version {
    /// Release version string (set at build time).
    pub const RELEASE: &str = env!("CARGO_PKG_VERSION");

    /// Git commit hash (set at build time via env, or "unknown").
    pub fn git_commit() -> &'static str {
        option_env!("GIT_COMMIT").unwrap_or("unknown")
    }

    /// Full version string with platform info.
    pub fn full() -> String {
        format!(
            "{} (commit: {}, {}/{})",
            RELEASE,
            git_commit(),
            std::env::consts::OS,
            std::env::consts::ARCH,
        )
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Collect);

    if command == Command::Version {
        println!("costmeter {}", version::full());
        return Ok(());
    }

    let config_path = cli
        .config
        .context("--config is required (use --help for usage)")?;

    let cfg = load_config(&config_path)?;

    if command == Command::CheckConfig {
        print_summary(&cfg);
        return Ok(());
    }

    let log_level = cli.log_level.as_deref().unwrap_or(&cfg.log_level);
    let filter = EnvFilter::try_new(log_level)
        .with_context(|| format!("invalid log level: {log_level}"))?;

    fmt().with_env_filter(filter).with_target(true).init();

    tracing::info!(
        version = version::RELEASE,
        commit = version::git_commit(),
        "starting costmeter",
    );

    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building tokio runtime")?;

    rt.block_on(run(cfg, command))
}

fn load_config(path: &Path) -> Result<Config> {
    Config::load(path).with_context(|| format!("loading config from {}", path.display()))
}

fn print_summary(cfg: &Config) {
    println!("configuration OK");
    println!("  interval:        {:?}", cfg.interval);
    println!("  pricing entries: {}", cfg.pricing.entries.len());
    println!(
        "  strategies:      {}",
        cfg.strategies
            .iter()
            .map(|s| s.name())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!("  dimensions:      {}", cfg.mapping.destinations().join(", "));
    println!(
        "  exporters:       stats={} http={} clickhouse={}",
        cfg.exporters.stats.enabled, cfg.exporters.http.enabled, cfg.exporters.clickhouse.enabled,
    );
}

async fn run(cfg: Config, command: Command) -> Result<()> {
    let agent = Agent::new(cfg)?;
    let shutdown = agent.shutdown_token();

    tokio::spawn(async move {
        wait_for_signal().await;
        shutdown.cancel();
    });

    match command {
        Command::Aggregate => agent.run_aggregate().await,
        _ => agent.run_collect().await,
    }
}

async fn wait_for_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    let mut sigterm =
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(sigterm) => sigterm,
            Err(e) => {
                tracing::warn!(error = %e, "failed to register SIGTERM handler");
                let _ = ctrl_c.await;
                tracing::info!("received SIGINT, shutting down");
                return;
            }
        };

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("received SIGINT, shutting down");
        }
        _ = sigterm.recv() => {
            tracing::info!("received SIGTERM, shutting down");
        }
    }
}
