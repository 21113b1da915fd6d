use std::convert::Infallible;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::time::Instant;
use tracing::info;
use tracing_subscriber::EnvFilter;

use gatekeeper::config::GatekeeperConfig;
use gatekeeper::Gatekeeper;

/// Inspect and exercise admission control rules.
#[derive(Debug, Parser)]
#[command(name = "gatekeeper", version, about)]
struct Cli {
    /// Rules file (YAML)
    #[arg(short, long, default_value = "gatekeeper.yaml")]
    config: PathBuf,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Load and validate the rules file
    Validate,
    /// Run admission checks against a rate limit and print each decision
    Check {
        /// Rate limit rule name
        name: String,
        /// Runtime key (e.g. "client:endpoint")
        key: String,
        /// Number of checks to run
        #[arg(short = 'n', long, default_value_t = 1)]
        count: u32,
    },
    /// Fire concurrent no-op calls through a throttle and print their start offsets
    Throttle {
        /// Throttle key
        name: String,
        /// Number of calls
        #[arg(short = 'n', long, default_value_t = 5)]
        calls: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let config = GatekeeperConfig::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;
    let gatekeeper = Gatekeeper::from_config(&config)?;

    match cli.command {
        Command::Validate => {
            let mut names: Vec<_> = config.rate_limits.keys().collect();
            names.sort();
            for name in names {
                let rule = &config.rate_limits[name];
                println!(
                    "rate_limit {}: {} {} per {}ms",
                    name, rule.strategy, rule.max_requests, rule.window_size_ms
                );
            }
            let mut keys: Vec<_> = config.throttles.keys().collect();
            keys.sort();
            for key in keys {
                let rule = &config.throttles[key];
                println!(
                    "throttle {}: min_interval {}ms, max_concurrent {:?}",
                    key, rule.min_interval_ms, rule.max_concurrent
                );
            }
        }
        Command::Check { name, key, count } => {
            let limiter = gatekeeper.limiter();
            for _ in 0..count {
                let status = limiter.check_limit(&name, &key);
                println!("{}", serde_json::to_string(&status)?);
            }
            if let Some(metrics) = limiter.get_metrics(&name) {
                println!("{}", serde_json::to_string(&metrics)?);
            }
        }
        Command::Throttle { name, calls } => {
            let origin = Instant::now();
            let runs = (0..calls).map(|i| {
                let throttler = gatekeeper.throttler().clone();
                let name = name.clone();
                async move {
                    throttler
                        .throttle(&name, || async move { Ok::<_, Infallible>((i, origin.elapsed())) })
                        .await
                }
            });

            for result in futures::future::join_all(runs).await {
                let (i, offset): (u32, Duration) = result?;
                println!("call {} started at +{}ms", i, offset.as_millis());
            }
        }
    }

    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}
