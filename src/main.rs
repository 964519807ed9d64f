use clap::Parser;
use heimdall::{config::Config, service::AccessLayer};
use std::time::Duration;
use tracing::{error, info};
use tracing_appender::non_blocking;
// no EnvFilter feature; use a simple level switch via RUST_LOG

static LOG_GUARD: std::sync::OnceLock<tracing_appender::non_blocking::WorkerGuard> =
    std::sync::OnceLock::new();

#[derive(Parser)]
#[command(name = "heimdall")]
#[command(about = "Resilient data-access layer: tiered cache, shard and replica routing, health monitoring")]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/heimdall.yaml")]
    config: String,

    /// Build the configuration from environment variables instead of a file
    #[arg(long)]
    from_env: bool,

    /// Interval between stats log lines (0 disables them)
    #[arg(long, default_value_t = 60)]
    stats_interval_secs: u64,
}

fn init_logging() {
    let (non_blocking_writer, guard) = non_blocking(std::io::stderr());
    // Keep guard alive for the program lifetime to avoid log loss
    let _ = LOG_GUARD.set(guard);

    let fmt = tracing_subscriber::fmt()
        .with_writer(non_blocking_writer)
        .with_ansi(true)
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_level(true)
        .compact();

    // Map RUST_LOG to a max level (debug/info/warn/error/trace)
    let level = match std::env::var("RUST_LOG")
        .unwrap_or_else(|_| "info".to_string())
        .to_lowercase()
        .as_str()
    {
        "trace" => tracing::Level::TRACE,
        "debug" => tracing::Level::DEBUG,
        "warn" => tracing::Level::WARN,
        "error" => tracing::Level::ERROR,
        _ => tracing::Level::INFO,
    };

    let _ = fmt.with_max_level(level).try_init();
}

async fn load_config(args: &Args) -> Result<Config, Box<dyn std::error::Error>> {
    if args.from_env {
        return Ok(Config::from_env()?);
    }
    let mut config = Config::from_yaml_file(&args.config).await?;
    config.apply_env_overrides(std::env::vars())?;
    Ok(config)
}

async fn run_with_config_and_shutdown(
    config: Config,
    stats_interval: Option<Duration>,
    shutdown: impl std::future::Future<Output = ()> + Send,
) -> Result<(), Box<dyn std::error::Error>> {
    info!(
        "Shard groups: {}, default: {}",
        config.shard_groups.len(),
        config.default_shard
    );
    let layer = AccessLayer::new(config).await?;
    let tasks = layer.start();

    let stats_loop = async {
        let Some(interval) = stats_interval else {
            return std::future::pending::<()>().await;
        };
        let mut ticker = tokio::time::interval(interval);
        ticker.tick().await;
        loop {
            ticker.tick().await;
            match serde_json::to_string(&layer.get_stats()) {
                Ok(stats) => info!("Stats: {}", stats),
                Err(e) => error!("Failed to serialize stats: {}", e),
            }
        }
    };

    tokio::select! {
        _ = stats_loop => {}
        _ = shutdown => {
            info!("Shutdown signal received");
        }
    }

    tasks.shutdown().await;
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_logging();
    let args = Args::parse();
    info!("Starting Heimdall data-access layer");

    let config = match load_config(&args).await {
        Ok(config) => config,
        Err(e) => {
            error!("Failed to load configuration: {}", e);
            return Err(e);
        }
    };
    let stats_interval =
        (args.stats_interval_secs > 0).then(|| Duration::from_secs(args.stats_interval_secs));

    run_with_config_and_shutdown(config, stats_interval, async {
        let _ = tokio::signal::ctrl_c().await;
    })
    .await?;
    info!("Heimdall stopped");
    Ok(())
}
