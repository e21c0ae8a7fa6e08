use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use camrelay::{
    spawn_config_watcher, BufferManager, ConfigStore, RelayConfig, RelayServer,
    ReloadableSettings,
};

#[derive(Parser, Debug)]
#[command(name = "camrelay")]
#[command(about = "Fan-out relay for MJPEG webcam streams")]
#[command(version)]
#[command(
    long_about = "Relays a single upstream webcam (an MJPEG stream or a polled \
still-image endpoint) to any number of HTTP clients, with failsafe fallback, \
aggregate framerate capping, and live configuration reload."
)]
struct Args {
    /// Path to configuration file
    #[arg(
        short,
        long,
        default_value = "camrelay.toml",
        help = "Path to TOML configuration file"
    )]
    config: String,

    /// Address to listen on
    #[arg(
        short,
        long,
        default_value = "0.0.0.0:8000",
        help = "Socket address for the HTTP listener"
    )]
    listen: String,

    /// Enable debug logging (most verbose)
    #[arg(short, long, help = "Enable debug level logging")]
    debug: bool,

    /// Enable quiet mode (errors only)
    #[arg(short, long, help = "Enable quiet mode - only log errors")]
    quiet: bool,

    /// Validate configuration and exit
    #[arg(
        long,
        help = "Validate configuration file and exit without starting the relay"
    )]
    validate_config: bool,

    /// Override log format (json, pretty, compact)
    #[arg(
        long,
        value_name = "FORMAT",
        help = "Log output format: json, pretty, or compact"
    )]
    log_format: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    info!("starting camrelay v{}", env!("CARGO_PKG_VERSION"));
    info!("configuration file: {}", args.config);

    let settings = match ReloadableSettings::load(&args.config) {
        Ok(settings) => settings,
        Err(e) => {
            error!("failed to load configuration: {e}");
            return Err(e.into());
        }
    };
    let config = match RelayConfig::from_settings(settings.settings()) {
        Ok(config) => config,
        Err(e) => {
            error!("invalid configuration: {e}");
            return Err(e.into());
        }
    };

    if args.validate_config {
        println!("configuration OK");
        return Ok(());
    }

    let store = Arc::new(ConfigStore::new(config.clone()));
    let manager = BufferManager::new(&config);

    // push configuration snapshots into the buffer manager
    let mut updates = store.subscribe();
    let config_manager = Arc::clone(&manager);
    tokio::spawn(async move {
        while updates.changed().await.is_ok() {
            let snapshot = updates.borrow_and_update().clone();
            config_manager.apply_config(&snapshot);
        }
    });

    let shutdown = CancellationToken::new();
    spawn_config_watcher(Arc::clone(&store), settings, shutdown.clone());

    let server = RelayServer::new(args.listen.clone(), manager, store.subscribe());
    let result = server.serve().await;
    shutdown.cancel();
    result.map_err(Into::into)
}

fn init_logging(args: &Args) -> Result<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

    let log_level = if args.debug {
        "debug"
    } else if args.quiet {
        "error"
    } else {
        "info"
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("camrelay={log_level}")));

    let fmt_layer = match args.log_format.as_deref() {
        Some("json") => fmt::layer().json().with_target(true).boxed(),
        Some("compact") => fmt::layer().compact().with_target(false).boxed(),
        Some("pretty") => fmt::layer().pretty().with_target(true).boxed(),
        None => fmt::layer().with_target(false).boxed(),
        Some(format) => {
            eprintln!("Warning: unknown log format '{format}', using default");
            fmt::layer().with_target(false).boxed()
        }
    };

    tracing_subscriber::registry()
        .with(fmt_layer)
        .with(env_filter)
        .init();

    Ok(())
}
