//! deej-gw - Rust implementation
//!
//! Maps physical sliders on a serial device to per-application audio volume.

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use deej_gw::app::{first_start_failure, Gateway};
use deej_gw::audio::{platform_backend, SessionFinder};
use deej_gw::config::{AppConfig, ConfigWatcher};
use deej_gw::link::DeviceLink;
use deej_gw::sniffer;

/// deej gateway - control per-application volume from hardware sliders
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.yaml")]
    config: String,

    /// Log level (error, warn, info, debug, trace)
    #[arg(short, long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Also write logs to a daily-rotated file in this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Log every slider move
    #[arg(short, long)]
    verbose: bool,

    /// List available serial ports
    #[arg(long)]
    list_ports: bool,

    /// Print raw device lines from the configured port
    #[arg(long)]
    sniff: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    let args = Args::parse();

    let _log_guard = init_logging(&args.log_level, args.log_dir.as_deref())?;

    if args.list_ports {
        sniffer::list_ports_formatted();
        return Ok(());
    }

    if args.sniff {
        let config = AppConfig::load(&args.config).await?;
        sniffer::run_cli_sniffer(config.port_settings(), config.decoder_options()).await?;
        return Ok(());
    }

    info!("Starting deej-gw {}...", env!("CARGO_PKG_VERSION"));
    info!("Configuration file: {}", args.config);

    let (config_watcher, initial_config) = ConfigWatcher::new(args.config.clone()).await?;
    info!(
        com_port = %initial_config.com_port,
        baud_rate = initial_config.baud_rate,
        sliders = initial_config.slider_mapping.len(),
        "Configuration loaded successfully with hot-reload enabled"
    );

    let finder = Arc::new(SessionFinder::new(platform_backend()));
    let link = DeviceLink::system(initial_config.port_settings());

    let mut gateway = Gateway::new(Arc::clone(&initial_config), finder, link);
    gateway.set_verbose(args.verbose);

    if let Err(e) = gateway.start().await {
        warn!(error = %e, "Failed to start first-time serial connection");
        if let Some(fatal) = first_start_failure(&e, &initial_config.com_port) {
            error!("{}", fatal);
            gateway.shutdown().await;
            return Err(fatal);
        }
    }

    gateway.run(Some(config_watcher), shutdown_signal()).await?;

    info!("deej-gw shutdown complete");
    Ok(())
}

fn init_logging(level: &str, log_dir: Option<&std::path::Path>) -> Result<Option<WorkerGuard>> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    let console = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false);

    let (file, guard) = match log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "deej-gw.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_target(false)
                .with_writer(writer);
            (Some(layer), Some(guard))
        },
        None => (None, None),
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(console)
        .with(file)
        .init();

    Ok(guard)
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("Failed to install CTRL+C signal handler");
    info!("Shutdown signal received");
}
