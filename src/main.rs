use anyhow::{Context, Result};
use clap::Parser;
use nakivo_exporter::{
    collector::MetricsCollector,
    config::{Settings, DEFAULT_CONFIG_FILE},
    server::start_server,
};
use std::fs::OpenOptions;
use std::sync::Mutex;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Nakivo Exporter - Prometheus metrics exporter for Nakivo Backup & Replication
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to YAML configuration file
    #[arg(short, long = "config-file", value_name = "FILE", default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Poll every host once, print the metrics to stdout and exit
    #[arg(long)]
    once: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Parse command-line arguments
    let args = Args::parse();

    // Load configuration
    let settings = Settings::load(&args.config_file)?;

    // Initialize logging
    init_logging(
        &settings.http_server.log_level,
        settings.http_server.log_file.as_deref(),
    )?;

    info!("Starting Nakivo Exporter");
    info!("Nakivo hosts configured: {}", settings.nakivo_hosts.len());

    let metrics = MetricsCollector::new(settings.nakivo_hosts, settings.collector);

    if args.once {
        print!("{}", metrics.scrape().await?);
        return Ok(());
    }

    info!("Listen address: {}", settings.http_server.listen_address());

    // Start HTTP server
    if let Err(e) = start_server(&settings.http_server, metrics).await {
        error!("Server error: {}", e);
        return Err(e.into());
    }

    Ok(())
}

/// Initialize structured logging with tracing.
///
/// Logs always go to stderr so `--once` output stays clean, and are also
/// appended to `log_file` when one is configured.
fn init_logging(log_level: &str, log_file: Option<&str>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let file_layer = match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Cannot open log file {}", path))?;
            Some(
                tracing_subscriber::fmt::layer()
                    .with_ansi(false)
                    .with_writer(Mutex::new(file)),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(file_layer)
        .init();

    Ok(())
}
