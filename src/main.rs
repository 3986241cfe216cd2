use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use stream_scheduler::{
    config::Config, database::Database, storage::MediaStorage, streaming::StreamManager,
    web::WebServer,
};

#[derive(Parser)]
#[command(name = "stream-scheduler")]
#[command(version = "0.1.0")]
#[command(about = "Schedule uploaded media as live RTMP streams driven by ffmpeg")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database URL (overrides config file)
    #[arg(short = 'd', long, value_name = "URL")]
    database_url: Option<String>,

    /// Encoder executable (overrides config file)
    #[arg(long, value_name = "PATH")]
    ffmpeg: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = if cli.log_level == "trace" {
        format!("stream_scheduler={},tower_http=trace", cli.log_level)
    } else {
        format!("stream_scheduler={}", cli.log_level)
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting Stream Scheduler v{}", env!("CARGO_PKG_VERSION"));

    std::env::set_var("CONFIG_FILE", &cli.config);
    let mut config = Config::load()?;
    info!("Configuration loaded from: {}", cli.config);

    if let Some(host) = cli.host {
        config.web.host = host;
    }
    if let Some(port) = cli.port {
        config.web.port = port;
    }
    if let Some(database_url) = cli.database_url {
        config.database.url = database_url;
    }
    if let Some(ffmpeg) = cli.ffmpeg {
        config.streaming.ffmpeg_command = ffmpeg;
    }
    config.validate()?;

    info!("Using database: {}", config.database.url);
    let database = Database::new(&config.database).await?;
    database.migrate().await?;
    info!("Database connection established and migrations applied");

    let storage = MediaStorage::from_config(&config.storage);
    storage.ensure_storage_dirs().await?;
    info!(
        "Media storage ready at {}",
        config.storage.uploads_path.display()
    );

    let manager = StreamManager::new(
        Arc::new(database.clone()),
        storage.clone(),
        (&config.streaming).into(),
    );
    let summary = manager.recover().await?;
    if summary.expired > 0 {
        warn!(
            "{} scheduled streams expired while the service was down",
            summary.expired
        );
    }

    let web_server = WebServer::new(config, database, manager.clone(), storage)?;
    info!(
        "Starting web server on {}:{}",
        web_server.host(),
        web_server.port()
    );

    web_server.serve(shutdown_signal()).await?;

    manager.shutdown().await;
    info!("Stream Scheduler stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
