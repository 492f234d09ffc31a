// src/main.rs - CNC host entry point
use std::sync::Arc;

use clap::Parser;

use cnc_host::config::Config;
use cnc_host::session::SessionManager;
use cnc_host::transport::SerialFactory;
use cnc_host::web;

#[derive(Parser, Debug)]
#[command(name = "cnc-host", version, about = "Serial G-code host with flow control")]
struct Args {
    /// Path to the TOML configuration file.
    #[arg(short, long, default_value = "cnc-host.toml")]
    config: String,

    /// Override the configured bind address.
    #[arg(long)]
    bind: Option<String>,

    /// Override the configured listen port.
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync + 'static>> {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::INFO)
        .init();

    let args = Args::parse();

    tracing::info!("Starting cnc-host");

    let mut config = Config::load(&args.config).map_err(|e| {
        tracing::error!("failed to load config from '{}': {}", args.config, e);
        Box::new(e) as Box<dyn std::error::Error + Send + Sync + 'static>
    })?;
    if let Some(bind) = args.bind {
        config.server.bind = bind;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    tracing::info!(
        "default baudrate {}, status poll every {} ms, queue reports every {} ms",
        config.serial.baudrate,
        config.serial.poll_interval_ms,
        config.serial.report_interval_ms
    );

    let manager = SessionManager::new(Arc::new(SerialFactory), config.serial.clone());
    let app = web::api::create_router(manager);

    let addr = format!("{}:{}", config.server.bind, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}
