//! camrelay: camera frame relay over MJPEG and MPEG1

use std::path::PathBuf;
use std::sync::Arc;

use camrelay::capture::sim::SimulatedConnector;
use camrelay::web::{self, AppState};
use camrelay::{Config, OutputFormat};
use clap::Parser;
use color_eyre::eyre::WrapErr;
use color_eyre::Result;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "camrelay", about = "Relay camera frames to browsers as MJPEG or MPEG1")]
struct Args {
    /// TOML configuration file
    #[arg(short, long, env = "CAMRELAY_CONFIG")]
    config: Option<PathBuf>,

    /// Override server.host
    #[arg(long)]
    host: Option<String>,

    /// Override server.port
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize error handling and logging
    color_eyre::install()?;
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("camrelay=info,tower_http=info")),
        )
        .with_timer(tracing_subscriber::fmt::time::uptime())
        .init();

    let args = Args::parse();

    let mut config = Config::load(args.config.as_deref()).wrap_err("Failed to load configuration")?;
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }
    config.validate()?;

    info!(
        "camrelay launching ({:?}, primary {})",
        config.stream.format, config.primary.uri
    );

    let bind = format!("{}:{}", config.server.host, config.server.port);
    let format = config.stream.format;
    let state = AppState::new(config, Arc::new(SimulatedConnector::new()));

    // A dead primary camera is fatal at startup
    if format != OutputFormat::Mpeg1 {
        state
            .probe_source()
            .await
            .wrap_err("Cannot open primary source")?;
    }

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .wrap_err_with(|| format!("Failed to bind to {}", bind))?;
    let port = listener.local_addr()?.port();

    state
        .start_transcoder(port)
        .await
        .wrap_err("Cannot start MPEG1 encoder")?;

    let signal_state = Arc::clone(&state);
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => signal_state.request_shutdown(),
            Err(e) => error!("Cannot listen for ctrl-c: {}", e),
        }
    });

    web::serve(listener, Arc::clone(&state)).await?;
    info!("camrelay stopped");
    Ok(())
}
