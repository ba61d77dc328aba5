//! CLI for mqbroker
//!
//! Loads the configuration, opens the broker and serves MQTT over TCP (and
//! WebSocket when a port is configured) until Ctrl-C.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use clap::Parser;
use mqbroker::broker::{Broker, lock_broker};
use mqbroker::config::{Settings, load_config, load_config_from};
use mqbroker::transport::{start_tcp_server, start_websocket_server};
use mqbroker::utils::{self, logging};
use tokio::net::TcpListener;
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "mqbroker", version, about = "MQTT 3.1/3.1.1 broker")]
struct Args {
    /// Configuration file (defaults to `config/default.*` if present)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the MQTT TCP port
    #[arg(short, long)]
    port: Option<u16>,

    /// Override the log level (error, warn, info, debug, trace)
    #[arg(long)]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() {
    let _ = dotenvy::dotenv();
    let args = Args::parse();

    let mut settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            logging::init("info");
            error!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    if let Some(level) = args.log_level {
        settings.log.level = level;
    }
    if let Some(port) = args.port {
        settings.server.port = port;
    }

    logging::init(&settings.log.level);

    if let Err(e) = run_server(settings).await {
        error!("Server failed: {e}");
        std::process::exit(1);
    }
}

fn load_settings(args: &Args) -> Result<Settings, config::ConfigError> {
    match &args.config {
        Some(path) => load_config_from(path),
        None => load_config(),
    }
}

async fn run_server(settings: Settings) -> utils::Result<()> {
    let broker = Arc::new(Mutex::new(Broker::from_settings(&settings)?));

    tokio::spawn(Broker::start_retry_loop(broker.clone()));

    let host = &settings.server.host;
    let tcp = TcpListener::bind((host.as_str(), settings.server.port)).await?;
    let websocket = match settings.server.websocket_port {
        Some(port) => Some(TcpListener::bind((host.as_str(), port)).await?),
        None => None,
    };

    let tcp_server = start_tcp_server(tcp, broker.clone());
    let websocket_broker = broker.clone();
    let websocket_server = async move {
        match websocket {
            Some(listener) => start_websocket_server(listener, websocket_broker).await,
            None => std::future::pending().await,
        }
    };

    tokio::select! {
        _ = tcp_server => {
            error!("TCP listener exited unexpectedly.");
        }
        _ = websocket_server => {
            error!("WebSocket listener exited unexpectedly.");
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received. Exiting gracefully.");
        }
    }

    lock_broker(&broker).flush_persistence()?;
    Ok(())
}
