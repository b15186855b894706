use std::sync::Arc;

use relaymq::broker::Broker;
use relaymq::config::load_config;
use relaymq::transport::upstream::NullUpstream;
use relaymq::transport::websocket::start_websocket_server;
use relaymq::utils::logging;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    let config = match load_config() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            std::process::exit(1);
        }
    };
    logging::init(&config.log.level);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let broker = Arc::new(Broker::new(config.broker.clone(), Arc::new(NullUpstream)));
    info!(settings = ?config.broker, "broker started");

    tokio::select! {
        result = start_websocket_server(&addr, broker) => {
            if let Err(e) = result {
                error!("WebSocket server failed on {}: {}", addr, e);
                std::process::exit(1);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("shutting down");
        }
    }
}
