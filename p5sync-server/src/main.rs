use std::process::ExitCode;

use log::{error, info};
use p5sync_collab::{ServerConfig, StorageConfig, SyncServer};

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::init();

    let config = match ServerConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!("Invalid configuration: {e}");
            return ExitCode::FAILURE;
        }
    };

    match &config.storage {
        StorageConfig::Memory => info!("Room logs kept in memory"),
        StorageConfig::Rocks(path) => info!("Room logs stored in {}", path.display()),
    }
    info!(
        "Starting p5sync server on {} (canvas {}x{})",
        config.bind_addr, config.canvas.width, config.canvas.height
    );

    let server = match SyncServer::new(config) {
        Ok(server) => server,
        Err(e) => {
            error!("Failed to open store: {e}");
            return ExitCode::FAILURE;
        }
    };

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!("Server error: {e}");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
        }
    }

    ExitCode::SUCCESS
}
