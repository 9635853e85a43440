//! Event ingestion service binary.
//!
//! Resolves `CONFIG_LOCATION`, builds every configured destination, and
//! runs the streaming and batch workers until SIGINT/SIGTERM. Exits 0 on a
//! clean shutdown, non-zero on configuration or initialization failure.

use std::process::ExitCode;

use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use ingest_config::{CONFIG_LOCATION_ENV, ConfigLocation, content_hash, parse_config, read_config_payload};

use crate::error::{ServerError, ServerResult};

mod core;
mod error;

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => runtime,
        Err(err) => {
            error!(error = %err, "failed to build runtime");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(async_main()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "service failed");
            ExitCode::FAILURE
        }
    }
}

async fn async_main() -> ServerResult<()> {
    let raw_location = std::env::var(CONFIG_LOCATION_ENV)
        .map_err(|_| ServerError::Config(ingest_config::LoadConfigError::LocationMissing))?;
    let location = ConfigLocation::parse(&raw_location);

    let payload = read_config_payload(&location).await.map_err(ServerError::Config)?;
    let config_hash = content_hash(&payload);
    let mut config = parse_config(&payload).map_err(ServerError::Config)?;
    config.server = config.server.with_port_override();

    info!(
        server = %config.server.name,
        port = config.server.port,
        destinations = config.destinations.len(),
        "configuration loaded"
    );

    crate::core::start(config, location, config_hash).await
}
