//! filepool server binary.

use filepool::config::Config;
use filepool::server::Server;
use filepool::store::DirStore;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::load()?;

    // Initialize logging
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        host = %config.host,
        port = config.port,
        control_port = config.control_port,
        workers = config.pool.capacity(),
        backend = %config.pool.backend(),
        root = %config.root.display(),
        "Starting filepool server"
    );

    let store = DirStore::open(&config.root)?;
    Server::bind(&config, Arc::new(store))?.run()?;
    Ok(())
}
