//! marathon-coordinator — coordinator daemon binary.

use std::sync::Arc;

use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use marathon_coordinator::{
    Coordinator, CoordinatorConfig, InMemoryNodeStore, InMemoryTaskStore,
};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match CoordinatorConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    let listener = match TcpListener::bind(config.listen_endpoint()).await {
        Ok(listener) => listener,
        Err(e) => {
            error!(endpoint = %config.listen_endpoint(), error = %e, "bind failed");
            std::process::exit(1);
        }
    };
    info!(endpoint = %config.listen_endpoint(), "coordinator listening");

    let hub = Coordinator::new(
        config.stale_timeout,
        Arc::new(InMemoryTaskStore::default()),
        Arc::new(InMemoryNodeStore::default()),
    );
    hub.run(listener, config.schedule_interval).await;
}
