//! marathon-node — compute-node daemon binary.

use tracing::error;
use tracing_subscriber::EnvFilter;

use marathon_node::{NodeConfig, NodeDaemon};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = match NodeConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "invalid configuration");
            std::process::exit(2);
        }
    };

    if let Err(e) = NodeDaemon::new(config).run().await {
        error!(error = %e, "node daemon exited with error");
        std::process::exit(1);
    }
}
