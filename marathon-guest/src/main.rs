//! marathon-guest — guest agent binary, runs inside a worker micro-VM.

#[cfg(not(target_os = "linux"))]
#[allow(clippy::print_stderr)]
fn main() {
    eprintln!("marathon-guest only runs inside a Linux micro-VM");
    std::process::exit(1);
}

#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> std::io::Result<()> {
    agent::run().await
}

#[cfg(target_os = "linux")]
mod agent {
    use std::io;
    use std::os::fd::AsRawFd;
    use std::time::Duration;

    use tracing::{error, info};
    use tracing_subscriber::EnvFilter;

    use marathon_guest::cleanup::{self, CleanupPaths};
    use marathon_guest::driver::{self, DriverConfig};
    use marathon_guest::interceptor::ApiInterceptor;
    use marathon_guest::{transport, workspace};

    /// Cap on the initial outbound-network wait.
    const NETWORK_WAIT: Duration = Duration::from_secs(30);

    /// Guest agent entry point: handshake, prologue, loop, cleanup.
    pub(crate) async fn run() -> io::Result<()> {
        tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_writer(io::stderr)
            .init();

        let config = DriverConfig::from_env();
        let cid = transport::local_cid();
        let mut listener = transport::bind()?;
        info!(cid, "guest agent listening");

        let (mut stream, spec) = transport::accept_task(&mut listener, cid).await?;
        info!(task = %spec.task_id, repo = %spec.repo_url, "task received");

        let paths = CleanupPaths {
            workdir: config.workdir.clone(),
            cache_dir: config.cache_dir.clone(),
            credentials: workspace::CREDENTIALS_PATH.into(),
        };

        // Prologue: network, clone, credentials, ownership.
        workspace::wait_for_network(NETWORK_WAIT).await;
        if let Err(e) = workspace::prepare(&spec, &config.workdir).await {
            error!(error = %e, "workspace setup failed");
            let result = driver::send_error(&mut stream, "setup_failed", &e.to_string()).await;
            cleanup::run(config.cleanup, &paths).await;
            return result;
        }

        // The interceptor is owned here and threaded into the loop.
        let interceptor = ApiInterceptor::new();
        let fd = stream.as_raw_fd();
        let result = driver::run_loop(
            &mut stream,
            || transport::cancel_pending(fd),
            &spec,
            &config,
            &interceptor,
        )
        .await;

        // Epilogue runs on every exit path.
        cleanup::run(config.cleanup, &paths).await;
        result
    }
}
