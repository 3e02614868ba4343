//! Periodic status heartbeats to the coordinator.
//!
//! The first heartbeat a coordinator sees from a node doubles as its
//! registration, so there is no separate register message.

use std::sync::Arc;
use std::time::Duration;

use marathon_proto::Message;
use tokio::io::AsyncWrite;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::pool::{VmPool, VmStarter};
use crate::status::StatusCollector;
use crate::upstream::Upstream;

/// Runs the heartbeat loop until the stop flag flips.
///
/// A send failure is logged and retried on the next tick; the coordinator
/// reaps nodes that stay silent past its stale timeout, so there is nothing
/// better to do locally than keep trying.
pub async fn run<W, S>(
    upstream: Arc<Upstream<W>>,
    collector: Arc<StatusCollector>,
    pool: Arc<VmPool<S>>,
    interval: Duration,
    mut stop: watch::Receiver<bool>,
) where
    W: AsyncWrite + Unpin,
    S: VmStarter,
{
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let counts = pool.counts().await;
                let status = collector.collect(counts, pool.is_draining());
                if let Err(e) = upstream.send(&Message::Heartbeat(status)).await {
                    warn!(error = %e, "heartbeat send failed");
                }
            }
            _ = stop.changed() => {
                debug!("heartbeat stopping");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use marathon_proto::NodeId;

    use super::*;
    use crate::testutil::StubStarter;

    #[tokio::test]
    async fn emits_heartbeats_until_stopped() {
        let (client, mut server) = tokio::io::duplex(4096);
        let upstream = Arc::new(Upstream::new(client));
        let collector = Arc::new(StatusCollector::new(
            NodeId::generate(),
            4,
            std::env::temp_dir(),
        ));
        let pool = Arc::new(VmPool::new(StubStarter::new(), 4, 0));
        let (stop_tx, stop_rx) = watch::channel(false);

        let task = tokio::spawn(run(
            Arc::clone(&upstream),
            collector,
            pool,
            Duration::from_millis(10),
            stop_rx,
        ));

        for _ in 0..2 {
            let (_, msg) = marathon_proto::recv(&mut server).await.unwrap();
            match msg {
                Message::Heartbeat(status) => {
                    assert_eq!(status.total_slots, 4);
                    assert!(status.healthy);
                }
                other => panic!("unexpected frame {other:?}"),
            }
        }

        stop_tx.send(true).unwrap();
        task.await.unwrap();
    }
}
