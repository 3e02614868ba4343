//! Daemon assembly: pool, heartbeat, assignment loop, graceful shutdown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use marathon_proto::{Message, TaskId, TaskSpec, encode_frame};
use tokio::io::BufReader;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Mutex, mpsc, watch};
use tracing::{error, info, warn};

use crate::config::NodeConfig;
use crate::error::Result;
use crate::heartbeat;
use crate::hypervisor::Launcher;
use crate::pool::VmPool;
use crate::session::{self, ForwardedFrame, SessionOutcome};
use crate::snapshot::SnapshotStore;
use crate::status::StatusCollector;
use crate::upstream::Upstream;

/// How long an acquired VM gets to produce its `READY` frame.
const READY_TIMEOUT: Duration = Duration::from_secs(60);

/// Depth of the session → upstream event queue.
const EVENT_QUEUE: usize = 256;

/// Cancel signals for in-flight tasks.
type CancelMap = Arc<Mutex<HashMap<TaskId, watch::Sender<bool>>>>;

/// One compute node's daemon process.
#[derive(Debug)]
pub struct NodeDaemon {
    /// Node configuration.
    config: NodeConfig,
}

impl NodeDaemon {
    /// Creates a daemon from its configuration.
    pub const fn new(config: NodeConfig) -> Self {
        Self { config }
    }

    /// Runs the daemon until the coordinator connection drops or the
    /// process receives ctrl-c. All VMs are destroyed on the way out.
    pub async fn run(self) -> Result<()> {
        let config = self.config;
        info!(node = %config.node_id, "node daemon starting");

        let snapshots = SnapshotStore::scan(&config.snapshot_dir)?;
        info!(snapshots = ?snapshots.list(), "snapshot store ready");
        let launcher = Launcher::new(&config, snapshots)?;
        let pool = Arc::new(VmPool::new(
            launcher,
            config.vm_slots,
            config.warm_pool_target,
        ));

        let (stop_tx, stop_rx) = watch::channel(false);
        let warmer = VmPool::spawn_warmer(
            Arc::clone(&pool),
            config.warm_check_interval,
            stop_rx.clone(),
        );

        let stream = TcpStream::connect(config.orchestrator_endpoint()).await?;
        info!(endpoint = %config.orchestrator_endpoint(), "connected to coordinator");
        let (read_half, write_half) = stream.into_split();
        let upstream = Arc::new(Upstream::new(write_half));

        let collector = Arc::new(StatusCollector::new(
            config.node_id,
            config.vm_slots,
            config.runtime_dir.clone(),
        ));
        let heartbeat_task = tokio::spawn(heartbeat::run(
            Arc::clone(&upstream),
            Arc::clone(&collector),
            Arc::clone(&pool),
            config.heartbeat_interval,
            stop_rx,
        ));

        let (events_tx, events_rx) = mpsc::channel::<ForwardedFrame>(EVENT_QUEUE);
        let forwarder = tokio::spawn(forward_events(events_rx, Arc::clone(&upstream)));

        let cancels: CancelMap = Arc::new(Mutex::new(HashMap::new()));

        let mut reader = BufReader::new(read_half);
        loop {
            tokio::select! {
                received = marathon_proto::recv(&mut reader) => match received {
                    Ok((_, Message::AssignTask(spec))) => {
                        spawn_task_session(
                            spec,
                            Arc::clone(&pool),
                            Arc::clone(&collector),
                            events_tx.clone(),
                            Arc::clone(&cancels),
                            config.cancel_grace,
                        );
                    }
                    Ok((_, Message::CancelTask { task_id })) => {
                        let sessions = cancels.lock().await;
                        match sessions.get(&task_id) {
                            Some(flag) => {
                                info!(task = %task_id, "cancel requested");
                                let _ = flag.send(true);
                            }
                            None => warn!(task = %task_id, "cancel for unknown task ignored"),
                        }
                    }
                    Ok((_, other)) => {
                        warn!(tag = other.tag(), "unexpected coordinator frame ignored");
                    }
                    Err(e) => {
                        error!(error = %e, "coordinator connection lost");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        // Stop background work, then tear down every VM. Live sessions
        // lose their event sink; their VMs are destroyed with the pool.
        let _ = stop_tx.send(true);
        let _ = heartbeat_task.await;
        let _ = warmer.await;
        drop(events_tx);
        forwarder.abort();
        pool.shutdown().await;
        info!("node daemon stopped");
        Ok(())
    }
}

/// Drains session events into `TASK_EVENT` frames upstream, in order.
async fn forward_events(
    mut events: mpsc::Receiver<ForwardedFrame>,
    upstream: Arc<Upstream<OwnedWriteHalf>>,
) {
    while let Some(event) = events.recv().await {
        let msg = Message::TaskEvent {
            task_id: event.task_id,
            frame: event.frame,
        };
        if let Err(e) = upstream.send(&msg).await {
            warn!(error = %e, "failed to forward task event");
        }
    }
}

/// Acquires a VM and runs one task session on its own task.
fn spawn_task_session(
    spec: TaskSpec,
    pool: Arc<VmPool<Launcher>>,
    collector: Arc<StatusCollector>,
    events: mpsc::Sender<ForwardedFrame>,
    cancels: CancelMap,
    grace: Duration,
) {
    tokio::spawn(async move {
        let task_id = spec.task_id;
        let ticket = match pool.acquire().await {
            Ok(ticket) => ticket,
            Err(e) => {
                // The coordinator re-queues on this code; the task is not failed.
                warn!(task = %task_id, error = %e, "no VM available for assignment");
                send_error_event(&events, task_id, "pool_exhausted", &e.to_string()).await;
                return;
            }
        };
        collector.note_task_started();

        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        cancels.lock().await.insert(task_id, cancel_tx);

        let outcome =
            session::run_task(&ticket, &spec, &events, &mut cancel_rx, grace, READY_TIMEOUT).await;

        cancels.lock().await.remove(&task_id);

        match outcome {
            Ok(SessionOutcome::Completed { iteration, .. }) => {
                info!(task = %task_id, iteration, "task completed");
            }
            Ok(SessionOutcome::Failed { ref code, .. }) => {
                info!(task = %task_id, code, "task failed");
            }
            Ok(SessionOutcome::Cancelled) => {
                info!(task = %task_id, "task cancelled");
            }
            Err(e) => {
                // Session errors never reached the coordinator as a guest
                // frame; report one so the task does not hang in `running`.
                error!(task = %task_id, error = %e, "task session failed");
                send_error_event(&events, task_id, "node_error", &e.to_string()).await;
            }
        }

        // The VM is single-use: destroy it regardless of outcome.
        pool.release(ticket.id).await;
    });
}

/// Forwards a node-originated `ERROR` frame for a task.
async fn send_error_event(
    events: &mpsc::Sender<ForwardedFrame>,
    task_id: TaskId,
    code: &str,
    message: &str,
) {
    let frame = encode_frame(
        0,
        &Message::Error {
            code: code.to_owned(),
            message: message.to_owned(),
        },
    );
    let _ = events.send(ForwardedFrame { task_id, frame }).await;
}
