//! Framed TCP server and the coordinator hub state.
//!
//! One listener serves two kinds of connections, told apart by their first
//! frame: node daemons open with `HEARTBEAT`, clients open with
//! `SUBMIT_TASK` / `CANCEL_TASK` / `TASK_STATUS`. Task events from a node
//! are applied to the task record and fanned out, in arrival order, to the
//! submitting client's connection.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use marathon_proto::{
    ClientId, Message, NodeId, TaskId, TaskSpec, TaskState, UsageMetrics, decode_frame,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::registry::NodeRegistry;
use crate::scheduler::{TaskQueue, pick_node};
use crate::store::{NodeStore, TaskStore, UsageLedger};
use crate::task::Task;

/// Outbound queue depth per connection.
const LINK_QUEUE: usize = 64;

/// The coordinator's shared state.
pub struct Coordinator {
    /// Node liveness and capacity.
    registry: NodeRegistry,
    /// Durable task records.
    tasks: Arc<dyn TaskStore>,
    /// Durable node records.
    nodes: Arc<dyn NodeStore>,
    /// Tasks waiting for a node.
    queue: TaskQueue,
    /// Per-client usage totals.
    ledger: UsageLedger,
    /// Live outbound links to node daemons.
    node_links: Mutex<HashMap<NodeId, mpsc::Sender<Message>>>,
    /// Live event sinks for submitting clients.
    subscribers: Mutex<HashMap<TaskId, mpsc::Sender<Message>>>,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl Coordinator {
    /// Creates the hub with the given stores and stale timeout.
    pub fn new(
        stale_timeout: Duration,
        tasks: Arc<dyn TaskStore>,
        nodes: Arc<dyn NodeStore>,
    ) -> Arc<Self> {
        Arc::new(Self {
            registry: NodeRegistry::new(stale_timeout),
            tasks,
            nodes,
            queue: TaskQueue::default(),
            ledger: UsageLedger::default(),
            node_links: Mutex::new(HashMap::new()),
            subscribers: Mutex::new(HashMap::new()),
        })
    }

    /// The node registry (exposed for capacity queries).
    pub const fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    /// Per-client usage totals.
    pub const fn ledger(&self) -> &UsageLedger {
        &self.ledger
    }

    /// Accepts a submission: assigns an id, stores the task, queues it.
    pub fn submit(&self, client_id: ClientId, mut spec: TaskSpec) -> TaskId {
        let task_id = TaskId::generate();
        spec.task_id = task_id;
        self.tasks.insert(Task::new(client_id, spec));
        self.queue.enqueue(task_id);
        info!(task = %task_id, "task submitted");
        task_id
    }

    /// Handles a client cancel request.
    ///
    /// A task still in the queue is cancelled on the spot with no
    /// downstream traffic; an assigned task gets a `CANCEL_TASK` forwarded
    /// to its node; terminal tasks are left untouched.
    pub async fn cancel(&self, task_id: TaskId) -> Result<()> {
        let task = self
            .tasks
            .get(task_id)
            .ok_or(Error::UnknownTask(task_id))?;

        if task.state.is_terminal() {
            return Ok(());
        }

        if task.state == TaskState::Queued && self.queue.remove(task_id) {
            self.tasks.update(task_id, &mut |t| {
                let _ = t.transition(TaskState::Cancelled);
            });
            self.notify(
                task_id,
                &Message::Error {
                    code: "cancelled".into(),
                    message: "cancelled while queued".into(),
                },
            )
            .await;
            self.unsubscribe(task_id);
            info!(task = %task_id, "queued task cancelled");
            return Ok(());
        }

        if let Some(node_id) = task.assigned_node {
            let link = self.node_link(node_id);
            if let Some(link) = link {
                let _ = link.send(Message::CancelTask { task_id }).await;
                info!(task = %task_id, node = %node_id, "cancel forwarded");
            } else {
                warn!(task = %task_id, node = %node_id, "no link to assigned node");
            }
        }
        Ok(())
    }

    /// One scheduling pass: requeue tasks stranded on stale nodes, then
    /// assign queued tasks to the best-scoring nodes.
    pub async fn schedule_tick(&self) {
        for node_id in self.registry.reap_stale() {
            warn!(node = %node_id, "node went stale, reaping");
            self.nodes.remove(node_id);
            self.node_links_remove(node_id);
            for task in self.tasks.in_state(TaskState::Starting) {
                if task.assigned_node == Some(node_id) {
                    info!(task = %task.id, "returning task from stale node to queue");
                    self.tasks.update(task.id, &mut |t| {
                        let _ = t.requeue();
                    });
                    self.queue.enqueue(task.id);
                }
            }
        }

        loop {
            let Some(task_id) = self.queue.pop() else { break };
            // Cancelled-while-queued records may still be in flight; skip
            // anything no longer queued.
            let Some(task) = self.tasks.get(task_id) else {
                continue;
            };
            if task.state != TaskState::Queued {
                continue;
            }

            let healthy = self.registry.healthy();
            let Some(chosen) = pick_node(&healthy).map(|n| n.node_id) else {
                // No candidate this tick; retry later.
                self.queue.requeue_front(task_id);
                break;
            };
            let Some(link) = self.node_link(chosen) else {
                self.queue.requeue_front(task_id);
                break;
            };

            self.tasks.update(task_id, &mut |t| {
                if t.transition(TaskState::Starting).is_ok() {
                    t.assigned_node = Some(chosen);
                }
            });
            if link.send(Message::AssignTask(task.spec.clone())).await.is_err() {
                warn!(task = %task_id, node = %chosen, "assignment link closed, requeueing");
                self.tasks.update(task_id, &mut |t| {
                    let _ = t.requeue();
                });
                self.queue.requeue_front(task_id);
                break;
            }
            info!(task = %task_id, node = %chosen, "task assigned");
        }
    }

    /// Applies one forwarded guest frame to the task record and fans it
    /// out to the subscriber.
    pub async fn handle_task_event(&self, task_id: TaskId, frame: &[u8]) {
        let inner = match decode_frame(frame) {
            Ok((_, msg)) => msg,
            Err(e) => {
                warn!(task = %task_id, error = %e, "undecodable task event dropped");
                return;
            }
        };
        let Some(task) = self.tasks.get(task_id) else {
            warn!(task = %task_id, "event for unknown task dropped");
            return;
        };

        match inner {
            Message::Output { .. } | Message::Progress { .. } => {
                if task.state == TaskState::Starting {
                    self.tasks.update(task_id, &mut |t| {
                        let _ = t.transition(TaskState::Running);
                    });
                }
                self.notify(task_id, &inner).await;
            }
            Message::Metrics {
                input_tokens,
                output_tokens,
                ..
            } => {
                let delta = UsageMetrics {
                    input_tokens: u64::from(input_tokens),
                    output_tokens: u64::from(output_tokens),
                    ..UsageMetrics::default()
                };
                self.tasks.update(task_id, &mut |t| t.add_usage(&delta));
                self.ledger.record(task.owner, &delta);
                self.notify(task_id, &inner).await;
            }
            Message::Complete {
                ref metrics,
                ref artifact_url,
                ..
            } => {
                // COMPLETE totals are authoritative; credit the client only
                // with what per-frame merges have not already counted.
                let delta = metrics.delta_since(&task.usage);
                self.ledger.record(task.owner, &delta);
                let artifact = artifact_url.clone();
                let totals = *metrics;
                self.tasks.update(task_id, &mut |t| {
                    t.usage.absorb_total(&totals);
                    t.artifact_url = artifact.clone();
                    let _ = t.transition(TaskState::Completed);
                });
                self.notify(task_id, &inner).await;
                self.unsubscribe(task_id);
                info!(task = %task_id, "task completed");
            }
            Message::Error { ref code, ref message } => {
                if code == "pool_exhausted" {
                    // Resource exhaustion is not surfaced; the scheduler
                    // simply retries the task elsewhere.
                    debug!(task = %task_id, "assigned node had no VM, requeueing");
                    self.tasks.update(task_id, &mut |t| {
                        let _ = t.requeue();
                    });
                    self.queue.enqueue(task_id);
                    return;
                }
                let next = if code == "cancelled" {
                    TaskState::Cancelled
                } else {
                    TaskState::Failed
                };
                let recorded = format!("{code}: {message}");
                self.tasks.update(task_id, &mut |t| {
                    t.error = Some(recorded.clone());
                    let _ = t.transition(next);
                });
                info!(task = %task_id, code = %code, "task ended with error");
                self.notify(task_id, &inner).await;
                self.unsubscribe(task_id);
            }
            other => {
                warn!(task = %task_id, tag = other.tag(), "unexpected inner event frame");
            }
        }
    }

    /// Builds a `TASK_STATUS_REPLY` for a task.
    pub fn status_reply(&self, task_id: TaskId) -> Message {
        match self.tasks.get(task_id) {
            Some(task) => Message::TaskStatusReply {
                state: task.state,
                metrics: task.usage,
                artifact_url: task.artifact_url,
                error: task.error,
            },
            None => Message::TaskStatusReply {
                state: TaskState::Unspecified,
                metrics: UsageMetrics::default(),
                artifact_url: None,
                error: Some(format!("unknown task {task_id}")),
            },
        }
    }

    /// Sends an event to the task's subscriber, wrapped as `TASK_EVENT`.
    async fn notify(&self, task_id: TaskId, inner: &Message) {
        let sink = self
            .subscribers
            .lock()
            .ok()
            .and_then(|subs| subs.get(&task_id).cloned());
        if let Some(sink) = sink {
            let event = Message::TaskEvent {
                task_id,
                frame: marathon_proto::encode_frame(0, inner),
            };
            let _ = sink.send(event).await;
        }
    }

    fn unsubscribe(&self, task_id: TaskId) {
        if let Ok(mut subs) = self.subscribers.lock() {
            subs.remove(&task_id);
        }
    }

    fn node_link(&self, node_id: NodeId) -> Option<mpsc::Sender<Message>> {
        self.node_links
            .lock()
            .ok()
            .and_then(|links| links.get(&node_id).cloned())
    }

    fn node_links_remove(&self, node_id: NodeId) {
        if let Ok(mut links) = self.node_links.lock() {
            links.remove(&node_id);
        }
    }

    /// Serves the framed endpoint until ctrl-c, scheduling as it goes.
    pub async fn run(self: Arc<Self>, listener: TcpListener, schedule_interval: Duration) {
        let scheduler = {
            let hub = Arc::clone(&self);
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(schedule_interval);
                loop {
                    ticker.tick().await;
                    hub.schedule_tick().await;
                }
            })
        };

        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        debug!(%peer, "connection accepted");
                        let hub = Arc::clone(&self);
                        tokio::spawn(async move {
                            if let Err(e) = hub.handle_connection(stream).await {
                                debug!(%peer, error = %e, "connection ended");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "accept failed");
                        break;
                    }
                },
                _ = tokio::signal::ctrl_c() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }
        scheduler.abort();
    }

    /// Dispatches one connection by its first frame.
    pub async fn handle_connection<S>(self: Arc<Self>, stream: S) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (mut reader, writer) = tokio::io::split(stream);
        let (correlation_id, first) = marathon_proto::recv(&mut reader).await?;
        match first {
            Message::Heartbeat(status) => self.node_connection(reader, writer, status).await,
            other => {
                self.client_connection(reader, writer, correlation_id, other)
                    .await
            }
        }
    }

    /// Serves one node daemon: heartbeats and task events in, assignments
    /// and cancels out.
    async fn node_connection<S>(
        self: Arc<Self>,
        mut reader: ReadHalf<S>,
        mut writer: WriteHalf<S>,
        first_status: marathon_proto::NodeStatus,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let node_id = first_status.node_id;
        info!(node = %node_id, hostname = %first_status.hostname, "node registered");
        self.registry.heartbeat(first_status.clone());
        self.nodes.upsert(first_status);

        let (tx, mut rx) = mpsc::channel::<Message>(LINK_QUEUE);
        if let Ok(mut links) = self.node_links.lock() {
            links.insert(node_id, tx);
        }

        let writer_task = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                if let Err(e) = marathon_proto::send(&mut writer, 0, &msg).await {
                    warn!(node = %node_id, error = %e, "node link write failed");
                    return;
                }
            }
        });

        let result = loop {
            match marathon_proto::recv(&mut reader).await {
                Ok((_, Message::Heartbeat(status))) => {
                    self.registry.heartbeat(status.clone());
                    self.nodes.upsert(status);
                }
                Ok((_, Message::TaskEvent { task_id, frame })) => {
                    self.handle_task_event(task_id, &frame).await;
                }
                Ok((_, other)) => {
                    break Err(Error::Protocol(format!(
                        "unexpected node frame tag {:#04x}",
                        other.tag()
                    )));
                }
                Err(e) => {
                    info!(node = %node_id, error = %e, "node connection closed");
                    break Ok(());
                }
            }
        };

        self.node_links_remove(node_id);
        writer_task.abort();
        result
    }

    /// Serves one client: submissions, cancels, status queries, and the
    /// live event stream for submitted tasks.
    async fn client_connection<S>(
        self: Arc<Self>,
        mut reader: ReadHalf<S>,
        mut writer: WriteHalf<S>,
        first_correlation: u32,
        first: Message,
    ) -> Result<()>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (events_tx, mut events_rx) = mpsc::channel::<Message>(LINK_QUEUE);

        if let Some(reply) = self
            .handle_client_frame(first, &events_tx)
            .await?
        {
            marathon_proto::send(&mut writer, first_correlation, &reply).await?;
        }

        loop {
            tokio::select! {
                received = marathon_proto::recv(&mut reader) => {
                    let (correlation_id, msg) = match received {
                        Ok(frame) => frame,
                        Err(e) => {
                            debug!(error = %e, "client connection closed");
                            return Ok(());
                        }
                    };
                    if let Some(reply) = self.handle_client_frame(msg, &events_tx).await? {
                        marathon_proto::send(&mut writer, correlation_id, &reply).await?;
                    }
                }
                event = events_rx.recv() => {
                    // The hub holds a sender per subscription, so this only
                    // ends when the connection does.
                    if let Some(event) = event {
                        marathon_proto::send(&mut writer, 0, &event).await?;
                    }
                }
            }
        }
    }

    /// Processes one client frame, returning the reply to send, if any.
    async fn handle_client_frame(
        &self,
        msg: Message,
        events: &mpsc::Sender<Message>,
    ) -> Result<Option<Message>> {
        match msg {
            Message::SubmitTask { client_id, spec } => {
                let task_id = self.submit(client_id, spec);
                if let Ok(mut subs) = self.subscribers.lock() {
                    subs.insert(task_id, events.clone());
                }
                Ok(Some(Message::TaskAccepted { task_id }))
            }
            Message::CancelTask { task_id } => {
                if let Err(e) = self.cancel(task_id).await {
                    warn!(task = %task_id, error = %e, "cancel failed");
                }
                Ok(None)
            }
            Message::TaskStatus { task_id } => Ok(Some(self.status_reply(task_id))),
            other => Err(Error::Protocol(format!(
                "unexpected client frame tag {:#04x}",
                other.tag()
            ))),
        }
    }
}
