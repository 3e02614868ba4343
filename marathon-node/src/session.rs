//! Per-task host↔guest session.
//!
//! After a VM is acquired for a task, the session connects to the VM's
//! host-side socket, completes the READY / TASK_START handshake, and then
//! relays guest frames until a terminal frame arrives. Relayed frames go out
//! as a typed channel of pre-assembled `TASK_EVENT` payloads; the daemon
//! forwards them upstream in order.
//!
//! Frames from one VM are totally ordered: the session is the only reader
//! of the guest stream and the only producer on its event channel.

use std::io;
use std::time::Duration;

use marathon_proto::{Message, TaskId, TaskSpec, UsageMetrics, encode_frame};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::UnixStream;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::vm::VmTicket;

/// Delay between connection probes while the guest agent boots.
const PROBE_INTERVAL: Duration = Duration::from_millis(100);

/// A guest frame ready to be forwarded upstream as a `TASK_EVENT`.
#[derive(Debug, Clone)]
pub struct ForwardedFrame {
    /// Task the frame belongs to.
    pub task_id: TaskId,
    /// Complete inner frame (header + payload).
    pub frame: Vec<u8>,
}

/// How a task session ended.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionOutcome {
    /// The guest reported completion.
    Completed {
        /// Exit code of the final agent invocation.
        exit_code: i32,
        /// Cumulative usage, legacy metrics frames included.
        metrics: UsageMetrics,
        /// Iteration the task completed on.
        iteration: u32,
        /// Whether the completion promise was observed.
        promise_found: bool,
        /// Produced artifact URL, if any.
        artifact_url: Option<String>,
    },
    /// The guest reported a failure.
    Failed {
        /// Stable machine-readable code.
        code: String,
        /// Human-readable message.
        message: String,
    },
    /// The task was cancelled (guest confirmed, or the grace period ran out).
    Cancelled,
}

/// Connects to an acquired VM and runs its task session to completion.
///
/// The guest agent may still be booting when the VM is handed out, so
/// connection attempts and handshakes that die before `READY` arrives are
/// probes — retried until `ready_timeout` elapses.
pub async fn run_task(
    ticket: &VmTicket,
    spec: &TaskSpec,
    events: &mpsc::Sender<ForwardedFrame>,
    cancel: &mut watch::Receiver<bool>,
    grace: Duration,
    ready_timeout: Duration,
) -> Result<SessionOutcome> {
    let deadline = Instant::now() + ready_timeout;
    loop {
        let retryable = Instant::now() < deadline;
        match UnixStream::connect(&ticket.control_socket).await {
            Ok(mut stream) => match await_ready(&mut stream).await {
                Ok(cid) => {
                    debug!(vm = %ticket.id, cid, "guest agent ready");
                    return drive_session(&mut stream, spec, events, cancel, grace).await;
                }
                Err(Error::Io(e)) if probe_error(&e) && retryable => {
                    tokio::time::sleep(PROBE_INTERVAL).await;
                }
                Err(e) => return Err(e),
            },
            Err(e) if retryable => {
                debug!(vm = %ticket.id, error = %e, "guest not reachable yet");
                tokio::time::sleep(PROBE_INTERVAL).await;
            }
            Err(e) => return Err(e.into()),
        }
    }
}

/// Errors that mean "the guest is not up yet", not "the guest is broken".
fn probe_error(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::UnexpectedEof
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionRefused
    )
}

/// Reads the guest's `READY` frame, returning its context id.
pub async fn await_ready<S>(stream: &mut S) -> Result<u32>
where
    S: AsyncRead + Unpin,
{
    match marathon_proto::recv(stream).await? {
        (_, Message::Ready { vm_id }) => Ok(vm_id),
        (_, other) => Err(Error::Protocol(format!(
            "expected READY, got tag {:#04x}",
            other.tag()
        ))),
    }
}

/// Sends `TASK_START` and relays guest frames until a terminal frame.
///
/// Dispatch rules:
/// - `OUTPUT` / `PROGRESS` — forwarded upstream.
/// - `METRICS` (legacy) — merged into the running usage and forwarded.
/// - `COMPLETE` / `ERROR` — forwarded, session ends.
/// - anything else — protocol violation; the caller destroys the VM.
///
/// A cancel request writes a `CANCEL` frame and then waits up to `grace`
/// for the guest's final frame before giving up on it.
pub async fn drive_session<S>(
    stream: &mut S,
    spec: &TaskSpec,
    events: &mpsc::Sender<ForwardedFrame>,
    cancel: &mut watch::Receiver<bool>,
    grace: Duration,
) -> Result<SessionOutcome>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    marathon_proto::send(stream, 0, &Message::TaskStart(spec.clone())).await?;

    let task_id = spec.task_id;
    let mut legacy_usage = UsageMetrics::default();

    loop {
        let cancel_requested = async {
            // A dropped sender means the daemon is going away without
            // cancelling; park forever and let the guest stream decide.
            if cancel.wait_for(|&c| c).await.is_err() {
                std::future::pending::<()>().await;
            }
        };

        tokio::select! {
            received = marathon_proto::recv(stream) => {
                let (_, msg) = received?;
                forward(events, task_id, &msg).await;
                match msg {
                    Message::Output { .. } | Message::Progress { .. } => {}
                    Message::Metrics { input_tokens, output_tokens, .. } => {
                        legacy_usage.merge(&UsageMetrics {
                            input_tokens: u64::from(input_tokens),
                            output_tokens: u64::from(output_tokens),
                            ..UsageMetrics::default()
                        });
                    }
                    Message::Complete { exit_code, metrics, iteration, promise_found, artifact_url } => {
                        let mut total = metrics;
                        total.merge(&legacy_usage);
                        return Ok(SessionOutcome::Completed {
                            exit_code,
                            metrics: total,
                            iteration,
                            promise_found,
                            artifact_url,
                        });
                    }
                    Message::Error { code, message } => {
                        return Ok(if code == "cancelled" {
                            SessionOutcome::Cancelled
                        } else {
                            SessionOutcome::Failed { code, message }
                        });
                    }
                    other => {
                        return Err(Error::Protocol(format!(
                            "unexpected guest frame tag {:#04x}",
                            other.tag()
                        )));
                    }
                }
            }
            () = cancel_requested => {
                marathon_proto::send(stream, 0, &Message::Cancel).await?;
                return Ok(await_cancelled(stream, events, task_id, grace).await);
            }
        }
    }
}

/// After sending `CANCEL`, waits up to `grace` for the guest's final frame.
///
/// Whatever happens within the grace period, the session ends here; an
/// unresponsive guest is simply destroyed by the caller.
async fn await_cancelled<S>(
    stream: &mut S,
    events: &mpsc::Sender<ForwardedFrame>,
    task_id: TaskId,
    grace: Duration,
) -> SessionOutcome
where
    S: AsyncRead + Unpin,
{
    loop {
        match tokio::time::timeout(grace, marathon_proto::recv(stream)).await {
            Ok(Ok((_, msg))) => {
                forward(events, task_id, &msg).await;
                match msg {
                    // In-flight output may still be queued ahead of the ack.
                    Message::Output { .. } | Message::Progress { .. } | Message::Metrics { .. } => {}
                    Message::Complete {
                        exit_code,
                        metrics,
                        iteration,
                        promise_found,
                        artifact_url,
                    } => {
                        return SessionOutcome::Completed {
                            exit_code,
                            metrics,
                            iteration,
                            promise_found,
                            artifact_url,
                        };
                    }
                    _ => return SessionOutcome::Cancelled,
                }
            }
            Ok(Err(e)) => {
                debug!(error = %e, "guest stream closed during cancel grace");
                return SessionOutcome::Cancelled;
            }
            Err(_) => {
                warn!(task = %task_id, "cancel grace period expired");
                return SessionOutcome::Cancelled;
            }
        }
    }
}

/// Re-frames a guest message and queues it for upstream forwarding.
///
/// A closed channel means the daemon is shutting down; the frame is dropped
/// rather than failing the session.
async fn forward(events: &mpsc::Sender<ForwardedFrame>, task_id: TaskId, msg: &Message) {
    let frame = ForwardedFrame {
        task_id,
        frame: encode_frame(0, msg),
    };
    let _ = events.send(frame).await;
}
