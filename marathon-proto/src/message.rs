//! Framed message catalog for both wires.
//!
//! Tags `0x01..=0x08` flow between a node daemon and the guest agent;
//! tags `0x10..=0x17` flow between the coordinator and node daemons or
//! submitting clients. Both ranges share the envelope in [`crate::codec`].

use std::io;

use crate::id::{ClientId, TaskId};
use crate::types::{NodeStatus, TaskSpec, TaskState, UsageMetrics};
use crate::wire::{Reader, Writer};

/// One-byte message tags (normative).
pub mod tag {
    /// Guest stdout/stderr chunk.
    pub const OUTPUT: u8 = 0x01;
    /// Legacy per-iteration metrics (authoritative totals ride `COMPLETE`).
    pub const METRICS: u8 = 0x02;
    /// Task finished inside the guest.
    pub const COMPLETE: u8 = 0x03;
    /// Task failed, with a stable machine code.
    pub const ERROR: u8 = 0x04;
    /// Guest agent handshake, carries its vsock context id.
    pub const READY: u8 = 0x05;
    /// Full task descriptor, host → guest.
    pub const TASK_START: u8 = 0x06;
    /// Per-iteration progress report.
    pub const PROGRESS: u8 = 0x07;
    /// Cancellation request (empty payload).
    pub const CANCEL: u8 = 0x08;
    /// Node status report; the first one registers the node.
    pub const HEARTBEAT: u8 = 0x10;
    /// Coordinator assigns a task to a node.
    pub const ASSIGN_TASK: u8 = 0x11;
    /// Node forwards a guest frame upstream, tagged with its task.
    pub const TASK_EVENT: u8 = 0x12;
    /// Client submits a task.
    pub const SUBMIT_TASK: u8 = 0x13;
    /// Coordinator acknowledges a submission with the assigned id.
    pub const TASK_ACCEPTED: u8 = 0x14;
    /// Client or coordinator requests cancellation of a task.
    pub const CANCEL_TASK: u8 = 0x15;
    /// Client polls task state.
    pub const TASK_STATUS: u8 = 0x16;
    /// Reply to `TASK_STATUS`.
    pub const TASK_STATUS_REPLY: u8 = 0x17;
}

/// Which stdio channel an [`Message::Output`] chunk came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputChannel {
    /// Agent stdout.
    Stdout = 0,
    /// Agent stderr.
    Stderr = 1,
}

impl OutputChannel {
    const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Stdout),
            1 => Some(Self::Stderr),
            _ => None,
        }
    }
}

/// Every message that can appear on a marathon wire.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// A chunk of agent output, forwarded as produced.
    Output {
        /// Originating stdio channel.
        channel: OutputChannel,
        /// Raw bytes as read from the child.
        data: Vec<u8>,
    },
    /// Legacy per-iteration metrics. Decoded and merged when received;
    /// current guests report totals via [`Message::Complete`] instead.
    Metrics {
        /// Input tokens for the iteration.
        input_tokens: u32,
        /// Output tokens for the iteration.
        output_tokens: u32,
        /// Estimated cost in USD.
        cost_usd: f64,
    },
    /// Terminal success report from the guest.
    Complete {
        /// Exit code of the final agent invocation.
        exit_code: i32,
        /// Cumulative usage over all iterations.
        metrics: UsageMetrics,
        /// Iteration on which the task completed.
        iteration: u32,
        /// Whether the configured completion promise was observed.
        promise_found: bool,
        /// Produced artifact URL, if any.
        artifact_url: Option<String>,
    },
    /// Terminal failure report, or cancellation confirmation.
    Error {
        /// Stable machine-readable code (e.g. `setup_failed`).
        code: String,
        /// Human-readable description.
        message: String,
    },
    /// Guest handshake carrying its vsock context id.
    Ready {
        /// Guest context id in `[3, 2^32 - 1]`.
        vm_id: u32,
    },
    /// Task descriptor, host → guest.
    TaskStart(TaskSpec),
    /// Per-iteration progress.
    Progress {
        /// Current iteration (1-based).
        iteration: u32,
        /// Iteration cap.
        max_iterations: u32,
        /// Free-form status string.
        status: String,
    },
    /// Cancellation request. Empty payload.
    Cancel,
    /// Node status report, node → coordinator.
    Heartbeat(NodeStatus),
    /// Task assignment, coordinator → node.
    AssignTask(TaskSpec),
    /// A guest frame forwarded upstream verbatim, tagged with its task.
    TaskEvent {
        /// Task the inner frame belongs to.
        task_id: TaskId,
        /// A complete inner frame (header + payload) as received.
        frame: Vec<u8>,
    },
    /// Task submission, client → coordinator.
    SubmitTask {
        /// Submitting client.
        client_id: ClientId,
        /// Requested task. Its `task_id` is assigned by the coordinator.
        spec: TaskSpec,
    },
    /// Submission acknowledgment with the assigned task id.
    TaskAccepted {
        /// Assigned task id.
        task_id: TaskId,
    },
    /// Cancellation request for a task.
    CancelTask {
        /// Task to cancel.
        task_id: TaskId,
    },
    /// Task state query.
    TaskStatus {
        /// Task to look up.
        task_id: TaskId,
    },
    /// Reply to [`Message::TaskStatus`].
    TaskStatusReply {
        /// Current state.
        state: TaskState,
        /// Cumulative usage so far.
        metrics: UsageMetrics,
        /// Artifact URL if the task completed with one.
        artifact_url: Option<String>,
        /// Error message if the task failed.
        error: Option<String>,
    },
}

impl Message {
    /// Returns the one-byte wire tag for this message.
    pub const fn tag(&self) -> u8 {
        match self {
            Self::Output { .. } => tag::OUTPUT,
            Self::Metrics { .. } => tag::METRICS,
            Self::Complete { .. } => tag::COMPLETE,
            Self::Error { .. } => tag::ERROR,
            Self::Ready { .. } => tag::READY,
            Self::TaskStart(_) => tag::TASK_START,
            Self::Progress { .. } => tag::PROGRESS,
            Self::Cancel => tag::CANCEL,
            Self::Heartbeat(_) => tag::HEARTBEAT,
            Self::AssignTask(_) => tag::ASSIGN_TASK,
            Self::TaskEvent { .. } => tag::TASK_EVENT,
            Self::SubmitTask { .. } => tag::SUBMIT_TASK,
            Self::TaskAccepted { .. } => tag::TASK_ACCEPTED,
            Self::CancelTask { .. } => tag::CANCEL_TASK,
            Self::TaskStatus { .. } => tag::TASK_STATUS,
            Self::TaskStatusReply { .. } => tag::TASK_STATUS_REPLY,
        }
    }

    /// Serializes the payload (header excluded).
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut w = Writer::new();
        match self {
            Self::Output { channel, data } => {
                w.put_u8(*channel as u8);
                w.put_bytes(data);
            }
            Self::Metrics {
                input_tokens,
                output_tokens,
                cost_usd,
            } => {
                w.put_u32(*input_tokens);
                w.put_u32(*output_tokens);
                w.put_f64(*cost_usd);
            }
            Self::Complete {
                exit_code,
                metrics,
                iteration,
                promise_found,
                artifact_url,
            } => {
                w.put_i32(*exit_code);
                metrics.encode(&mut w);
                w.put_u32(*iteration);
                w.put_bool(*promise_found);
                w.put_opt_str(artifact_url.as_deref());
            }
            Self::Error { code, message } => {
                w.put_str(code);
                w.put_str(message);
            }
            Self::Ready { vm_id } => w.put_u32(*vm_id),
            Self::TaskStart(spec) | Self::AssignTask(spec) => spec.encode(&mut w),
            Self::Progress {
                iteration,
                max_iterations,
                status,
            } => {
                w.put_u32(*iteration);
                w.put_u32(*max_iterations);
                w.put_str(status);
            }
            Self::Cancel => {}
            Self::Heartbeat(status) => status.encode(&mut w),
            Self::TaskEvent { task_id, frame } => {
                w.put_raw(task_id.as_bytes());
                w.put_bytes(frame);
            }
            Self::SubmitTask { client_id, spec } => {
                w.put_raw(client_id.as_bytes());
                spec.encode(&mut w);
            }
            Self::TaskAccepted { task_id }
            | Self::CancelTask { task_id }
            | Self::TaskStatus { task_id } => {
                w.put_raw(task_id.as_bytes());
            }
            Self::TaskStatusReply {
                state,
                metrics,
                artifact_url,
                error,
            } => {
                w.put_u8(*state as u8);
                metrics.encode(&mut w);
                w.put_opt_str(artifact_url.as_deref());
                w.put_opt_str(error.as_deref());
            }
        }
        w.into_bytes()
    }

    /// Deserializes a payload for the given tag.
    ///
    /// Unknown tags and malformed payloads (including trailing bytes) are
    /// protocol violations and fail with `InvalidData`.
    pub fn decode_payload(msg_type: u8, payload: &[u8]) -> io::Result<Self> {
        let mut r = Reader::new(payload);
        let msg = match msg_type {
            tag::OUTPUT => {
                let raw = r.get_u8()?;
                let channel = OutputChannel::from_u8(raw).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid output channel {raw}"),
                    )
                })?;
                Self::Output {
                    channel,
                    data: r.get_bytes()?,
                }
            }
            tag::METRICS => Self::Metrics {
                input_tokens: r.get_u32()?,
                output_tokens: r.get_u32()?,
                cost_usd: r.get_f64()?,
            },
            tag::COMPLETE => Self::Complete {
                exit_code: r.get_i32()?,
                metrics: UsageMetrics::decode(&mut r)?,
                iteration: r.get_u32()?,
                promise_found: r.get_bool()?,
                artifact_url: r.get_opt_str()?,
            },
            tag::ERROR => Self::Error {
                code: r.get_str()?,
                message: r.get_str()?,
            },
            tag::READY => Self::Ready {
                vm_id: r.get_u32()?,
            },
            tag::TASK_START => Self::TaskStart(TaskSpec::decode(&mut r)?),
            tag::PROGRESS => Self::Progress {
                iteration: r.get_u32()?,
                max_iterations: r.get_u32()?,
                status: r.get_str()?,
            },
            tag::CANCEL => Self::Cancel,
            tag::HEARTBEAT => Self::Heartbeat(NodeStatus::decode(&mut r)?),
            tag::ASSIGN_TASK => Self::AssignTask(TaskSpec::decode(&mut r)?),
            tag::TASK_EVENT => Self::TaskEvent {
                task_id: TaskId::from_bytes(r.get_array()?),
                frame: r.get_bytes()?,
            },
            tag::SUBMIT_TASK => Self::SubmitTask {
                client_id: ClientId::from_bytes(r.get_array()?),
                spec: TaskSpec::decode(&mut r)?,
            },
            tag::TASK_ACCEPTED => Self::TaskAccepted {
                task_id: TaskId::from_bytes(r.get_array()?),
            },
            tag::CANCEL_TASK => Self::CancelTask {
                task_id: TaskId::from_bytes(r.get_array()?),
            },
            tag::TASK_STATUS => Self::TaskStatus {
                task_id: TaskId::from_bytes(r.get_array()?),
            },
            tag::TASK_STATUS_REPLY => {
                let raw = r.get_u8()?;
                let state = TaskState::from_u8(raw).ok_or_else(|| {
                    io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("invalid task state {raw}"),
                    )
                })?;
                Self::TaskStatusReply {
                    state,
                    metrics: UsageMetrics::decode(&mut r)?,
                    artifact_url: r.get_opt_str()?,
                    error: r.get_opt_str()?,
                }
            }
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("unknown message tag {other:#04x}"),
                ));
            }
        };
        r.finish()?;
        Ok(msg)
    }
}
