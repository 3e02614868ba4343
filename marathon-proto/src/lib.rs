//! Wire protocol for marathon host↔guest and coordinator↔node communication.
//!
//! Every frame on every wire is a fixed 9-byte header — message tag,
//! correlation id, payload length — followed by a big-endian payload,
//! suitable for any reliable byte stream (vsock, Unix socket, TCP).
//!
//! The same envelope carries two tag ranges: `0x01..=0x08` between a node
//! daemon and the guest agent inside a VM, `0x10..=0x17` between the
//! coordinator and node daemons (and submitting clients).

mod codec;
mod id;
mod message;
mod types;
mod wire;

pub use codec::{HEADER_LEN, Header, MAX_PAYLOAD, decode_frame, encode_frame, recv, send};
pub use id::{ClientId, NodeId, TaskId, VmId};
pub use message::{Message, OutputChannel, tag};
pub use types::{
    AGENT_PORT, Credentials, DEFAULT_MAX_ITERATIONS, NodeStatus, TaskSpec, TaskState, UsageMetrics,
};
