//! Marathon guest agent library.
//!
//! Runs inside each worker micro-VM: receives a task over vsock, clones the
//! repository, drives the AI agent iteratively, and streams results back to
//! the node daemon. The binary in `main.rs` wires these modules to the real
//! vsock transport; everything transport-shaped is generic over the stream
//! so the loop is testable over in-memory pipes.

pub mod cleanup;
pub mod context;
pub mod driver;
pub mod interceptor;
pub mod iterlog;
pub mod runner;
pub mod signals;
#[cfg(target_os = "linux")]
pub mod transport;
#[cfg(target_os = "linux")]
pub mod workspace;
