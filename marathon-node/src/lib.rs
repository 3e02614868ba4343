//! Marathon compute-node daemon.
//!
//! One `marathon-node` process runs per compute host. It keeps a warm pool
//! of pre-booted micro-VMs, heartbeats its status to the coordinator,
//! accepts task assignments, and drives each task's host↔guest session
//! until completion.

mod config;
mod daemon;
mod error;
mod heartbeat;
mod hypervisor;
mod pool;
mod session;
mod snapshot;
mod status;
#[cfg(test)]
mod testutil;
mod upstream;
mod vm;

pub use config::NodeConfig;
pub use daemon::NodeDaemon;
pub use error::{Error, Result};
pub use hypervisor::Launcher;
pub use pool::{PoolCounts, VmPool, VmStarter};
pub use session::{ForwardedFrame, SessionOutcome, drive_session};
pub use snapshot::{Snapshot, SnapshotStore};
pub use status::StatusCollector;
pub use upstream::Upstream;
pub use vm::{Vm, VmId, VmProcess, VmState, VmTicket};
