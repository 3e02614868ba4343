//! Worker-VM records and lifecycle states.

use std::path::PathBuf;
use std::time::Instant;

use marathon_proto::TaskId;
// VM ids share the fixed-width hex id family defined with the wire types.
pub use marathon_proto::VmId;
use tokio::process::Child;

/// VM lifecycle state.
///
/// ```text
/// creating → ready → running → stopped
///    ↘          ↘
///     failed    failed
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum VmState {
    /// Hypervisor spawned, guest not yet reachable.
    Creating,
    /// Booted and idle in the warm set.
    Ready,
    /// Assigned to a task.
    Running,
    /// Destroyed.
    Stopped,
    /// Start or runtime failure; will be discarded.
    Failed,
}

/// Opaque handle to the hypervisor process backing a VM.
///
/// Detached handles (no process) exist only in tests.
#[derive(Debug)]
pub struct VmProcess(Option<Child>);

impl VmProcess {
    /// Wraps a spawned hypervisor child.
    pub const fn from_child(child: Child) -> Self {
        Self(Some(child))
    }

    /// A handle with no backing process.
    #[cfg(test)]
    pub(crate) const fn detached() -> Self {
        Self(None)
    }

    /// Host PID of the hypervisor process, if running.
    pub fn pid(&self) -> Option<u32> {
        self.0.as_ref().and_then(Child::id)
    }

    /// Kills the process and waits for it to be reaped. Best-effort: kill
    /// errors (already exited) are swallowed.
    pub async fn kill_and_reap(&mut self) {
        if let Some(child) = self.0.as_mut() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

/// One worker VM owned by the pool.
#[derive(Debug)]
pub struct Vm {
    /// VM identifier.
    pub id: VmId,
    /// Lifecycle state.
    pub state: VmState,
    /// Backing hypervisor process.
    pub process: VmProcess,
    /// Host-side Unix socket the hypervisor maps to the guest's vsock port.
    pub control_socket: PathBuf,
    /// Guest context id, in `[3, 2^32 - 1]`.
    pub cid: u32,
    /// Task currently assigned, if any.
    pub task_id: Option<TaskId>,
    /// When the VM was started.
    pub started_at: Instant,
}

impl Vm {
    /// Destroys the VM: kills the hypervisor, reaps it, and removes the
    /// control socket. Infallible from the caller's perspective.
    pub async fn destroy(mut self) {
        self.process.kill_and_reap().await;
        let _ = std::fs::remove_file(&self.control_socket);
        self.state = VmState::Stopped;
    }

    /// Connection details handed out on acquire; the [`Vm`] itself stays in
    /// the pool's active map.
    pub fn ticket(&self) -> VmTicket {
        VmTicket {
            id: self.id,
            cid: self.cid,
            control_socket: self.control_socket.clone(),
        }
    }
}

/// What a task session needs to talk to an acquired VM.
#[derive(Debug, Clone)]
pub struct VmTicket {
    /// VM identifier, used to release the VM afterwards.
    pub id: VmId,
    /// Guest context id.
    pub cid: u32,
    /// Host-side Unix socket path.
    pub control_socket: PathBuf,
}
