//! Hypervisor process management: one micro-VM per spawned process.
//!
//! The hypervisor binary is driven entirely through command-line
//! configuration: an API socket path, a vsock device mapping the guest
//! context id to a host Unix socket, and either a snapshot pair (preferred,
//! skips boot) or kernel + rootfs images (cold boot).

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use marathon_proto::AGENT_PORT;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::NodeConfig;
use crate::error::{Error, Result};
use crate::pool::VmStarter;
use crate::snapshot::{Snapshot, SnapshotStore};
use crate::vm::{Vm, VmId, VmProcess, VmState};

/// How long to wait for the hypervisor to expose the vsock socket.
const SOCKET_WAIT: Duration = Duration::from_secs(10);

/// Starts and destroys individual worker VMs.
#[derive(Debug)]
pub struct Launcher {
    /// Hypervisor binary.
    bin: PathBuf,
    /// Kernel image for cold boots.
    kernel_path: PathBuf,
    /// Root filesystem image for cold boots.
    rootfs_path: PathBuf,
    /// Directory for per-VM sockets.
    runtime_dir: PathBuf,
    /// Discovered snapshots.
    snapshots: SnapshotStore,
    /// Next guest context id. 0–2 are reserved by the transport, so
    /// allocation starts at 3.
    next_cid: AtomicU32,
}

impl Launcher {
    /// Creates a launcher from the node configuration and snapshot store.
    pub fn new(config: &NodeConfig, snapshots: SnapshotStore) -> std::io::Result<Self> {
        std::fs::create_dir_all(&config.runtime_dir)?;
        Ok(Self {
            bin: config.hypervisor_bin.clone(),
            kernel_path: config.kernel_path.clone(),
            rootfs_path: config.rootfs_path.clone(),
            runtime_dir: config.runtime_dir.clone(),
            snapshots,
            next_cid: AtomicU32::new(3),
        })
    }

    /// Allocates a fresh guest context id.
    fn allocate_cid(&self) -> u32 {
        self.next_cid.fetch_add(1, Ordering::SeqCst)
    }

    /// Starts a VM, preferring the default snapshot and falling back to a
    /// cold boot if the resume fails.
    pub async fn start(&self) -> Result<Vm> {
        if let Some(snapshot) = self.snapshots.get_default() {
            match self.start_from_snapshot(snapshot).await {
                Ok(vm) => return Ok(vm),
                Err(e) => {
                    warn!(snapshot = %snapshot.name, error = %e, "snapshot resume failed, cold-booting");
                }
            }
        }
        self.start_cold().await
    }

    /// Resumes a VM from a named snapshot.
    pub async fn start_from_snapshot(&self, snapshot: &Snapshot) -> Result<Vm> {
        let extra = [
            "--load-snapshot".into(),
            snapshot.vmstate_path.display().to_string(),
            "--mem-file".into(),
            snapshot.memory_path.display().to_string(),
        ];
        self.spawn_vm(&extra).await
    }

    /// Boots a VM from the kernel and rootfs images. Slower than a resume.
    pub async fn start_cold(&self) -> Result<Vm> {
        let extra = [
            "--kernel".into(),
            self.kernel_path.display().to_string(),
            "--rootfs".into(),
            self.rootfs_path.display().to_string(),
        ];
        self.spawn_vm(&extra).await
    }

    /// Spawns the hypervisor and waits for its vsock socket to appear.
    ///
    /// A failed start never leaks a process: the half-built child is killed
    /// and reaped before the error is returned.
    async fn spawn_vm(&self, extra_args: &[String]) -> Result<Vm> {
        let id = VmId::generate();
        let cid = self.allocate_cid();
        let api_socket = self.runtime_dir.join(format!("{id}.api"));
        let control_socket = self.runtime_dir.join(format!("{id}.vsock"));

        // Stale sockets from a previous run would make the bind fail.
        let _ = std::fs::remove_file(&api_socket);
        let _ = std::fs::remove_file(&control_socket);

        debug!(vm = %id, cid, "spawning hypervisor");
        let child = Command::new(&self.bin)
            .arg("--id")
            .arg(id.to_string())
            .arg("--api-sock")
            .arg(&api_socket)
            .arg("--vsock")
            .arg(format!(
                "cid={cid},port={AGENT_PORT},uds={}",
                control_socket.display()
            ))
            .args(extra_args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::HypervisorStart(format!("{}: {e}", self.bin.display())))?;

        let mut vm = Vm {
            id,
            state: VmState::Creating,
            process: VmProcess::from_child(child),
            control_socket: control_socket.clone(),
            cid,
            task_id: None,
            started_at: Instant::now(),
        };

        if let Err(e) = wait_for_socket(&control_socket, SOCKET_WAIT).await {
            vm.process.kill_and_reap().await;
            let _ = std::fs::remove_file(&api_socket);
            let _ = std::fs::remove_file(&control_socket);
            return Err(Error::HypervisorStart(format!(
                "vsock socket never appeared: {e}"
            )));
        }

        vm.state = VmState::Ready;
        info!(vm = %id, cid, boot_ms = vm.started_at.elapsed().as_millis(), "VM ready");
        Ok(vm)
    }
}

impl VmStarter for Launcher {
    fn start_vm(&self) -> impl Future<Output = Result<Vm>> + Send {
        self.start()
    }
}

/// Polls until `path` exists or the timeout elapses.
async fn wait_for_socket(path: &std::path::Path, timeout: Duration) -> std::io::Result<()> {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if path.exists() {
            return Ok(());
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    Err(std::io::Error::new(
        std::io::ErrorKind::TimedOut,
        format!("{} not created within {timeout:?}", path.display()),
    ))
}
