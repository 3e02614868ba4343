//! Test doubles shared across the node-daemon test modules.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Instant;

use crate::error::{Error, Result};
use crate::pool::VmStarter;
use crate::vm::{Vm, VmId, VmProcess, VmState};

/// Starter that fabricates detached VMs, optionally failing.
pub(crate) struct StubStarter {
    /// Next guest context id to hand out.
    next_cid: AtomicU32,
    /// When set, every start fails.
    pub(crate) fail: AtomicBool,
}

impl StubStarter {
    pub(crate) fn new() -> Self {
        Self {
            next_cid: AtomicU32::new(3),
            fail: AtomicBool::new(false),
        }
    }
}

impl VmStarter for StubStarter {
    fn start_vm(&self) -> impl Future<Output = Result<Vm>> + Send {
        let cid = self.next_cid.fetch_add(1, Ordering::SeqCst);
        let fail = self.fail.load(Ordering::SeqCst);
        async move {
            if fail {
                return Err(Error::HypervisorStart("stub failure".into()));
            }
            Ok(Vm {
                id: VmId::generate(),
                state: VmState::Ready,
                process: VmProcess::detached(),
                control_socket: std::env::temp_dir().join(format!("stub-{cid}.vsock")),
                cid,
                task_id: None,
                started_at: Instant::now(),
            })
        }
    }
}
