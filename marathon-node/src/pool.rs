//! Warm pool of pre-booted worker VMs.
//!
//! The pool owns every VM on the node. Warm VMs wait in an ordered queue;
//! `acquire` moves the front VM into the active map and hands back a
//! connection ticket. Released VMs are destroyed, never reused — isolation
//! comes from a fresh VM per task, and the background warmer replaces them.
//!
//! One mutex protects both collections. Critical sections are pointer and
//! map manipulation only; VM boots and teardowns happen outside the lock.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Mutex, Semaphore, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::{Error, Result};
use crate::vm::{Vm, VmId, VmState, VmTicket};

/// Upper bound on simultaneous VM start attempts.
const MAX_PARALLEL_STARTS: usize = 4;

/// Boots worker VMs to `Ready`. Implemented by [`crate::Launcher`]; tests
/// substitute a stub.
pub trait VmStarter: Send + Sync + 'static {
    /// Starts one VM and returns it in the `Ready` state.
    fn start_vm(&self) -> impl Future<Output = Result<Vm>> + Send;
}

/// Snapshot of the pool's occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolCounts {
    /// VMs booted and idle.
    pub warm: usize,
    /// VMs assigned to tasks.
    pub active: usize,
}

impl PoolCounts {
    /// Warm plus active.
    pub const fn total(&self) -> usize {
        self.warm + self.active
    }
}

/// The two collections guarded by the pool mutex.
///
/// Invariant: no VM id appears in both; warm VMs are `Ready`, active VMs
/// are `Running`.
#[derive(Debug, Default)]
struct Inner {
    /// Ordered warm queue; acquires pop the front.
    warm: VecDeque<Vm>,
    /// Active VMs keyed by id.
    active: HashMap<VmId, Vm>,
}

/// Thread-safe pool of pre-booted VMs.
#[derive(Debug)]
pub struct VmPool<S> {
    /// VM boot backend.
    starter: S,
    /// Warm queue + active map under one mutex.
    inner: Mutex<Inner>,
    /// Hard cap on warm + active.
    slots: u32,
    /// Warm VMs the background warmer maintains.
    warm_target: u32,
    /// While set, the warmer stops replacing VMs.
    draining: AtomicBool,
    /// Bounds parallel start attempts.
    start_permits: Semaphore,
}

impl<S: VmStarter> VmPool<S> {
    /// Creates an empty pool.
    pub fn new(starter: S, slots: u32, warm_target: u32) -> Self {
        Self {
            starter,
            inner: Mutex::new(Inner::default()),
            slots,
            warm_target,
            draining: AtomicBool::new(false),
            start_permits: Semaphore::new(MAX_PARALLEL_STARTS),
        }
    }

    /// Brings the warm count up to `target`, within the slot cap.
    ///
    /// Start attempts run concurrently, bounded by the start semaphore. A
    /// failed start is logged and leaves the pool untouched; the next
    /// warmer tick retries.
    pub async fn warm_to(pool: &Arc<Self>, target: usize) {
        let needed = {
            let inner = pool.inner.lock().await;
            let room = (pool.slots as usize).saturating_sub(inner.warm.len() + inner.active.len());
            target.saturating_sub(inner.warm.len()).min(room)
        };
        if needed == 0 {
            return;
        }

        let mut starts = JoinSet::new();
        for _ in 0..needed {
            let pool = Arc::clone(pool);
            starts.spawn(Self::start_one(pool));
        }
        while starts.join_next().await.is_some() {}
    }

    /// Boots one VM and adds it to the warm queue.
    async fn start_one(pool: Arc<Self>) {
        // Semaphore is never closed, so acquire cannot fail.
        let Ok(_permit) = pool.start_permits.acquire().await else {
            return;
        };
        if pool.is_draining() {
            return;
        }
        match pool.starter.start_vm().await {
            Ok(vm) => {
                let mut inner = pool.inner.lock().await;
                // Re-check capacity: acquires and other starts ran while booting.
                if inner.warm.len() + inner.active.len() >= pool.slots as usize {
                    drop(inner);
                    debug!(vm = %vm.id, "pool filled while booting, discarding VM");
                    vm.destroy().await;
                    return;
                }
                debug!(vm = %vm.id, warm = inner.warm.len() + 1, "VM added to warm queue");
                inner.warm.push_back(vm);
            }
            Err(e) => warn!(error = %e, "VM start failed, will retry on next tick"),
        }
    }

    /// Takes a warm VM for a task. Fails with [`Error::PoolExhausted`] when
    /// the warm queue is empty; never waits for warming.
    ///
    /// Linearizable: concurrent acquires each get a distinct VM.
    pub async fn acquire(&self) -> Result<VmTicket> {
        let mut inner = self.inner.lock().await;
        let mut vm = inner.warm.pop_front().ok_or(Error::PoolExhausted)?;
        vm.state = VmState::Running;
        let ticket = vm.ticket();
        inner.active.insert(vm.id, vm);
        Ok(ticket)
    }

    /// Destroys an active VM. Infallible: kill errors are swallowed and an
    /// unknown id is a no-op.
    pub async fn release(&self, id: VmId) {
        let vm = {
            let mut inner = self.inner.lock().await;
            inner.active.remove(&id)
        };
        match vm {
            Some(vm) => {
                vm.destroy().await;
                debug!(vm = %id, "VM released and destroyed");
            }
            None => warn!(vm = %id, "release of unknown VM ignored"),
        }
    }

    /// Current warm/active occupancy.
    pub async fn counts(&self) -> PoolCounts {
        let inner = self.inner.lock().await;
        PoolCounts {
            warm: inner.warm.len(),
            active: inner.active.len(),
        }
    }

    /// Total VM slots on this node.
    pub const fn slots(&self) -> u32 {
        self.slots
    }

    /// Marks the node as draining; the warmer stops replacing VMs.
    pub fn set_draining(&self, draining: bool) {
        self.draining.store(draining, Ordering::SeqCst);
    }

    /// Whether the node is draining.
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::SeqCst)
    }

    /// Destroys every VM, warm and active.
    pub async fn shutdown(&self) {
        let vms: Vec<Vm> = {
            let mut inner = self.inner.lock().await;
            let warm: Vec<Vm> = inner.warm.drain(..).collect();
            let active: Vec<Vm> = inner.active.drain().map(|(_, vm)| vm).collect();
            warm.into_iter().chain(active).collect()
        };
        info!(count = vms.len(), "destroying all pool VMs");
        for vm in vms {
            vm.destroy().await;
        }
    }

    /// Spawns the background replenisher.
    ///
    /// Each tick tops the warm queue up to the configured target unless the
    /// node is draining. Client acquires never wait on this task.
    pub fn spawn_warmer(
        pool: Arc<Self>,
        interval: Duration,
        mut stop: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if !pool.is_draining() {
                            Self::warm_to(&pool, pool.warm_target as usize).await;
                        }
                    }
                    _ = stop.changed() => {
                        debug!("warmer stopping");
                        return;
                    }
                }
            }
        })
    }
}
