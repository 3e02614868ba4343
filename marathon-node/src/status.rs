//! Live node-status sampling for heartbeats.

use std::path::PathBuf;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use marathon_proto::{NodeId, NodeStatus};
use tracing::debug;

use crate::pool::PoolCounts;

/// Cumulative CPU jiffies from `/proc/stat`.
#[derive(Debug, Default, Clone, Copy)]
struct CpuSample {
    /// Non-idle jiffies.
    busy: u64,
    /// All jiffies.
    total: u64,
}

/// Collects the node's self-reported status.
///
/// CPU usage is the busy fraction between successive collections, so the
/// first heartbeat reports 0.
#[derive(Debug)]
pub struct StatusCollector {
    /// This node's id.
    node_id: NodeId,
    /// Hostname, resolved once at startup.
    hostname: String,
    /// Total VM slots offered.
    total_slots: u32,
    /// Filesystem whose free space is reported.
    runtime_dir: PathBuf,
    /// Daemon start time, for uptime.
    started: Instant,
    /// Previous CPU sample for delta computation.
    cpu: Mutex<CpuSample>,
    /// Unix seconds of the last task start; 0 = never.
    last_task_at: AtomicU64,
}

impl StatusCollector {
    /// Creates a collector for this node.
    pub fn new(node_id: NodeId, total_slots: u32, runtime_dir: PathBuf) -> Self {
        let hostname = nix::unistd::gethostname()
            .map(|h| h.to_string_lossy().into_owned())
            .unwrap_or_else(|_| "unknown".to_owned());
        Self {
            node_id,
            hostname,
            total_slots,
            runtime_dir,
            started: Instant::now(),
            cpu: Mutex::new(CpuSample::default()),
            last_task_at: AtomicU64::new(0),
        }
    }

    /// Records that a task just started on this node.
    pub fn note_task_started(&self) {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_task_at.store(now, Ordering::SeqCst);
    }

    /// Samples the system and builds one status report.
    #[allow(clippy::cast_possible_truncation)]
    pub fn collect(&self, counts: PoolCounts, draining: bool) -> NodeStatus {
        let last = self.last_task_at.load(Ordering::SeqCst);
        NodeStatus {
            node_id: self.node_id,
            hostname: self.hostname.clone(),
            total_slots: self.total_slots,
            active_vms: counts.active as u32,
            warm_vms: counts.warm as u32,
            cpu_usage: self.cpu_fraction(),
            memory_usage: memory_fraction().unwrap_or(0.0),
            disk_free_bytes: disk_free_bytes(&self.runtime_dir),
            healthy: true,
            draining,
            uptime_secs: self.started.elapsed().as_secs(),
            last_task_at: (last != 0).then_some(last),
        }
    }

    /// Busy CPU fraction since the previous collection, clamped to `[0, 1]`.
    fn cpu_fraction(&self) -> f64 {
        let Some(current) = read_cpu_sample() else {
            return 0.0;
        };
        let Ok(mut prev) = self.cpu.lock() else {
            return 0.0;
        };
        let busy = current.busy.saturating_sub(prev.busy);
        let total = current.total.saturating_sub(prev.total);
        *prev = current;
        if total == 0 {
            0.0
        } else {
            #[allow(clippy::cast_precision_loss)]
            let fraction = busy as f64 / total as f64;
            fraction.clamp(0.0, 1.0)
        }
    }
}

/// Parses the aggregate `cpu` line of `/proc/stat`.
fn read_cpu_sample() -> Option<CpuSample> {
    let stat = std::fs::read_to_string("/proc/stat").ok()?;
    let line = stat.lines().next()?.strip_prefix("cpu ")?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .filter_map(|f| f.parse().ok())
        .collect();
    // user nice system idle iowait irq softirq steal ...
    if fields.len() < 4 {
        return None;
    }
    let total: u64 = fields.iter().sum();
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuSample {
        busy: total.saturating_sub(idle),
        total,
    })
}

/// Used-memory fraction from `/proc/meminfo`, when available.
fn memory_fraction() -> Option<f64> {
    let meminfo = std::fs::read_to_string("/proc/meminfo").ok()?;
    let mut total = None;
    let mut available = None;
    for line in meminfo.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total = parse_kib(rest);
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available = parse_kib(rest);
        }
    }
    let (total, available) = (total?, available?);
    if total == 0 {
        return None;
    }
    #[allow(clippy::cast_precision_loss)]
    let fraction = 1.0 - (available as f64 / total as f64);
    Some(fraction.clamp(0.0, 1.0))
}

/// Parses a `/proc/meminfo` value field (`"  16302396 kB"`).
fn parse_kib(rest: &str) -> Option<u64> {
    rest.split_whitespace().next()?.parse().ok()
}

/// Free bytes on the filesystem holding `path`, 0 when unavailable.
fn disk_free_bytes(path: &std::path::Path) -> u64 {
    match nix::sys::statvfs::statvfs(path) {
        Ok(stat) => u64::from(stat.blocks_available()) * u64::from(stat.fragment_size()),
        Err(e) => {
            debug!(path = %path.display(), error = %e, "statvfs failed");
            0
        }
    }
}
