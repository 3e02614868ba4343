//! Node configuration, sourced from `MARATHON_*` environment variables.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use marathon_proto::NodeId;

use crate::error::{Error, Result};

/// Runtime configuration for one node daemon.
#[derive(Debug, Clone)]
pub struct NodeConfig {
    /// This node's identifier. Generated when `MARATHON_NODE_ID` is unset.
    pub node_id: NodeId,
    /// Coordinator host.
    pub orchestrator_address: String,
    /// Coordinator port.
    pub orchestrator_port: u16,
    /// Total VM slots this node offers.
    pub vm_slots: u32,
    /// Warm VMs to keep pre-booted.
    pub warm_pool_target: u32,
    /// Base directory holding snapshot subdirectories.
    pub snapshot_dir: PathBuf,
    /// Kernel image for cold boots.
    pub kernel_path: PathBuf,
    /// Root filesystem image for cold boots.
    pub rootfs_path: PathBuf,
    /// Hypervisor binary invoked per VM.
    pub hypervisor_bin: PathBuf,
    /// Directory for per-VM sockets.
    pub runtime_dir: PathBuf,
    /// Interval between heartbeats.
    pub heartbeat_interval: Duration,
    /// Interval between warm-pool replenishment checks.
    pub warm_check_interval: Duration,
    /// How long to wait for a final guest frame after sending `CANCEL`.
    pub cancel_grace: Duration,
}

impl NodeConfig {
    /// Reads configuration from the environment.
    ///
    /// Unset variables fall back to defaults; set-but-malformed values are
    /// rejected rather than silently defaulted.
    pub fn from_env() -> Result<Self> {
        let node_id = match std::env::var("MARATHON_NODE_ID") {
            Ok(raw) => raw
                .parse()
                .map_err(|e| Error::Config(format!("MARATHON_NODE_ID: {e}")))?,
            Err(_) => NodeId::generate(),
        };

        Ok(Self {
            node_id,
            orchestrator_address: env_or("MARATHON_ORCHESTRATOR_ADDRESS", "127.0.0.1"),
            orchestrator_port: env_parse("MARATHON_ORCHESTRATOR_PORT", 7070)?,
            vm_slots: env_parse("MARATHON_VM_SLOTS", 8)?,
            warm_pool_target: env_parse("MARATHON_WARM_POOL_TARGET", 2)?,
            snapshot_dir: env_or("MARATHON_SNAPSHOT_DIR", "/var/lib/marathon/snapshots").into(),
            kernel_path: env_or("MARATHON_KERNEL_PATH", "/var/lib/marathon/vmlinux").into(),
            rootfs_path: env_or("MARATHON_ROOTFS_PATH", "/var/lib/marathon/rootfs.ext4").into(),
            hypervisor_bin: env_or("MARATHON_HYPERVISOR_BIN", "firecracker").into(),
            runtime_dir: env_or("MARATHON_RUNTIME_DIR", "/run/marathon").into(),
            heartbeat_interval: Duration::from_secs(env_parse(
                "MARATHON_HEARTBEAT_INTERVAL_SECS",
                10,
            )?),
            warm_check_interval: Duration::from_secs(env_parse(
                "MARATHON_WARM_CHECK_INTERVAL_SECS",
                2,
            )?),
            cancel_grace: Duration::from_secs(env_parse("MARATHON_CANCEL_GRACE_SECS", 5)?),
        })
    }

    /// `host:port` of the coordinator endpoint.
    pub fn orchestrator_endpoint(&self) -> String {
        format!("{}:{}", self.orchestrator_address, self.orchestrator_port)
    }
}

/// Returns the variable's value, or `default` when unset.
fn env_or(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_owned())
}

/// Parses the variable when set; unset falls back to `default`.
fn env_parse<T>(key: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| Error::Config(format!("{key}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_when_unset() {
        // Env-var access in tests is process-global; use keys no other test sets.
        let config = NodeConfig::from_env().unwrap();
        assert!(config.vm_slots > 0);
        assert!(config.heartbeat_interval > Duration::ZERO);
    }

    #[test]
    fn endpoint_formatting() {
        let mut config = NodeConfig::from_env().unwrap();
        config.orchestrator_address = "10.0.0.9".into();
        config.orchestrator_port = 9000;
        assert_eq!(config.orchestrator_endpoint(), "10.0.0.9:9000");
    }
}
