//! Node liveness and capacity registry.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use marathon_proto::{NodeId, NodeStatus};

/// Latest status plus when it was received.
///
/// Keeping both under one key makes the status and last-heartbeat maps
/// co-indexed by construction.
#[derive(Debug, Clone)]
struct Entry {
    /// Most recent reported status.
    status: NodeStatus,
    /// When the report arrived.
    last_heartbeat: Instant,
}

/// Tracks every known node's status and heartbeat freshness.
#[derive(Debug)]
pub struct NodeRegistry {
    /// Node entries under one mutex.
    nodes: Mutex<HashMap<NodeId, Entry>>,
    /// A node whose last heartbeat is older than this is stale.
    stale_timeout: Duration,
}

impl NodeRegistry {
    /// Creates a registry with the given stale timeout.
    pub fn new(stale_timeout: Duration) -> Self {
        Self {
            nodes: Mutex::new(HashMap::new()),
            stale_timeout,
        }
    }

    /// Upserts a node's status and refreshes its heartbeat. The first
    /// heartbeat from a node registers it.
    pub fn heartbeat(&self, status: NodeStatus) {
        self.heartbeat_at(status, Instant::now());
    }

    fn heartbeat_at(&self, status: NodeStatus, at: Instant) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(
                status.node_id,
                Entry {
                    status,
                    last_heartbeat: at,
                },
            );
        }
    }

    /// Point lookup of a node's latest status.
    pub fn get(&self, id: NodeId) -> Option<NodeStatus> {
        self.nodes
            .lock()
            .ok()?
            .get(&id)
            .map(|entry| entry.status.clone())
    }

    /// Snapshot of all nodes that are healthy, not draining, and fresh.
    pub fn healthy(&self) -> Vec<NodeStatus> {
        self.healthy_at(Instant::now())
    }

    fn healthy_at(&self, now: Instant) -> Vec<NodeStatus> {
        self.nodes
            .lock()
            .map(|nodes| {
                nodes
                    .values()
                    .filter(|e| {
                        e.status.healthy
                            && !e.status.draining
                            && now.duration_since(e.last_heartbeat) < self.stale_timeout
                    })
                    .map(|e| e.status.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Removes and returns every node whose heartbeat has gone stale.
    pub fn reap_stale(&self) -> Vec<NodeId> {
        self.reap_stale_at(Instant::now())
    }

    fn reap_stale_at(&self, now: Instant) -> Vec<NodeId> {
        let Ok(mut nodes) = self.nodes.lock() else {
            return Vec::new();
        };
        let stale: Vec<NodeId> = nodes
            .iter()
            .filter(|(_, e)| now.duration_since(e.last_heartbeat) >= self.stale_timeout)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            nodes.remove(id);
        }
        stale
    }

    /// Sum of available slots over eligible nodes.
    pub fn total_capacity(&self) -> u32 {
        self.healthy()
            .iter()
            .map(NodeStatus::available_slots)
            .sum()
    }
}
