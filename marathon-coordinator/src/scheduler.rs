//! Capacity-based node scoring and the pending-task queue.
//!
//! The assignment pass itself lives with the server (it needs the live node
//! connections); this module owns everything decidable from data: the score
//! formula, candidate selection, and the queue of unassigned tasks.

use std::collections::VecDeque;
use std::sync::Mutex;

use marathon_proto::{NodeStatus, TaskId};

/// Scores one node. Higher is better.
///
/// `0.5·(availableSlots/totalSlots) + 0.25·(1 − cpu) + 0.25·(1 − mem)`.
pub fn score(status: &NodeStatus) -> f64 {
    if status.total_slots == 0 {
        return 0.0;
    }
    let slot_ratio = f64::from(status.available_slots()) / f64::from(status.total_slots);
    0.5 * slot_ratio + 0.25 * (1.0 - status.cpu_usage) + 0.25 * (1.0 - status.memory_usage)
}

/// Picks the assignment target from a healthy-node snapshot.
///
/// Nodes without free slots are rejected; the highest scorer wins; score
/// ties break toward the lexicographically lowest node id so assignment is
/// deterministic.
pub fn pick_node(candidates: &[NodeStatus]) -> Option<&NodeStatus> {
    candidates
        .iter()
        .filter(|n| n.available_slots() > 0)
        .max_by(|a, b| {
            score(a)
                .total_cmp(&score(b))
                // Inverted id ordering: max_by keeps the *lowest* id on ties.
                .then_with(|| b.node_id.cmp(&a.node_id))
        })
}

/// FIFO queue of tasks waiting for a node.
///
/// A task is queued at most once at a time: the scheduling pass pops it,
/// and only a stale node or an exhausted pool puts it back.
#[derive(Debug, Default)]
pub struct TaskQueue {
    /// Pending task ids in submission order.
    inner: Mutex<VecDeque<TaskId>>,
}

impl TaskQueue {
    /// Appends a task to the back of the queue.
    pub fn enqueue(&self, id: TaskId) {
        if let Ok(mut queue) = self.inner.lock() {
            queue.push_back(id);
        }
    }

    /// Puts a task back at the front (no candidate this tick).
    pub fn requeue_front(&self, id: TaskId) {
        if let Ok(mut queue) = self.inner.lock() {
            queue.push_front(id);
        }
    }

    /// Takes the next pending task.
    pub fn pop(&self) -> Option<TaskId> {
        self.inner.lock().ok()?.pop_front()
    }

    /// Removes a task wherever it sits (client cancel while queued).
    pub fn remove(&self, id: TaskId) -> bool {
        let Ok(mut queue) = self.inner.lock() else {
            return false;
        };
        let before = queue.len();
        queue.retain(|queued| *queued != id);
        queue.len() != before
    }

    /// Number of pending tasks.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
