//! Persistence collaborators.
//!
//! The relational store lives outside this system; the coordinator only
//! needs these small surfaces. The in-memory implementations back tests
//! and single-process deployments.

use std::collections::HashMap;
use std::sync::Mutex;

use marathon_proto::{ClientId, NodeId, NodeStatus, TaskId, TaskState, UsageMetrics};

use crate::task::Task;

/// Durable task records. Every terminal state change is written through.
pub trait TaskStore: Send + Sync {
    /// Inserts a new task.
    fn insert(&self, task: Task);

    /// Point lookup.
    fn get(&self, id: TaskId) -> Option<Task>;

    /// Applies a mutation to a stored task. Returns `false` for unknown ids.
    fn update(&self, id: TaskId, mutate: &mut dyn FnMut(&mut Task)) -> bool;

    /// All tasks currently in `state`.
    fn in_state(&self, state: TaskState) -> Vec<Task>;

    /// Removes a task record (administrative pruning).
    fn remove(&self, id: TaskId) -> bool;
}

/// Durable node records.
pub trait NodeStore: Send + Sync {
    /// Inserts or refreshes a node record.
    fn upsert(&self, status: NodeStatus);

    /// Removes a node record.
    fn remove(&self, id: NodeId);
}

/// Mutex-protected in-memory [`TaskStore`].
#[derive(Debug, Default)]
pub struct InMemoryTaskStore {
    /// Task records by id.
    tasks: Mutex<HashMap<TaskId, Task>>,
}

impl TaskStore for InMemoryTaskStore {
    fn insert(&self, task: Task) {
        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.insert(task.id, task);
        }
    }

    fn get(&self, id: TaskId) -> Option<Task> {
        self.tasks.lock().ok()?.get(&id).cloned()
    }

    fn update(&self, id: TaskId, mutate: &mut dyn FnMut(&mut Task)) -> bool {
        let Ok(mut tasks) = self.tasks.lock() else {
            return false;
        };
        match tasks.get_mut(&id) {
            Some(task) => {
                mutate(task);
                true
            }
            None => false,
        }
    }

    fn in_state(&self, state: TaskState) -> Vec<Task> {
        self.tasks
            .lock()
            .map(|tasks| {
                tasks
                    .values()
                    .filter(|t| t.state == state)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove(&self, id: TaskId) -> bool {
        self.tasks
            .lock()
            .is_ok_and(|mut tasks| tasks.remove(&id).is_some())
    }
}

/// Mutex-protected in-memory [`NodeStore`].
#[derive(Debug, Default)]
pub struct InMemoryNodeStore {
    /// Node records by id.
    nodes: Mutex<HashMap<NodeId, NodeStatus>>,
}

impl NodeStore for InMemoryNodeStore {
    fn upsert(&self, status: NodeStatus) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.insert(status.node_id, status);
        }
    }

    fn remove(&self, id: NodeId) {
        if let Ok(mut nodes) = self.nodes.lock() {
            nodes.remove(&id);
        }
    }
}

/// Per-client cumulative usage, aggregated from task events.
#[derive(Debug, Default)]
pub struct UsageLedger {
    /// Monotone totals by client.
    totals: Mutex<HashMap<ClientId, UsageMetrics>>,
}

impl UsageLedger {
    /// Folds a delta into one client's totals.
    pub fn record(&self, client: ClientId, delta: &UsageMetrics) {
        if let Ok(mut totals) = self.totals.lock() {
            totals.entry(client).or_default().merge(delta);
        }
    }

    /// Snapshot of one client's totals.
    pub fn for_client(&self, client: ClientId) -> UsageMetrics {
        self.totals
            .lock()
            .ok()
            .and_then(|totals| totals.get(&client).copied())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use marathon_proto::{Credentials, TaskSpec};

    use super::*;

    fn sample_task() -> Task {
        let spec = TaskSpec {
            task_id: TaskId::generate(),
            repo_url: "r".into(),
            branch: "b".into(),
            prompt: "p".into(),
            credentials: Credentials {
                token: "t".into(),
                forge_host: "h".into(),
            },
            create_artifact: false,
            artifact_title: None,
            artifact_body: None,
            completion_promise: None,
            max_iterations: 1,
            env: Vec::new(),
        };
        Task::new(ClientId::generate(), spec)
    }

    #[test]
    fn insert_get_update_remove() {
        let store = InMemoryTaskStore::default();
        let task = sample_task();
        let id = task.id;

        store.insert(task);
        assert!(store.get(id).is_some());

        assert!(store.update(id, &mut |t| {
            t.transition(TaskState::Starting).unwrap();
        }));
        assert_eq!(store.get(id).unwrap().state, TaskState::Starting);
        assert_eq!(store.in_state(TaskState::Starting).len(), 1);

        assert!(store.remove(id));
        assert!(store.get(id).is_none());
        assert!(!store.update(id, &mut |_| {}));
    }

    #[test]
    fn ledger_accumulates_per_client() {
        let ledger = UsageLedger::default();
        let client = ClientId::generate();
        ledger.record(
            client,
            &UsageMetrics {
                input_tokens: 3,
                ..UsageMetrics::default()
            },
        );
        ledger.record(
            client,
            &UsageMetrics {
                input_tokens: 4,
                ..UsageMetrics::default()
            },
        );
        assert_eq!(ledger.for_client(client).input_tokens, 7);
        assert_eq!(
            ledger.for_client(ClientId::generate()),
            UsageMetrics::default()
        );
    }
}
