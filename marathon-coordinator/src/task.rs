//! Task records and their lifecycle transitions.

use std::time::SystemTime;

use marathon_proto::{ClientId, NodeId, TaskId, TaskSpec, TaskState, UsageMetrics};

use crate::error::{Error, Result};

/// One submitted task, from acceptance to a terminal state.
#[derive(Debug, Clone)]
pub struct Task {
    /// Task identifier, assigned at submission.
    pub id: TaskId,
    /// Submitting client.
    pub owner: ClientId,
    /// Current lifecycle state.
    pub state: TaskState,
    /// The full descriptor dispatched to a node.
    pub spec: TaskSpec,
    /// Node the task is assigned to, once scheduled.
    pub assigned_node: Option<NodeId>,
    /// Accumulated usage across all iterations.
    pub usage: UsageMetrics,
    /// Submission time.
    pub created_at: SystemTime,
    /// When execution began on a node.
    pub started_at: Option<SystemTime>,
    /// When the task reached a terminal state.
    pub completed_at: Option<SystemTime>,
    /// Produced artifact URL, on success.
    pub artifact_url: Option<String>,
    /// Error message, on failure.
    pub error: Option<String>,
}

impl Task {
    /// Creates a freshly queued task.
    pub fn new(owner: ClientId, spec: TaskSpec) -> Self {
        Self {
            id: spec.task_id,
            owner,
            state: TaskState::Queued,
            spec,
            assigned_node: None,
            usage: UsageMetrics::default(),
            created_at: SystemTime::now(),
            started_at: None,
            completed_at: None,
            artifact_url: None,
            error: None,
        }
    }

    /// Transitions the task, enforcing terminal-state permanence and
    /// stamping the lifecycle timestamps.
    pub fn transition(&mut self, next: TaskState) -> Result<()> {
        if self.state.is_terminal() {
            return Err(Error::TerminalState {
                task: self.id,
                state: self.state,
            });
        }
        if next == TaskState::Running && self.started_at.is_none() {
            self.started_at = Some(SystemTime::now());
        }
        if next.is_terminal() {
            self.completed_at = Some(SystemTime::now());
        }
        self.state = next;
        Ok(())
    }

    /// Folds a usage delta into the task total. Monotone.
    pub fn add_usage(&mut self, delta: &UsageMetrics) {
        self.usage.merge(delta);
    }

    /// Clears the node assignment and re-queues the task (stale node or
    /// exhausted pool). Terminal tasks are left alone.
    pub fn requeue(&mut self) -> Result<()> {
        self.transition(TaskState::Queued)?;
        self.assigned_node = None;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use marathon_proto::Credentials;

    use super::*;

    fn task() -> Task {
        let spec = TaskSpec {
            task_id: TaskId::generate(),
            repo_url: "https://forge.test/o/r.git".into(),
            branch: "main".into(),
            prompt: "p".into(),
            credentials: Credentials {
                token: "t".into(),
                forge_host: "forge.test".into(),
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
    fn normal_lifecycle() {
        let mut t = task();
        assert_eq!(t.state, TaskState::Queued);
        t.transition(TaskState::Starting).unwrap();
        t.transition(TaskState::Running).unwrap();
        assert!(t.started_at.is_some());
        t.transition(TaskState::Completed).unwrap();
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn terminal_states_are_permanent() {
        for terminal in [TaskState::Completed, TaskState::Failed, TaskState::Cancelled] {
            let mut t = task();
            t.transition(terminal).unwrap();
            for next in [
                TaskState::Queued,
                TaskState::Starting,
                TaskState::Running,
                TaskState::Completed,
                TaskState::Failed,
                TaskState::Cancelled,
            ] {
                assert!(t.transition(next).is_err());
                assert_eq!(t.state, terminal);
            }
        }
    }

    #[test]
    fn usage_is_monotone() {
        let mut t = task();
        t.add_usage(&UsageMetrics {
            input_tokens: 5,
            ..UsageMetrics::default()
        });
        t.add_usage(&UsageMetrics {
            input_tokens: 7,
            tool_calls: 1,
            ..UsageMetrics::default()
        });
        assert_eq!(t.usage.input_tokens, 12);
        assert_eq!(t.usage.tool_calls, 1);
    }

    #[test]
    fn requeue_clears_assignment() {
        let mut t = task();
        t.transition(TaskState::Starting).unwrap();
        t.assigned_node = Some(NodeId::generate());
        t.requeue().unwrap();
        assert_eq!(t.state, TaskState::Queued);
        assert!(t.assigned_node.is_none());
    }
}
