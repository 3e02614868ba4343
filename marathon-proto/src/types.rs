//! Payload structs carried inside framed messages.

use std::io;

use crate::id::{NodeId, TaskId};
use crate::wire::{Reader, Writer};

/// Default iteration cap when a task does not specify one.
pub const DEFAULT_MAX_ITERATIONS: u32 = 50;

/// Vsock port the guest agent listens on inside every worker VM.
pub const AGENT_PORT: u32 = 5252;

/// Task lifecycle state, with its normative u8 wire/persistence mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum TaskState {
    /// Not yet known (zero value).
    #[default]
    Unspecified = 0,
    /// Accepted, waiting for a node.
    Queued = 1,
    /// Assigned to a node, VM being prepared.
    Starting = 2,
    /// Guest agent is iterating.
    Running = 3,
    /// Finished successfully. Terminal.
    Completed = 4,
    /// Finished with an error. Terminal.
    Failed = 5,
    /// Cancelled by the client. Terminal.
    Cancelled = 6,
}

impl TaskState {
    /// Returns `true` for states that admit no further transition.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Decodes the wire byte.
    pub const fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Unspecified),
            1 => Some(Self::Queued),
            2 => Some(Self::Starting),
            3 => Some(Self::Running),
            4 => Some(Self::Completed),
            5 => Some(Self::Failed),
            6 => Some(Self::Cancelled),
            _ => None,
        }
    }
}

impl std::fmt::Display for TaskState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Unspecified => "unspecified",
            Self::Queued => "queued",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        })
    }
}

/// Six monotone usage counters, additive per iteration and per client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UsageMetrics {
    /// Compute time in milliseconds.
    pub compute_ms: u64,
    /// Input tokens consumed.
    pub input_tokens: u64,
    /// Output tokens produced.
    pub output_tokens: u64,
    /// Tokens read from the provider cache.
    pub cache_read_tokens: u64,
    /// Tokens written to the provider cache.
    pub cache_write_tokens: u64,
    /// Tool invocations observed.
    pub tool_calls: u64,
}

impl UsageMetrics {
    /// Raises each counter to at least the value in `total`.
    ///
    /// Used when an authoritative cumulative report arrives after partial
    /// per-iteration reports were already merged; counters never decrease.
    pub fn absorb_total(&mut self, total: &Self) {
        self.compute_ms = self.compute_ms.max(total.compute_ms);
        self.input_tokens = self.input_tokens.max(total.input_tokens);
        self.output_tokens = self.output_tokens.max(total.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.max(total.cache_read_tokens);
        self.cache_write_tokens = self.cache_write_tokens.max(total.cache_write_tokens);
        self.tool_calls = self.tool_calls.max(total.tool_calls);
    }

    /// Fieldwise `self − earlier`, saturating at zero.
    pub fn delta_since(&self, earlier: &Self) -> Self {
        Self {
            compute_ms: self.compute_ms.saturating_sub(earlier.compute_ms),
            input_tokens: self.input_tokens.saturating_sub(earlier.input_tokens),
            output_tokens: self.output_tokens.saturating_sub(earlier.output_tokens),
            cache_read_tokens: self.cache_read_tokens.saturating_sub(earlier.cache_read_tokens),
            cache_write_tokens: self
                .cache_write_tokens
                .saturating_sub(earlier.cache_write_tokens),
            tool_calls: self.tool_calls.saturating_sub(earlier.tool_calls),
        }
    }

    /// Adds `other` into `self`, saturating. Counters never decrease.
    pub fn merge(&mut self, other: &Self) {
        self.compute_ms = self.compute_ms.saturating_add(other.compute_ms);
        self.input_tokens = self.input_tokens.saturating_add(other.input_tokens);
        self.output_tokens = self.output_tokens.saturating_add(other.output_tokens);
        self.cache_read_tokens = self.cache_read_tokens.saturating_add(other.cache_read_tokens);
        self.cache_write_tokens = self
            .cache_write_tokens
            .saturating_add(other.cache_write_tokens);
        self.tool_calls = self.tool_calls.saturating_add(other.tool_calls);
    }

    pub(crate) fn encode(&self, w: &mut Writer) {
        w.put_u64(self.compute_ms);
        w.put_u64(self.input_tokens);
        w.put_u64(self.output_tokens);
        w.put_u64(self.cache_read_tokens);
        w.put_u64(self.cache_write_tokens);
        w.put_u64(self.tool_calls);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> io::Result<Self> {
        Ok(Self {
            compute_ms: r.get_u64()?,
            input_tokens: r.get_u64()?,
            output_tokens: r.get_u64()?,
            cache_read_tokens: r.get_u64()?,
            cache_write_tokens: r.get_u64()?,
            tool_calls: r.get_u64()?,
        })
    }
}

/// Repository credentials handed to the guest for the duration of a task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    /// Access token injected into the credential helper file.
    pub token: String,
    /// Forge host the token authenticates against (e.g. a git host).
    pub forge_host: String,
}

impl Credentials {
    pub(crate) fn encode(&self, w: &mut Writer) {
        w.put_str(&self.token);
        w.put_str(&self.forge_host);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> io::Result<Self> {
        Ok(Self {
            token: r.get_str()?,
            forge_host: r.get_str()?,
        })
    }
}

/// Full task descriptor: everything the guest agent needs to run one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskSpec {
    /// Task identifier assigned at submission.
    pub task_id: TaskId,
    /// Repository to clone.
    pub repo_url: String,
    /// Branch to check out.
    pub branch: String,
    /// Base prompt for the AI agent.
    pub prompt: String,
    /// Repository credentials.
    pub credentials: Credentials,
    /// Whether the agent should produce an artifact (e.g. a pull request).
    pub create_artifact: bool,
    /// Optional artifact title.
    pub artifact_title: Option<String>,
    /// Optional artifact body.
    pub artifact_body: Option<String>,
    /// Completion promise the agent must emit to declare success.
    pub completion_promise: Option<String>,
    /// Iteration cap.
    pub max_iterations: u32,
    /// Extra environment variables for the agent process.
    pub env: Vec<(String, String)>,
}

impl TaskSpec {
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn encode(&self, w: &mut Writer) {
        w.put_raw(self.task_id.as_bytes());
        w.put_str(&self.repo_url);
        w.put_str(&self.branch);
        w.put_str(&self.prompt);
        self.credentials.encode(w);
        w.put_bool(self.create_artifact);
        w.put_opt_str(self.artifact_title.as_deref());
        w.put_opt_str(self.artifact_body.as_deref());
        w.put_opt_str(self.completion_promise.as_deref());
        w.put_u32(self.max_iterations);
        w.put_u32(self.env.len() as u32);
        for (k, v) in &self.env {
            w.put_str(k);
            w.put_str(v);
        }
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> io::Result<Self> {
        let task_id = TaskId::from_bytes(r.get_array()?);
        let repo_url = r.get_str()?;
        let branch = r.get_str()?;
        let prompt = r.get_str()?;
        let credentials = Credentials::decode(r)?;
        let create_artifact = r.get_bool()?;
        let artifact_title = r.get_opt_str()?;
        let artifact_body = r.get_opt_str()?;
        let completion_promise = r.get_opt_str()?;
        let max_iterations = r.get_u32()?;
        let env_len = r.get_u32()?;
        let mut env = Vec::with_capacity(env_len.min(256) as usize);
        for _ in 0..env_len {
            env.push((r.get_str()?, r.get_str()?));
        }
        Ok(Self {
            task_id,
            repo_url,
            branch,
            prompt,
            credentials,
            create_artifact,
            artifact_title,
            artifact_body,
            completion_promise,
            max_iterations,
            env,
        })
    }
}

/// One node's self-reported status, carried in every heartbeat.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeStatus {
    /// Node identifier.
    pub node_id: NodeId,
    /// Node hostname.
    pub hostname: String,
    /// Total VM slots on this node.
    pub total_slots: u32,
    /// VMs currently assigned to tasks.
    pub active_vms: u32,
    /// Pre-booted idle VMs.
    pub warm_vms: u32,
    /// CPU usage fraction in `[0, 1]`.
    pub cpu_usage: f64,
    /// Memory usage fraction in `[0, 1]`.
    pub memory_usage: f64,
    /// Free disk space in bytes.
    pub disk_free_bytes: u64,
    /// Whether the node considers itself healthy.
    pub healthy: bool,
    /// Whether the node is draining (no new assignments).
    pub draining: bool,
    /// Seconds since the node daemon started.
    pub uptime_secs: u64,
    /// Unix seconds of the last task start, if any.
    pub last_task_at: Option<u64>,
}

impl NodeStatus {
    /// Slots free for new assignments: `total - active`, never negative.
    pub const fn available_slots(&self) -> u32 {
        self.total_slots.saturating_sub(self.active_vms)
    }

    pub(crate) fn encode(&self, w: &mut Writer) {
        w.put_raw(self.node_id.as_bytes());
        w.put_str(&self.hostname);
        w.put_u32(self.total_slots);
        w.put_u32(self.active_vms);
        w.put_u32(self.warm_vms);
        w.put_f64(self.cpu_usage);
        w.put_f64(self.memory_usage);
        w.put_u64(self.disk_free_bytes);
        w.put_bool(self.healthy);
        w.put_bool(self.draining);
        w.put_u64(self.uptime_secs);
        w.put_opt_u64(self.last_task_at);
    }

    pub(crate) fn decode(r: &mut Reader<'_>) -> io::Result<Self> {
        Ok(Self {
            node_id: NodeId::from_bytes(r.get_array()?),
            hostname: r.get_str()?,
            total_slots: r.get_u32()?,
            active_vms: r.get_u32()?,
            warm_vms: r.get_u32()?,
            cpu_usage: r.get_f64()?,
            memory_usage: r.get_f64()?,
            disk_free_bytes: r.get_u64()?,
            healthy: r.get_bool()?,
            draining: r.get_bool()?,
            uptime_secs: r.get_u64()?,
            last_task_at: r.get_opt_u64()?,
        })
    }
}
