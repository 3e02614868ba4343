//! The iterative task driver ("ralph loop").
//!
//! Runs the AI agent up to the iteration cap, carrying `MEMORY` and the
//! previous output forward, and terminates on the first completion signal.
//! All escape clauses live in one decision table so the priority order is
//! explicit and testable.

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use marathon_proto::{DEFAULT_MAX_ITERATIONS, Message, TaskSpec, UsageMetrics};
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info, warn};

use crate::cleanup::CleanupStrategy;
use crate::context;
use crate::interceptor::ApiInterceptor;
use crate::iterlog;
use crate::runner;
use crate::signals::{self, Signals};

/// Guest-side driver configuration, from `MARATHON_*` variables.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    /// AI agent binary to invoke each iteration.
    pub agent_bin: PathBuf,
    /// Where the repository is cloned.
    pub workdir: PathBuf,
    /// Agent cache directory (cleanup target).
    pub cache_dir: PathBuf,
    /// End-of-task cleanup strategy.
    pub cleanup: CleanupStrategy,
    /// Pause between iterations.
    pub iteration_delay: Duration,
}

impl DriverConfig {
    /// Reads the driver configuration from the environment.
    pub fn from_env() -> Self {
        Self {
            agent_bin: std::env::var("MARATHON_AGENT_BIN")
                .unwrap_or_else(|_| "/usr/local/bin/agent".to_owned())
                .into(),
            workdir: std::env::var("MARATHON_WORKDIR")
                .unwrap_or_else(|_| "/workspace/repo".to_owned())
                .into(),
            cache_dir: std::env::var("MARATHON_AGENT_CACHE")
                .unwrap_or_else(|_| "/root/.cache/agent".to_owned())
                .into(),
            cleanup: CleanupStrategy::from_env(),
            iteration_delay: Duration::from_secs(1),
        }
    }
}

/// Why an iteration concluded the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompleteReason {
    /// A pull-request URL appeared in the output.
    ArtifactCreated,
    /// The configured completion promise was emitted.
    PromiseSeen,
    /// No promise configured and the cap is a single iteration.
    SingleIteration,
    /// No promise configured and the agent exited cleanly.
    CleanExit,
}

/// Outcome of the per-iteration decision table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Emit `COMPLETE` and stop.
    Complete(CompleteReason),
    /// Emit a `needs_clarification` error and stop.
    Clarify,
    /// Run another iteration.
    Continue,
}

/// The decision table. Priority is top to bottom:
/// artifact, promise, clarification, then the no-promise exit rules.
pub fn decide(
    signals: &Signals,
    promise_configured: bool,
    max_iterations: u32,
    exit_code: i32,
) -> Decision {
    if signals.artifact_created() {
        return Decision::Complete(CompleteReason::ArtifactCreated);
    }
    if signals.has_promise {
        return Decision::Complete(CompleteReason::PromiseSeen);
    }
    if signals.needs_clarification {
        return Decision::Clarify;
    }
    if !promise_configured {
        if max_iterations == 1 {
            return Decision::Complete(CompleteReason::SingleIteration);
        }
        if exit_code == 0 {
            return Decision::Complete(CompleteReason::CleanExit);
        }
        // Non-zero exit with no promise configured: transient agent crash.
        return Decision::Continue;
    }
    // Promise configured but not yet seen.
    Decision::Continue
}

/// Best-effort parse of the agent's JSON envelope from stdout.
///
/// Tries the whole output first, then the last non-empty line (agents often
/// print the envelope after free-form logs). Unparseable output is fine.
pub fn parse_envelope(stdout: &str) -> Option<Value> {
    if let Ok(value) = serde_json::from_str::<Value>(stdout.trim()) {
        return Some(value);
    }
    let last = stdout.lines().rev().find(|l| !l.trim().is_empty())?;
    serde_json::from_str(last.trim()).ok()
}

/// Runs the iteration loop to a terminal frame.
///
/// `cancel_pending` is the non-consuming transport peek, polled between
/// iterations only. Every terminal path emits exactly one `COMPLETE` or
/// `ERROR` frame on `stream` before returning; transport failures abort
/// the loop with the underlying error.
pub async fn run_loop<S, P>(
    stream: &mut S,
    cancel_pending: P,
    spec: &TaskSpec,
    config: &DriverConfig,
    interceptor: &ApiInterceptor,
) -> io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
    P: Fn() -> io::Result<bool>,
{
    let cap = if spec.max_iterations == 0 {
        DEFAULT_MAX_ITERATIONS
    } else {
        spec.max_iterations
    };
    let promise = spec.completion_promise.as_deref().filter(|p| !p.is_empty());
    let mut prev_stdout = String::new();
    let mut compute_ms = 0u64;

    // The agent talks to the forge directly too, so the credentials ride
    // its environment alongside the task overrides.
    let mut agent_env = spec.env.clone();
    agent_env.push((
        "MARATHON_FORGE_TOKEN".to_owned(),
        spec.credentials.token.clone(),
    ));
    agent_env.push((
        "MARATHON_FORGE_HOST".to_owned(),
        spec.credentials.forge_host.clone(),
    ));

    for iteration in 1..=cap {
        if cancel_pending().unwrap_or(false) {
            info!(iteration, "cancel observed between iterations");
            return send_error(stream, "cancelled", "task cancelled between iterations").await;
        }

        marathon_proto::send(
            stream,
            0,
            &Message::Progress {
                iteration,
                max_iterations: cap,
                status: "running".into(),
            },
        )
        .await?;

        let prompt = context::build_prompt(
            &spec.prompt,
            promise,
            iteration,
            cap,
            &config.workdir,
            &prev_stdout,
        );

        let run = match runner::run_agent(
            stream,
            &config.agent_bin,
            &prompt,
            &config.workdir,
            &agent_env,
        )
        .await
        {
            Ok(run) => run,
            Err(e) => {
                warn!(error = %e, "agent process could not be run");
                return send_error(stream, "agent_spawn_failed", &e.to_string()).await;
            }
        };
        compute_ms = compute_ms.saturating_add(run.duration_ms);

        match parse_envelope(&run.stdout) {
            Some(envelope) => interceptor.record(&envelope),
            None => debug!(iteration, "no parseable JSON envelope in agent output"),
        }

        if let Err(e) = iterlog::append(&config.workdir, iteration, run.exit_code, &run.stdout) {
            warn!(error = %e, "failed to append iteration record");
        }

        let signals = signals::extract(&run.stdout, promise);
        debug!(iteration, exit_code = run.exit_code, ?signals, "iteration finished");

        match decide(&signals, promise.is_some(), cap, run.exit_code) {
            Decision::Complete(reason) => {
                info!(iteration, ?reason, "task complete");
                let metrics = cumulative(interceptor, compute_ms);
                return marathon_proto::send(
                    stream,
                    0,
                    &Message::Complete {
                        exit_code: run.exit_code,
                        metrics,
                        iteration,
                        promise_found: signals.has_promise,
                        artifact_url: signals.artifact_url,
                    },
                )
                .await;
            }
            Decision::Clarify => {
                let question = signals.clarification.unwrap_or_default();
                return send_error(stream, "needs_clarification", &question).await;
            }
            Decision::Continue => {
                prev_stdout = run.stdout;
                tokio::time::sleep(config.iteration_delay).await;
            }
        }
    }

    send_error(
        stream,
        "max_iterations",
        "Reached iteration limit without completion",
    )
    .await
}

/// Totals from the interceptor plus the driver-tracked compute time.
fn cumulative(interceptor: &ApiInterceptor, compute_ms: u64) -> UsageMetrics {
    let mut metrics = interceptor.metrics();
    metrics.merge(&UsageMetrics {
        compute_ms,
        ..UsageMetrics::default()
    });
    metrics
}

/// Emits one terminal `ERROR` frame.
pub async fn send_error<S>(stream: &mut S, code: &str, message: &str) -> io::Result<()>
where
    S: AsyncWrite + Unpin,
{
    marathon_proto::send(
        stream,
        0,
        &Message::Error {
            code: code.to_owned(),
            message: message.to_owned(),
        },
    )
    .await
}
