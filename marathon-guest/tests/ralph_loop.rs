//! End-to-end iteration-loop scenarios with a stub agent binary.
//!
//! The "agent" is a shell script; the host side of the transport is an
//! in-memory duplex pipe. Each scenario drives `run_loop` to a terminal
//! frame and checks the frames the node daemon would have seen.

#![cfg(unix)]

use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use marathon_guest::cleanup::CleanupStrategy;
use marathon_guest::driver::{self, DriverConfig};
use marathon_guest::interceptor::ApiInterceptor;
use marathon_proto::{Credentials, Message, TaskId, TaskSpec};

/// Writes an executable stub agent script.
fn stub_agent(dir: &std::path::Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("agent.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

/// A counting stub that needs a state file between invocations.
fn counting_agent(dir: &std::path::Path, body_after_count: &str) -> PathBuf {
    stub_agent(
        dir,
        &format!(
            "n=$(cat \"$STATE_FILE\" 2>/dev/null || echo 0)\n\
             n=$((n+1))\n\
             echo \"$n\" > \"$STATE_FILE\"\n\
             {body_after_count}"
        ),
    )
}

struct Scenario {
    tmp: tempfile::TempDir,
    spec: TaskSpec,
    config: DriverConfig,
}

impl Scenario {
    fn new(promise: Option<&str>, max_iterations: u32) -> Self {
        let tmp = tempfile::tempdir().unwrap();
        let workdir = tmp.path().join("repo");
        std::fs::create_dir_all(&workdir).unwrap();

        let state_file = tmp.path().join("state");
        let spec = TaskSpec {
            task_id: TaskId::generate(),
            repo_url: "https://forge.test/o/r.git".into(),
            branch: "main".into(),
            prompt: "do the task".into(),
            credentials: Credentials {
                token: "t".into(),
                forge_host: "forge.test".into(),
            },
            create_artifact: false,
            artifact_title: None,
            artifact_body: None,
            completion_promise: promise.map(str::to_owned),
            max_iterations,
            env: vec![("STATE_FILE".into(), state_file.display().to_string())],
        };
        let config = DriverConfig {
            agent_bin: PathBuf::new(),
            workdir,
            cache_dir: tmp.path().join("cache"),
            cleanup: CleanupStrategy::None,
            iteration_delay: Duration::ZERO,
        };
        Self { tmp, spec, config }
    }

    fn with_agent(mut self, body: &str) -> Self {
        self.config.agent_bin = stub_agent(self.tmp.path(), body);
        self
    }

    fn with_counting_agent(mut self, body_after_count: &str) -> Self {
        self.config.agent_bin = counting_agent(self.tmp.path(), body_after_count);
        self
    }

    /// Runs the loop against a frame collector; returns all received frames.
    async fn run(&self) -> Vec<Message> {
        self.run_with_probe(|| Ok(false)).await
    }

    async fn run_with_probe(&self, probe: impl Fn() -> io::Result<bool>) -> Vec<Message> {
        let (mut guest, mut host) = tokio::io::duplex(1 << 16);
        let interceptor = ApiInterceptor::new();

        let drive = driver::run_loop(&mut guest, probe, &self.spec, &self.config, &interceptor);

        let collect = async {
            let mut frames = Vec::new();
            loop {
                let (_, msg) = marathon_proto::recv(&mut host).await.unwrap();
                let terminal =
                    matches!(msg, Message::Complete { .. } | Message::Error { .. });
                frames.push(msg);
                if terminal {
                    return frames;
                }
            }
        };

        let (result, frames) = tokio::join!(drive, collect);
        result.unwrap();
        frames
    }
}

/// Last frame must be COMPLETE; returns its fields.
fn expect_complete(frames: &[Message]) -> (i32, marathon_proto::UsageMetrics, u32, bool, Option<String>) {
    match frames.last().unwrap() {
        Message::Complete {
            exit_code,
            metrics,
            iteration,
            promise_found,
            artifact_url,
        } => (
            *exit_code,
            *metrics,
            *iteration,
            *promise_found,
            artifact_url.clone(),
        ),
        other => panic!("expected COMPLETE, got {other:?}"),
    }
}

/// Last frame must be ERROR; returns (code, message).
fn expect_error(frames: &[Message]) -> (String, String) {
    match frames.last().unwrap() {
        Message::Error { code, message } => (code.clone(), message.clone()),
        other => panic!("expected ERROR, got {other:?}"),
    }
}

#[tokio::test]
async fn single_iteration_promise_hit() {
    let frames = Scenario::new(Some("TASK_COMPLETE"), 1)
        .with_agent(
            "echo '<promise>TASK_COMPLETE</promise>'\n\
             echo '{\"usage\":{\"input_tokens\":10,\"output_tokens\":5}}'",
        )
        .run()
        .await;

    let (exit_code, metrics, iteration, promise_found, artifact) = expect_complete(&frames);
    assert_eq!(exit_code, 0);
    assert_eq!(iteration, 1);
    assert!(promise_found);
    assert!(artifact.is_none());
    assert_eq!(metrics.input_tokens, 10);
    assert_eq!(metrics.output_tokens, 5);
    assert!(matches!(
        frames.first().unwrap(),
        Message::Progress { iteration: 1, .. }
    ));
}

#[tokio::test]
async fn three_iterations_to_completion() {
    let frames = Scenario::new(Some("TASK_COMPLETE"), 5)
        .with_counting_agent(
            "if [ \"$n\" -ge 3 ]; then echo '<promise>TASK_COMPLETE</promise>'; fi\n\
             echo '{\"usage\":{\"input_tokens\":10}}'\n\
             exit 0",
        )
        .run()
        .await;

    let (_, metrics, iteration, promise_found, _) = expect_complete(&frames);
    assert_eq!(iteration, 3);
    assert!(promise_found);
    // Usage accumulates across the three iterations.
    assert_eq!(metrics.input_tokens, 30);

    let progress_count = frames
        .iter()
        .filter(|f| matches!(f, Message::Progress { .. }))
        .count();
    assert_eq!(progress_count, 3);
}

#[tokio::test]
async fn artifact_created_overrides_no_promise() {
    let frames = Scenario::new(None, 10)
        .with_counting_agent(
            "if [ \"$n\" -ge 2 ]; then\n\
             echo 'opened https://example.test/o/r/pull/42'\n\
             exit 0\n\
             else\n\
             exit 1\n\
             fi",
        )
        .run()
        .await;

    let (_, _, iteration, _, artifact) = expect_complete(&frames);
    assert_eq!(iteration, 2);
    assert_eq!(artifact.as_deref(), Some("https://example.test/o/r/pull/42"));
}

#[tokio::test]
async fn clarification_fails_the_task() {
    let frames = Scenario::new(Some("TASK_COMPLETE"), 5)
        .with_agent("echo '<clarification>Which DB?</clarification>'")
        .run()
        .await;

    let (code, message) = expect_error(&frames);
    assert_eq!(code, "needs_clarification");
    assert!(message.contains("Which DB?"));
}

#[tokio::test]
async fn cancel_between_iterations() {
    // The probe reports a pending CANCEL from the second iteration on.
    let polls = Arc::new(AtomicU32::new(0));
    let probe_polls = Arc::clone(&polls);

    let frames = Scenario::new(Some("TASK_COMPLETE"), 10)
        .with_agent("exit 0")
        .run_with_probe(move || Ok(probe_polls.fetch_add(1, Ordering::SeqCst) >= 1))
        .await;

    let (code, _) = expect_error(&frames);
    assert_eq!(code, "cancelled");

    // No second iteration began.
    assert!(!frames.iter().any(|f| matches!(
        f,
        Message::Progress { iteration: 2, .. }
    )));
}

#[tokio::test]
async fn iteration_cap_reached() {
    let frames = Scenario::new(Some("TASK_COMPLETE"), 2)
        .with_agent("echo still working")
        .run()
        .await;

    let (code, message) = expect_error(&frames);
    assert_eq!(code, "max_iterations");
    assert!(message.contains("iteration limit"));

    let progress_count = frames
        .iter()
        .filter(|f| matches!(f, Message::Progress { .. }))
        .count();
    assert_eq!(progress_count, 2);
}

#[tokio::test]
async fn credentials_reach_the_agent_environment() {
    // No promise, single iteration: completes on the clean exit.
    let frames = Scenario::new(None, 1)
        .with_agent("echo \"token=$MARATHON_FORGE_TOKEN host=$MARATHON_FORGE_HOST\"")
        .run()
        .await;

    expect_complete(&frames);
    let stdout: String = frames
        .iter()
        .filter_map(|f| match f {
            Message::Output { data, .. } => Some(String::from_utf8_lossy(data).into_owned()),
            _ => None,
        })
        .collect();
    assert!(stdout.contains("token=t"));
    assert!(stdout.contains("host=forge.test"));
}

#[tokio::test]
async fn iteration_records_accumulate_in_workdir() {
    let scenario = Scenario::new(Some("TASK_COMPLETE"), 2).with_agent("echo attempt output");
    let _ = scenario.run().await;

    let log =
        std::fs::read_to_string(scenario.config.workdir.join(".marathon/iterations.log")).unwrap();
    assert!(log.contains("--- Iteration 1 (exit_code=0) ---"));
    assert!(log.contains("--- Iteration 2 (exit_code=0) ---"));
    assert!(log.contains("attempt output"));
}
