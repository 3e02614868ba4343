//! One AI-agent invocation: spawn, drain, forward, collect.

use std::io;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use marathon_proto::{Message, OutputChannel};
use tokio::io::{AsyncReadExt, AsyncWrite};
use tokio::process::Command;

/// PATH handed to the agent process.
const MINIMAL_PATH: &str = "/usr/local/bin:/usr/bin:/bin";

/// Read buffer size for each stdio channel.
const CHUNK: usize = 4096;

/// Collected result of one agent invocation.
#[derive(Debug)]
pub struct AgentRun {
    /// Process exit code (`-1` if killed by a signal).
    pub exit_code: i32,
    /// Full stdout, lossily decoded.
    pub stdout: String,
    /// Full stderr, lossily decoded.
    pub stderr: String,
    /// Wall-clock duration of the invocation in milliseconds.
    pub duration_ms: u64,
}

/// Spawns the agent binary and drains it to completion.
///
/// Both stdio channels are drained concurrently; every chunk is forwarded
/// as an `OUTPUT` frame on `stream` as it arrives and buffered for the
/// caller. The prompt is passed as an argument requesting non-interactive
/// JSON output.
pub async fn run_agent<S>(
    stream: &mut S,
    bin: &Path,
    prompt: &str,
    workdir: &Path,
    env: &[(String, String)],
) -> io::Result<AgentRun>
where
    S: AsyncWrite + Unpin,
{
    let spawn_t0 = Instant::now();

    let mut cmd = Command::new(bin);
    cmd.current_dir(workdir)
        .args(["--non-interactive", "--output-format", "json", "--prompt"])
        .arg(prompt)
        .env_clear()
        .env("PATH", MINIMAL_PATH)
        .env("HOME", std::env::var("HOME").unwrap_or_else(|_| "/root".to_owned()))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (key, value) in env {
        cmd.env(key, value);
    }

    let mut child = cmd.spawn()?;

    // Pipes were requested above, so both are present.
    let Some(mut stdout) = child.stdout.take() else {
        unreachable!()
    };
    let Some(mut stderr) = child.stderr.take() else {
        unreachable!()
    };

    let mut stdout_buf = Vec::new();
    let mut stderr_buf = Vec::new();
    let mut stdout_chunk = [0u8; CHUNK];
    let mut stderr_chunk = [0u8; CHUNK];
    let mut stdout_done = false;
    let mut stderr_done = false;

    while !(stdout_done && stderr_done) {
        tokio::select! {
            n = stdout.read(&mut stdout_chunk), if !stdout_done => match n {
                Ok(0) | Err(_) => stdout_done = true,
                Ok(len) => {
                    stdout_buf.extend_from_slice(&stdout_chunk[..len]);
                    marathon_proto::send(stream, 0, &Message::Output {
                        channel: OutputChannel::Stdout,
                        data: stdout_chunk[..len].to_vec(),
                    }).await?;
                }
            },
            n = stderr.read(&mut stderr_chunk), if !stderr_done => match n {
                Ok(0) | Err(_) => stderr_done = true,
                Ok(len) => {
                    stderr_buf.extend_from_slice(&stderr_chunk[..len]);
                    marathon_proto::send(stream, 0, &Message::Output {
                        channel: OutputChannel::Stderr,
                        data: stderr_chunk[..len].to_vec(),
                    }).await?;
                }
            },
        }
    }

    let status = child.wait().await?;

    #[allow(clippy::cast_possible_truncation)]
    Ok(AgentRun {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&stdout_buf).into_owned(),
        stderr: String::from_utf8_lossy(&stderr_buf).into_owned(),
        duration_ms: spawn_t0.elapsed().as_millis() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Writes an executable stub agent script.
    #[cfg(unix)]
    fn stub_agent(tmp: &tempfile::TempDir, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let path = tmp.path().join("agent.sh");
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn captures_and_forwards_both_channels() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = stub_agent(&tmp, "echo out-line\necho err-line >&2\nexit 3");
        let (mut host, mut peer) = tokio::io::duplex(8192);

        let run = run_agent(&mut host, &agent, "prompt", tmp.path(), &[])
            .await
            .unwrap();
        assert_eq!(run.exit_code, 3);
        assert!(run.stdout.contains("out-line"));
        assert!(run.stderr.contains("err-line"));

        let mut saw_stdout = false;
        let mut saw_stderr = false;
        for _ in 0..2 {
            match marathon_proto::recv(&mut peer).await.unwrap() {
                (_, Message::Output { channel: OutputChannel::Stdout, data }) => {
                    assert!(String::from_utf8_lossy(&data).contains("out-line"));
                    saw_stdout = true;
                }
                (_, Message::Output { channel: OutputChannel::Stderr, data }) => {
                    assert!(String::from_utf8_lossy(&data).contains("err-line"));
                    saw_stderr = true;
                }
                (_, other) => panic!("unexpected frame {other:?}"),
            }
        }
        assert!(saw_stdout && saw_stderr);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn task_env_reaches_the_agent() {
        let tmp = tempfile::tempdir().unwrap();
        let agent = stub_agent(&tmp, "echo \"token=$FORGE_TOKEN\"");
        let (mut host, _peer) = tokio::io::duplex(8192);

        let run = run_agent(
            &mut host,
            &agent,
            "prompt",
            tmp.path(),
            &[("FORGE_TOKEN".into(), "tok-9".into())],
        )
        .await
        .unwrap();
        assert!(run.stdout.contains("token=tok-9"));
    }

    #[tokio::test]
    async fn missing_binary_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut host, _peer) = tokio::io::duplex(1024);
        let err = run_agent(
            &mut host,
            Path::new("/nonexistent/agent"),
            "prompt",
            tmp.path(),
            &[],
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::NotFound);
    }
}
