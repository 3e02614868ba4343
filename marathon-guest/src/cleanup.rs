//! End-of-task cleanup strategies.
//!
//! Cleanup runs on every exit path — success, failure, cancellation — and
//! is never allowed to fail the task: missing paths are expected, anything
//! else is logged and skipped.

use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::process::Command;
use tracing::warn;

/// What to remove when the task ends, configured via
/// `MARATHON_CLEANUP_STRATEGY`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum CleanupStrategy {
    /// Delete work tree, agent cache, and credentials.
    #[default]
    Full,
    /// Delete work tree and credentials, keep the agent cache.
    KeepCache,
    /// Delete credentials and unset the credential helper, keep the tree.
    KeepWorkspace,
    /// Leave everything in place.
    None,
}

impl FromStr for CleanupStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "full" => Ok(Self::Full),
            "keep_cache" => Ok(Self::KeepCache),
            "keep_workspace" => Ok(Self::KeepWorkspace),
            "none" => Ok(Self::None),
            other => Err(format!("unknown cleanup strategy: {other}")),
        }
    }
}

impl CleanupStrategy {
    /// Reads `MARATHON_CLEANUP_STRATEGY`, defaulting to `full`. An
    /// unrecognized value is logged and also falls back to `full`.
    pub fn from_env() -> Self {
        match std::env::var("MARATHON_CLEANUP_STRATEGY") {
            Ok(raw) => raw.parse().unwrap_or_else(|e: String| {
                warn!(error = %e, "falling back to full cleanup");
                Self::Full
            }),
            Err(_) => Self::Full,
        }
    }
}

/// Filesystem locations a task leaves behind.
#[derive(Debug, Clone)]
pub struct CleanupPaths {
    /// Cloned work tree.
    pub workdir: PathBuf,
    /// Agent cache directory.
    pub cache_dir: PathBuf,
    /// Credentials helper file.
    pub credentials: PathBuf,
}

/// Executes the configured strategy. Infallible by design.
pub async fn run(strategy: CleanupStrategy, paths: &CleanupPaths) {
    match strategy {
        CleanupStrategy::Full => {
            remove_dir(&paths.workdir);
            remove_dir(&paths.cache_dir);
            remove_file(&paths.credentials);
        }
        CleanupStrategy::KeepCache => {
            remove_dir(&paths.workdir);
            remove_file(&paths.credentials);
        }
        CleanupStrategy::KeepWorkspace => {
            remove_file(&paths.credentials);
            unset_credential_helper(&paths.workdir).await;
        }
        CleanupStrategy::None => {}
    }
}

/// Removes a directory tree; missing is fine, other errors are logged.
fn remove_dir(path: &Path) {
    if let Err(e) = std::fs::remove_dir_all(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "cleanup: failed to remove directory");
    }
}

/// Removes a file; missing is fine, other errors are logged.
fn remove_file(path: &Path) {
    if let Err(e) = std::fs::remove_file(path)
        && e.kind() != io::ErrorKind::NotFound
    {
        warn!(path = %path.display(), error = %e, "cleanup: failed to remove file");
    }
}

/// Drops the credential-helper config from a kept work tree.
async fn unset_credential_helper(workdir: &Path) {
    let result = Command::new("git")
        .arg("-C")
        .arg(workdir)
        .args(["config", "--unset", "credential.helper"])
        .output()
        .await;
    if let Err(e) = result {
        warn!(error = %e, "cleanup: failed to unset credential helper");
    }
}
