//! Append-only per-iteration log inside the work tree.

use std::io::{self, Write};
use std::path::Path;

/// Dot-directory holding marathon bookkeeping inside the clone.
pub const LOG_DIR: &str = ".marathon";

/// Iteration log file name.
pub const LOG_FILE: &str = "iterations.log";

/// Longest stdout summary kept per iteration (2 KiB).
const SUMMARY_CAP: usize = 2 * 1024;

/// Appends one iteration record to `.marathon/iterations.log`.
pub fn append(workdir: &Path, iteration: u32, exit_code: i32, summary: &str) -> io::Result<()> {
    let dir = workdir.join(LOG_DIR);
    std::fs::create_dir_all(&dir)?;

    let truncated = head(summary, SUMMARY_CAP);
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(LOG_FILE))?;
    write!(
        file,
        "\n--- Iteration {iteration} (exit_code={exit_code}) ---\n{truncated}\n"
    )
}

/// First `cap` bytes of `text`, trimmed to a char boundary.
fn head(text: &str, cap: usize) -> &str {
    if text.len() <= cap {
        return text;
    }
    let mut end = cap;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}
