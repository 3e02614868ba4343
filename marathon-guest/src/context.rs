//! Cross-iteration context: the `MEMORY` note and the prompt prefix.

use std::path::Path;

/// Persistent note file the agent maintains in the work tree.
pub const MEMORY_FILE: &str = "MEMORY";

/// Most of `MEMORY` the prefix will carry (32 KiB).
pub const MEMORY_CAP: usize = 32 * 1024;

/// Most of the previous iteration's stdout the prefix will carry (4 KiB).
pub const PREV_OUTPUT_CAP: usize = 4 * 1024;

/// Builds the prompt for iteration `iteration` of `max_iterations`.
///
/// The first iteration gets the base prompt verbatim. Later iterations get
/// a context prefix: the `MEMORY` note, the tail of the previous stdout,
/// and the standing instructions on how to signal completion.
pub fn build_prompt(
    base_prompt: &str,
    completion_promise: Option<&str>,
    iteration: u32,
    max_iterations: u32,
    workdir: &Path,
    prev_stdout: &str,
) -> String {
    if iteration <= 1 {
        return base_prompt.to_owned();
    }

    let memory = std::fs::read_to_string(workdir.join(MEMORY_FILE)).unwrap_or_default();
    let memory = tail(&memory, MEMORY_CAP);
    let prev = tail(prev_stdout, PREV_OUTPUT_CAP);

    let promise_line = match completion_promise {
        Some(promise) if !promise.is_empty() => {
            format!("emit <promise>{promise}</promise> when the task is fully complete")
        }
        _ => "emit <promise>done</promise> when the task is fully complete".to_owned(),
    };

    format!(
        "This is iteration {iteration} of {max_iterations} on the same task.\n\
         \n\
         ## MEMORY (your persistent notes)\n\
         {memory}\n\
         \n\
         ## Output of the previous iteration (tail)\n\
         {prev}\n\
         \n\
         ## Instructions\n\
         - {promise_line}.\n\
         - If you are blocked on a question only the submitter can answer, \
         emit <clarification>your question</clarification>.\n\
         - Persist anything you need across iterations by writing to the \
         MEMORY file in the repository root.\n\
         \n\
         ## Task\n\
         {base_prompt}"
    )
}

/// Last `cap` bytes of `text`, trimmed to a char boundary.
fn tail(text: &str, cap: usize) -> &str {
    if text.len() <= cap {
        return text;
    }
    let mut start = text.len() - cap;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    &text[start..]
}
