//! Completion-signal extraction from agent output.
//!
//! After every iteration the driver scans the agent's stdout for three
//! signals: the configured completion promise, a clarification request,
//! and a produced artifact URL. Their relative priority lives in the
//! decision table, not here.

/// Signals extracted from one iteration's stdout.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Signals {
    /// The configured completion promise was emitted.
    pub has_promise: bool,
    /// The agent asked a blocking question.
    pub needs_clarification: bool,
    /// The clarification question, when present.
    pub clarification: Option<String>,
    /// First artifact (pull-request) URL found, when present.
    pub artifact_url: Option<String>,
}

impl Signals {
    /// Whether an artifact URL was produced.
    pub const fn artifact_created(&self) -> bool {
        self.artifact_url.is_some()
    }
}

/// Scans `stdout` for all three signals.
///
/// The promise counts only when one is configured and non-empty, and either
/// a `<promise>` tag whose trimmed content equals it or the raw text is
/// present anywhere in the output.
pub fn extract(stdout: &str, completion_promise: Option<&str>) -> Signals {
    let has_promise = match completion_promise {
        Some(promise) if !promise.is_empty() => {
            tag_content(stdout, "promise").is_some_and(|tag| tag.trim() == promise)
                || stdout.contains(promise)
        }
        _ => false,
    };

    let clarification = tag_content(stdout, "clarification").map(str::to_owned);

    Signals {
        has_promise,
        needs_clarification: clarification.is_some(),
        clarification,
        artifact_url: find_artifact_url(stdout).map(str::to_owned),
    }
}

/// Returns the content of the first `<name>…</name>` tag pair.
fn tag_content<'a>(text: &'a str, name: &str) -> Option<&'a str> {
    let open = format!("<{name}>");
    let close = format!("</{name}>");
    let start = text.find(&open)? + open.len();
    let end = text[start..].find(&close)? + start;
    Some(&text[start..end])
}

/// Finds the first token that looks like a forge pull-request URL:
/// `https://<host>/<owner>/<repo>/pull/<n>`.
///
/// Tokens are split on whitespace and quote characters, so URLs embedded in
/// JSON output are still found.
fn find_artifact_url(text: &str) -> Option<&str> {
    text.split(|c: char| c.is_whitespace() || c == '"' || c == '\'')
        .find(|token| is_pull_request_url(token))
}

/// Validates the `https://<host>/<owner>/<repo>/pull/<n>` shape.
fn is_pull_request_url(token: &str) -> bool {
    let Some(rest) = token.strip_prefix("https://") else {
        return false;
    };
    let segments: Vec<&str> = rest.split('/').collect();
    matches!(
        segments.as_slice(),
        [host, owner, repo, "pull", number]
            if !host.is_empty()
                && !owner.is_empty()
                && !repo.is_empty()
                && !number.is_empty()
                && number.bytes().all(|b| b.is_ascii_digit())
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn promise_tag_match() {
        let signals = extract("work done <promise> TASK_COMPLETE </promise>", Some("TASK_COMPLETE"));
        assert!(signals.has_promise);
    }

    #[test]
    fn promise_raw_text_match() {
        let signals = extract("...TASK_COMPLETE...", Some("TASK_COMPLETE"));
        assert!(signals.has_promise);
    }

    #[test]
    fn promise_requires_configuration() {
        let signals = extract("<promise>TASK_COMPLETE</promise>", None);
        assert!(!signals.has_promise);
        let signals = extract("<promise></promise>", Some(""));
        assert!(!signals.has_promise);
    }

    #[test]
    fn mismatched_promise_tag_is_ignored() {
        let signals = extract("<promise>SOMETHING_ELSE</promise>", Some("TASK_COMPLETE"));
        assert!(!signals.has_promise);
    }

    #[test]
    fn clarification_captures_question() {
        let signals = extract("<clarification>Which DB?</clarification>", None);
        assert!(signals.needs_clarification);
        assert_eq!(signals.clarification.as_deref(), Some("Which DB?"));
    }

    #[test]
    fn pull_request_url_detected() {
        let signals = extract("opened https://example.test/a/b/pull/7 for review", None);
        assert!(signals.artifact_created());
        assert_eq!(
            signals.artifact_url.as_deref(),
            Some("https://example.test/a/b/pull/7")
        );
    }

    #[test]
    fn quoted_url_detected() {
        let signals = extract(r#"{"url":"https://example.test/a/b/pull/42"}"#, None);
        assert_eq!(
            signals.artifact_url.as_deref(),
            Some("https://example.test/a/b/pull/42")
        );
    }

    #[test]
    fn issue_url_is_not_an_artifact() {
        let signals = extract("see https://example.test/a/b/issues/7", None);
        assert!(!signals.artifact_created());
    }

    #[test]
    fn non_numeric_pull_segment_rejected() {
        let signals = extract("https://example.test/a/b/pull/abc", None);
        assert!(!signals.artifact_created());
    }
}
