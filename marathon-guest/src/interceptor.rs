//! Per-call usage accounting scraped from the AI agent's structured output.
//!
//! The accumulator is a plain value owned by the driver and threaded into
//! whatever parses agent responses; there is deliberately no global
//! instance. The two parsers are stateless and usable on their own.

use std::sync::Mutex;

use marathon_proto::UsageMetrics;
use serde_json::Value;

/// Thread-safe accumulator for per-call usage statistics.
#[derive(Debug, Default)]
pub struct ApiInterceptor {
    /// Running totals.
    totals: Mutex<UsageMetrics>,
}

impl ApiInterceptor {
    /// Creates an empty accumulator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically folds one whole API response into the totals.
    ///
    /// Token counts come from the response's `usage` sub-object;
    /// `tool_calls` increments when any `content[*].type` is `"tool_use"`.
    pub fn record(&self, response: &Value) {
        let delta = response_usage(response);
        if let Ok(mut totals) = self.totals.lock() {
            totals.merge(&delta);
        }
    }

    /// Snapshot of the running totals.
    pub fn metrics(&self) -> UsageMetrics {
        self.totals.lock().map(|t| *t).unwrap_or_default()
    }

    /// Clears the totals.
    pub fn reset(&self) {
        if let Ok(mut totals) = self.totals.lock() {
            *totals = UsageMetrics::default();
        }
    }
}

/// Extracts usage counters from a whole-response JSON value.
pub fn response_usage(response: &Value) -> UsageMetrics {
    let usage = &response["usage"];
    let tool_use = response["content"]
        .as_array()
        .is_some_and(|blocks| blocks.iter().any(|b| b["type"] == "tool_use"));

    UsageMetrics {
        compute_ms: 0,
        input_tokens: count(usage, "input_tokens"),
        output_tokens: count(usage, "output_tokens"),
        cache_read_tokens: count(usage, "cache_read_input_tokens"),
        cache_write_tokens: count(usage, "cache_creation_input_tokens"),
        tool_calls: u64::from(tool_use),
    }
}

/// Reads a non-negative counter field, defaulting to 0.
fn count(usage: &Value, field: &str) -> u64 {
    usage[field].as_u64().unwrap_or(0)
}

/// One parsed server-sent streaming chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum StreamEvent {
    /// A message began.
    MessageStart,
    /// A non-tool content block began.
    ContentStart,
    /// A content block delta arrived.
    ContentDelta,
    /// A tool-use content block began.
    ToolUseStart,
    /// End-of-message delta carrying the output token count.
    MessageDelta {
        /// Output tokens reported for the message.
        output_tokens: u64,
    },
    /// A message ended.
    MessageStop,
    /// The stream terminator (`[DONE]`).
    Done,
}

/// Parses one streaming line of the form `data: <json-or-[DONE]>`.
///
/// Returns `None` for blank lines, non-data lines, unparseable JSON, and
/// event types this accounting does not care about.
pub fn parse_stream_chunk(line: &str) -> Option<StreamEvent> {
    let data = line.trim().strip_prefix("data:")?.trim_start();
    if data == "[DONE]" {
        return Some(StreamEvent::Done);
    }
    let value: Value = serde_json::from_str(data).ok()?;
    match value["type"].as_str()? {
        "message_start" => Some(StreamEvent::MessageStart),
        "content_block_start" => {
            if value["content_block"]["type"] == "tool_use" {
                Some(StreamEvent::ToolUseStart)
            } else {
                Some(StreamEvent::ContentStart)
            }
        }
        "content_block_delta" => Some(StreamEvent::ContentDelta),
        "message_delta" => Some(StreamEvent::MessageDelta {
            output_tokens: count(&value["usage"], "output_tokens"),
        }),
        "message_stop" => Some(StreamEvent::MessageStop),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(json: &str) -> Value {
        serde_json::from_str(json).unwrap()
    }

    #[test]
    fn record_accumulates_tokens_and_tool_calls() {
        let interceptor = ApiInterceptor::new();
        interceptor.record(&response(
            r#"{"usage":{"input_tokens":100,"output_tokens":20,
                "cache_read_input_tokens":5,"cache_creation_input_tokens":2},
               "content":[{"type":"text","text":"hi"},{"type":"tool_use","name":"bash"}]}"#,
        ));
        interceptor.record(&response(
            r#"{"usage":{"input_tokens":50,"output_tokens":10},
               "content":[{"type":"text","text":"done"}]}"#,
        ));

        let totals = interceptor.metrics();
        assert_eq!(totals.input_tokens, 150);
        assert_eq!(totals.output_tokens, 30);
        assert_eq!(totals.cache_read_tokens, 5);
        assert_eq!(totals.cache_write_tokens, 2);
        assert_eq!(totals.tool_calls, 1);
    }

    #[test]
    fn reset_clears_totals() {
        let interceptor = ApiInterceptor::new();
        interceptor.record(&response(r#"{"usage":{"input_tokens":9},"content":[]}"#));
        interceptor.reset();
        assert_eq!(interceptor.metrics(), UsageMetrics::default());
    }

    #[test]
    fn missing_usage_is_zero() {
        let usage = response_usage(&response(r#"{"content":[]}"#));
        assert_eq!(usage, UsageMetrics::default());
    }

    #[test]
    fn stream_chunk_events() {
        assert_eq!(
            parse_stream_chunk(r#"data: {"type":"message_start","message":{}}"#),
            Some(StreamEvent::MessageStart)
        );
        assert_eq!(
            parse_stream_chunk(
                r#"data: {"type":"content_block_start","content_block":{"type":"text"}}"#
            ),
            Some(StreamEvent::ContentStart)
        );
        assert_eq!(
            parse_stream_chunk(
                r#"data: {"type":"content_block_start","content_block":{"type":"tool_use"}}"#
            ),
            Some(StreamEvent::ToolUseStart)
        );
        assert_eq!(
            parse_stream_chunk(r#"data: {"type":"content_block_delta","delta":{}}"#),
            Some(StreamEvent::ContentDelta)
        );
        assert_eq!(
            parse_stream_chunk(r#"data: {"type":"message_delta","usage":{"output_tokens":42}}"#),
            Some(StreamEvent::MessageDelta { output_tokens: 42 })
        );
        assert_eq!(
            parse_stream_chunk(r#"data: {"type":"message_stop"}"#),
            Some(StreamEvent::MessageStop)
        );
        assert_eq!(parse_stream_chunk("data: [DONE]"), Some(StreamEvent::Done));
    }

    #[test]
    fn non_data_lines_are_skipped() {
        assert_eq!(parse_stream_chunk(""), None);
        assert_eq!(parse_stream_chunk("event: ping"), None);
        assert_eq!(parse_stream_chunk("data: not-json"), None);
    }
}
