// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use serde_json::Value;

/// One recognized event on the agent's stdout stream.
///
/// The wire format is newline-delimited JSON; everything the gateway does
/// not recognize is deliberately ignored rather than treated as an error,
/// because the agent adds new record types over time.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    /// A chunk of assistant text.
    TextDelta { text: String },
    /// The final record of a turn, with cost/usage accounting.
    Result(AgentResult),
    /// Echo of a stdin line in persistent mode; receipt only.
    UserReceipt,
}

/// Payload of a `result` record.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentResult {
    pub text: String,
    pub session_id: Option<String>,
    pub cost: Option<f64>,
    pub tokens: Option<u64>,
}

/// Parse one line of the agent's stdout stream.
///
/// Returns `None` for blank lines, truncated JSON, unknown record types and
/// `stream_event` envelopes whose inner shape is not exactly a text delta.
/// Never panics: a hostile or garbled line is simply dropped and parsing
/// continues with the next one.
pub fn parse_stream_line(line: &str) -> Option<StreamEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let v: Value = serde_json::from_str(line).ok()?;

    match v.get("type").and_then(Value::as_str)? {
        "stream_event" => {
            let event = v.get("event")?;
            if event.get("type").and_then(Value::as_str) != Some("content_block_delta") {
                return None;
            }
            let delta = event.get("delta")?;
            if delta.get("type").and_then(Value::as_str) != Some("text_delta") {
                return None;
            }
            let text = delta.get("text").and_then(Value::as_str)?;
            if text.is_empty() {
                return None;
            }
            Some(StreamEvent::TextDelta { text: text.to_string() })
        }
        "result" => {
            let tokens = v.get("usage").map(|usage| {
                let input = usage.get("input_tokens").and_then(Value::as_u64).unwrap_or(0);
                let output = usage.get("output_tokens").and_then(Value::as_u64).unwrap_or(0);
                input + output
            });
            let cost = v
                .get("cost_usd")
                .and_then(Value::as_f64)
                .or_else(|| v.get("total_cost_usd").and_then(Value::as_f64));
            Some(StreamEvent::Result(AgentResult {
                text: v.get("result").and_then(Value::as_str).unwrap_or("").to_string(),
                session_id: v
                    .get("session_id")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                cost,
                tokens,
            }))
        }
        "user" => Some(StreamEvent::UserReceipt),
        _ => None,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
