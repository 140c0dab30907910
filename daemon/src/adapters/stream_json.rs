//! Parser for the `--output-format stream-json` protocol spoken by the
//! claude and cursor CLIs.
//!
//! Records arrive one JSON object per line: a `system/init` record that
//! reveals the session id, `assistant` records carrying content blocks,
//! `user` records carrying tool results, and a terminal `result` record
//! with outcome and usage stats.
//!
//! Assistant text is held back one record so the last fragment can be
//! flagged `final` when the result record arrives.

use std::collections::HashSet;

use overture_events::{CanonicalEvent, ErrorKind, RunMetrics};
use serde::Deserialize;
use serde_json::Value;

use super::process::{classify_exit, ExitSummary, GarbageBuffer, NativeParser};

// ============================================================================
// Native record shapes
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawRecord {
    System(RawSystem),
    Assistant(RawEnvelope),
    User(RawEnvelope),
    Result(RawResult),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawSystem {
    subtype: Option<String>,
    session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawEnvelope {
    session_id: Option<String>,
    message: RawMessageBody,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawMessageBody {
    content: Vec<RawBlock>,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawBlock {
    Text {
        text: String,
    },
    Thinking {
        #[serde(default)]
        thinking: String,
    },
    ToolUse {
        id: String,
        name: String,
        #[serde(default)]
        input: Value,
    },
    ToolResult {
        tool_use_id: String,
        #[serde(default)]
        content: Value,
        #[serde(default)]
        is_error: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawResult {
    subtype: Option<String>,
    is_error: bool,
    result: Option<String>,
    duration_ms: Option<u64>,
    num_turns: Option<u32>,
    total_cost_usd: Option<f64>,
    session_id: Option<String>,
}

enum Terminal {
    Complete(RunMetrics),
    Failed { kind: ErrorKind, message: String },
}

// ============================================================================
// Parser
// ============================================================================

pub(crate) struct StreamJsonParser {
    resume_attempted: bool,
    session_seen: bool,
    pending_text: Option<String>,
    completed_tools: HashSet<String>,
    emitted_any: bool,
    terminal: Option<Terminal>,
    garbage: GarbageBuffer,
}

impl StreamJsonParser {
    pub(crate) fn new(resume_attempted: bool) -> Self {
        Self {
            resume_attempted,
            session_seen: false,
            pending_text: None,
            completed_tools: HashSet::new(),
            emitted_any: false,
            terminal: None,
            garbage: GarbageBuffer::default(),
        }
    }

    fn session_info(&mut self, session_id: Option<String>) -> Option<CanonicalEvent> {
        let id = session_id.filter(|id| !id.is_empty())?;
        if self.session_seen {
            return None;
        }
        self.session_seen = true;
        Some(CanonicalEvent::SessionInfo {
            native_session_id: id,
        })
    }

    fn take_pending(&mut self, is_final: bool) -> Vec<CanonicalEvent> {
        self.pending_text
            .take()
            .map(|text| {
                vec![CanonicalEvent::AssistantText {
                    text,
                    is_final,
                }]
            })
            .unwrap_or_default()
    }

    fn tool_result(
        &mut self,
        tool_use_id: String,
        content: &Value,
        is_error: bool,
    ) -> Option<CanonicalEvent> {
        // A result can appear in both assistant and user records; emit once.
        if !self.completed_tools.insert(tool_use_id.clone()) {
            return None;
        }
        let text = flatten_content(content);
        Some(CanonicalEvent::ToolResult {
            call_id: tool_use_id,
            ok: !is_error,
            output: if is_error { None } else { text.clone() },
            error: if is_error { text } else { None },
        })
    }

    fn blocks(&mut self, envelope: RawEnvelope, out: &mut Vec<CanonicalEvent>) {
        // Cursor skips the system/init record; its first assistant record
        // still carries the session id.
        if let Some(info) = self.session_info(envelope.session_id) {
            out.push(info);
        }
        for block in envelope.message.content {
            match block {
                RawBlock::Text { text } => {
                    out.extend(self.take_pending(false));
                    self.pending_text = Some(text);
                }
                RawBlock::Thinking { .. } => {}
                RawBlock::ToolUse { id, name, input } => {
                    out.extend(self.take_pending(false));
                    out.push(CanonicalEvent::ToolCall {
                        call_id: id,
                        tool: name,
                        arguments: input,
                    });
                }
                RawBlock::ToolResult {
                    tool_use_id,
                    content,
                    is_error,
                } => {
                    out.extend(self.tool_result(tool_use_id, &content, is_error));
                }
                RawBlock::Unknown => {}
            }
        }
    }

    fn result(&mut self, result: RawResult, out: &mut Vec<CanonicalEvent>) {
        if let Some(info) = self.session_info(result.session_id.clone()) {
            out.push(info);
        }

        let failed = result.is_error
            || result
                .subtype
                .as_deref()
                .is_some_and(|s| s.starts_with("error"));

        if failed {
            out.extend(self.take_pending(false));
            let message = result
                .result
                .clone()
                .filter(|m| !m.is_empty())
                .or(result.subtype.clone())
                .unwrap_or_else(|| "CLI reported an error result".to_string());
            self.terminal = Some(Terminal::Failed {
                kind: classify_result_error(&message),
                message,
            });
            return;
        }

        let mut tail = self.take_pending(true);
        if tail.is_empty() {
            if let Some(text) = result.result.clone().filter(|t| !t.is_empty()) {
                tail.push(CanonicalEvent::AssistantText {
                    text,
                    is_final: true,
                });
            }
        }
        out.extend(tail);

        self.terminal = Some(Terminal::Complete(RunMetrics {
            duration_ms: result.duration_ms,
            num_turns: result.num_turns,
            total_cost_usd: result.total_cost_usd,
        }));
    }
}

impl NativeParser for StreamJsonParser {
    fn parse_line(&mut self, line: &str) -> Vec<CanonicalEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let record: RawRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(_) => {
                self.garbage.note(line);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        match record {
            RawRecord::System(system) => {
                if system.subtype.as_deref() != Some("status") {
                    out.extend(self.session_info(system.session_id));
                }
            }
            RawRecord::Assistant(envelope) | RawRecord::User(envelope) => {
                self.blocks(envelope, &mut out);
            }
            RawRecord::Result(result) => self.result(result, &mut out),
            RawRecord::Unknown => {}
        }

        if !out.is_empty() {
            self.emitted_any = true;
        }
        out
    }

    fn finish(&mut self, exit: ExitSummary) -> Vec<CanonicalEvent> {
        let mut out = Vec::new();

        match self.terminal.take() {
            Some(Terminal::Complete(metrics)) => {
                out.push(CanonicalEvent::status_complete(Some(metrics)));
            }
            Some(Terminal::Failed { kind, message }) => {
                out.push(CanonicalEvent::error(kind, message));
                out.push(CanonicalEvent::status_failed(kind));
            }
            None if exit.success && !self.garbage.seen_any() => {
                out.extend(self.take_pending(true));
                out.push(CanonicalEvent::status_complete(None));
            }
            None => {
                out.extend(self.take_pending(false));
                let (kind, message) = classify_exit(
                    &exit,
                    self.emitted_any,
                    self.resume_attempted,
                    self.garbage.seen_any(),
                );
                out.push(CanonicalEvent::error(kind, message));
                out.push(CanonicalEvent::status_failed(kind));
            }
        }
        out
    }
}

fn classify_result_error(message: &str) -> ErrorKind {
    let lower = message.to_lowercase();
    if lower.contains("rate limit") || lower.contains("429") || lower.contains("overloaded") {
        ErrorKind::RateLimited
    } else if lower.contains("login") || lower.contains("unauthorized") || lower.contains("api key")
    {
        ErrorKind::AuthMissing
    } else {
        ErrorKind::Internal
    }
}

/// Tool result payloads are either a plain string or a list of typed
/// blocks; anything else is serialized verbatim.
fn flatten_content(content: &Value) -> Option<String> {
    match content {
        Value::Null => None,
        Value::String(s) => Some(s.clone()),
        Value::Array(blocks) => {
            let joined: Vec<String> = blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(Value::as_str).map(str::to_string))
                .collect();
            if joined.is_empty() {
                serde_json::to_string(content).ok()
            } else {
                Some(joined.join("\n"))
            }
        }
        other => serde_json::to_string(other).ok(),
    }
}
