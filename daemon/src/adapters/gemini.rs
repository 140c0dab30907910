//! Driver for the `gemini` CLI.
//!
//! Invocation: `gemini --output-format stream-json --yolo --prompt
//! <instruction>`. Events are JSON lines: an `init` record with the
//! session id, `content` chunks, `tool_call` / `tool_result` pairs, and
//! a terminal `result` or `error` record. The parser is deliberately
//! lenient about field spellings; the qwen CLI shares this lineage and
//! reuses it wholesale.

use std::path::Path;

use overture_events::{CanonicalEvent, ErrorKind, RunMetrics};
use serde_json::Value;

use super::process::{
    base_command, classify_exit, probe_version, spawn_run, EventStream, ExitSummary,
    GarbageBuffer, NativeParser,
};
use super::{write_instructions, Availability, RunSpec};

const ENV_PREFIXES: &[&str] = &["GEMINI_", "GOOGLE_"];

pub const INSTRUCTIONS_FILE: &str = "GEMINI.md";
pub const DEFAULT_MODEL: &str = "gemini-2.5-pro";

#[derive(Debug, Clone)]
pub struct GeminiAdapter {
    program: String,
}

impl Default for GeminiAdapter {
    fn default() -> Self {
        Self {
            program: "gemini".to_string(),
        }
    }
}

impl GeminiAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_program(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    pub async fn available(&self) -> Availability {
        probe_version(&self.program, &["--version"]).await
    }

    pub async fn initialize(&self, workspace: &Path, system_prompt: &str) -> std::io::Result<()> {
        write_instructions(workspace, INSTRUCTIONS_FILE, system_prompt).await
    }

    pub fn run(&self, spec: RunSpec) -> EventStream {
        run_with(&self.program, ENV_PREFIXES, spec)
    }
}

/// Shared launch path for the gemini-cli family.
pub(crate) fn run_with(program: &str, env_prefixes: &[&str], spec: RunSpec) -> EventStream {
    let mut cmd = base_command(program, &spec.workspace, env_prefixes);
    cmd.args(["--output-format", "stream-json", "--yolo"]);
    if let Some(model) = &spec.model {
        cmd.args(["--model", model]);
    }
    let resume = spec.prior_session_id.is_some();
    if let Some(session) = &spec.prior_session_id {
        cmd.args(["--resume", session]);
    }
    cmd.args(["--prompt", &spec.instruction]);

    spawn_run(
        cmd,
        GeminiStreamParser::new(resume),
        spec.cancel,
        spec.cancel_grace,
        None,
    )
}

// ============================================================================
// Parser
// ============================================================================

enum Terminal {
    Complete(RunMetrics),
    Failed { kind: ErrorKind, message: String },
}

pub(crate) struct GeminiStreamParser {
    resume_attempted: bool,
    session_seen: bool,
    pending_text: Option<String>,
    emitted_any: bool,
    terminal: Option<Terminal>,
    garbage: GarbageBuffer,
}

impl GeminiStreamParser {
    pub(crate) fn new(resume_attempted: bool) -> Self {
        Self {
            resume_attempted,
            session_seen: false,
            pending_text: None,
            emitted_any: false,
            terminal: None,
            garbage: GarbageBuffer::default(),
        }
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

    fn session_info(&mut self, value: &Value) -> Option<CanonicalEvent> {
        if self.session_seen {
            return None;
        }
        let id = value
            .get("session_id")
            .or_else(|| value.get("sessionId"))
            .and_then(Value::as_str)
            .filter(|id| !id.is_empty())?;
        self.session_seen = true;
        Some(CanonicalEvent::SessionInfo {
            native_session_id: id.to_string(),
        })
    }

    fn text_of(value: &Value) -> Option<String> {
        value
            .get("text")
            .or_else(|| value.get("content"))
            .or_else(|| value.get("delta"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    fn call_id_of(value: &Value) -> Option<String> {
        value
            .get("call_id")
            .or_else(|| value.get("callId"))
            .or_else(|| value.get("id"))
            .and_then(Value::as_str)
            .map(str::to_string)
    }
}

impl NativeParser for GeminiStreamParser {
    fn parse_line(&mut self, line: &str) -> Vec<CanonicalEvent> {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            return Vec::new();
        }

        let value: Value = match serde_json::from_str(trimmed) {
            Ok(value) => value,
            Err(_) => {
                self.garbage.note(line);
                return Vec::new();
            }
        };

        let mut out = Vec::new();
        out.extend(self.session_info(&value));

        match value.get("type").and_then(Value::as_str).unwrap_or("") {
            "content" | "assistant" | "message" => {
                if let Some(text) = Self::text_of(&value) {
                    out.extend(self.take_pending(false));
                    self.pending_text = Some(text);
                }
            }
            "tool_call" | "tool_use" => {
                if let Some(call_id) = Self::call_id_of(&value) {
                    out.extend(self.take_pending(false));
                    out.push(CanonicalEvent::ToolCall {
                        call_id,
                        tool: value
                            .get("name")
                            .or_else(|| value.get("tool"))
                            .and_then(Value::as_str)
                            .unwrap_or("tool")
                            .to_string(),
                        arguments: value
                            .get("args")
                            .or_else(|| value.get("arguments"))
                            .cloned()
                            .unwrap_or(Value::Null),
                    });
                }
            }
            "tool_result" => {
                if let Some(call_id) = Self::call_id_of(&value) {
                    let failed = value
                        .get("status")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s == "error" || s == "failed");
                    let output = value
                        .get("output")
                        .or_else(|| value.get("result"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    out.push(CanonicalEvent::ToolResult {
                        call_id,
                        ok: !failed,
                        output: if failed { None } else { output.clone() },
                        error: if failed { output } else { None },
                    });
                }
            }
            "result" | "turn_completed" => {
                out.extend(self.take_pending(true));
                let stats = value.get("stats").cloned().unwrap_or(Value::Null);
                self.terminal = Some(Terminal::Complete(RunMetrics {
                    duration_ms: stats.get("duration_ms").and_then(Value::as_u64),
                    num_turns: stats
                        .get("num_turns")
                        .and_then(Value::as_u64)
                        .map(|n| n as u32),
                    total_cost_usd: None,
                }));
            }
            "error" => {
                out.extend(self.take_pending(false));
                let message = value
                    .get("message")
                    .or_else(|| value.get("error"))
                    .and_then(Value::as_str)
                    .unwrap_or("CLI reported an error")
                    .to_string();
                let lower = message.to_lowercase();
                let kind = if lower.contains("rate limit")
                    || lower.contains("429")
                    || lower.contains("quota")
                {
                    ErrorKind::RateLimited
                } else if lower.contains("login") || lower.contains("api key") {
                    ErrorKind::AuthMissing
                } else if self.resume_attempted && lower.contains("session") {
                    ErrorKind::SessionStale
                } else {
                    ErrorKind::Internal
                };
                self.terminal = Some(Terminal::Failed { kind, message });
            }
            _ => {}
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_then_content_then_result() {
        let mut parser = GeminiStreamParser::new(false);
        let mut events = Vec::new();
        for line in [
            r#"{"type":"init","session_id":"g-sess-1","model":"gemini-2.5-pro"}"#,
            r#"{"type":"content","content":"Adding the page now."}"#,
            r#"{"type":"result","stats":{"duration_ms":900,"num_turns":1}}"#,
        ] {
            events.extend(parser.parse_line(line));
        }
        events.extend(parser.finish(ExitSummary {
            code: Some(0),
            success: true,
            stderr: String::new(),
        }));

        assert_eq!(
            events,
            vec![
                CanonicalEvent::SessionInfo {
                    native_session_id: "g-sess-1".to_string()
                },
                CanonicalEvent::AssistantText {
                    text: "Adding the page now.".to_string(),
                    is_final: true
                },
                CanonicalEvent::status_complete(Some(RunMetrics {
                    duration_ms: Some(900),
                    num_turns: Some(1),
                    total_cost_usd: None,
                })),
            ]
        );
    }

    #[test]
    fn tool_call_and_result_round_trip() {
        let mut parser = GeminiStreamParser::new(false);
        let call = parser.parse_line(
            r#"{"type":"tool_call","call_id":"c1","name":"write_file","args":{"path":"x"}}"#,
        );
        assert!(matches!(&call[0], CanonicalEvent::ToolCall { call_id, .. } if call_id == "c1"));

        let result = parser
            .parse_line(r#"{"type":"tool_result","call_id":"c1","status":"success","output":"ok"}"#);
        assert_eq!(
            result[0],
            CanonicalEvent::ToolResult {
                call_id: "c1".to_string(),
                ok: true,
                output: Some("ok".to_string()),
                error: None,
            }
        );
    }

    #[test]
    fn quota_error_is_rate_limited() {
        let mut parser = GeminiStreamParser::new(false);
        parser.parse_line(r#"{"type":"error","message":"Quota exceeded for model"}"#);
        let tail = parser.finish(ExitSummary {
            code: Some(1),
            success: false,
            stderr: String::new(),
        });
        assert!(matches!(
            tail[0],
            CanonicalEvent::Error {
                kind: ErrorKind::RateLimited,
                ..
            }
        ));
    }
}
