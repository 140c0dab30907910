//! Driver for the `codex` CLI.
//!
//! Invocation: `codex exec --json` with the instruction as the trailing
//! argument; resume is `codex exec resume <id>`. Output is NDJSON of
//! thread items: `session.started`, `item.started` / `item.completed`
//! (agent messages, command executions, file changes), and a terminal
//! `turn.completed` / `turn.failed`.

use std::collections::HashSet;
use std::path::Path;

use overture_events::{CanonicalEvent, ErrorKind, RunMetrics};
use serde_json::Value;

use super::process::{
    base_command, classify_exit, probe_version, spawn_run, EventStream, ExitSummary,
    GarbageBuffer, NativeParser,
};
use super::{write_instructions, Availability, RunSpec};

const ENV_PREFIXES: &[&str] = &["OPENAI_", "CODEX_"];

pub const INSTRUCTIONS_FILE: &str = "AGENTS.md";
pub const DEFAULT_MODEL: &str = "gpt-5-codex";

#[derive(Debug, Clone)]
pub struct CodexAdapter {
    program: String,
}

impl Default for CodexAdapter {
    fn default() -> Self {
        Self {
            program: "codex".to_string(),
        }
    }
}

impl CodexAdapter {
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
        let mut cmd = base_command(&self.program, &spec.workspace, ENV_PREFIXES);
        let resume = spec.prior_session_id.is_some();
        match &spec.prior_session_id {
            Some(session) => {
                cmd.args(["exec", "resume", session]);
            }
            None => {
                cmd.arg("exec");
            }
        }
        cmd.args(["--json", "--skip-git-repo-check", "--color", "never"]);
        if let Some(model) = &spec.model {
            cmd.args(["--model", model]);
        }
        cmd.arg(&spec.instruction);

        spawn_run(
            cmd,
            CodexParser::new(resume),
            spec.cancel,
            spec.cancel_grace,
            None,
        )
    }
}

// ============================================================================
// NDJSON parser
// ============================================================================

enum Terminal {
    Complete(RunMetrics),
    Failed { kind: ErrorKind, message: String },
}

struct CodexParser {
    resume_attempted: bool,
    session_seen: bool,
    pending_text: Option<String>,
    started_items: HashSet<String>,
    emitted_any: bool,
    terminal: Option<Terminal>,
    garbage: GarbageBuffer,
}

impl CodexParser {
    fn new(resume_attempted: bool) -> Self {
        Self {
            resume_attempted,
            session_seen: false,
            pending_text: None,
            started_items: HashSet::new(),
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
        let direct = value
            .get("session_id")
            .or_else(|| value.get("conversation_id"))
            .or_else(|| value.get("thread_id"))
            .and_then(Value::as_str);
        let nested = value
            .get("session")
            .and_then(|s| s.get("id").or_else(|| s.get("session_id")))
            .and_then(Value::as_str);
        let id = direct.or(nested)?.to_string();
        if id.is_empty() {
            return None;
        }
        self.session_seen = true;
        Some(CanonicalEvent::SessionInfo {
            native_session_id: id,
        })
    }

    fn item(&mut self, started: bool, item: &Value, out: &mut Vec<CanonicalEvent>) {
        let item_type = item.get("type").and_then(Value::as_str).unwrap_or("");
        match item_type {
            "agent_message" => {
                if !started {
                    if let Some(text) = item.get("text").and_then(Value::as_str) {
                        out.extend(self.take_pending(false));
                        self.pending_text = Some(text.to_string());
                    }
                }
            }
            "reasoning" => {}
            _ => {
                let Some(id) = item.get("id").and_then(Value::as_str) else {
                    return;
                };
                if started {
                    out.extend(self.take_pending(false));
                    self.started_items.insert(id.to_string());
                    out.push(CanonicalEvent::ToolCall {
                        call_id: id.to_string(),
                        tool: item_type.to_string(),
                        arguments: item.clone(),
                    });
                } else {
                    // Some item kinds surface only as completed; synthesize
                    // the call so every result has a matching call.
                    if !self.started_items.contains(id) {
                        out.extend(self.take_pending(false));
                        self.started_items.insert(id.to_string());
                        out.push(CanonicalEvent::ToolCall {
                            call_id: id.to_string(),
                            tool: item_type.to_string(),
                            arguments: item.clone(),
                        });
                    }
                    let failed = item
                        .get("status")
                        .and_then(Value::as_str)
                        .is_some_and(|s| s == "failed")
                        || item
                            .get("exit_code")
                            .and_then(Value::as_i64)
                            .is_some_and(|c| c != 0);
                    let output = item
                        .get("aggregated_output")
                        .or_else(|| item.get("output"))
                        .and_then(Value::as_str)
                        .map(str::to_string);
                    out.push(CanonicalEvent::ToolResult {
                        call_id: id.to_string(),
                        ok: !failed,
                        output: if failed { None } else { output.clone() },
                        error: if failed { output } else { None },
                    });
                }
            }
        }
    }
}

impl NativeParser for CodexParser {
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
            "item.started" => {
                if let Some(item) = value.get("item") {
                    self.item(true, item, &mut out);
                }
            }
            "item.completed" => {
                if let Some(item) = value.get("item") {
                    self.item(false, item, &mut out);
                }
            }
            "turn.completed" => {
                out.extend(self.take_pending(true));
                self.terminal = Some(Terminal::Complete(RunMetrics::default()));
            }
            "turn.failed" | "error" => {
                out.extend(self.take_pending(false));
                let message = value
                    .get("error")
                    .and_then(|e| e.get("message"))
                    .or_else(|| value.get("message"))
                    .and_then(Value::as_str)
                    .unwrap_or("codex turn failed")
                    .to_string();
                let lower = message.to_lowercase();
                let kind = if lower.contains("rate limit") || lower.contains("429") {
                    ErrorKind::RateLimited
                } else if lower.contains("login") || lower.contains("api key") {
                    ErrorKind::AuthMissing
                } else if self.resume_attempted
                    && (lower.contains("session") || lower.contains("thread"))
                    && (lower.contains("not found") || lower.contains("expired"))
                {
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

    fn run_lines(lines: &[&str]) -> (CodexParser, Vec<CanonicalEvent>) {
        let mut parser = CodexParser::new(false);
        let mut out = Vec::new();
        for line in lines {
            out.extend(parser.parse_line(line));
        }
        (parser, out)
    }

    #[test]
    fn session_started_yields_session_info_once() {
        let (_, events) = run_lines(&[
            r#"{"type":"session.started","session":{"id":"0199a213-81ab-7800"}}"#,
            r#"{"type":"session.started","session":{"id":"other"}}"#,
        ]);
        assert_eq!(
            events,
            vec![CanonicalEvent::SessionInfo {
                native_session_id: "0199a213-81ab-7800".to_string()
            }]
        );
    }

    #[test]
    fn command_execution_maps_to_tool_call_and_result() {
        let (_, events) = run_lines(&[
            r#"{"type":"item.started","item":{"id":"item_1","type":"command_execution","command":"pnpm build"}}"#,
            r#"{"type":"item.completed","item":{"id":"item_1","type":"command_execution","command":"pnpm build","exit_code":0,"aggregated_output":"built"}}"#,
        ]);
        assert_eq!(events.len(), 2);
        assert!(matches!(
            &events[0],
            CanonicalEvent::ToolCall { call_id, tool, .. }
                if call_id == "item_1" && tool == "command_execution"
        ));
        assert_eq!(
            events[1],
            CanonicalEvent::ToolResult {
                call_id: "item_1".to_string(),
                ok: true,
                output: Some("built".to_string()),
                error: None,
            }
        );
    }

    #[test]
    fn completed_only_item_synthesizes_its_call() {
        let (_, events) = run_lines(&[
            r#"{"type":"item.completed","item":{"id":"item_2","type":"file_change","status":"completed"}}"#,
        ]);
        assert_eq!(events.len(), 2);
        assert!(matches!(&events[0], CanonicalEvent::ToolCall { .. }));
        assert!(matches!(
            &events[1],
            CanonicalEvent::ToolResult { ok: true, .. }
        ));
    }

    #[test]
    fn agent_message_is_finalized_by_turn_completed() {
        let (mut parser, events) = run_lines(&[
            r#"{"type":"item.completed","item":{"id":"item_3","type":"agent_message","text":"All done"}}"#,
            r#"{"type":"turn.completed","usage":{"input_tokens":10,"output_tokens":4}}"#,
        ]);
        assert_eq!(
            events,
            vec![CanonicalEvent::AssistantText {
                text: "All done".to_string(),
                is_final: true
            }]
        );
        let tail = parser.finish(ExitSummary {
            code: Some(0),
            success: true,
            stderr: String::new(),
        });
        assert!(matches!(
            tail.as_slice(),
            [CanonicalEvent::Status { .. }]
        ));
    }

    #[test]
    fn turn_failed_produces_error_then_failed_status() {
        let (mut parser, _) = run_lines(&[
            r#"{"type":"turn.failed","error":{"message":"rate limit exceeded"}}"#,
        ]);
        let tail = parser.finish(ExitSummary {
            code: Some(1),
            success: false,
            stderr: String::new(),
        });
        assert!(matches!(
            tail[0],
            CanonicalEvent::Error {
                kind: ErrorKind::RateLimited,
                retryable: true,
                ..
            }
        ));
        assert_eq!(
            tail[1],
            CanonicalEvent::status_failed(ErrorKind::RateLimited)
        );
    }

    #[test]
    fn reasoning_items_are_skipped() {
        let (_, events) = run_lines(&[
            r#"{"type":"item.completed","item":{"id":"item_4","type":"reasoning","text":"thinking..."}}"#,
        ]);
        assert!(events.is_empty());
    }
}
