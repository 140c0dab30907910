//! Driver for the `claude` CLI (Claude Code).
//!
//! Invocation: `claude --print --verbose --output-format stream-json`
//! with the instruction as the trailing argument. Sessions resume via
//! `--resume <id>`; the model is selected with `--model`.

use std::path::Path;

use super::process::{base_command, probe_version, spawn_run, EventStream};
use super::stream_json::StreamJsonParser;
use super::{write_instructions, Availability, RunSpec};

const ENV_PREFIXES: &[&str] = &["ANTHROPIC_", "CLAUDE_"];

pub const INSTRUCTIONS_FILE: &str = "CLAUDE.md";
pub const DEFAULT_MODEL: &str = "claude-sonnet-4-5-20250929";

#[derive(Debug, Clone)]
pub struct ClaudeAdapter {
    program: String,
}

impl Default for ClaudeAdapter {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
        }
    }
}

impl ClaudeAdapter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the executable; tests point this at scripted fixtures.
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
        cmd.args(["--print", "--verbose", "--output-format", "stream-json"]);
        if let Some(model) = &spec.model {
            cmd.args(["--model", model]);
        }
        let resume = spec.prior_session_id.is_some();
        if let Some(session) = &spec.prior_session_id {
            cmd.args(["--resume", session]);
        }
        cmd.arg(&spec.instruction);

        spawn_run(
            cmd,
            StreamJsonParser::new(resume),
            spec.cancel,
            spec.cancel_grace,
            None,
        )
    }
}
