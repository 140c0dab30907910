//! Driver for the `cursor-agent` CLI.
//!
//! Speaks the same stream-json framing as claude, with two quirks: no
//! `system/init` record (the session id rides on the first assistant
//! record) and a `result` record distinguished by `is_error`/`subtype`.

use std::path::Path;

use super::process::{base_command, probe_version, spawn_run, EventStream};
use super::stream_json::StreamJsonParser;
use super::{write_instructions, Availability, RunSpec};

const ENV_PREFIXES: &[&str] = &["CURSOR_"];

pub const INSTRUCTIONS_FILE: &str = ".cursorrules";
pub const DEFAULT_MODEL: &str = "auto";

#[derive(Debug, Clone)]
pub struct CursorAdapter {
    program: String,
}

impl Default for CursorAdapter {
    fn default() -> Self {
        Self {
            program: "cursor-agent".to_string(),
        }
    }
}

impl CursorAdapter {
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
        cmd.args(["--print", "--output-format", "stream-json", "--force"]);
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
