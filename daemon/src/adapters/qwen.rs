//! Driver for the `qwen` CLI.
//!
//! qwen-code is a gemini-cli fork; it shares the launch flags and the
//! stream-json framing, so this adapter reuses the gemini launch path
//! with its own binary, instructions file, and pass-through environment.

use std::path::Path;

use super::gemini;
use super::process::{probe_version, EventStream};
use super::{write_instructions, Availability, RunSpec};

const ENV_PREFIXES: &[&str] = &["QWEN_", "DASHSCOPE_", "OPENAI_"];

pub const INSTRUCTIONS_FILE: &str = "QWEN.md";
pub const DEFAULT_MODEL: &str = "qwen3-coder-plus";

#[derive(Debug, Clone)]
pub struct QwenAdapter {
    program: String,
}

impl Default for QwenAdapter {
    fn default() -> Self {
        Self {
            program: "qwen".to_string(),
        }
    }
}

impl QwenAdapter {
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
        gemini::run_with(&self.program, ENV_PREFIXES, spec)
    }
}
