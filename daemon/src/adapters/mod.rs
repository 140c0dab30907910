//! Adapters: one driver per external AI coding CLI.
//!
//! The capability set is closed (`kind`, `available`, `initialize`,
//! `run`), so adapters are a tagged enum rather than an open trait
//! object; the registry stays a plain lookup table.

pub mod claude;
pub mod codex;
pub mod cursor;
pub mod gemini;
pub mod process;
pub mod qwen;
pub(crate) mod stream_json;

use std::path::{Path, PathBuf};
use std::time::Duration;

use overture_events::AgentKind;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

pub use claude::ClaudeAdapter;
pub use codex::CodexAdapter;
pub use cursor::CursorAdapter;
pub use gemini::GeminiAdapter;
pub use process::EventStream;
pub use qwen::QwenAdapter;

/// Result of a version probe.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Availability {
    pub installed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl Availability {
    pub fn missing(error: impl Into<String>) -> Self {
        Self {
            installed: false,
            version: None,
            error: Some(error.into()),
        }
    }
}

/// Everything an adapter needs to launch one run.
#[derive(Debug, Clone)]
pub struct RunSpec {
    pub workspace: PathBuf,
    pub instruction: String,
    /// Native model flag value, already resolved by the registry.
    pub model: Option<String>,
    pub prior_session_id: Option<String>,
    pub cancel: CancellationToken,
    pub cancel_grace: Duration,
}

/// Closed adapter set, dispatched by `AgentKind`.
#[derive(Debug, Clone)]
pub enum Adapter {
    Claude(ClaudeAdapter),
    Cursor(CursorAdapter),
    Codex(CodexAdapter),
    Gemini(GeminiAdapter),
    Qwen(QwenAdapter),
}

impl Adapter {
    pub fn default_for(kind: AgentKind) -> Self {
        match kind {
            AgentKind::Claude => Adapter::Claude(ClaudeAdapter::new()),
            AgentKind::Cursor => Adapter::Cursor(CursorAdapter::new()),
            AgentKind::Codex => Adapter::Codex(CodexAdapter::new()),
            AgentKind::Gemini => Adapter::Gemini(GeminiAdapter::new()),
            AgentKind::Qwen => Adapter::Qwen(QwenAdapter::new()),
        }
    }

    pub fn kind(&self) -> AgentKind {
        match self {
            Adapter::Claude(_) => AgentKind::Claude,
            Adapter::Cursor(_) => AgentKind::Cursor,
            Adapter::Codex(_) => AgentKind::Codex,
            Adapter::Gemini(_) => AgentKind::Gemini,
            Adapter::Qwen(_) => AgentKind::Qwen,
        }
    }

    pub async fn available(&self) -> Availability {
        match self {
            Adapter::Claude(a) => a.available().await,
            Adapter::Cursor(a) => a.available().await,
            Adapter::Codex(a) => a.available().await,
            Adapter::Gemini(a) => a.available().await,
            Adapter::Qwen(a) => a.available().await,
        }
    }

    pub async fn initialize(&self, workspace: &Path, system_prompt: &str) -> std::io::Result<()> {
        match self {
            Adapter::Claude(a) => a.initialize(workspace, system_prompt).await,
            Adapter::Cursor(a) => a.initialize(workspace, system_prompt).await,
            Adapter::Codex(a) => a.initialize(workspace, system_prompt).await,
            Adapter::Gemini(a) => a.initialize(workspace, system_prompt).await,
            Adapter::Qwen(a) => a.initialize(workspace, system_prompt).await,
        }
    }

    pub fn run(&self, spec: RunSpec) -> EventStream {
        match self {
            Adapter::Claude(a) => a.run(spec),
            Adapter::Cursor(a) => a.run(spec),
            Adapter::Codex(a) => a.run(spec),
            Adapter::Gemini(a) => a.run(spec),
            Adapter::Qwen(a) => a.run(spec),
        }
    }

    pub fn default_model(kind: AgentKind) -> &'static str {
        match kind {
            AgentKind::Claude => claude::DEFAULT_MODEL,
            AgentKind::Cursor => cursor::DEFAULT_MODEL,
            AgentKind::Codex => codex::DEFAULT_MODEL,
            AgentKind::Gemini => gemini::DEFAULT_MODEL,
            AgentKind::Qwen => qwen::DEFAULT_MODEL,
        }
    }
}

/// Seed the agent's instructions file from the system prompt. Repeated
/// calls with the same content leave the workspace byte-identical.
pub(crate) async fn write_instructions(
    workspace: &Path,
    file: &str,
    content: &str,
) -> std::io::Result<()> {
    let path = workspace.join(file);
    if let Ok(existing) = tokio::fs::read_to_string(&path).await {
        if existing == content {
            return Ok(());
        }
    }
    tokio::fs::create_dir_all(workspace).await?;
    tokio::fs::write(&path, content).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn default_adapters_carry_their_kind() {
        for kind in AgentKind::ALL {
            assert_eq!(Adapter::default_for(kind).kind(), kind);
        }
    }

    #[tokio::test]
    async fn initialize_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let adapter = Adapter::default_for(AgentKind::Claude);
        let prompt = "# Build agent\n\nKeep edits small.\n";

        adapter
            .initialize(dir.path(), prompt)
            .await
            .expect("first initialize");
        let path = dir.path().join(claude::INSTRUCTIONS_FILE);
        let first = std::fs::read(&path).expect("read");
        let first_mtime = std::fs::metadata(&path).expect("meta").modified().ok();

        adapter
            .initialize(dir.path(), prompt)
            .await
            .expect("second initialize");
        let second = std::fs::read(&path).expect("read");
        let second_mtime = std::fs::metadata(&path).expect("meta").modified().ok();

        assert_eq!(first, second);
        assert_eq!(first_mtime, second_mtime);
    }

    #[tokio::test]
    async fn initialize_rewrites_on_changed_prompt() {
        let dir = tempdir().expect("tempdir");
        let adapter = Adapter::default_for(AgentKind::Qwen);
        adapter
            .initialize(dir.path(), "v1")
            .await
            .expect("initialize");
        adapter
            .initialize(dir.path(), "v2")
            .await
            .expect("initialize");
        let content =
            std::fs::read_to_string(dir.path().join(qwen::INSTRUCTIONS_FILE)).expect("read");
        assert_eq!(content, "v2");
    }

    #[test]
    fn each_agent_has_a_distinct_instructions_file() {
        let files = [
            claude::INSTRUCTIONS_FILE,
            cursor::INSTRUCTIONS_FILE,
            codex::INSTRUCTIONS_FILE,
            gemini::INSTRUCTIONS_FILE,
            qwen::INSTRUCTIONS_FILE,
        ];
        let unique: std::collections::HashSet<_> = files.iter().collect();
        assert_eq!(unique.len(), files.len());
    }
}
