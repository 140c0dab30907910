//! System prompt loader.
//!
//! Role prompts are plain markdown files the daemon passes to adapter
//! initialization verbatim. The `bootstrap` role runs on a project's
//! first instruction, `builder` on everything after.

use std::path::PathBuf;

use tracing::debug;

pub const ROLE_BOOTSTRAP: &str = "bootstrap";
pub const ROLE_BUILDER: &str = "builder";

const DEFAULT_SYSTEM_PROMPT: &str = "\
# Overture build agent

You are an AI coding agent working inside a user's web-app project
workspace. Apply the user's instruction with small, surgical edits.
Never paste large code listings into chat; use your editing tools and
reply with a short summary of what changed.
";

pub struct PromptLoader {
    dir: Option<PathBuf>,
}

impl PromptLoader {
    pub fn new(dir: Option<PathBuf>) -> Self {
        Self { dir }
    }

    /// Read `<dir>/<role>.md`, falling back to the built-in prompt when
    /// the directory or file is absent.
    pub async fn load(&self, role: &str) -> String {
        if let Some(dir) = &self.dir {
            let path = dir.join(format!("{role}.md"));
            match tokio::fs::read_to_string(&path).await {
                Ok(content) if !content.trim().is_empty() => return content,
                Ok(_) => {
                    debug!(path = %path.display(), "prompt file is empty, using default");
                }
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "prompt file unavailable, using default");
                }
            }
        }
        DEFAULT_SYSTEM_PROMPT.to_string()
    }

    pub fn role_for(is_initial: bool) -> &'static str {
        if is_initial {
            ROLE_BOOTSTRAP
        } else {
            ROLE_BUILDER
        }
    }
}
