//! Canonical event schema.
//!
//! Adapters normalize their CLI's native output into [`CanonicalEvent`]s;
//! everything downstream (persistence, broadcast, clients) consumes only
//! this schema. Variants are tagged by `type` in `snake_case`, which is
//! also the frame type on the wire.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::message::MessageRole;

/// Closed set of supported external agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentKind {
    Claude,
    Cursor,
    Codex,
    Gemini,
    Qwen,
}

impl AgentKind {
    pub const ALL: [AgentKind; 5] = [
        AgentKind::Claude,
        AgentKind::Cursor,
        AgentKind::Codex,
        AgentKind::Gemini,
        AgentKind::Qwen,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Cursor => "cursor",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
            AgentKind::Qwen => "qwen",
        }
    }
}

impl fmt::Display for AgentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown agent kind: {0}")]
pub struct UnknownAgent(String);

impl FromStr for AgentKind {
    type Err = UnknownAgent;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "claude" => Ok(AgentKind::Claude),
            "cursor" => Ok(AgentKind::Cursor),
            "codex" => Ok(AgentKind::Codex),
            "gemini" => Ok(AgentKind::Gemini),
            "qwen" => Ok(AgentKind::Qwen),
            other => Err(UnknownAgent(other.to_string())),
        }
    }
}

/// Failure taxonomy carried by `Error` events and failed `Status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    CliNotInstalled,
    SpawnFailed,
    AuthMissing,
    CrashedBeforeFirstEvent,
    SessionStale,
    RateLimited,
    ModelFallback,
    Timeout,
    Cancelled,
    Protocol,
    Internal,
}

impl ErrorKind {
    /// Whether a retry (by the orchestrator or the client) can succeed.
    pub fn retryable(&self) -> bool {
        matches!(self, ErrorKind::SessionStale | ErrorKind::RateLimited)
    }

    /// Whether a run failing with this kind triggers the one-shot retry
    /// against the fallback agent. Mid-stream failures never do; these are
    /// all "the requested CLI could not run at all" classes.
    pub fn fallback_eligible(&self) -> bool {
        matches!(
            self,
            ErrorKind::CliNotInstalled
                | ErrorKind::SpawnFailed
                | ErrorKind::AuthMissing
                | ErrorKind::CrashedBeforeFirstEvent
                | ErrorKind::Protocol
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::CliNotInstalled => "cli_not_installed",
            ErrorKind::SpawnFailed => "spawn_failed",
            ErrorKind::AuthMissing => "auth_missing",
            ErrorKind::CrashedBeforeFirstEvent => "crashed_before_first_event",
            ErrorKind::SessionStale => "session_stale",
            ErrorKind::RateLimited => "rate_limited",
            ErrorKind::ModelFallback => "model_fallback",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Protocol => "protocol",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Lifecycle phase carried by `Status` events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StatusPhase {
    Start,
    Complete,
    Cancelled,
    Failed,
    Fellback,
}

impl StatusPhase {
    /// `start` and `fellback` are informational; everything else ends a run.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            StatusPhase::Complete | StatusPhase::Cancelled | StatusPhase::Failed
        )
    }
}

/// Run metrics reported by the CLI's terminal record, folded into the
/// terminal `Status{complete}` event so clients can render cost notices.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_turns: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_cost_usd: Option<f64>,
}

impl RunMetrics {
    pub fn is_empty(&self) -> bool {
        self.duration_ms.is_none() && self.num_turns.is_none() && self.total_cost_usd.is_none()
    }
}

/// The uniform event schema the core emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum CanonicalEvent {
    /// Streaming natural-language reply fragment; `final` marks the end of
    /// the turn's text.
    AssistantText {
        text: String,
        #[serde(rename = "final")]
        is_final: bool,
    },
    /// The agent invoked a tool (file edit, shell command, search).
    ToolCall {
        call_id: String,
        tool: String,
        arguments: serde_json::Value,
    },
    /// Result for a prior `ToolCall` with the same `call_id`.
    ToolResult {
        call_id: String,
        ok: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        output: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },
    /// Emitted at most once per run when the CLI reveals its session id.
    SessionInfo { native_session_id: String },
    /// Run lifecycle marker.
    Status {
        phase: StatusPhase,
        /// Agent the run executes on; present on `start`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        agent: Option<AgentKind>,
        /// Native model flag the run was started with; present on `start`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        model: Option<String>,
        /// Failure kind; present on `failed`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        kind: Option<ErrorKind>,
        /// Present on `fellback`.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<AgentKind>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        to: Option<AgentKind>,
        /// Run metrics; present on `complete` when the CLI reported them.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        meta: Option<RunMetrics>,
    },
    Error {
        kind: ErrorKind,
        message: String,
        retryable: bool,
    },
}

impl CanonicalEvent {
    pub fn status_start(agent: AgentKind, model: Option<String>) -> Self {
        CanonicalEvent::Status {
            phase: StatusPhase::Start,
            agent: Some(agent),
            model,
            kind: None,
            from: None,
            to: None,
            meta: None,
        }
    }

    pub fn status_complete(meta: Option<RunMetrics>) -> Self {
        CanonicalEvent::Status {
            phase: StatusPhase::Complete,
            agent: None,
            model: None,
            kind: None,
            from: None,
            to: None,
            meta: meta.filter(|m| !m.is_empty()),
        }
    }

    pub fn status_cancelled() -> Self {
        CanonicalEvent::Status {
            phase: StatusPhase::Cancelled,
            agent: None,
            model: None,
            kind: None,
            from: None,
            to: None,
            meta: None,
        }
    }

    pub fn status_failed(kind: ErrorKind) -> Self {
        CanonicalEvent::Status {
            phase: StatusPhase::Failed,
            agent: None,
            model: None,
            kind: Some(kind),
            from: None,
            to: None,
            meta: None,
        }
    }

    pub fn status_fellback(from: AgentKind, to: AgentKind) -> Self {
        CanonicalEvent::Status {
            phase: StatusPhase::Fellback,
            agent: None,
            model: None,
            kind: None,
            from: Some(from),
            to: Some(to),
            meta: None,
        }
    }

    /// Error event with `retryable` derived from the kind.
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        CanonicalEvent::Error {
            kind,
            message: message.into(),
            retryable: kind.retryable(),
        }
    }

    /// The wire/`kind` column name of this variant.
    pub fn kind_str(&self) -> &'static str {
        match self {
            CanonicalEvent::AssistantText { .. } => "assistant_text",
            CanonicalEvent::ToolCall { .. } => "tool_call",
            CanonicalEvent::ToolResult { .. } => "tool_result",
            CanonicalEvent::SessionInfo { .. } => "session_info",
            CanonicalEvent::Status { .. } => "status",
            CanonicalEvent::Error { .. } => "error",
        }
    }

    /// Role under which the event is persisted.
    pub fn role(&self) -> MessageRole {
        match self {
            CanonicalEvent::AssistantText { .. } => MessageRole::Assistant,
            CanonicalEvent::ToolCall { .. } => MessageRole::Assistant,
            CanonicalEvent::ToolResult { .. } => MessageRole::Tool,
            CanonicalEvent::SessionInfo { .. }
            | CanonicalEvent::Status { .. }
            | CanonicalEvent::Error { .. } => MessageRole::System,
        }
    }

    /// True for the three statuses that end a run.
    pub fn is_terminal_status(&self) -> bool {
        matches!(
            self,
            CanonicalEvent::Status { phase, .. } if phase.is_terminal()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn agent_kind_round_trips_through_str() {
        for kind in AgentKind::ALL {
            assert_eq!(kind.as_str().parse::<AgentKind>().unwrap(), kind);
        }
        assert!("copilot".parse::<AgentKind>().is_err());
    }

    #[test]
    fn error_kind_predicates_match_taxonomy() {
        assert!(ErrorKind::SessionStale.retryable());
        assert!(ErrorKind::RateLimited.retryable());
        assert!(!ErrorKind::Timeout.retryable());
        assert!(!ErrorKind::ModelFallback.retryable());

        for kind in [
            ErrorKind::CliNotInstalled,
            ErrorKind::SpawnFailed,
            ErrorKind::AuthMissing,
            ErrorKind::CrashedBeforeFirstEvent,
            ErrorKind::Protocol,
        ] {
            assert!(kind.fallback_eligible(), "{kind:?} should be eligible");
        }
        for kind in [
            ErrorKind::Timeout,
            ErrorKind::SessionStale,
            ErrorKind::Cancelled,
            ErrorKind::Internal,
        ] {
            assert!(!kind.fallback_eligible(), "{kind:?} should not be eligible");
        }
    }

    #[test]
    fn assistant_text_serializes_final_keyword() {
        let event = CanonicalEvent::AssistantText {
            text: "Done.".to_string(),
            is_final: true,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(
            value,
            json!({"type": "assistant_text", "text": "Done.", "final": true})
        );
    }

    #[test]
    fn tool_result_omits_absent_output_and_error() {
        let event = CanonicalEvent::ToolResult {
            call_id: "t1".to_string(),
            ok: true,
            output: Some("ok".to_string()),
            error: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value.get("output"), Some(&json!("ok")));
        assert!(value.get("error").is_none());
    }

    #[test]
    fn status_fellback_carries_from_and_to() {
        let event = CanonicalEvent::status_fellback(AgentKind::Qwen, AgentKind::Claude);
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value.get("phase"), Some(&json!("fellback")));
        assert_eq!(value.get("from"), Some(&json!("qwen")));
        assert_eq!(value.get("to"), Some(&json!("claude")));
        assert!(value.get("kind").is_none());
    }

    #[test]
    fn terminal_statuses_are_exactly_three() {
        assert!(CanonicalEvent::status_complete(None).is_terminal_status());
        assert!(CanonicalEvent::status_cancelled().is_terminal_status());
        assert!(CanonicalEvent::status_failed(ErrorKind::Timeout).is_terminal_status());
        assert!(!CanonicalEvent::status_start(AgentKind::Claude, None).is_terminal_status());
        assert!(!CanonicalEvent::status_fellback(AgentKind::Qwen, AgentKind::Claude)
            .is_terminal_status());
        assert!(!CanonicalEvent::error(ErrorKind::Timeout, "stalled").is_terminal_status());
    }

    #[test]
    fn event_deserializes_from_wire_shape() {
        let event: CanonicalEvent = serde_json::from_value(json!({
            "type": "status",
            "phase": "failed",
            "kind": "timeout"
        }))
        .unwrap();
        assert_eq!(event, CanonicalEvent::status_failed(ErrorKind::Timeout));
    }

    #[test]
    fn empty_metrics_are_dropped_from_complete() {
        let event = CanonicalEvent::status_complete(Some(RunMetrics::default()));
        let value = serde_json::to_value(&event).unwrap();
        assert!(value.get("meta").is_none());
    }
}
