//! Per-agent session state and its projection from the transcript.
//!
//! Session rows are not persisted on their own; the transcript is the
//! source of truth. [`project_sessions`] replays a project's persisted
//! events and rebuilds the state the orchestrator holds in memory, which
//! is how sessions survive daemon restarts.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::event::{AgentKind, CanonicalEvent, StatusPhase};
use crate::message::StoredMessage;

/// Conversation state for one `(project, agent)` pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SessionState {
    /// Opaque id the CLI hands out; replayed on later runs to resume
    /// conversation context. Only advanced by successful runs.
    pub native_session_id: Option<String>,
    /// Last model used; consulted when a submit omits one.
    pub last_model: Option<String>,
    /// Sequence number of the last event a run of this session emitted.
    pub seq: u64,
}

/// Result of replaying a project transcript.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProjectSessions {
    pub sessions: HashMap<AgentKind, SessionState>,
    /// Highest seq in the transcript; the orchestrator resumes its
    /// counter from here.
    pub last_seq: u64,
}

struct OpenRun {
    agent: AgentKind,
    model: Option<String>,
    native_session_id: Option<String>,
    saw_assistant_text: bool,
}

/// Pure projection: transcript in, session state out.
///
/// A session's `native_session_id` and `last_model` advance only when a
/// run terminates `complete` having emitted at least one `AssistantText`;
/// partial, failed, and cancelled runs leave the session untouched.
pub fn project_sessions(messages: &[StoredMessage]) -> ProjectSessions {
    let mut result = ProjectSessions::default();
    let mut open: Option<OpenRun> = None;

    for message in messages {
        result.last_seq = result.last_seq.max(message.seq);

        match &message.body {
            CanonicalEvent::Status {
                phase: StatusPhase::Start,
                agent: Some(agent),
                model,
                ..
            } => {
                open = Some(OpenRun {
                    agent: *agent,
                    model: model.clone(),
                    native_session_id: None,
                    saw_assistant_text: false,
                });
            }
            CanonicalEvent::SessionInfo { native_session_id } => {
                if let Some(run) = open.as_mut() {
                    run.native_session_id = Some(native_session_id.clone());
                }
            }
            CanonicalEvent::AssistantText { .. } => {
                if let Some(run) = open.as_mut() {
                    run.saw_assistant_text = true;
                }
            }
            CanonicalEvent::Status { phase, .. } if phase.is_terminal() => {
                if let Some(run) = open.take() {
                    let entry = result.sessions.entry(run.agent).or_default();
                    entry.seq = message.seq;
                    if *phase == StatusPhase::Complete && run.saw_assistant_text {
                        if let Some(id) = run.native_session_id {
                            entry.native_session_id = Some(id);
                        }
                        if run.model.is_some() {
                            entry.last_model = run.model;
                        }
                    }
                }
            }
            _ => {}
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ErrorKind, RunMetrics};

    fn transcript(events: Vec<(&str, CanonicalEvent)>) -> Vec<StoredMessage> {
        events
            .into_iter()
            .enumerate()
            .map(|(i, (request_id, body))| {
                StoredMessage::from_event("p1", (i + 1) as u64, request_id, body)
            })
            .collect()
    }

    fn happy_run(request_id: &'static str, session: &str) -> Vec<(&'static str, CanonicalEvent)> {
        vec![
            (
                request_id,
                CanonicalEvent::status_start(
                    AgentKind::Claude,
                    Some("claude-sonnet-4-5-20250929".to_string()),
                ),
            ),
            (
                request_id,
                CanonicalEvent::SessionInfo {
                    native_session_id: session.to_string(),
                },
            ),
            (
                request_id,
                CanonicalEvent::AssistantText {
                    text: "Done.".to_string(),
                    is_final: true,
                },
            ),
            (
                request_id,
                CanonicalEvent::status_complete(Some(RunMetrics {
                    duration_ms: Some(1200),
                    num_turns: Some(2),
                    total_cost_usd: None,
                })),
            ),
        ]
    }

    #[test]
    fn complete_run_with_text_advances_session() {
        let projected = project_sessions(&transcript(happy_run("1-aa", "sess-A")));
        let claude = &projected.sessions[&AgentKind::Claude];
        assert_eq!(claude.native_session_id.as_deref(), Some("sess-A"));
        assert_eq!(
            claude.last_model.as_deref(),
            Some("claude-sonnet-4-5-20250929")
        );
        assert_eq!(claude.seq, 4);
        assert_eq!(projected.last_seq, 4);
    }

    #[test]
    fn failed_run_leaves_session_untouched() {
        let mut events = happy_run("1-aa", "sess-A");
        events.extend(vec![
            (
                "2-bb",
                CanonicalEvent::status_start(AgentKind::Claude, None),
            ),
            (
                "2-bb",
                CanonicalEvent::SessionInfo {
                    native_session_id: "sess-B".to_string(),
                },
            ),
            ("2-bb", CanonicalEvent::status_failed(ErrorKind::Timeout)),
        ]);
        let projected = project_sessions(&transcript(events));
        let claude = &projected.sessions[&AgentKind::Claude];
        assert_eq!(claude.native_session_id.as_deref(), Some("sess-A"));
        assert_eq!(claude.seq, 7);
    }

    #[test]
    fn cancelled_run_without_text_does_not_create_session_id() {
        let events = vec![
            (
                "1-aa",
                CanonicalEvent::status_start(AgentKind::Codex, None),
            ),
            (
                "1-aa",
                CanonicalEvent::SessionInfo {
                    native_session_id: "thread-1".to_string(),
                },
            ),
            ("1-aa", CanonicalEvent::status_cancelled()),
        ];
        let projected = project_sessions(&transcript(events));
        let codex = &projected.sessions[&AgentKind::Codex];
        assert!(codex.native_session_id.is_none());
        assert_eq!(codex.seq, 3);
    }

    #[test]
    fn complete_run_without_session_info_keeps_previous_id() {
        let mut events = happy_run("1-aa", "sess-A");
        events.extend(vec![
            (
                "2-bb",
                CanonicalEvent::status_start(AgentKind::Claude, None),
            ),
            (
                "2-bb",
                CanonicalEvent::AssistantText {
                    text: "Resumed.".to_string(),
                    is_final: true,
                },
            ),
            ("2-bb", CanonicalEvent::status_complete(None)),
        ]);
        let projected = project_sessions(&transcript(events));
        let claude = &projected.sessions[&AgentKind::Claude];
        assert_eq!(claude.native_session_id.as_deref(), Some("sess-A"));
    }

    #[test]
    fn fallback_run_is_attributed_to_the_fallback_agent() {
        let events = vec![
            ("1-aa", CanonicalEvent::status_start(AgentKind::Qwen, None)),
            (
                "1-aa",
                CanonicalEvent::error(ErrorKind::CliNotInstalled, "qwen missing"),
            ),
            (
                "1-aa",
                CanonicalEvent::status_failed(ErrorKind::CliNotInstalled),
            ),
            (
                "1-aa",
                CanonicalEvent::status_fellback(AgentKind::Qwen, AgentKind::Claude),
            ),
            (
                "2-bb",
                CanonicalEvent::status_start(AgentKind::Claude, None),
            ),
            (
                "2-bb",
                CanonicalEvent::SessionInfo {
                    native_session_id: "sess-C".to_string(),
                },
            ),
            (
                "2-bb",
                CanonicalEvent::AssistantText {
                    text: "hi".to_string(),
                    is_final: true,
                },
            ),
            ("2-bb", CanonicalEvent::status_complete(None)),
        ];
        let projected = project_sessions(&transcript(events));
        assert!(projected.sessions[&AgentKind::Qwen]
            .native_session_id
            .is_none());
        assert_eq!(
            projected.sessions[&AgentKind::Claude]
                .native_session_id
                .as_deref(),
            Some("sess-C")
        );
        assert_eq!(projected.last_seq, 8);
    }

    #[test]
    fn empty_transcript_projects_to_empty_state() {
        let projected = project_sessions(&[]);
        assert!(projected.sessions.is_empty());
        assert_eq!(projected.last_seq, 0);
    }
}
