//! WebSocket wire protocol: frame envelope, inbound commands, close codes.
//!
//! Text frames carry JSON except the literal `"ping"` / `"pong"`
//! keepalives. The envelope is `{type, data, request_id?, seq?}` in both
//! directions; outbound types mirror the canonical event variants.

use serde::{Deserialize, Serialize};

use crate::event::{AgentKind, CanonicalEvent};
use crate::message::StoredMessage;

pub const KEEPALIVE_PING: &str = "ping";
pub const KEEPALIVE_PONG: &str = "pong";

pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_SLOW_CONSUMER: u16 = 4001;
pub const CLOSE_UNAUTHORIZED: u16 = 4002;
pub const CLOSE_PROJECT_UNKNOWN: u16 = 4003;

/// Upper bound on submitted instruction text.
pub const MAX_INSTRUCTION_BYTES: usize = 64 * 1024;

pub const MIN_DEADLINE_SECONDS: u64 = 60;
pub const MAX_DEADLINE_SECONDS: u64 = 3600;

/// An image the caller already wrote into the project workspace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageAttachment {
    pub path: String,
    pub name: String,
}

/// Payload of an inbound `submit` command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub instruction: String,
    pub agent: AgentKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<ImageAttachment>,
    #[serde(default)]
    pub is_initial: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deadline_seconds: Option<u64>,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SubmitError {
    #[error("instruction must not be empty")]
    EmptyInstruction,

    #[error("instruction exceeds {MAX_INSTRUCTION_BYTES} bytes")]
    InstructionTooLarge,

    #[error("deadline_seconds must be within {MIN_DEADLINE_SECONDS}..={MAX_DEADLINE_SECONDS}")]
    DeadlineOutOfRange,

    #[error("image path escapes the project workspace: {0}")]
    ImageOutsideWorkspace(String),
}

impl SubmitRequest {
    /// Structural validation. Workspace containment for image paths is
    /// checked separately where the workspace root is known.
    pub fn validate(&self) -> Result<(), SubmitError> {
        if self.instruction.is_empty() {
            return Err(SubmitError::EmptyInstruction);
        }
        if self.instruction.len() > MAX_INSTRUCTION_BYTES {
            return Err(SubmitError::InstructionTooLarge);
        }
        if let Some(deadline) = self.deadline_seconds {
            if !(MIN_DEADLINE_SECONDS..=MAX_DEADLINE_SECONDS).contains(&deadline) {
                return Err(SubmitError::DeadlineOutOfRange);
            }
        }
        Ok(())
    }
}

/// Inbound command envelope, tagged by `type` with the payload in `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ClientCommand {
    Submit(SubmitRequest),
    Cancel { request_id: String },
    SubscribeFromSeq { seq: u64 },
}

/// Outbound frame: one per canonical event, plus protocol errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboundFrame {
    #[serde(rename = "type")]
    pub frame_type: String,
    pub data: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seq: Option<u64>,
}

impl OutboundFrame {
    /// Frame for a persisted event. The event's own tag becomes the frame
    /// type; the remaining fields become `data`.
    pub fn from_message(message: &StoredMessage) -> Self {
        Self::from_event(&message.body, Some(message.request_id.clone()), Some(message.seq))
    }

    pub fn from_event(event: &CanonicalEvent, request_id: Option<String>, seq: Option<u64>) -> Self {
        let mut data = serde_json::to_value(event).unwrap_or(serde_json::Value::Null);
        if let Some(map) = data.as_object_mut() {
            map.remove("type");
        }
        Self {
            frame_type: event.kind_str().to_string(),
            data,
            request_id,
            seq,
        }
    }

    /// Frame answering a malformed or rejected client frame. Does not
    /// carry a seq; it is not part of any transcript.
    pub fn protocol_error(message: impl Into<String>) -> Self {
        Self::from_event(
            &CanonicalEvent::error(crate::event::ErrorKind::Protocol, message),
            None,
            None,
        )
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::StatusPhase;
    use serde_json::json;

    #[test]
    fn submit_command_parses_from_envelope() {
        let cmd: ClientCommand = serde_json::from_value(json!({
            "type": "submit",
            "data": {
                "instruction": "add hello page",
                "agent": "claude",
                "model": "claude-sonnet-4.5"
            }
        }))
        .unwrap();
        match cmd {
            ClientCommand::Submit(req) => {
                assert_eq!(req.agent, AgentKind::Claude);
                assert_eq!(req.model.as_deref(), Some("claude-sonnet-4.5"));
                assert!(!req.is_initial);
                assert!(req.images.is_empty());
            }
            other => panic!("expected submit, got {other:?}"),
        }
    }

    #[test]
    fn cancel_and_subscribe_parse_from_envelope() {
        let cancel: ClientCommand = serde_json::from_value(json!({
            "type": "cancel",
            "data": {"request_id": "3-ab12cd34"}
        }))
        .unwrap();
        assert_eq!(
            cancel,
            ClientCommand::Cancel {
                request_id: "3-ab12cd34".to_string()
            }
        );

        let subscribe: ClientCommand = serde_json::from_value(json!({
            "type": "subscribe_from_seq",
            "data": {"seq": 5}
        }))
        .unwrap();
        assert_eq!(subscribe, ClientCommand::SubscribeFromSeq { seq: 5 });
    }

    #[test]
    fn validate_rejects_boundary_violations() {
        let mut req = SubmitRequest {
            instruction: "x".to_string(),
            agent: AgentKind::Claude,
            model: None,
            images: Vec::new(),
            is_initial: false,
            deadline_seconds: None,
        };
        assert!(req.validate().is_ok());

        req.instruction = String::new();
        assert_eq!(req.validate(), Err(SubmitError::EmptyInstruction));

        req.instruction = "y".repeat(MAX_INSTRUCTION_BYTES + 1);
        assert_eq!(req.validate(), Err(SubmitError::InstructionTooLarge));

        req.instruction = "x".to_string();
        req.deadline_seconds = Some(59);
        assert_eq!(req.validate(), Err(SubmitError::DeadlineOutOfRange));
        req.deadline_seconds = Some(3601);
        assert_eq!(req.validate(), Err(SubmitError::DeadlineOutOfRange));
        req.deadline_seconds = Some(600);
        assert!(req.validate().is_ok());
    }

    #[test]
    fn outbound_frame_lifts_event_tag_to_frame_type() {
        let row = StoredMessage::from_event(
            "p1",
            4,
            "2-ff00aa11",
            CanonicalEvent::status_start(AgentKind::Qwen, None),
        );
        let frame = OutboundFrame::from_message(&row);
        assert_eq!(frame.frame_type, "status");
        assert_eq!(frame.seq, Some(4));
        assert_eq!(frame.request_id.as_deref(), Some("2-ff00aa11"));
        assert!(frame.data.get("type").is_none());
        assert_eq!(frame.data.get("phase"), Some(&json!("start")));

        let parsed: serde_json::Value = serde_json::from_str(&frame.to_json()).unwrap();
        assert_eq!(parsed["type"], json!("status"));
    }

    #[test]
    fn status_phase_round_trips_on_wire() {
        for (phase, text) in [
            (StatusPhase::Start, "start"),
            (StatusPhase::Complete, "complete"),
            (StatusPhase::Cancelled, "cancelled"),
            (StatusPhase::Failed, "failed"),
            (StatusPhase::Fellback, "fellback"),
        ] {
            assert_eq!(serde_json::to_value(phase).unwrap(), json!(text));
        }
    }
}
