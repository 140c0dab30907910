//! Append-only transcript rows and the store seam.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::event::CanonicalEvent;

/// Role of a persisted message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
    Tool,
    System,
}

/// One persisted canonical event.
///
/// Rows are append-only and keyed by `(project_id, seq)`; `seq` is unique
/// within a project. `(project_id, request_id, kind)` correlates tool
/// calls with their results.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredMessage {
    pub project_id: String,
    pub seq: u64,
    pub request_id: String,
    pub role: MessageRole,
    pub kind: String,
    #[serde(rename = "body_json")]
    pub body: CanonicalEvent,
    pub created_at: String,
}

impl StoredMessage {
    /// Build a row for an event, stamping role, kind and timestamp.
    pub fn from_event(
        project_id: impl Into<String>,
        seq: u64,
        request_id: impl Into<String>,
        body: CanonicalEvent,
    ) -> Self {
        Self {
            project_id: project_id.into(),
            seq,
            request_id: request_id.into(),
            role: body.role(),
            kind: body.kind_str().to_string(),
            body,
            created_at: chrono::Utc::now().to_rfc3339(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Integration boundary with persistence. Append-only from the core's
/// perspective; assumed transactionally safe by the backing store.
#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn append(&self, message: &StoredMessage) -> Result<(), StoreError>;

    /// All rows with `seq` strictly greater than `after_seq`, ascending.
    async fn list_since(
        &self,
        project_id: &str,
        after_seq: u64,
    ) -> Result<Vec<StoredMessage>, StoreError>;

    /// The most recent `limit` rows, ascending.
    async fn tail(&self, project_id: &str, limit: usize)
        -> Result<Vec<StoredMessage>, StoreError>;

    /// Highest `seq` persisted for the project; 0 when empty.
    async fn last_seq(&self, project_id: &str) -> Result<u64, StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::AgentKind;

    #[test]
    fn from_event_stamps_role_kind_and_timestamp() {
        let row = StoredMessage::from_event(
            "p1",
            7,
            "3-abc",
            CanonicalEvent::AssistantText {
                text: "hi".to_string(),
                is_final: false,
            },
        );
        assert_eq!(row.seq, 7);
        assert_eq!(row.kind, "assistant_text");
        assert_eq!(row.role, MessageRole::Assistant);
        assert!(!row.created_at.is_empty());
    }

    #[test]
    fn row_serializes_body_under_body_json() {
        let row = StoredMessage::from_event(
            "p1",
            1,
            "1-abc",
            CanonicalEvent::status_start(AgentKind::Claude, None),
        );
        let value = serde_json::to_value(&row).unwrap();
        assert!(value.get("body_json").is_some());
        assert_eq!(
            value["body_json"].get("type"),
            Some(&serde_json::json!("status"))
        );

        let back: StoredMessage = serde_json::from_value(value).unwrap();
        assert_eq!(back, row);
    }
}
