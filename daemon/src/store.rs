//! Message store backends.
//!
//! `JsonlMessageStore` is the daemon's durable transcript: one append-only
//! JSONL file per project. `MemoryMessageStore` backs tests and embeds.
//! Both sit behind the `MessageStore` trait from `overture-events`.

use std::collections::HashMap;
use std::path::PathBuf;

use async_trait::async_trait;
use overture_events::{MessageStore, StoreError, StoredMessage};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

// ============================================================================
// MemoryMessageStore
// ============================================================================

#[derive(Default)]
pub struct MemoryMessageStore {
    inner: Mutex<HashMap<String, Vec<StoredMessage>>>,
}

impl MemoryMessageStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MessageStore for MemoryMessageStore {
    async fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .entry(message.project_id.clone())
            .or_default()
            .push(message.clone());
        Ok(())
    }

    async fn list_since(
        &self,
        project_id: &str,
        after_seq: u64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(project_id)
            .map(|rows| {
                rows.iter()
                    .filter(|m| m.seq > after_seq)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn tail(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(project_id)
            .map(|rows| {
                let start = rows.len().saturating_sub(limit);
                rows[start..].to_vec()
            })
            .unwrap_or_default())
    }

    async fn last_seq(&self, project_id: &str) -> Result<u64, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .get(project_id)
            .and_then(|rows| rows.last())
            .map(|m| m.seq)
            .unwrap_or(0))
    }
}

// ============================================================================
// JsonlMessageStore
// ============================================================================

/// One `<project_id>.jsonl` file per project under the store root.
/// Rows are appended as single JSON lines; corrupt lines are skipped with
/// a warning when reading back.
pub struct JsonlMessageStore {
    root: PathBuf,
}

impl JsonlMessageStore {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn project_path(&self, project_id: &str) -> PathBuf {
        // Project ids are platform-generated; sanitize anyway so a hostile
        // id cannot escape the store root.
        let safe: String = project_id
            .chars()
            .map(|c| {
                if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                    c
                } else {
                    '_'
                }
            })
            .collect();
        self.root.join(format!("{safe}.jsonl"))
    }

    async fn read_all(&self, project_id: &str) -> Result<Vec<StoredMessage>, StoreError> {
        let path = self.project_path(project_id);
        let content = match fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut rows = Vec::new();
        for line in content.lines() {
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredMessage>(trimmed) {
                Ok(row) => rows.push(row),
                Err(e) => {
                    warn!(project = project_id, error = %e, "skipping corrupt transcript line");
                }
            }
        }
        Ok(rows)
    }
}

#[async_trait]
impl MessageStore for JsonlMessageStore {
    async fn append(&self, message: &StoredMessage) -> Result<(), StoreError> {
        fs::create_dir_all(&self.root).await?;
        let mut line = serde_json::to_vec(message)?;
        line.push(b'\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.project_path(&message.project_id))
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }

    async fn list_since(
        &self,
        project_id: &str,
        after_seq: u64,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = self.read_all(project_id).await?;
        Ok(rows.into_iter().filter(|m| m.seq > after_seq).collect())
    }

    async fn tail(
        &self,
        project_id: &str,
        limit: usize,
    ) -> Result<Vec<StoredMessage>, StoreError> {
        let rows = self.read_all(project_id).await?;
        let start = rows.len().saturating_sub(limit);
        Ok(rows[start..].to_vec())
    }

    async fn last_seq(&self, project_id: &str) -> Result<u64, StoreError> {
        let rows = self.read_all(project_id).await?;
        Ok(rows.last().map(|m| m.seq).unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use overture_events::{AgentKind, CanonicalEvent};
    use tempfile::tempdir;

    fn row(project: &str, seq: u64) -> StoredMessage {
        StoredMessage::from_event(
            project,
            seq,
            format!("{seq}-test"),
            CanonicalEvent::AssistantText {
                text: format!("line {seq}"),
                is_final: false,
            },
        )
    }

    async fn exercise_store(store: &dyn MessageStore) {
        for seq in 1..=5 {
            store.append(&row("p1", seq)).await.expect("append");
        }
        store.append(&row("p2", 1)).await.expect("append");

        let since = store.list_since("p1", 3).await.expect("list_since");
        assert_eq!(
            since.iter().map(|m| m.seq).collect::<Vec<_>>(),
            vec![4, 5]
        );

        let tail = store.tail("p1", 2).await.expect("tail");
        assert_eq!(tail.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![4, 5]);

        assert_eq!(store.last_seq("p1").await.expect("last_seq"), 5);
        assert_eq!(store.last_seq("p2").await.expect("last_seq"), 1);
        assert_eq!(store.last_seq("p3").await.expect("last_seq"), 0);
        assert!(store.list_since("p3", 0).await.expect("empty").is_empty());
    }

    #[tokio::test]
    async fn memory_store_roundtrip() {
        let store = MemoryMessageStore::new();
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn jsonl_store_roundtrip() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlMessageStore::new(dir.path().join("messages"));
        exercise_store(&store).await;
    }

    #[tokio::test]
    async fn jsonl_store_survives_reopen() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("messages");
        {
            let store = JsonlMessageStore::new(root.clone());
            store.append(&row("p1", 1)).await.expect("append");
            store.append(&row("p1", 2)).await.expect("append");
        }
        let store = JsonlMessageStore::new(root);
        assert_eq!(store.last_seq("p1").await.expect("last_seq"), 2);
    }

    #[tokio::test]
    async fn jsonl_store_skips_corrupt_lines() {
        let dir = tempdir().expect("tempdir");
        let root = dir.path().join("messages");
        let store = JsonlMessageStore::new(root.clone());
        store.append(&row("p1", 1)).await.expect("append");

        let path = root.join("p1.jsonl");
        let mut content = std::fs::read_to_string(&path).expect("read");
        content.push_str("{not json\n");
        std::fs::write(&path, content).expect("write");
        store.append(&row("p1", 2)).await.expect("append");

        let rows = store.list_since("p1", 0).await.expect("list");
        assert_eq!(rows.iter().map(|m| m.seq).collect::<Vec<_>>(), vec![1, 2]);
    }

    #[tokio::test]
    async fn jsonl_store_sanitizes_hostile_project_ids() {
        let dir = tempdir().expect("tempdir");
        let store = JsonlMessageStore::new(dir.path().join("messages"));
        store
            .append(&row("../escape", 1))
            .await
            .expect("append");
        assert_eq!(store.last_seq("../escape").await.expect("last_seq"), 1);
        assert!(dir.path().join("messages").join("___escape.jsonl").exists());
    }
}
