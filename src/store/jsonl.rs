//! JSONL turn history
//!
//! Append-only log of finished turns at `<dir>/turns.jsonl`, one JSON
//! object per line. The latest agent session id of each session is cached
//! in memory so resumption does not rescan the file.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

use super::{SessionStore, StoreResult, TurnRecord};
use crate::error::StoreError;

/// JSONL-backed session store
pub struct JsonlSessionStore {
    log_path: PathBuf,
    /// Maps session id → latest agent session id; also serializes appends
    resume: Mutex<HashMap<String, String>>,
}

impl JsonlSessionStore {
    /// Open (or create) the store in `dir`, loading existing history.
    pub fn open<P: AsRef<Path>>(dir: P) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir).map_err(|e| StoreError::io(dir, e))?;

        let log_path = dir.join("turns.jsonl");
        let mut resume = HashMap::new();
        for record in read_records(&log_path)? {
            if let Some(agent) = record.agent_session_id {
                resume.insert(record.session_id, agent);
            }
        }

        Ok(Self {
            log_path,
            resume: Mutex::new(resume),
        })
    }

    /// Read every recorded turn, in order.
    pub fn read_all(&self) -> StoreResult<Vec<TurnRecord>> {
        read_records(&self.log_path)
    }

    /// Path to the log file
    #[must_use]
    pub fn log_path(&self) -> &Path {
        &self.log_path
    }
}

fn read_records(path: &Path) -> StoreResult<Vec<TurnRecord>> {
    if !path.exists() {
        return Ok(Vec::new());
    }

    let content = std::fs::read_to_string(path).map_err(|e| StoreError::io(path, e))?;

    let mut records = Vec::new();
    for (line_num, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let record: TurnRecord = serde_json::from_str(line).map_err(|e| {
            StoreError::Serialization(format!("line {} of {}: {e}", line_num + 1, path.display()))
        })?;
        records.push(record);
    }
    Ok(records)
}

#[async_trait]
impl SessionStore for JsonlSessionStore {
    async fn record_turn(&self, record: TurnRecord) -> StoreResult<()> {
        let json = serde_json::to_string(&record)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut resume = self.resume.lock().await;
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .await
            .map_err(|e| StoreError::io(&self.log_path, e))?;
        file.write_all(format!("{json}\n").as_bytes())
            .await
            .map_err(|e| StoreError::io(&self.log_path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&self.log_path, e))?;

        if let Some(agent) = record.agent_session_id {
            resume.insert(record.session_id, agent);
        }
        Ok(())
    }

    async fn last_agent_session(&self, session_id: &str) -> StoreResult<Option<String>> {
        Ok(self.resume.lock().await.get(session_id).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{sample_record, TurnStatus};
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_directory() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path().join(".tether");

        let store = JsonlSessionStore::open(&dir).unwrap();
        assert!(dir.exists());
        assert_eq!(store.log_path(), dir.join("turns.jsonl"));
        assert!(store.read_all().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_record_and_read_back() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonlSessionStore::open(temp_dir.path()).unwrap();

        store
            .record_turn(sample_record("s-1", Some("agent-1")))
            .await
            .unwrap();
        let mut cancelled = sample_record("s-2", None);
        cancelled.status = TurnStatus::Cancelled;
        store.record_turn(cancelled).await.unwrap();

        let records = store.read_all().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].session_id, "s-1");
        assert_eq!(records[0].usage.output_tokens, 34);
        assert_eq!(records[1].status, TurnStatus::Cancelled);

        let content = std::fs::read_to_string(store.log_path()).unwrap();
        assert_eq!(content.lines().count(), 2);
        assert!(content.contains("\"status\":\"cancelled\""));
    }

    #[tokio::test]
    async fn test_last_agent_session_tracks_latest() {
        let temp_dir = TempDir::new().unwrap();
        let store = JsonlSessionStore::open(temp_dir.path()).unwrap();

        assert_eq!(store.last_agent_session("s-1").await.unwrap(), None);
        store
            .record_turn(sample_record("s-1", Some("agent-1")))
            .await
            .unwrap();
        store
            .record_turn(sample_record("s-1", Some("agent-2")))
            .await
            .unwrap();
        // A turn without an agent id does not erase the previous one
        store.record_turn(sample_record("s-1", None)).await.unwrap();

        assert_eq!(
            store.last_agent_session("s-1").await.unwrap().as_deref(),
            Some("agent-2")
        );
    }

    #[tokio::test]
    async fn test_reopen_restores_resume_map() {
        let temp_dir = TempDir::new().unwrap();
        {
            let store = JsonlSessionStore::open(temp_dir.path()).unwrap();
            store
                .record_turn(sample_record("s-1", Some("agent-9")))
                .await
                .unwrap();
        }
        let store = JsonlSessionStore::open(temp_dir.path()).unwrap();
        assert_eq!(
            store.last_agent_session("s-1").await.unwrap().as_deref(),
            Some("agent-9")
        );
    }

    #[test]
    fn test_corrupt_line_is_reported() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("turns.jsonl"), "{not json}\n").unwrap();
        let err = JsonlSessionStore::open(temp_dir.path()).err().unwrap();
        assert!(err.to_string().contains("line 1"), "got: {err}");
    }
}
