//! In-memory session store

use async_trait::async_trait;
use tokio::sync::Mutex;

use super::{SessionStore, StoreResult, TurnRecord};

/// Keeps records in memory; used in tests and when persistence is off.
#[derive(Debug, Default)]
pub struct MemorySessionStore {
    records: Mutex<Vec<TurnRecord>>,
}

impl MemorySessionStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of every recorded turn.
    pub async fn records(&self) -> Vec<TurnRecord> {
        self.records.lock().await.clone()
    }
}

#[async_trait]
impl SessionStore for MemorySessionStore {
    async fn record_turn(&self, record: TurnRecord) -> StoreResult<()> {
        self.records.lock().await.push(record);
        Ok(())
    }

    async fn last_agent_session(&self, session_id: &str) -> StoreResult<Option<String>> {
        Ok(self
            .records
            .lock()
            .await
            .iter()
            .rev()
            .filter(|r| r.session_id == session_id)
            .find_map(|r| r.agent_session_id.clone()))
    }
}
