//! In-process knowledge store.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Mutex;

use super::{KnowledgeRecord, KnowledgeStore};

#[derive(Debug, Default)]
pub struct MemoryKnowledgeStore {
    records: Mutex<Vec<KnowledgeRecord>>,
}

impl MemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the stored records.
    pub fn records(&self) -> Vec<KnowledgeRecord> {
        self.records
            .lock()
            .map(|records| records.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl KnowledgeStore for MemoryKnowledgeStore {
    async fn append(&self, record: KnowledgeRecord) -> Result<()> {
        self.records
            .lock()
            .map_err(|_| anyhow::anyhow!("knowledge store lock poisoned"))?
            .push(record);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<KnowledgeRecord>> {
        Ok(self
            .records
            .lock()
            .map_err(|_| anyhow::anyhow!("knowledge store lock poisoned"))?
            .clone())
    }
}
