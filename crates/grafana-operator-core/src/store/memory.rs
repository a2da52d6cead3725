//! In-memory [`StateStore`] implementation for tests.
//!
//! Uses a `HashMap` behind `std::sync::RwLock`.

use std::collections::HashMap;
use std::sync::RwLock;

use anyhow::Result;
use async_trait::async_trait;

use super::{ControllerRecord, StateStore};

pub struct InMemoryStateStore {
    records: RwLock<HashMap<String, ControllerRecord>>,
}

impl InMemoryStateStore {
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
        }
    }

    /// Number of stored records.
    pub fn len(&self) -> usize {
        self.records.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryStateStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl StateStore for InMemoryStateStore {
    async fn load(&self, unit: &str) -> Result<Option<ControllerRecord>> {
        Ok(self.records.read().unwrap().get(unit).cloned())
    }

    async fn save(&self, record: &ControllerRecord) -> Result<()> {
        self.records
            .write()
            .unwrap()
            .insert(record.unit.clone(), record.clone());
        Ok(())
    }

    async fn clear(&self, unit: &str) -> Result<()> {
        self.records.write().unwrap().remove(unit);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_save_load_clear() {
        let store = InMemoryStateStore::new();
        assert!(store.load("grafana/0").await.unwrap().is_none());

        let mut rec = ControllerRecord::new("grafana/0");
        rec.fingerprint = Some("abc".to_string());
        rec.generation = 2;
        store.save(&rec).await.unwrap();
        assert_eq!(store.load("grafana/0").await.unwrap(), Some(rec.clone()));

        rec.generation = 3;
        store.save(&rec).await.unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.load("grafana/0").await.unwrap().unwrap().generation, 3);

        store.clear("grafana/0").await.unwrap();
        assert!(store.is_empty());
    }
}
