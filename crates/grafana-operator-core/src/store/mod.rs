//! Persisted controller state.
//!
//! The [`StateStore`] trait is how the controller keeps what it must
//! remember across operator restarts: the last applied fingerprint, the
//! artifact generation, storage state, and whether the workload container
//! has reported ready. Implementations must be `Send + Sync`.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::models::StorageState;

/// Everything the controller persists for one unit.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerRecord {
    pub unit: String,
    /// Fingerprint of the last artifact that was applied successfully.
    pub fingerprint: Option<String>,
    /// Generation of that artifact; 0 means nothing applied yet.
    pub generation: u64,
    pub storage: Option<StorageState>,
    pub container_ready: bool,
    /// Database identity whose schema this unit migrated as leader.
    pub migrated_database: Option<String>,
    /// Unix timestamp of the last save.
    pub updated_at: i64,
}

impl ControllerRecord {
    pub fn new(unit: impl Into<String>) -> Self {
        Self {
            unit: unit.into(),
            ..Default::default()
        }
    }
}

#[async_trait]
pub trait StateStore: Send + Sync {
    /// Load the record for a unit, if one was ever saved.
    async fn load(&self, unit: &str) -> Result<Option<ControllerRecord>>;

    /// Insert or replace the record for `record.unit`.
    async fn save(&self, record: &ControllerRecord) -> Result<()>;

    /// Forget a unit (storage teardown).
    async fn clear(&self, unit: &str) -> Result<()>;
}
