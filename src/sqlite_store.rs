//! SQLite-backed [`StateStore`].
//!
//! Stores one row per unit in `controller_state`; the storage state is kept
//! as a JSON column. Call [`crate::migrate::run_migrations`] before use.

use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::{Row, SqlitePool};

use grafana_operator_core::models::StorageState;
use grafana_operator_core::store::{ControllerRecord, StateStore};

pub struct SqliteStateStore {
    pool: SqlitePool,
}

impl SqliteStateStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl StateStore for SqliteStateStore {
    async fn load(&self, unit: &str) -> Result<Option<ControllerRecord>> {
        let row = sqlx::query(
            "SELECT unit, fingerprint, generation, storage_json, container_ready, \
             migrated_database, updated_at FROM controller_state WHERE unit = ?",
        )
        .bind(unit)
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };

        let storage_json: Option<String> = row.get("storage_json");
        let storage = match storage_json {
            Some(json) => Some(
                serde_json::from_str::<StorageState>(&json)
                    .with_context(|| format!("corrupt storage state for {}", unit))?,
            ),
            None => None,
        };
        let generation: i64 = row.get("generation");
        let container_ready: i64 = row.get("container_ready");

        Ok(Some(ControllerRecord {
            unit: row.get("unit"),
            fingerprint: row.get("fingerprint"),
            generation: generation.max(0) as u64,
            storage,
            container_ready: container_ready != 0,
            migrated_database: row.get("migrated_database"),
            updated_at: row.get("updated_at"),
        }))
    }

    async fn save(&self, record: &ControllerRecord) -> Result<()> {
        let storage_json = record
            .storage
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        sqlx::query(
            r#"
            INSERT INTO controller_state
                (unit, fingerprint, generation, storage_json, container_ready, migrated_database, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(unit) DO UPDATE SET
                fingerprint = excluded.fingerprint,
                generation = excluded.generation,
                storage_json = excluded.storage_json,
                container_ready = excluded.container_ready,
                migrated_database = excluded.migrated_database,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&record.unit)
        .bind(&record.fingerprint)
        .bind(record.generation as i64)
        .bind(storage_json)
        .bind(record.container_ready as i64)
        .bind(&record.migrated_database)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn clear(&self, unit: &str) -> Result<()> {
        sqlx::query("DELETE FROM controller_state WHERE unit = ?")
            .bind(unit)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
