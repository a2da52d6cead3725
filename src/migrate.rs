use anyhow::Result;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // One row per unit managed from this database
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS controller_state (
            unit TEXT PRIMARY KEY,
            fingerprint TEXT,
            generation INTEGER NOT NULL DEFAULT 0,
            storage_json TEXT,
            container_ready INTEGER NOT NULL DEFAULT 0,
            migrated_database TEXT,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    pool.close().await;
    Ok(())
}
