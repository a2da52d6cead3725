//! `status`: print the persisted controller record.

use anyhow::Result;

use grafana_operator_core::store::StateStore;

use crate::config::Config;
use crate::db;
use crate::migrate;
use crate::sqlite_store::SqliteStateStore;

pub async fn run_status(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    let pool = db::connect(config).await?;
    let store = SqliteStateStore::new(pool);
    let unit = &config.unit.name;

    let Some(record) = store.load(unit).await? else {
        println!("No state recorded for {}.", unit);
        return Ok(());
    };

    let updated = chrono::DateTime::from_timestamp(record.updated_at, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_else(|| record.updated_at.to_string());

    println!("Unit:              {}", record.unit);
    println!(
        "Fingerprint:       {}",
        record.fingerprint.as_deref().unwrap_or("(none)")
    );
    println!("Generation:        {}", record.generation);
    println!("Container ready:   {}", record.container_ready);
    match &record.storage {
        Some(s) => println!(
            "Storage:           {} (initialized: {})",
            s.mount_path.display(),
            s.initialized
        ),
        None => println!("Storage:           not attached"),
    }
    println!(
        "Migrated database: {}",
        record.migrated_database.as_deref().unwrap_or("(none)")
    );
    println!("Updated:           {}", updated);
    Ok(())
}
