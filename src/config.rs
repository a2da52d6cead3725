//! TOML configuration parsing and validation.
//!
//! The operator reads a single file (default `./config/operator.toml`).
//! Every section except `[unit]` and `[db]` is optional and falls back to
//! the defaults below.
//!
//! ```toml
//! [unit]
//! name = "grafana/0"
//!
//! [db]
//! path = "./data/operator.sqlite"
//!
//! [grafana]
//! port = 3000
//! log_level = "info"
//! ```

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use grafana_operator_core::render::RenderSettings;

/// Log levels Grafana accepts in `[log] level`.
pub const GRAFANA_LOG_LEVELS: &[&str] = &["debug", "info", "warn", "error", "critical"];

/// Smallest volume the storage contract allows.
pub const MIN_STORAGE_MB: u64 = 100;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub unit: UnitConfig,
    pub db: DbConfig,
    #[serde(default)]
    pub grafana: GrafanaConfig,
    #[serde(default)]
    pub workload: WorkloadConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub reconcile: ReconcileConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct UnitConfig {
    /// Unit id, `<app>/<number>`.
    pub name: String,
    /// Address peers use to reach this unit.
    #[serde(default)]
    pub address: Option<String>,
}

impl UnitConfig {
    pub fn app(&self) -> &str {
        self.name.split('/').next().unwrap_or(&self.name)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct GrafanaConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_config_dir")]
    pub config_dir: String,
    #[serde(default = "default_true")]
    pub require_database: bool,
    #[serde(default = "default_admin_user")]
    pub admin_user: String,
}

impl Default for GrafanaConfig {
    fn default() -> Self {
        Self {
            port: default_port(),
            log_level: default_log_level(),
            config_dir: default_config_dir(),
            require_database: true,
            admin_user: default_admin_user(),
        }
    }
}

fn default_port() -> u16 {
    3000
}
fn default_log_level() -> String {
    "info".to_string()
}
fn default_config_dir() -> String {
    "/etc/grafana".to_string()
}
fn default_true() -> bool {
    true
}
fn default_admin_user() -> String {
    "admin".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct WorkloadConfig {
    #[serde(default = "default_container")]
    pub container: String,
    #[serde(default = "default_service")]
    pub service: String,
    #[serde(default = "default_command")]
    pub command: Vec<String>,
    /// Root of the container filesystem as seen by the operator.
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Fixed readiness endpoint. When unset, it follows the port the
    /// current layer was rendered with.
    #[serde(default)]
    pub health_url: Option<String>,
    #[serde(default = "default_restart_attempts")]
    pub restart_attempts: u32,
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
    #[serde(default = "default_ready_attempts")]
    pub ready_attempts: u32,
    #[serde(default = "default_ready_interval_ms")]
    pub ready_interval_ms: u64,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            container: default_container(),
            service: default_service(),
            command: default_command(),
            root: default_root(),
            health_url: None,
            restart_attempts: default_restart_attempts(),
            backoff_base_ms: default_backoff_base_ms(),
            call_timeout_secs: default_call_timeout_secs(),
            ready_attempts: default_ready_attempts(),
            ready_interval_ms: default_ready_interval_ms(),
        }
    }
}

impl WorkloadConfig {
    pub fn call_timeout(&self) -> Duration {
        Duration::from_secs(self.call_timeout_secs)
    }

    pub fn ready_interval(&self) -> Duration {
        Duration::from_millis(self.ready_interval_ms)
    }

    /// Backoff before restart attempt `attempt` (1-based retries): base, 2×base, 4×base, ...
    /// capped at 2^5.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(5);
        Duration::from_millis(self.backoff_base_ms.saturating_mul(1 << exp))
    }
}

fn default_container() -> String {
    "grafana".to_string()
}
fn default_service() -> String {
    "grafana".to_string()
}
fn default_command() -> Vec<String> {
    vec![
        "grafana-server".to_string(),
        "--homepath".to_string(),
        "/usr/share/grafana".to_string(),
    ]
}
fn default_root() -> PathBuf {
    PathBuf::from("/")
}
fn default_restart_attempts() -> u32 {
    3
}
fn default_backoff_base_ms() -> u64 {
    500
}
fn default_call_timeout_secs() -> u64 {
    30
}
fn default_ready_attempts() -> u32 {
    10
}
fn default_ready_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_storage_name")]
    pub name: String,
    #[serde(default = "default_mount_path")]
    pub mount_path: PathBuf,
    #[serde(default = "default_min_size_mb")]
    pub min_size_mb: u64,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            name: default_storage_name(),
            mount_path: default_mount_path(),
            min_size_mb: default_min_size_mb(),
        }
    }
}

impl StorageConfig {
    pub fn min_size_bytes(&self) -> u64 {
        self.min_size_mb.saturating_mul(1024 * 1024)
    }
}

fn default_storage_name() -> String {
    "sqlitedb".to_string()
}
fn default_mount_path() -> PathBuf {
    PathBuf::from("/var/lib/grafana")
}
fn default_min_size_mb() -> u64 {
    MIN_STORAGE_MB
}

#[derive(Debug, Deserialize, Clone)]
pub struct ReconcileConfig {
    /// Periodic retry passes scheduled while degraded.
    #[serde(default = "default_periodic_retries")]
    pub periodic_retries: u32,
    #[serde(default = "default_retry_interval_secs")]
    pub retry_interval_secs: u64,
}

impl Default for ReconcileConfig {
    fn default() -> Self {
        Self {
            periodic_retries: default_periodic_retries(),
            retry_interval_secs: default_retry_interval_secs(),
        }
    }
}

fn default_periodic_retries() -> u32 {
    5
}
fn default_retry_interval_secs() -> u64 {
    60
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:7340".to_string()
}

#[derive(Debug, Deserialize, Clone)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Config {
    /// Renderer inputs derived from this configuration.
    pub fn render_settings(&self) -> RenderSettings {
        RenderSettings {
            port: self.grafana.port,
            log_level: self.grafana.log_level.clone(),
            config_dir: self.grafana.config_dir.clone(),
            data_dir: self.storage.mount_path.display().to_string(),
            require_database: self.grafana.require_database,
            admin_user: self.grafana.admin_user.clone(),
            address: self.unit.address.clone(),
            service: self.workload.service.clone(),
            command: self.workload.command.clone(),
        }
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    // Validate unit
    match config.unit.name.split_once('/') {
        Some((app, n)) if !app.is_empty() && !n.is_empty() && n.parse::<u32>().is_ok() => {}
        _ => bail!(
            "unit.name must look like '<app>/<number>', got '{}'",
            config.unit.name
        ),
    }

    // Validate grafana
    if config.grafana.port == 0 {
        bail!("grafana.port must be > 0");
    }
    validate_log_level(&config.grafana.log_level)?;

    // Validate workload
    if config.workload.command.is_empty() {
        bail!("workload.command must not be empty");
    }
    if config.workload.restart_attempts < 1 {
        bail!("workload.restart_attempts must be >= 1");
    }
    if config.workload.ready_attempts < 1 {
        bail!("workload.ready_attempts must be >= 1");
    }

    // Validate storage
    if config.storage.min_size_mb < MIN_STORAGE_MB {
        bail!(
            "storage.min_size_mb must be >= {} (declared storage minimum)",
            MIN_STORAGE_MB
        );
    }

    Ok(())
}

pub fn validate_log_level(level: &str) -> Result<()> {
    if !GRAFANA_LOG_LEVELS.contains(&level) {
        bail!(
            "Unknown Grafana log level: '{}'. Must be one of {}.",
            level,
            GRAFANA_LOG_LEVELS.join(", ")
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(content: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(content.as_bytes()).unwrap();
        f
    }

    const MINIMAL: &str = r#"
[unit]
name = "grafana/0"

[db]
path = "/tmp/operator.sqlite"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let f = write_config(MINIMAL);
        let cfg = load_config(f.path()).unwrap();
        assert_eq!(cfg.grafana.port, 3000);
        assert_eq!(cfg.grafana.log_level, "info");
        assert!(cfg.grafana.require_database);
        assert_eq!(cfg.storage.min_size_bytes(), 100 * 1024 * 1024);
        assert!(cfg.workload.health_url.is_none());
        assert_eq!(cfg.unit.app(), "grafana");
    }

    #[test]
    fn test_rejects_bad_unit_name() {
        let f = write_config(&MINIMAL.replace("grafana/0", "grafana"));
        let err = load_config(f.path()).unwrap_err();
        assert!(err.to_string().contains("unit.name"));
    }

    #[test]
    fn test_rejects_unknown_log_level() {
        let f = write_config(&format!("{}\n[grafana]\nlog_level = \"loud\"\n", MINIMAL));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_rejects_small_storage() {
        let f = write_config(&format!("{}\n[storage]\nmin_size_mb = 10\n", MINIMAL));
        assert!(load_config(f.path()).is_err());
    }

    #[test]
    fn test_backoff_is_exponential_and_capped() {
        let w = WorkloadConfig {
            backoff_base_ms: 100,
            ..Default::default()
        };
        assert_eq!(w.backoff(1), Duration::from_millis(100));
        assert_eq!(w.backoff(2), Duration::from_millis(200));
        assert_eq!(w.backoff(3), Duration::from_millis(400));
        assert_eq!(w.backoff(20), Duration::from_millis(3200));
    }
}
