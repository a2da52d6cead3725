//! Shipped [`Workload`] implementations.
//!
//! [`ProcessWorkload`] treats a directory on the host as the container
//! filesystem and supervises Grafana as a child process. Readiness is
//! Grafana's own `/api/health` endpoint on the port the current layer was
//! rendered with.
//!
//! [`DryRunWorkload`] writes the same files but never starts anything and
//! always reports ready; `replay --dry-run` uses it to inspect what a
//! sequence of events would produce.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use grafana_operator_core::models::ServiceLayer;
use grafana_operator_core::render::{CONFIG_PATH_ENVS, HTTP_PORT_ENV};

use crate::config::Config;
use crate::traits::Workload;

/// Map an absolute container path onto the host directory standing in for
/// the container root.
fn host_path(root: &Path, container_path: &str) -> PathBuf {
    root.join(container_path.trim_start_matches('/'))
}

async fn write_under(root: &Path, path: &str, content: &[u8]) -> Result<()> {
    let target = host_path(root, path);
    if let Some(parent) = target.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    tokio::fs::write(&target, content)
        .await
        .with_context(|| format!("Failed to write {}", target.display()))?;
    Ok(())
}

// ═══════════════════════════════════════════════════════════════════════
// ProcessWorkload
// ═══════════════════════════════════════════════════════════════════════

pub struct ProcessWorkload {
    root: PathBuf,
    /// Fixed readiness URL from configuration; overrides the layer's port.
    health_url: Option<String>,
    default_port: u16,
    client: reqwest::Client,
    layer: Mutex<Option<ServiceLayer>>,
    child: Mutex<Option<Child>>,
}

impl ProcessWorkload {
    pub fn new(config: &Config) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.workload.call_timeout_secs.max(1)))
            .build()?;

        Ok(Self {
            root: config.workload.root.clone(),
            health_url: config.workload.health_url.clone(),
            default_port: config.grafana.port,
            client,
            layer: Mutex::new(None),
            child: Mutex::new(None),
        })
    }

    /// Readiness URL for the given layer.
    fn probe_url(&self, layer: Option<&ServiceLayer>) -> String {
        if let Some(url) = &self.health_url {
            return url.clone();
        }
        let port = layer
            .and_then(|l| l.environment.get(HTTP_PORT_ENV))
            .and_then(|p| p.parse::<u16>().ok())
            .unwrap_or(self.default_port);
        format!("http://127.0.0.1:{}/api/health", port)
    }

    /// The layer's environment with config paths moved under the root,
    /// where [`write_file`](Workload::write_file) puts them.
    fn process_env(&self, layer: &ServiceLayer) -> BTreeMap<String, String> {
        let mut env = layer.environment.clone();
        for key in CONFIG_PATH_ENVS {
            if let Some(path) = env.get_mut(*key) {
                *path = host_path(&self.root, path).display().to_string();
            }
        }
        env
    }

    async fn kill_child(child: &mut Child) -> Result<()> {
        if child.try_wait()?.is_none() {
            child.start_kill()?;
            child.wait().await?;
        }
        Ok(())
    }
}

#[async_trait]
impl Workload for ProcessWorkload {
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        write_under(&self.root, path, content).await?;
        debug!(path, bytes = content.len(), "wrote workload file");
        Ok(())
    }

    async fn add_layer(&self, layer: &ServiceLayer) -> Result<()> {
        if layer.command.is_empty() {
            bail!("service '{}' has an empty command", layer.service);
        }
        *self.layer.lock().await = Some(layer.clone());
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<()> {
        let layer = self.layer.lock().await.clone();
        let Some(layer) = layer else {
            bail!("no layer defines service '{}'", name);
        };
        if layer.service != name {
            bail!("unknown service '{}' (layer defines '{}')", name, layer.service);
        }

        let mut guard = self.child.lock().await;
        if let Some(mut old) = guard.take() {
            Self::kill_child(&mut old).await?;
        }

        // Stdout belongs to the platform's JSON lines.
        let child = Command::new(&layer.command[0])
            .args(&layer.command[1..])
            .envs(self.process_env(&layer))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to spawn '{}'", layer.command[0]))?;

        info!(service = name, pid = child.id(), "service started");
        *guard = Some(child);
        Ok(())
    }

    async fn stop_service(&self, name: &str) -> Result<()> {
        if let Some(mut child) = self.child.lock().await.take() {
            Self::kill_child(&mut child).await?;
            info!(service = name, "service stopped");
        }
        Ok(())
    }

    async fn check_ready(&self, name: &str) -> bool {
        {
            let mut guard = self.child.lock().await;
            match guard.as_mut().map(|c| c.try_wait()) {
                Some(Ok(None)) => {}
                Some(Ok(Some(exit))) => {
                    warn!(service = name, %exit, "service exited");
                    *guard = None;
                    return false;
                }
                Some(Err(e)) => {
                    warn!(service = name, error = %e, "cannot poll service");
                    return false;
                }
                None => return false,
            }
        }

        let url = self.probe_url(self.layer.lock().await.as_ref());
        match self.client.get(&url).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!(service = name, error = %e, "health check failed");
                false
            }
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// DryRunWorkload
// ═══════════════════════════════════════════════════════════════════════

pub struct DryRunWorkload {
    root: PathBuf,
    layer: Mutex<Option<ServiceLayer>>,
}

impl DryRunWorkload {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            layer: Mutex::new(None),
        }
    }

    /// The last layer added, if any.
    pub async fn layer(&self) -> Option<ServiceLayer> {
        self.layer.lock().await.clone()
    }
}

#[async_trait]
impl Workload for DryRunWorkload {
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()> {
        write_under(&self.root, path, content).await
    }

    async fn add_layer(&self, layer: &ServiceLayer) -> Result<()> {
        *self.layer.lock().await = Some(layer.clone());
        Ok(())
    }

    async fn restart_service(&self, name: &str) -> Result<()> {
        debug!(service = name, "dry run: restart skipped");
        Ok(())
    }

    async fn stop_service(&self, _name: &str) -> Result<()> {
        Ok(())
    }

    async fn check_ready(&self, _name: &str) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    #[test]
    fn test_host_path_strips_leading_slash() {
        let p = host_path(Path::new("/tmp/root"), "/etc/grafana/grafana.ini");
        assert_eq!(p, PathBuf::from("/tmp/root/etc/grafana/grafana.ini"));
    }

    #[tokio::test]
    async fn test_dry_run_writes_under_root() {
        let dir = TempDir::new().unwrap();
        let w = DryRunWorkload::new(dir.path());
        w.write_file("/etc/grafana/grafana.ini", b"[server]\n")
            .await
            .unwrap();
        let written = std::fs::read(dir.path().join("etc/grafana/grafana.ini")).unwrap();
        assert_eq!(written, b"[server]\n");
        assert!(w.check_ready("grafana").await);
    }

    fn process_workload(dir: &TempDir, extra: &str) -> ProcessWorkload {
        let toml = format!(
            "[unit]\nname = \"grafana/0\"\n[db]\npath = \"{}\"\n[grafana]\nport = 3999\n[workload]\nroot = \"{}\"\n{}",
            dir.path().join("s.sqlite").display(),
            dir.path().display(),
            extra
        );
        let config: Config = toml::from_str(&toml).unwrap();
        ProcessWorkload::new(&config).unwrap()
    }

    fn layer(env: &[(&str, &str)]) -> ServiceLayer {
        ServiceLayer {
            summary: "grafana layer".into(),
            service: "grafana".into(),
            command: vec!["grafana-server".into()],
            environment: env
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            startup: "enabled".into(),
        }
    }

    #[test]
    fn test_probe_follows_layer_port() {
        let dir = TempDir::new().unwrap();
        let w = process_workload(&dir, "");
        assert_eq!(w.probe_url(None), "http://127.0.0.1:3999/api/health");
        assert_eq!(
            w.probe_url(Some(&layer(&[(HTTP_PORT_ENV, "32821")]))),
            "http://127.0.0.1:32821/api/health"
        );

        let fixed = process_workload(&dir, "health_url = \"http://grafana:3000/api/health\"\n");
        assert_eq!(
            fixed.probe_url(Some(&layer(&[(HTTP_PORT_ENV, "32821")]))),
            "http://grafana:3000/api/health"
        );
    }

    #[test]
    fn test_process_env_points_config_paths_under_root() {
        let dir = TempDir::new().unwrap();
        let w = process_workload(&dir, "");
        let env = w.process_env(&layer(&[
            ("GF_PATHS_CONFIG", "/etc/grafana/grafana.ini"),
            ("GF_PATHS_PROVISIONING", "/etc/grafana/provisioning"),
            ("GF_PATHS_DATA", "/var/lib/grafana"),
        ]));
        assert_eq!(
            env["GF_PATHS_CONFIG"],
            dir.path().join("etc/grafana/grafana.ini").display().to_string()
        );
        assert_eq!(
            env["GF_PATHS_PROVISIONING"],
            dir.path().join("etc/grafana/provisioning").display().to_string()
        );
        assert_eq!(env["GF_PATHS_DATA"], "/var/lib/grafana");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_spawned_service_sees_rewritten_env() {
        let dir = TempDir::new().unwrap();
        let w = process_workload(&dir, "");
        let out = dir.path().join("env.txt");
        let mut l = layer(&[("GF_PATHS_CONFIG", "/etc/grafana/grafana.ini")]);
        l.command = vec![
            "sh".into(),
            "-c".into(),
            format!("echo \"$GF_PATHS_CONFIG\" > {}", out.display()),
        ];
        w.add_layer(&l).await.unwrap();
        w.restart_service("grafana").await.unwrap();

        let mut written = String::new();
        for _ in 0..100 {
            written = std::fs::read_to_string(&out).unwrap_or_default();
            if written.ends_with('\n') {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(
            written.trim(),
            dir.path().join("etc/grafana/grafana.ini").display().to_string()
        );
        w.stop_service("grafana").await.unwrap();
    }

    #[tokio::test]
    async fn test_process_workload_rejects_unknown_service() {
        let dir = TempDir::new().unwrap();
        let w = process_workload(&dir, "");

        assert!(w.restart_service("grafana").await.is_err());

        w.add_layer(&ServiceLayer {
            summary: "grafana layer".into(),
            service: "grafana".into(),
            command: vec!["true".into()],
            environment: BTreeMap::new(),
            startup: "enabled".into(),
        })
        .await
        .unwrap();
        assert!(w.restart_service("other").await.is_err());
        assert!(!w.check_ready("grafana").await);
        w.stop_service("grafana").await.unwrap();
    }
}
