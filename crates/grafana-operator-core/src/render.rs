//! Configuration renderer.
//!
//! [`render`] is a pure function from relation state, peer state, and
//! operator settings to a [`ConfigArtifact`]. Identical inputs produce
//! byte-identical output, which is what lets the controller skip work when
//! the fingerprint is unchanged.
//!
//! # Ordering
//!
//! Datasources are sorted by `(name, source_unit)` and dashboards by
//! `(title, source_unit, content)` before anything is written, so the order in which
//! the platform delivered relation events never shows up in the output.
//!
//! # Conflicts
//!
//! - Two datasources with the same name: the one from the lowest-sorting
//!   unit is kept.
//! - More than one datasource flagged default: only the first (by sort
//!   order) stays default; Grafana refuses to provision two.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write;

use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::error::RenderError;
use crate::models::{
    ConfigArtifact, DashboardDescriptor, DatabaseCredential, DatabaseDriver, DatasourceInfo,
    PeerState, ServiceLayer,
};
use crate::relation::RelationSnapshot;

/// Port Grafana's alerting cluster gossips on.
pub const HA_GOSSIP_PORT: u16 = 9094;

/// Layer environment carrying the rendered HTTP port.
pub const HTTP_PORT_ENV: &str = "GF_SERVER_HTTP_PORT";

/// Layer environment variables naming files the workload writes, as
/// container paths. `GF_PATHS_DATA` is the storage mount and is not one.
pub const CONFIG_PATH_ENVS: &[&str] = &["GF_PATHS_CONFIG", "GF_PATHS_PROVISIONING"];

/// Operator-side inputs to rendering (from configuration, not relations).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenderSettings {
    pub port: u16,
    pub log_level: String,
    /// Directory holding `grafana.ini` and `provisioning/`.
    pub config_dir: String,
    /// Storage mount path; Grafana's data directory.
    pub data_dir: String,
    /// Refuse to fall back to sqlite when no database relation exists.
    pub require_database: bool,
    pub admin_user: String,
    /// This unit's address, included in the alerting peer list.
    pub address: Option<String>,
    pub service: String,
    pub command: Vec<String>,
}

impl RenderSettings {
    pub fn ini_path(&self) -> String {
        format!("{}/grafana.ini", self.config_dir.trim_end_matches('/'))
    }

    pub fn provisioning_dir(&self) -> String {
        format!("{}/provisioning", self.config_dir.trim_end_matches('/'))
    }

    pub fn datasources_path(&self) -> String {
        format!("{}/datasources/datasources.yaml", self.provisioning_dir())
    }

    pub fn dashboards_provider_path(&self) -> String {
        format!("{}/dashboards/dashboards.yaml", self.provisioning_dir())
    }

    pub fn dashboards_dir(&self) -> String {
        format!("{}/dashboards/json", self.provisioning_dir())
    }
}

/// Render the complete workload configuration.
///
/// `peers` are the other units of this application; any peer at all means
/// the units must share an external database.
pub fn render(
    settings: &RenderSettings,
    relations: &RelationSnapshot,
    peers: &[PeerState],
) -> Result<ConfigArtifact, RenderError> {
    let database = match relations.database.credential() {
        Some(c) => Some(c),
        None if settings.require_database || !peers.is_empty() => {
            return Err(RenderError::NoDatabase)
        }
        None => None,
    };

    let datasources = normalize_datasources(&relations.datasources);
    let dashboards = sorted_dashboards(&relations.dashboards);
    let ha_peers = ha_peer_list(settings, peers);
    let root_url = relations.ingress.as_ref().map(|i| i.url.as_str());

    let mut files = BTreeMap::new();
    files.insert(
        settings.ini_path(),
        render_ini(settings, database, root_url, &ha_peers).into_bytes(),
    );
    files.insert(
        settings.datasources_path(),
        render_datasources(&datasources)?.into_bytes(),
    );
    files.insert(
        settings.dashboards_provider_path(),
        render_dashboard_provider()?.into_bytes(),
    );
    for dash in &dashboards {
        let path = dashboard_path(settings, dash, &files);
        files.insert(path, dash.content.clone().into_bytes());
    }

    let mut environment = BTreeMap::new();
    environment.insert("GF_PATHS_CONFIG".to_string(), settings.ini_path());
    environment.insert("GF_PATHS_DATA".to_string(), settings.data_dir.clone());
    environment.insert(
        "GF_PATHS_PROVISIONING".to_string(),
        settings.provisioning_dir(),
    );
    environment.insert(HTTP_PORT_ENV.to_string(), settings.port.to_string());

    let layer = ServiceLayer {
        summary: "grafana layer".to_string(),
        service: settings.service.clone(),
        command: settings.command.clone(),
        environment,
        startup: "enabled".to_string(),
    };

    Ok(ConfigArtifact::new(files, layer))
}

fn normalize_datasources(input: &[DatasourceInfo]) -> Vec<DatasourceInfo> {
    let mut sorted: Vec<DatasourceInfo> = input.to_vec();
    sorted.sort_by(|a, b| {
        a.name
            .cmp(&b.name)
            .then_with(|| a.source_unit.cmp(&b.source_unit))
    });

    let mut seen = BTreeSet::new();
    let mut default_taken = false;
    let mut out = Vec::with_capacity(sorted.len());
    for mut ds in sorted {
        if !seen.insert(ds.name.clone()) {
            continue;
        }
        if ds.is_default {
            if default_taken {
                ds.is_default = false;
            }
            default_taken = true;
        }
        out.push(ds);
    }
    out
}

fn sorted_dashboards(input: &[DashboardDescriptor]) -> Vec<DashboardDescriptor> {
    let mut sorted = input.to_vec();
    sorted.sort_by(|a, b| {
        a.title
            .cmp(&b.title)
            .then_with(|| a.source_unit.cmp(&b.source_unit))
            .then_with(|| a.content.cmp(&b.content))
    });
    sorted
}

/// `<title>--<unit>-<hash>.json`, where the hash covers the unslugged title
/// and unit so that inputs slugging alike still get distinct files. The same
/// title from the same unit on two relations takes a numeric suffix, in
/// sort order.
fn dashboard_path(
    settings: &RenderSettings,
    dash: &DashboardDescriptor,
    taken: &BTreeMap<String, Vec<u8>>,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(dash.title.as_bytes());
    hasher.update([0u8]);
    hasher.update(dash.source_unit.as_bytes());
    let digest = hex::encode(hasher.finalize());

    let stem = format!(
        "{}/{}--{}-{}",
        settings.dashboards_dir(),
        slug(&dash.title),
        slug(&dash.source_unit),
        &digest[..8]
    );
    let mut path = format!("{}.json", stem);
    let mut n = 2;
    while taken.contains_key(&path) {
        path = format!("{}-{}.json", stem, n);
        n += 1;
    }
    path
}

fn ha_peer_list(settings: &RenderSettings, peers: &[PeerState]) -> Vec<String> {
    if peers.is_empty() {
        return Vec::new();
    }
    let addresses: BTreeSet<&str> = peers
        .iter()
        .filter_map(|p| p.address.as_deref())
        .chain(settings.address.as_deref())
        .collect();
    addresses
        .into_iter()
        .map(|a| format!("{}:{}", a, HA_GOSSIP_PORT))
        .collect()
}

fn render_ini(
    settings: &RenderSettings,
    database: Option<&DatabaseCredential>,
    root_url: Option<&str>,
    ha_peers: &[String],
) -> String {
    // write! into a String cannot fail.
    let mut ini = String::new();
    let _ = writeln!(ini, "# Managed by grafana-operator; local edits are overwritten.");
    let _ = writeln!(ini);

    let _ = writeln!(ini, "[server]");
    let _ = writeln!(ini, "http_port = {}", settings.port);
    if let Some(url) = root_url {
        let _ = writeln!(ini, "root_url = {}", url);
        if has_sub_path(url) {
            let _ = writeln!(ini, "serve_from_sub_path = true");
        }
    }
    let _ = writeln!(ini);

    let _ = writeln!(ini, "[log]");
    let _ = writeln!(ini, "level = {}", settings.log_level);
    let _ = writeln!(ini);

    let _ = writeln!(ini, "[paths]");
    let _ = writeln!(ini, "data = {}", settings.data_dir);
    let _ = writeln!(ini, "provisioning = {}", settings.provisioning_dir());
    let _ = writeln!(ini);

    let _ = writeln!(ini, "[database]");
    match database {
        Some(c) => {
            let _ = writeln!(ini, "type = {}", c.driver.as_str());
            let _ = writeln!(ini, "host = {}:{}", c.host, c.port);
            let _ = writeln!(ini, "name = {}", c.database);
            let _ = writeln!(ini, "user = {}", c.user);
            let _ = writeln!(ini, "password = \"\"\"{}\"\"\"", c.password);
            let ssl_mode = match (c.driver, c.tls) {
                (DatabaseDriver::Mysql, true) => "true",
                (DatabaseDriver::Mysql, false) => "false",
                (DatabaseDriver::Postgres, true) => "require",
                (DatabaseDriver::Postgres, false) => "disable",
            };
            let _ = writeln!(ini, "ssl_mode = {}", ssl_mode);
        }
        None => {
            let _ = writeln!(ini, "type = sqlite3");
            let _ = writeln!(ini, "path = grafana.db");
        }
    }
    let _ = writeln!(ini);

    let _ = writeln!(ini, "[security]");
    let _ = writeln!(ini, "admin_user = {}", settings.admin_user);

    if !ha_peers.is_empty() {
        let _ = writeln!(ini);
        let _ = writeln!(ini, "[unified_alerting]");
        let _ = writeln!(ini, "ha_listen_address = 0.0.0.0:{}", HA_GOSSIP_PORT);
        let _ = writeln!(ini, "ha_peers = {}", ha_peers.join(","));
    }
    ini
}

fn has_sub_path(url: &str) -> bool {
    let rest = url.split_once("://").map(|(_, r)| r).unwrap_or(url);
    match rest.find('/') {
        Some(i) => !rest[i..].trim_matches('/').is_empty(),
        None => false,
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasourceDocument<'a> {
    api_version: u32,
    datasources: Vec<DatasourceEntry<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DatasourceEntry<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    source_type: &'a str,
    url: &'a str,
    access: &'a str,
    is_default: bool,
    editable: bool,
}

fn render_datasources(datasources: &[DatasourceInfo]) -> Result<String, RenderError> {
    let doc = DatasourceDocument {
        api_version: 1,
        datasources: datasources
            .iter()
            .map(|ds| DatasourceEntry {
                name: &ds.name,
                source_type: &ds.source_type,
                url: &ds.url,
                access: ds.access.as_str(),
                is_default: ds.is_default,
                editable: false,
            })
            .collect(),
    };
    // JSON is valid YAML; Grafana's provisioning loader accepts it as-is.
    serde_json::to_string_pretty(&doc).map_err(|e| RenderError::Serialize {
        document: "datasources.yaml",
        reason: e.to_string(),
    })
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardProviderDocument<'a> {
    api_version: u32,
    providers: Vec<DashboardProvider<'a>>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct DashboardProvider<'a> {
    name: &'a str,
    #[serde(rename = "type")]
    provider_type: &'a str,
    disable_deletion: bool,
    allow_ui_updates: bool,
    options: ProviderOptions,
}

#[derive(Serialize)]
struct ProviderOptions {
    path: String,
}

fn render_dashboard_provider() -> Result<String, RenderError> {
    let doc = DashboardProviderDocument {
        api_version: 1,
        providers: vec![DashboardProvider {
            name: "grafana-operator",
            provider_type: "file",
            disable_deletion: false,
            allow_ui_updates: false,
            // Grafana expands this, so the path follows wherever the
            // provisioning directory ends up.
            options: ProviderOptions {
                path: "${GF_PATHS_PROVISIONING}/dashboards/json".to_string(),
            },
        }],
    };
    serde_json::to_string_pretty(&doc).map_err(|e| RenderError::Serialize {
        document: "dashboards.yaml",
        reason: e.to_string(),
    })
}

/// Lowercase, alphanumerics kept, everything else collapsed to `-`.
fn slug(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut dash = false;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            dash = false;
        } else if !dash && !out.is_empty() {
            out.push('-');
            dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("untitled");
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AccessMode, IngressInfo, RawData};
    use crate::relation::DatabaseState;

    fn settings() -> RenderSettings {
        RenderSettings {
            port: 3000,
            log_level: "info".to_string(),
            config_dir: "/etc/grafana".to_string(),
            data_dir: "/var/lib/grafana".to_string(),
            require_database: true,
            admin_user: "admin".to_string(),
            address: None,
            service: "grafana".to_string(),
            command: vec!["grafana-server".to_string()],
        }
    }

    fn cred() -> DatabaseCredential {
        DatabaseCredential {
            driver: DatabaseDriver::Mysql,
            host: "db.local".to_string(),
            port: 3306,
            database: "grafana".to_string(),
            user: "u".to_string(),
            password: "p".to_string(),
            tls: false,
            extra: RawData::new(),
        }
    }

    fn ds(name: &str, unit: &str, is_default: bool) -> DatasourceInfo {
        DatasourceInfo {
            name: name.to_string(),
            source_type: name.to_string(),
            url: format!("http://{}:9090", name),
            access: AccessMode::Proxy,
            is_default,
            source_unit: unit.to_string(),
            extra: RawData::new(),
        }
    }

    fn snapshot_with(datasources: Vec<DatasourceInfo>) -> RelationSnapshot {
        RelationSnapshot {
            datasources,
            database: DatabaseState::Ready(cred()),
            ..Default::default()
        }
    }

    fn ini(artifact: &ConfigArtifact) -> String {
        String::from_utf8(artifact.file("/etc/grafana/grafana.ini").unwrap().to_vec()).unwrap()
    }

    #[test]
    fn test_render_is_deterministic() {
        let snap = snapshot_with(vec![ds("prometheus", "prometheus/0", true)]);
        let a = render(&settings(), &snap, &[]).unwrap();
        let b = render(&settings(), &snap, &[]).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_datasource_order_does_not_matter() {
        let forward = snapshot_with(vec![ds("prometheus", "prometheus/0", false), ds("loki", "loki/0", false)]);
        let reverse = snapshot_with(vec![ds("loki", "loki/0", false), ds("prometheus", "prometheus/0", false)]);
        let a = render(&settings(), &forward, &[]).unwrap();
        let b = render(&settings(), &reverse, &[]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());

        let doc = String::from_utf8(
            a.file("/etc/grafana/provisioning/datasources/datasources.yaml")
                .unwrap()
                .to_vec(),
        )
        .unwrap();
        let loki = doc.find("\"loki\"").unwrap();
        let prom = doc.find("\"prometheus\"").unwrap();
        assert!(loki < prom, "datasources must be sorted by name");
    }

    #[test]
    fn test_no_database_when_required() {
        let snap = RelationSnapshot::default();
        assert_eq!(render(&settings(), &snap, &[]), Err(RenderError::NoDatabase));
    }

    #[test]
    fn test_sqlite_fallback_for_single_unit() {
        let mut s = settings();
        s.require_database = false;
        let artifact = render(&s, &RelationSnapshot::default(), &[]).unwrap();
        assert!(ini(&artifact).contains("type = sqlite3"));

        let peer = PeerState {
            unit: "grafana/1".to_string(),
            ..Default::default()
        };
        assert_eq!(
            render(&s, &RelationSnapshot::default(), &[peer]),
            Err(RenderError::NoDatabase)
        );
    }

    #[test]
    fn test_duplicate_names_and_defaults() {
        let snap = snapshot_with(vec![
            ds("prometheus", "prometheus/1", true),
            ds("prometheus", "prometheus/0", false),
            ds("loki", "loki/0", true),
        ]);
        let artifact = render(&settings(), &snap, &[]).unwrap();
        let doc: serde_json::Value = serde_json::from_slice(
            artifact
                .file("/etc/grafana/provisioning/datasources/datasources.yaml")
                .unwrap(),
        )
        .unwrap();
        let list = doc["datasources"].as_array().unwrap();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0]["name"], "loki");
        assert_eq!(list[0]["isDefault"], true);
        assert_eq!(list[1]["name"], "prometheus");
        assert_eq!(list[1]["isDefault"], false);
    }

    #[test]
    fn test_ingress_sets_root_url() {
        let mut snap = snapshot_with(vec![]);
        snap.ingress = Some(IngressInfo {
            url: "https://example.com/grafana".to_string(),
            extra: RawData::new(),
        });
        let text = ini(&render(&settings(), &snap, &[]).unwrap());
        assert!(text.contains("root_url = https://example.com/grafana"));
        assert!(text.contains("serve_from_sub_path = true"));
    }

    #[test]
    fn test_database_section() {
        let text = ini(&render(&settings(), &snapshot_with(vec![]), &[]).unwrap());
        assert!(text.contains("type = mysql"));
        assert!(text.contains("host = db.local:3306"));
        assert!(text.contains("name = grafana"));
        assert!(text.contains("password = \"\"\"p\"\"\""));
    }

    #[test]
    fn test_dashboards_written_sorted() {
        let mut snap = snapshot_with(vec![]);
        snap.dashboards = vec![
            DashboardDescriptor {
                title: "Node Exporter".to_string(),
                content: "{}".to_string(),
                source_unit: "node/0".to_string(),
                extra: RawData::new(),
            },
            DashboardDescriptor {
                title: "API Latency".to_string(),
                content: "{\"panels\":[]}".to_string(),
                source_unit: "api/0".to_string(),
                extra: RawData::new(),
            },
        ];
        let artifact = render(&settings(), &snap, &[]).unwrap();
        let names: Vec<&str> = dashboard_files(&artifact).into_iter().map(|(p, _)| p).collect();
        assert_eq!(names.len(), 2);
        assert!(names[0].starts_with("/etc/grafana/provisioning/dashboards/json/api-latency--api-0-"));
        assert!(names[1].starts_with("/etc/grafana/provisioning/dashboards/json/node-exporter--node-0-"));
    }

    fn dashboard_files(artifact: &ConfigArtifact) -> Vec<(&str, &[u8])> {
        artifact
            .files()
            .iter()
            .filter(|(p, _)| p.starts_with("/etc/grafana/provisioning/dashboards/json/"))
            .map(|(p, c)| (p.as_str(), c.as_slice()))
            .collect()
    }

    fn dashboard(title: &str, unit: &str, content: &str) -> DashboardDescriptor {
        DashboardDescriptor {
            title: title.to_string(),
            content: content.to_string(),
            source_unit: unit.to_string(),
            extra: RawData::new(),
        }
    }

    #[test]
    fn test_dashboards_with_colliding_slugs_are_all_kept() {
        let mut snap = snapshot_with(vec![]);
        snap.dashboards = vec![
            dashboard("API Latency", "app/0", "{\"a\":1}"),
            dashboard("api-latency", "app-0", "{\"b\":2}"),
            // Same title from the same unit over two relations.
            dashboard("Errors", "app/0", "{\"c\":3}"),
            dashboard("Errors", "app/0", "{\"d\":4}"),
        ];
        let artifact = render(&settings(), &snap, &[]).unwrap();
        let mut contents: Vec<&[u8]> = dashboard_files(&artifact).into_iter().map(|(_, c)| c).collect();
        contents.sort();
        assert_eq!(
            contents,
            vec![
                b"{\"a\":1}".as_slice(),
                b"{\"b\":2}".as_slice(),
                b"{\"c\":3}".as_slice(),
                b"{\"d\":4}".as_slice(),
            ]
        );

        // Delivery order does not move dashboards between files.
        snap.dashboards.reverse();
        assert_eq!(render(&settings(), &snap, &[]).unwrap(), artifact);
    }

    #[test]
    fn test_layer_carries_rendered_port() {
        let mut s = settings();
        s.port = 3999;
        let artifact = render(&s, &snapshot_with(vec![]), &[]).unwrap();
        assert_eq!(
            artifact.layer().environment.get(HTTP_PORT_ENV).map(String::as_str),
            Some("3999")
        );
        assert!(ini(&artifact).contains("http_port = 3999"));
    }

    #[test]
    fn test_ha_peers_same_on_every_unit() {
        let mut s0 = settings();
        s0.address = Some("10.0.0.1".to_string());
        let mut s1 = settings();
        s1.address = Some("10.0.0.2".to_string());
        let p0 = PeerState {
            unit: "grafana/0".to_string(),
            address: Some("10.0.0.1".to_string()),
            ..Default::default()
        };
        let p1 = PeerState {
            unit: "grafana/1".to_string(),
            address: Some("10.0.0.2".to_string()),
            ..Default::default()
        };
        let snap = snapshot_with(vec![]);
        let a = render(&s0, &snap, &[p1]).unwrap();
        let b = render(&s1, &snap, &[p0]).unwrap();
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert!(ini(&a).contains("ha_peers = 10.0.0.1:9094,10.0.0.2:9094"));
    }

    #[test]
    fn test_slug() {
        assert_eq!(slug("Node Exporter / Full"), "node-exporter-full");
        assert_eq!(slug("grafana/0"), "grafana-0");
        assert_eq!(slug("???"), "untitled");
    }
}
