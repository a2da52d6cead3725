//! Core data models used throughout the operator.
//!
//! These types describe relation data as the platform delivers it, the typed
//! descriptors decoded from it, and the artifacts the renderer produces.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Key-value data bag for one unit on one relation.
pub type RawData = BTreeMap<String, String>;

/// The interface contract a relation conforms to.
///
/// Serialized with the declared interface names so that event payloads and
/// relation dumps match what the platform reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum InterfaceKind {
    #[serde(rename = "grafana-datasource")]
    Datasource,
    #[serde(rename = "grafana-dash")]
    Dashboard,
    #[serde(rename = "mysql")]
    Database,
    #[serde(rename = "ingress")]
    Ingress,
    #[serde(rename = "grafana-peers")]
    Peer,
}

impl InterfaceKind {
    /// Returns the declared interface name (e.g. `"grafana-datasource"`).
    pub fn interface_name(&self) -> &'static str {
        match self {
            InterfaceKind::Datasource => "grafana-datasource",
            InterfaceKind::Dashboard => "grafana-dash",
            InterfaceKind::Database => "mysql",
            InterfaceKind::Ingress => "ingress",
            InterfaceKind::Peer => "grafana-peers",
        }
    }

    pub fn from_interface_name(name: &str) -> Option<Self> {
        match name {
            "grafana-datasource" => Some(InterfaceKind::Datasource),
            "grafana-dash" => Some(InterfaceKind::Dashboard),
            "mysql" => Some(InterfaceKind::Database),
            "ingress" => Some(InterfaceKind::Ingress),
            "grafana-peers" => Some(InterfaceKind::Peer),
            _ => None,
        }
    }
}

impl fmt::Display for InterfaceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.interface_name())
    }
}

/// A relation as seen from the local unit.
///
/// The interface kind is fixed at construction; there is no setter.
/// `data` holds one bag per unit, including the local unit's own bag when
/// the platform reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct RelationDescriptor {
    pub id: u32,
    pub name: String,
    #[serde(rename = "interface")]
    kind: InterfaceKind,
    pub local_unit: String,
    #[serde(default)]
    pub remote_units: BTreeSet<String>,
    #[serde(default)]
    pub data: BTreeMap<String, RawData>,
}

impl RelationDescriptor {
    pub fn new(
        id: u32,
        name: impl Into<String>,
        kind: InterfaceKind,
        local_unit: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            kind,
            local_unit: local_unit.into(),
            remote_units: BTreeSet::new(),
            data: BTreeMap::new(),
        }
    }

    pub fn kind(&self) -> InterfaceKind {
        self.kind
    }

    /// Add a remote unit together with its data bag.
    pub fn with_unit(mut self, unit: impl Into<String>, data: RawData) -> Self {
        let unit = unit.into();
        self.remote_units.insert(unit.clone());
        self.data.insert(unit, data);
        self
    }

    pub fn unit_data(&self, unit: &str) -> Option<&RawData> {
        self.data.get(unit)
    }

    /// Remote units in sorted order, paired with their data bag.
    ///
    /// Units that have not written anything yet yield an empty bag.
    pub fn remote_data(&self) -> impl Iterator<Item = (&str, &RawData)> + '_ {
        static EMPTY: RawData = BTreeMap::new();
        self.remote_units
            .iter()
            .map(move |u| (u.as_str(), self.data.get(u).unwrap_or(&EMPTY)))
    }

    /// Remove a remote unit and its data bag. Returns true if it was present.
    pub fn remove_unit(&mut self, unit: &str) -> bool {
        let was_present = self.remote_units.remove(unit);
        self.data.remove(unit);
        was_present
    }
}

/// How Grafana reaches a datasource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessMode {
    /// Requests go through the Grafana backend.
    Proxy,
    /// Requests go straight from the browser.
    Direct,
}

impl AccessMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessMode::Proxy => "proxy",
            AccessMode::Direct => "direct",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatasourceInfo {
    pub name: String,
    pub source_type: String,
    pub url: String,
    pub access: AccessMode,
    pub is_default: bool,
    /// Unit that published the entry.
    pub source_unit: String,
    /// Keys this version does not understand, preserved verbatim.
    pub extra: RawData,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DashboardDescriptor {
    pub title: String,
    /// Serialized panel definitions (JSON).
    pub content: String,
    pub source_unit: String,
    pub extra: RawData,
}

/// Database driver Grafana should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseDriver {
    Mysql,
    Postgres,
}

impl DatabaseDriver {
    pub fn as_str(&self) -> &'static str {
        match self {
            DatabaseDriver::Mysql => "mysql",
            DatabaseDriver::Postgres => "postgres",
        }
    }
}

#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredential {
    pub driver: DatabaseDriver,
    pub host: String,
    pub port: u16,
    pub database: String,
    pub user: String,
    pub password: String,
    pub tls: bool,
    pub extra: RawData,
}

impl DatabaseCredential {
    /// Stable identity of the database this credential points at.
    ///
    /// Credentials rotating for the same database keep the same identity,
    /// so a password change does not re-trigger the leader-gated migration.
    pub fn identity(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.driver.as_str().as_bytes());
        hasher.update([0]);
        hasher.update(self.host.as_bytes());
        hasher.update([0]);
        hasher.update(self.port.to_le_bytes());
        hasher.update(self.database.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Debug for DatabaseCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredential")
            .field("driver", &self.driver)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("tls", &self.tls)
            .finish()
    }
}

/// Routing information handed back by an ingress provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressInfo {
    /// Externally reachable URL for this application.
    pub url: String,
    pub extra: RawData,
}

/// One unit's entry in the peer relation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize)]
pub struct PeerState {
    pub unit: String,
    pub leader: bool,
    /// Fingerprint of the last configuration this unit applied.
    pub fingerprint: Option<String>,
    pub ready: bool,
    /// Address other units can reach this one on.
    pub address: Option<String>,
    /// Identity of the database whose schema this unit migrated (leader only).
    pub migrated_database: Option<String>,
    #[serde(skip)]
    pub extra: RawData,
}

/// Pebble-style service layer for the workload container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceLayer {
    pub summary: String,
    pub service: String,
    pub command: Vec<String>,
    pub environment: BTreeMap<String, String>,
    pub startup: String,
}

/// A fully rendered workload configuration.
///
/// Immutable: a different relation state yields a different instance;
/// [`with_generation`](ConfigArtifact::with_generation) consumes the artifact
/// and returns a new one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigArtifact {
    files: BTreeMap<String, Vec<u8>>,
    layer: ServiceLayer,
    fingerprint: String,
    generation: u64,
}

impl ConfigArtifact {
    /// Build an artifact and compute its fingerprint. Generation starts at 0.
    pub fn new(files: BTreeMap<String, Vec<u8>>, layer: ServiceLayer) -> Self {
        let fingerprint = fingerprint(&files, &layer);
        Self {
            files,
            layer,
            fingerprint,
            generation: 0,
        }
    }

    pub fn with_generation(self, generation: u64) -> Self {
        Self { generation, ..self }
    }

    pub fn files(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.files
    }

    pub fn file(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(|v| v.as_slice())
    }

    pub fn layer(&self) -> &ServiceLayer {
        &self.layer
    }

    /// SHA-256 over every file (path and content) and the service layer, hex encoded.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

fn fingerprint(files: &BTreeMap<String, Vec<u8>>, layer: &ServiceLayer) -> String {
    let mut hasher = Sha256::new();
    for (path, content) in files {
        hasher.update(path.as_bytes());
        hasher.update([0]);
        hasher.update((content.len() as u64).to_le_bytes());
        hasher.update(content);
    }
    hasher.update(layer.summary.as_bytes());
    hasher.update([0]);
    hasher.update(layer.service.as_bytes());
    hasher.update([0]);
    for arg in &layer.command {
        hasher.update(arg.as_bytes());
        hasher.update([0]);
    }
    for (k, v) in &layer.environment {
        hasher.update(k.as_bytes());
        hasher.update([b'=']);
        hasher.update(v.as_bytes());
        hasher.update([0]);
    }
    hasher.update(layer.startup.as_bytes());
    hex::encode(hasher.finalize())
}

/// Persistent volume as seen by this unit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageState {
    pub mount_path: PathBuf,
    pub initialized: bool,
    pub size_bytes: Option<u64>,
}

/// Unit status categories understood by the platform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StatusKind {
    Maintenance,
    Waiting,
    Active,
    Blocked,
    Error,
}

impl StatusKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Maintenance => "maintenance",
            StatusKind::Waiting => "waiting",
            StatusKind::Active => "active",
            StatusKind::Blocked => "blocked",
            StatusKind::Error => "error",
        }
    }
}

/// Status published after every reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitStatus {
    pub kind: StatusKind,
    pub message: String,
}

impl UnitStatus {
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            f.write_str(self.kind.as_str())
        } else {
            write!(f, "{}: {}", self.kind.as_str(), self.message)
        }
    }
}
