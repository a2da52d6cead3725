//! Reconciliation controller.
//!
//! [`Controller::handle`] runs one reconciliation pass per event:
//!
//! ```text
//! event ─▶ observe ─▶ storage ─▶ container ─▶ snapshot ─▶ peers ─▶ render
//!                                                                    │
//!          status ◀── persist ◀── publish ◀── apply? ◀── gate ◀──────┘
//! ```
//!
//! Every failure is converted into a [`PassOutcome`] at the pass boundary;
//! the pure [`Phase::next`] turns that into the unit's phase and status.
//! Nothing in a pass returns an error to the caller.
//!
//! When the rendered fingerprint equals the last applied one, the pass makes
//! no container control-plane call at all.

use anyhow::Result;
use serde::Serialize;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use grafana_operator_core::error::FatalError;
use grafana_operator_core::models::{
    ConfigArtifact, InterfaceKind, PeerState, RawData, UnitStatus,
};
use grafana_operator_core::relation::{DatabaseState, RelationView, SnapshotError};
use grafana_operator_core::render::{render, RenderSettings};
use grafana_operator_core::state::{PassOutcome, Phase, WaitReason};
use grafana_operator_core::store::{ControllerRecord, StateStore};
use grafana_operator_core::RenderError;

use crate::config::{validate_log_level, Config};
use crate::error::{ApplyError, StorageError};
use crate::events::Event;
use crate::peers::{MigrationGate, PeerCoordinator};
use crate::storage::StorageManager;
use crate::traits::{Leadership, ObservedLeadership, Platform, Workload};

/// Relation-data keys this unit publishes as a provider.
pub mod provider_keys {
    pub const GRAFANA_URL: &str = "grafana-url";
    pub const SERVICE_HOSTNAME: &str = "service-hostname";
    pub const SERVICE_NAME: &str = "service-name";
    pub const SERVICE_PORT: &str = "service-port";
}

/// The collaborators a controller drives.
#[derive(Clone)]
pub struct Collaborators {
    pub workload: Arc<dyn Workload>,
    pub platform: Arc<dyn Platform>,
    pub store: Arc<dyn StateStore>,
    pub leadership: Arc<ObservedLeadership>,
}

/// Snapshot of the controller after a pass, for `/status` and the CLI.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusReport {
    pub unit: String,
    #[serde(flatten)]
    pub phase: Phase,
    pub status: UnitStatus,
    pub fingerprint: Option<String>,
    pub generation: u64,
    pub leader: bool,
    pub container_ready: bool,
    pub storage_ready: bool,
    pub peers_converged: bool,
}

pub struct Controller {
    unit: String,
    config: Config,
    settings: RenderSettings,
    /// Set while the last config-changed event carried an invalid value.
    config_error: Option<FatalError>,
    workload: Arc<dyn Workload>,
    platform: Arc<dyn Platform>,
    store: Arc<dyn StateStore>,
    leadership: Arc<ObservedLeadership>,
    peers: PeerCoordinator,
    storage: StorageManager,
    view: RelationView,
    record: ControllerRecord,
    phase: Phase,
    peers_converged: bool,
    /// Last bag written per provider relation.
    published: BTreeMap<u32, RawData>,
}

impl Controller {
    /// Build a controller, resuming from the persisted record if one exists.
    pub async fn load(config: Config, collaborators: Collaborators) -> Result<Self> {
        let unit = config.unit.name.clone();
        let record = collaborators
            .store
            .load(&unit)
            .await?
            .unwrap_or_else(|| ControllerRecord::new(&unit));

        let mut storage = StorageManager::new(&config.storage);
        if let Some(state) = record.storage.clone() {
            storage.restore(state);
        }

        let peers = PeerCoordinator::new(
            &unit,
            config.unit.address.clone(),
            collaborators.leadership.clone(),
            collaborators.platform.clone(),
        );

        info!(
            unit = %unit,
            generation = record.generation,
            fingerprint = ?record.fingerprint,
            "controller loaded"
        );

        Ok(Self {
            settings: config.render_settings(),
            unit,
            config,
            config_error: None,
            workload: collaborators.workload,
            platform: collaborators.platform,
            store: collaborators.store,
            leadership: collaborators.leadership,
            peers,
            storage,
            view: RelationView::new(),
            record,
            phase: Phase::default(),
            peers_converged: false,
            published: BTreeMap::new(),
        })
    }

    pub fn phase(&self) -> &Phase {
        &self.phase
    }

    pub fn record(&self) -> &ControllerRecord {
        &self.record
    }

    pub fn view(&self) -> &RelationView {
        &self.view
    }

    pub fn report(&self) -> StatusReport {
        StatusReport {
            unit: self.unit.clone(),
            phase: self.phase.clone(),
            status: self.phase.status(),
            fingerprint: self.record.fingerprint.clone(),
            generation: self.record.generation,
            leader: self.leadership.is_leader(),
            container_ready: self.record.container_ready,
            storage_ready: self.storage.state().is_some(),
            peers_converged: self.peers_converged,
        }
    }

    /// Run one reconciliation pass for `event` and return the resulting
    /// unit status.
    pub async fn handle(&mut self, event: Event) -> UnitStatus {
        let span = info_span!(
            "pass",
            pass_id = %Uuid::new_v4(),
            event = event.name(),
            unit = %self.unit
        );
        self.run_pass(event).instrument(span).await
    }

    async fn run_pass(&mut self, event: Event) -> UnitStatus {
        debug!("pass started");

        let outcome = match self.observe(event).await {
            Some(outcome) => outcome,
            None if self.phase.is_terminating() => PassOutcome::Removed,
            None => self.reconcile().await,
        };

        let previous = self.phase.clone();
        self.phase = self.phase.next(&outcome);

        if !self.phase.is_terminating() {
            self.publish().await;
            self.persist().await;
        }

        let status = self.phase.status();
        if let Err(e) = self.platform.set_status(&status).await {
            warn!(error = %e, "failed to publish unit status");
        }

        if previous != self.phase {
            info!(
                status = %status,
                generation = self.record.generation,
                fingerprint = ?self.record.fingerprint,
                "phase changed"
            );
        } else {
            debug!(status = %status, "phase unchanged");
        }
        status
    }

    // ── observe ──────────────────────────────────────────────────────────

    /// Fold the event into local state. Returns an outcome only when the
    /// event decides the pass by itself.
    async fn observe(&mut self, event: Event) -> Option<PassOutcome> {
        match event {
            Event::Start => {
                self.phase = self.phase.on_start();
            }
            Event::PebbleReady => {
                // A (re)started container has lost the running service.
                self.record.container_ready = true;
                self.record.fingerprint = None;
            }
            Event::StorageAttached { size_mb } => {
                self.storage.attach(size_mb.map(|mb| mb.saturating_mul(1024 * 1024)));
            }
            Event::StorageDetaching => {
                self.storage.detach();
                self.record.storage = None;
                self.record.fingerprint = None;
                self.stop_workload().await;
            }
            Event::RelationChanged { relation } => {
                let id = relation.id;
                let kind = relation.kind();
                if let Err(e) = self.view.apply_changed(relation) {
                    warn!(relation_id = id, interface = %kind, error = %e, "relation rejected");
                }
            }
            Event::RelationDeparted { relation_id, unit } => {
                if !self.view.depart(relation_id, &unit) {
                    debug!(relation_id, departed = %unit, "departed unit was not known");
                }
            }
            Event::RelationBroken { relation_id } => {
                if let Some(rel) = self.view.broken(relation_id) {
                    if rel.kind() == InterfaceKind::Peer {
                        self.peers.reset_published();
                    }
                }
                self.published.remove(&relation_id);
            }
            Event::LeaderChanged { leader } => {
                self.leadership.set(leader);
            }
            Event::ConfigChanged { port, log_level } => {
                self.apply_config_change(port, log_level);
            }
            Event::UpdateStatus | Event::Retry => {}
            Event::Remove => {
                self.terminate().await;
                return Some(PassOutcome::Removed);
            }
        }
        None
    }

    fn apply_config_change(&mut self, port: Option<u16>, log_level: Option<String>) {
        if port == Some(0) {
            self.config_error = Some(FatalError::InvalidConfig("port must be > 0".into()));
            return;
        }
        if let Some(level) = &log_level {
            if let Err(e) = validate_log_level(level) {
                self.config_error = Some(FatalError::InvalidConfig(e.to_string()));
                return;
            }
        }

        self.config_error = None;
        if let Some(port) = port {
            self.settings.port = port;
        }
        if let Some(level) = log_level {
            self.settings.log_level = level;
        }
        info!(
            port = self.settings.port,
            log_level = %self.settings.log_level,
            "configuration updated"
        );
    }

    // ── reconcile ────────────────────────────────────────────────────────

    async fn reconcile(&mut self) -> PassOutcome {
        if let Some(err) = &self.config_error {
            return PassOutcome::Fatal(err.to_string());
        }

        let mount_path = self.config.storage.mount_path.clone();
        match self.storage.ensure_ready(&mount_path) {
            Ok(state) => self.record.storage = Some(state),
            Err(StorageError::NotAttached { .. }) => {
                return PassOutcome::NotReady(WaitReason::Storage)
            }
            Err(e @ StorageError::TooSmall { .. }) => return PassOutcome::Fatal(e.to_string()),
            Err(e @ StorageError::Io { .. }) => {
                error!(error = %e, "storage initialization failed");
                return PassOutcome::ApplyFailed(e.to_string());
            }
        }

        if !self.record.container_ready {
            return PassOutcome::NotReady(WaitReason::Workload);
        }

        let snapshot = match self.view.snapshot() {
            Ok(s) => s,
            Err(e) => return snapshot_failure(e),
        };
        for entry in &snapshot.incomplete {
            debug!(
                relation_id = entry.relation_id,
                remote_unit = %entry.unit,
                field = entry.field,
                "skipping incomplete relation entry"
            );
        }

        let peer_states = match self.peers.observe_peer_fingerprints(&self.view) {
            Ok(p) => p,
            Err(e) => return snapshot_failure(e),
        };
        if let Err(e) = self.peers.check_conflict(&peer_states) {
            return PassOutcome::Fatal(e.to_string());
        }

        let artifact = match render(&self.settings, &snapshot, &peer_states) {
            Ok(a) => a,
            Err(RenderError::NoDatabase) => {
                let reason = match snapshot.database {
                    DatabaseState::Incomplete => WaitReason::DatabaseCredentials,
                    _ => WaitReason::Database,
                };
                return PassOutcome::NotReady(reason);
            }
            Err(e) => return PassOutcome::Fatal(e.to_string()),
        };

        let identity = snapshot.database.credential().map(|c| c.identity());
        if let Some(id) = &identity {
            let gate =
                self.peers
                    .migration_gate(id, &peer_states, self.record.migrated_database.as_deref());
            debug!(gate = ?gate, "migration gate");
            if gate == MigrationGate::WaitForLeader {
                return PassOutcome::NotReady(WaitReason::Migration);
            }
        }

        if self.record.fingerprint.as_deref() == Some(artifact.fingerprint()) {
            debug!(fingerprint = %artifact.fingerprint(), "configuration unchanged");
            return PassOutcome::Unchanged;
        }

        let generation = self.record.generation + 1;
        let artifact = artifact.with_generation(generation);
        match self.apply(&artifact).await {
            Ok(()) => {
                self.record.fingerprint = Some(artifact.fingerprint().to_string());
                self.record.generation = generation;
                if identity.is_some() {
                    self.record.migrated_database = identity;
                }
                info!(
                    fingerprint = %artifact.fingerprint(),
                    generation,
                    files = artifact.files().len(),
                    "configuration applied"
                );
                PassOutcome::Applied
            }
            Err(e) => {
                // Files may be partially written; force the next pass to apply.
                self.record.fingerprint = None;
                warn!(error = %e, generation, "apply failed");
                PassOutcome::ApplyFailed(e.to_string())
            }
        }
    }

    // ── apply ────────────────────────────────────────────────────────────

    async fn apply(&self, artifact: &ConfigArtifact) -> Result<(), ApplyError> {
        let limit = self.config.workload.call_timeout();

        for (path, content) in artifact.files() {
            timed(limit, "write_file", self.workload.write_file(path, content))
                .await?
                .map_err(|e| ApplyError::WriteFile {
                    path: path.clone(),
                    reason: format!("{:#}", e),
                })?;
        }

        let layer = artifact.layer();
        timed(limit, "add_layer", self.workload.add_layer(layer))
            .await?
            .map_err(|e| ApplyError::Layer(format!("{:#}", e)))?;

        self.restart(&layer.service).await?;
        self.wait_ready(&layer.service).await
    }

    async fn restart(&self, service: &str) -> Result<(), ApplyError> {
        let workload = &self.config.workload;
        let limit = workload.call_timeout();
        let mut last_error = String::new();

        for attempt in 1..=workload.restart_attempts {
            if attempt > 1 {
                let delay = workload.backoff(attempt - 1);
                debug!(attempt, delay_ms = delay.as_millis() as u64, "retrying restart");
                tokio::time::sleep(delay).await;
            }
            match timed(limit, "restart_service", self.workload.restart_service(service)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => last_error = format!("{:#}", e),
                Err(e) => last_error = e.to_string(),
            }
            warn!(service, attempt, error = %last_error, "restart failed");
        }

        Err(ApplyError::Restart {
            service: service.to_string(),
            attempts: workload.restart_attempts,
            reason: last_error,
        })
    }

    async fn wait_ready(&self, service: &str) -> Result<(), ApplyError> {
        let workload = &self.config.workload;
        let limit = workload.call_timeout();

        for attempt in 0..workload.ready_attempts {
            if attempt > 0 {
                tokio::time::sleep(workload.ready_interval()).await;
            }
            let ready = tokio::time::timeout(limit, self.workload.check_ready(service))
                .await
                .unwrap_or(false);
            if ready {
                return Ok(());
            }
        }

        Err(ApplyError::NotReady {
            service: service.to_string(),
            attempts: workload.ready_attempts,
        })
    }

    // ── publish / persist ────────────────────────────────────────────────

    /// Write this unit's peer entry and provider entries where they changed.
    async fn publish(&mut self) {
        let peer_states: Vec<PeerState> = self
            .peers
            .observe_peer_fingerprints(&self.view)
            .unwrap_or_default();
        self.peers_converged =
            PeerCoordinator::converged(self.record.fingerprint.as_deref(), &peer_states);

        if let Some(relation_id) = self.view.peer_relation_id() {
            let own = self.peers.own_state(
                self.record.fingerprint.as_deref(),
                self.phase == Phase::Ready,
                self.record.migrated_database.as_deref(),
            );
            if let Err(e) = self.peers.publish_fingerprint(relation_id, &own).await {
                warn!(relation_id, error = %e, "failed to publish peer state");
            }
        }

        let mut writes = Vec::new();
        for rel in self.view.relations() {
            let bag = match rel.kind() {
                InterfaceKind::Datasource | InterfaceKind::Dashboard => self.grafana_url_bag(),
                InterfaceKind::Ingress => self.ingress_bag(),
                InterfaceKind::Database | InterfaceKind::Peer => continue,
            };
            if self.published.get(&rel.id) != Some(&bag) {
                writes.push((rel.id, bag));
            }
        }
        for (relation_id, bag) in writes {
            match self.platform.write_unit_data(relation_id, &bag).await {
                Ok(()) => {
                    self.published.insert(relation_id, bag);
                }
                Err(e) => warn!(relation_id, error = %e, "failed to publish relation data"),
            }
        }
    }

    fn hostname(&self) -> String {
        self.config
            .unit
            .address
            .clone()
            .unwrap_or_else(|| self.unit.replace('/', "-"))
    }

    fn grafana_url_bag(&self) -> RawData {
        let mut bag = RawData::new();
        bag.insert(
            provider_keys::GRAFANA_URL.into(),
            format!("http://{}:{}", self.hostname(), self.settings.port),
        );
        bag
    }

    fn ingress_bag(&self) -> RawData {
        let app = self.config.unit.app().to_string();
        let mut bag = RawData::new();
        bag.insert(provider_keys::SERVICE_HOSTNAME.into(), app.clone());
        bag.insert(provider_keys::SERVICE_NAME.into(), app);
        bag.insert(
            provider_keys::SERVICE_PORT.into(),
            self.settings.port.to_string(),
        );
        bag
    }

    async fn persist(&mut self) {
        self.record.updated_at = chrono::Utc::now().timestamp();
        if let Err(e) = self.store.save(&self.record).await {
            error!(error = %e, "failed to persist controller record");
        }
    }

    // ── teardown ─────────────────────────────────────────────────────────

    async fn stop_workload(&self) {
        let limit = self.config.workload.call_timeout();
        let service = &self.config.workload.service;
        match timed(limit, "stop_service", self.workload.stop_service(service)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(service = %service, error = %e, "failed to stop service"),
            Err(e) => warn!(service = %service, error = %e, "failed to stop service"),
        }
    }

    /// Best-effort cleanup on unit removal. Every step is bounded by the
    /// call timeout and failures are only logged.
    async fn terminate(&mut self) {
        info!("unit removal: cleaning up");
        self.stop_workload().await;
        if let Err(e) = self.store.clear(&self.unit).await {
            warn!(error = %e, "failed to clear controller record");
        }
        self.storage.detach();
    }
}

fn snapshot_failure(err: SnapshotError) -> PassOutcome {
    warn!(error = %err, "relation data rejected");
    PassOutcome::Fatal(err.to_string())
}

/// Bound a control-plane call by `limit`.
async fn timed<T, F>(limit: Duration, operation: &str, fut: F) -> Result<Result<T>, ApplyError>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| ApplyError::Timeout {
            operation: operation.to_string(),
            secs: limit.as_secs(),
        })
}
