//! Local view of the relations this unit participates in.
//!
//! The platform owns relation data; [`RelationView`] is this unit's latest
//! copy of it, updated from relation events and read by every
//! reconciliation pass through [`RelationView::snapshot`].

use std::collections::BTreeMap;

use crate::codec::{decode, TypedDescriptor};
use crate::error::{DecodeError, FatalError};
use crate::models::{
    DashboardDescriptor, DatabaseCredential, DatasourceInfo, IngressInfo, InterfaceKind,
    PeerState, RelationDescriptor,
};

/// Maximum number of database relations (the declared `limit: 1`).
pub const DATABASE_RELATION_LIMIT: usize = 1;

/// Why a snapshot could not be produced.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SnapshotError {
    #[error("relation {relation_id} ({unit}): {source}")]
    Decode {
        relation_id: u32,
        unit: String,
        #[source]
        source: DecodeError,
    },

    #[error(transparent)]
    Rejected(#[from] FatalError),
}

/// State of the single database relation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DatabaseState {
    /// No database relation exists.
    Absent,
    /// The relation exists but no unit has published a complete credential.
    Incomplete,
    Ready(DatabaseCredential),
}

impl DatabaseState {
    pub fn credential(&self) -> Option<&DatabaseCredential> {
        match self {
            DatabaseState::Ready(c) => Some(c),
            _ => None,
        }
    }
}

/// A remote entry skipped because it is still missing a required field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteEntry {
    pub relation_id: u32,
    pub unit: String,
    pub field: &'static str,
}

/// Typed view of every non-peer relation, ready for rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelationSnapshot {
    pub datasources: Vec<DatasourceInfo>,
    pub dashboards: Vec<DashboardDescriptor>,
    pub database: DatabaseState,
    pub ingress: Option<IngressInfo>,
    pub incomplete: Vec<IncompleteEntry>,
}

impl Default for RelationSnapshot {
    fn default() -> Self {
        Self {
            datasources: Vec::new(),
            dashboards: Vec::new(),
            database: DatabaseState::Absent,
            ingress: None,
            incomplete: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct RelationView {
    relations: BTreeMap<u32, RelationDescriptor>,
    /// Relation events refused because they changed an interface kind.
    /// Kept until the offending relation is broken.
    rejected: BTreeMap<u32, FatalError>,
}

impl RelationView {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the latest descriptor for a relation.
    ///
    /// Fails (and remembers the failure) if the relation's interface kind
    /// differs from what was first seen.
    ///
    /// A database relation beyond the limit is still recorded, so that it
    /// takes over once the others are broken, but the call fails and
    /// [`snapshot`](Self::snapshot) refuses to proceed while the view is over
    /// the limit.
    pub fn apply_changed(&mut self, desc: RelationDescriptor) -> Result<(), FatalError> {
        if let Some(existing) = self.relations.get(&desc.id) {
            if existing.kind() != desc.kind() {
                let err = FatalError::InterfaceChanged {
                    relation_id: desc.id,
                    from: existing.kind(),
                    to: desc.kind(),
                };
                self.rejected.insert(desc.id, err.clone());
                return Err(err);
            }
        }
        let is_database = desc.kind() == InterfaceKind::Database;
        self.relations.insert(desc.id, desc);
        if is_database {
            self.check_database_limit()?;
        }
        Ok(())
    }

    fn check_database_limit(&self) -> Result<(), FatalError> {
        if self.by_kind(InterfaceKind::Database).count() > DATABASE_RELATION_LIMIT {
            return Err(FatalError::TooManyRelations {
                kind: InterfaceKind::Database,
                limit: DATABASE_RELATION_LIMIT,
            });
        }
        Ok(())
    }

    /// A remote unit left the relation. Returns true if anything changed.
    pub fn depart(&mut self, relation_id: u32, unit: &str) -> bool {
        self.relations
            .get_mut(&relation_id)
            .map(|r| r.remove_unit(unit))
            .unwrap_or(false)
    }

    /// The relation is gone entirely.
    pub fn broken(&mut self, relation_id: u32) -> Option<RelationDescriptor> {
        self.rejected.remove(&relation_id);
        self.relations.remove(&relation_id)
    }

    pub fn get(&self, relation_id: u32) -> Option<&RelationDescriptor> {
        self.relations.get(&relation_id)
    }

    pub fn relations(&self) -> impl Iterator<Item = &RelationDescriptor> {
        self.relations.values()
    }

    pub fn by_kind(&self, kind: InterfaceKind) -> impl Iterator<Item = &RelationDescriptor> {
        self.relations.values().filter(move |r| r.kind() == kind)
    }

    pub fn peer_relation_id(&self) -> Option<u32> {
        self.by_kind(InterfaceKind::Peer).next().map(|r| r.id)
    }

    /// Decode every non-peer relation into a [`RelationSnapshot`].
    ///
    /// Entries missing required keys are skipped and listed in
    /// `incomplete`; malformed entries fail the whole snapshot.
    pub fn snapshot(&self) -> Result<RelationSnapshot, SnapshotError> {
        if let Some(err) = self.rejected.values().next() {
            return Err(SnapshotError::Rejected(err.clone()));
        }
        self.check_database_limit()?;

        let mut snap = RelationSnapshot::default();
        let mut database_seen = false;

        for rel in self.relations.values() {
            if rel.kind() == InterfaceKind::Peer {
                continue;
            }
            if rel.kind() == InterfaceKind::Database {
                database_seen = true;
            }
            for (unit, raw) in rel.remote_data() {
                let decoded = match decode(rel.kind(), unit, raw) {
                    Ok(d) => d,
                    Err(DecodeError::MissingField { field, .. }) => {
                        snap.incomplete.push(IncompleteEntry {
                            relation_id: rel.id,
                            unit: unit.to_string(),
                            field,
                        });
                        continue;
                    }
                    Err(source) => {
                        return Err(SnapshotError::Decode {
                            relation_id: rel.id,
                            unit: unit.to_string(),
                            source,
                        })
                    }
                };
                match decoded {
                    TypedDescriptor::Datasource(ds) => snap.datasources.push(ds),
                    TypedDescriptor::Dashboard(db) => snap.dashboards.push(db),
                    TypedDescriptor::Database(c) => {
                        // Units are visited in sorted order; the first
                        // complete credential wins.
                        if snap.database.credential().is_none() {
                            snap.database = DatabaseState::Ready(c);
                        }
                    }
                    TypedDescriptor::Ingress(i) => {
                        if snap.ingress.is_none() {
                            snap.ingress = Some(i);
                        }
                    }
                    TypedDescriptor::Peer(_) => {}
                }
            }
        }

        if database_seen && snap.database.credential().is_none() {
            snap.database = DatabaseState::Incomplete;
        }
        Ok(snap)
    }

    /// Decode the remote units' entries on the peer relation, sorted by unit.
    pub fn peer_states(&self) -> Result<Vec<PeerState>, SnapshotError> {
        let mut peers = Vec::new();
        for rel in self.by_kind(InterfaceKind::Peer) {
            for (unit, raw) in rel.remote_data() {
                match decode(InterfaceKind::Peer, unit, raw) {
                    Ok(TypedDescriptor::Peer(p)) => peers.push(p),
                    Ok(_) => {}
                    Err(source) => {
                        return Err(SnapshotError::Decode {
                            relation_id: rel.id,
                            unit: unit.to_string(),
                            source,
                        })
                    }
                }
            }
        }
        peers.sort_by(|a, b| a.unit.cmp(&b.unit));
        Ok(peers)
    }
}
