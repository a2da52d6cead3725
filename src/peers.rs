//! Peer coordination.
//!
//! Each unit writes only its own entry on the `grafana-peers` relation and
//! reads everyone else's. There is no cross-unit locking: leadership comes
//! from the platform through [`Leadership`], and consistency is reached by
//! convergence, every unit eventually publishing the same fingerprint.
//!
//! The one single-writer action is the first start against a new database,
//! during which Grafana migrates the schema. [`PeerCoordinator::migration_gate`]
//! lets the leader go first and holds followers until the leader has
//! published the database identity it migrated.

use anyhow::Result;
use std::sync::Arc;
use tracing::debug;

use grafana_operator_core::codec::{encode, TypedDescriptor};
use grafana_operator_core::error::FatalError;
use grafana_operator_core::models::{PeerState, RawData};
use grafana_operator_core::relation::{RelationView, SnapshotError};

use crate::traits::{Leadership, Platform};

/// Whether this unit may start Grafana against a database.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrationGate {
    /// This unit is the leader and migrates the schema itself.
    Lead,
    /// The schema is known to be migrated; start normally.
    Follow,
    /// Hold until the leader publishes the identity.
    WaitForLeader,
}

pub struct PeerCoordinator {
    unit: String,
    address: Option<String>,
    leadership: Arc<dyn Leadership>,
    platform: Arc<dyn Platform>,
    /// Last bag written per peer relation id.
    published: Option<(u32, RawData)>,
}

impl PeerCoordinator {
    pub fn new(
        unit: impl Into<String>,
        address: Option<String>,
        leadership: Arc<dyn Leadership>,
        platform: Arc<dyn Platform>,
    ) -> Self {
        Self {
            unit: unit.into(),
            address,
            leadership,
            platform,
            published: None,
        }
    }

    pub fn is_leader(&self) -> bool {
        self.leadership.is_leader()
    }

    /// Remote peer entries, sorted by unit id.
    pub fn observe_peer_fingerprints(
        &self,
        view: &RelationView,
    ) -> Result<Vec<PeerState>, SnapshotError> {
        view.peer_states()
    }

    /// Two remote units both claiming leadership cannot be resolved locally.
    pub fn check_conflict(&self, peers: &[PeerState]) -> Result<(), FatalError> {
        let claimants: Vec<String> = peers
            .iter()
            .filter(|p| p.leader)
            .map(|p| p.unit.clone())
            .collect();
        if claimants.len() > 1 {
            return Err(FatalError::LeadershipConflict { units: claimants });
        }
        Ok(())
    }

    /// Decide whether this unit may apply a configuration pointing at the
    /// database with `identity`. `recorded` is the identity this unit
    /// already migrated or followed.
    pub fn migration_gate(
        &self,
        identity: &str,
        peers: &[PeerState],
        recorded: Option<&str>,
    ) -> MigrationGate {
        if recorded == Some(identity) {
            return MigrationGate::Follow;
        }
        if self.is_leader() {
            return MigrationGate::Lead;
        }
        let migrated = peers
            .iter()
            .any(|p| p.leader && p.migrated_database.as_deref() == Some(identity));
        if migrated {
            MigrationGate::Follow
        } else {
            MigrationGate::WaitForLeader
        }
    }

    /// This unit's own peer entry.
    pub fn own_state(
        &self,
        fingerprint: Option<&str>,
        ready: bool,
        migrated_database: Option<&str>,
    ) -> PeerState {
        PeerState {
            unit: self.unit.clone(),
            leader: self.is_leader(),
            fingerprint: fingerprint.map(str::to_string),
            ready,
            address: self.address.clone(),
            migrated_database: migrated_database.map(str::to_string),
            extra: RawData::new(),
        }
    }

    /// Write this unit's entry on the peer relation if it changed since the
    /// last write. Returns whether anything was written.
    pub async fn publish_fingerprint(&mut self, relation_id: u32, state: &PeerState) -> Result<bool> {
        let bag = encode(&TypedDescriptor::Peer(state.clone()));
        if let Some((id, last)) = &self.published {
            if *id == relation_id && *last == bag {
                return Ok(false);
            }
        }
        self.platform.write_unit_data(relation_id, &bag).await?;
        debug!(relation_id, fingerprint = ?state.fingerprint, "published peer state");
        self.published = Some((relation_id, bag));
        Ok(true)
    }

    /// Forget what was published, e.g. after the peer relation is broken.
    pub fn reset_published(&mut self) {
        self.published = None;
    }

    /// True when every remote peer reports `fingerprint`.
    pub fn converged(fingerprint: Option<&str>, peers: &[PeerState]) -> bool {
        match fingerprint {
            Some(fp) => peers.iter().all(|p| p.fingerprint.as_deref() == Some(fp)),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::ObservedLeadership;
    use async_trait::async_trait;
    use grafana_operator_core::models::UnitStatus;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        writes: Mutex<Vec<(u32, RawData)>>,
    }

    #[async_trait]
    impl Platform for Recorder {
        async fn set_status(&self, _status: &UnitStatus) -> Result<()> {
            Ok(())
        }
        async fn write_unit_data(&self, relation_id: u32, data: &RawData) -> Result<()> {
            self.writes.lock().unwrap().push((relation_id, data.clone()));
            Ok(())
        }
    }

    fn coordinator(leader: bool) -> (PeerCoordinator, Arc<Recorder>) {
        let platform = Arc::new(Recorder::default());
        let c = PeerCoordinator::new(
            "grafana/1",
            Some("10.0.0.2".into()),
            Arc::new(ObservedLeadership::new(leader)),
            platform.clone(),
        );
        (c, platform)
    }

    fn peer(unit: &str, leader: bool, migrated: Option<&str>) -> PeerState {
        PeerState {
            unit: unit.into(),
            leader,
            migrated_database: migrated.map(str::to_string),
            ..Default::default()
        }
    }

    #[test]
    fn test_leader_leads_migration() {
        let (c, _) = coordinator(true);
        assert_eq!(c.migration_gate("db1", &[], None), MigrationGate::Lead);
    }

    #[test]
    fn test_follower_waits_for_leader() {
        let (c, _) = coordinator(false);
        let peers = vec![peer("grafana/0", true, None)];
        assert_eq!(
            c.migration_gate("db1", &peers, None),
            MigrationGate::WaitForLeader
        );

        let peers = vec![peer("grafana/0", true, Some("db1"))];
        assert_eq!(c.migration_gate("db1", &peers, None), MigrationGate::Follow);
    }

    #[test]
    fn test_follower_ignores_non_leader_claims() {
        let (c, _) = coordinator(false);
        let peers = vec![peer("grafana/2", false, Some("db1"))];
        assert_eq!(
            c.migration_gate("db1", &peers, None),
            MigrationGate::WaitForLeader
        );
    }

    #[test]
    fn test_recorded_identity_passes_gate() {
        let (c, _) = coordinator(false);
        assert_eq!(c.migration_gate("db1", &[], Some("db1")), MigrationGate::Follow);
        assert_eq!(
            c.migration_gate("db2", &[], Some("db1")),
            MigrationGate::WaitForLeader
        );
    }

    #[test]
    fn test_two_remote_leaders_conflict() {
        let (c, _) = coordinator(false);
        let peers = vec![peer("grafana/0", true, None), peer("grafana/2", true, None)];
        let err = c.check_conflict(&peers).unwrap_err();
        assert_eq!(
            err,
            FatalError::LeadershipConflict {
                units: vec!["grafana/0".into(), "grafana/2".into()]
            }
        );
        assert!(c.check_conflict(&peers[..1]).is_ok());
    }

    #[tokio::test]
    async fn test_publish_only_on_change() {
        let (mut c, platform) = coordinator(false);
        let state = c.own_state(Some("abc"), true, None);
        assert!(c.publish_fingerprint(7, &state).await.unwrap());
        assert!(!c.publish_fingerprint(7, &state).await.unwrap());

        let state = c.own_state(Some("def"), true, None);
        assert!(c.publish_fingerprint(7, &state).await.unwrap());

        let writes = platform.writes.lock().unwrap();
        assert_eq!(writes.len(), 2);
        assert_eq!(writes[1].1.get("fingerprint").unwrap(), "def");
        assert_eq!(writes[1].1.get("address").unwrap(), "10.0.0.2");
    }

    #[test]
    fn test_converged() {
        let mut a = peer("grafana/0", true, None);
        a.fingerprint = Some("x".into());
        let mut b = peer("grafana/2", false, None);
        b.fingerprint = Some("x".into());
        assert!(PeerCoordinator::converged(Some("x"), &[a.clone(), b.clone()]));
        b.fingerprint = Some("y".into());
        assert!(!PeerCoordinator::converged(Some("x"), &[a, b]));
        assert!(PeerCoordinator::converged(Some("x"), &[]));
        assert!(!PeerCoordinator::converged(None, &[]));
    }
}
