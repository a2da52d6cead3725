//! Inbound platform events.
//!
//! One event triggers exactly one reconciliation pass. The JSON form is
//! tagged by `event`:
//!
//! ```json
//! {"event": "pebble-ready"}
//! {"event": "storage-attached", "size-mb": 1024}
//! {"event": "relation-changed", "relation": {"id": 4, "name": "database", "interface": "mysql",
//!   "local-unit": "grafana/0", "remote-units": ["mysql/0"], "data": {"mysql/0": {"host": "db.local"}}}}
//! {"event": "relation-departed", "relation-id": 4, "unit": "mysql/0"}
//! {"event": "leader-changed", "leader": true}
//! {"event": "config-changed", "port": 3001}
//! ```

use serde::{Deserialize, Serialize};

use grafana_operator_core::models::RelationDescriptor;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum Event {
    Start,
    /// The workload container can accept control-plane calls.
    PebbleReady,
    StorageAttached {
        #[serde(default, rename = "size-mb")]
        size_mb: Option<u64>,
    },
    StorageDetaching,
    /// Latest full view of one relation.
    RelationChanged { relation: RelationDescriptor },
    RelationDeparted {
        #[serde(rename = "relation-id")]
        relation_id: u32,
        unit: String,
    },
    RelationBroken {
        #[serde(rename = "relation-id")]
        relation_id: u32,
    },
    LeaderChanged { leader: bool },
    ConfigChanged {
        #[serde(default)]
        port: Option<u16>,
        #[serde(default, rename = "log-level")]
        log_level: Option<String>,
    },
    UpdateStatus,
    /// Scheduled by the event loop while degraded.
    Retry,
    Remove,
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::Start => "start",
            Event::PebbleReady => "pebble-ready",
            Event::StorageAttached { .. } => "storage-attached",
            Event::StorageDetaching => "storage-detaching",
            Event::RelationChanged { .. } => "relation-changed",
            Event::RelationDeparted { .. } => "relation-departed",
            Event::RelationBroken { .. } => "relation-broken",
            Event::LeaderChanged { .. } => "leader-changed",
            Event::ConfigChanged { .. } => "config-changed",
            Event::UpdateStatus => "update-status",
            Event::Retry => "retry",
            Event::Remove => "remove",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use grafana_operator_core::models::InterfaceKind;

    #[test]
    fn test_parse_relation_changed() {
        let json = r#"{"event": "relation-changed", "relation": {
            "id": 4, "name": "database", "interface": "mysql", "local-unit": "grafana/0",
            "remote-units": ["mysql/0"],
            "data": {"mysql/0": {"host": "0.1.2.3:3306", "name": "my-test-db"}}}}"#;
        let event: Event = serde_json::from_str(json).unwrap();
        match event {
            Event::RelationChanged { relation } => {
                assert_eq!(relation.id, 4);
                assert_eq!(relation.kind(), InterfaceKind::Database);
                assert_eq!(
                    relation.unit_data("mysql/0").unwrap().get("name").unwrap(),
                    "my-test-db"
                );
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[test]
    fn test_parse_unit_events() {
        let e: Event = serde_json::from_str(r#"{"event":"pebble-ready"}"#).unwrap();
        assert_eq!(e, Event::PebbleReady);
        let e: Event =
            serde_json::from_str(r#"{"event":"storage-attached","size-mb":512}"#).unwrap();
        assert_eq!(e, Event::StorageAttached { size_mb: Some(512) });
        let e: Event =
            serde_json::from_str(r#"{"event":"config-changed","log-level":"debug"}"#).unwrap();
        assert_eq!(
            e,
            Event::ConfigChanged {
                port: None,
                log_level: Some("debug".into())
            }
        );
        assert_eq!(e.name(), "config-changed");
    }

    #[test]
    fn test_unknown_event_rejected() {
        assert!(serde_json::from_str::<Event>(r#"{"event":"explode"}"#).is_err());
    }
}
