//! Error taxonomy for the pure parts of the operator.
//!
//! None of these are allowed to escape a reconciliation pass: the
//! controller converts each of them into a unit status.

use crate::models::InterfaceKind;

/// Relation data could not be turned into a typed descriptor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// A required key is absent (or empty). The remote side has not
    /// finished publishing; this is "not ready", not "broken".
    #[error("{kind}: missing required field '{field}'")]
    MissingField {
        kind: InterfaceKind,
        field: &'static str,
    },

    /// A value is present but fails type coercion.
    #[error("{kind}: malformed '{field}': {reason}")]
    Malformed {
        kind: InterfaceKind,
        field: &'static str,
        reason: String,
    },
}

impl DecodeError {
    pub fn is_missing(&self) -> bool {
        matches!(self, DecodeError::MissingField { .. })
    }
}

/// The renderer cannot produce a valid configuration yet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RenderError {
    #[error("database relation required but not available")]
    NoDatabase,

    #[error("failed to serialize {document}: {reason}")]
    Serialize {
        document: &'static str,
        reason: String,
    },
}

/// An invariant was violated; needs operator intervention.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum FatalError {
    #[error("relation {relation_id} changed interface from {from} to {to}")]
    InterfaceChanged {
        relation_id: u32,
        from: InterfaceKind,
        to: InterfaceKind,
    },

    #[error("too many {kind} relations (limit {limit})")]
    TooManyRelations { kind: InterfaceKind, limit: usize },

    #[error("multiple units claim leadership: {}", units.join(", "))]
    LeadershipConflict { units: Vec<String> },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}
