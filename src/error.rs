//! Error types for the I/O side of a reconciliation pass.
//!
//! Relation decoding, rendering and invariant errors live in
//! `grafana_operator_core::error`; these two cover the collaborators the
//! controller drives directly.

use std::path::PathBuf;

/// The persistent volume is not usable yet.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage '{name}' is not attached")]
    NotAttached { name: String },

    #[error("storage '{name}' is {size_mb} MiB, need at least {min_mb} MiB")]
    TooSmall {
        name: String,
        size_mb: u64,
        min_mb: u64,
    },

    #[error("storage at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// A container control-plane call failed while applying an artifact.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error("failed to write {path}: {reason}")]
    WriteFile { path: String, reason: String },

    #[error("failed to add service layer: {0}")]
    Layer(String),

    #[error("failed to restart {service} after {attempts} attempts: {reason}")]
    Restart {
        service: String,
        attempts: u32,
        reason: String,
    },

    #[error("{operation} timed out after {secs}s")]
    Timeout { operation: String, secs: u64 },

    #[error("{service} not ready after {attempts} checks")]
    NotReady { service: String, attempts: u32 },
}
