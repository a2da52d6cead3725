//! # Grafana Operator Core
//!
//! Shared, I/O-free logic for the Grafana operator: data model, relation
//! codec, relation view, configuration renderer, reconciliation state
//! machine, and the persisted-state store abstraction.
//!
//! This crate contains no tokio, sqlx, filesystem, or process control. Every
//! function here is deterministic given its inputs, which is what makes the
//! fingerprint-based idempotence of the controller possible.

pub mod codec;
pub mod error;
pub mod models;
pub mod relation;
pub mod render;
pub mod state;
pub mod store;

pub use error::{DecodeError, FatalError, RenderError};
