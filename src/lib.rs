//! # Grafana Operator
//!
//! A lifecycle reconciliation controller for a Grafana unit running under
//! container orchestration.
//!
//! The operator consumes relation and lifecycle events, renders Grafana's
//! configuration from the current relation state, applies it to the workload
//! container only when its fingerprint changes, and reports a unit status
//! after every pass. Peer units coordinate through their own relation
//! entries; the leader performs the first start against a new database.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌────────────────────┐
//! │ HTTP/replay │──▶│  EventLoop   │──▶│    Controller      │
//! │   events    │   │ (mpsc, 1 rx) │   │ observe/render/    │
//! └─────────────┘   └──────┬───────┘   │ apply/publish      │
//!                          │ watch     └──┬──────┬──────┬───┘
//!                          ▼              ▼      ▼      ▼
//!                    StatusReport    Workload Platform SQLite
//! ```
//!
//! The pure parts (relation codec, renderer, state machine) live in the
//! `grafana_operator_core` crate.
//!
//! ## Quick Start
//!
//! ```bash
//! grafana-operator init                    # create state database
//! grafana-operator render relations.json   # preview configuration
//! grafana-operator replay events.jsonl --dry-run
//! grafana-operator serve                   # event loop + HTTP surface
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`controller`] | Reconciliation passes |
//! | [`events`] | Inbound event type |
//! | [`runtime`] | Event loop, `serve` and `replay` |
//! | [`server`] | HTTP event/status surface |
//! | [`traits`] | Workload, leadership and platform seams |
//! | [`workload`] | Process-supervising workload |
//! | [`platform`] | JSON-lines platform output |
//! | [`peers`] | Peer coordination and migration gating |
//! | [`storage`] | Persistent volume lifecycle |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | Persisted controller record |

pub mod config;
pub mod controller;
pub mod db;
pub mod error;
pub mod events;
pub mod migrate;
pub mod peers;
pub mod platform;
pub mod render_cmd;
pub mod runtime;
pub mod server;
pub mod sqlite_store;
pub mod status;
pub mod storage;
pub mod traits;
pub mod workload;
