//! Collaborator traits the controller drives.
//!
//! The controller never talks to a container runtime, the orchestration
//! platform or leadership arbitration directly. It goes through these three
//! traits, so tests can swap in recording mocks and the binary can ship
//! process-based implementations.
//!
//! ```text
//!                 ┌──────────────┐
//!   events ─────▶ │  Controller  │
//!                 └──┬────┬────┬─┘
//!                    │    │    │
//!           ┌────────┘    │    └─────────┐
//!           ▼             ▼              ▼
//!     ┌──────────┐  ┌────────────┐  ┌──────────┐
//!     │ Workload │  │ Leadership │  │ Platform │
//!     │ files,   │  │ is_leader  │  │ status,  │
//!     │ services │  │            │  │ rel data │
//!     └──────────┘  └────────────┘  └──────────┘
//! ```

use anyhow::Result;
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};

use grafana_operator_core::models::{RawData, ServiceLayer, UnitStatus};

// ═══════════════════════════════════════════════════════════════════════
// Workload Trait
// ═══════════════════════════════════════════════════════════════════════

/// Container control plane for the workload.
///
/// Calls may block on I/O; the controller wraps each one in a timeout and
/// retries restarts with backoff.
#[async_trait]
pub trait Workload: Send + Sync {
    /// Write `content` to `path` inside the workload container, creating
    /// parent directories.
    async fn write_file(&self, path: &str, content: &[u8]) -> Result<()>;

    /// Replace the service layer (`override: replace`).
    async fn add_layer(&self, layer: &ServiceLayer) -> Result<()>;

    /// Start the service, or stop and start it if already running.
    async fn restart_service(&self, name: &str) -> Result<()>;

    /// Stop the service. Stopping a stopped service is not an error.
    async fn stop_service(&self, name: &str) -> Result<()>;

    /// One readiness probe. Never errors; unreachable means `false`.
    async fn check_ready(&self, name: &str) -> bool;
}

// ═══════════════════════════════════════════════════════════════════════
// Leadership Trait
// ═══════════════════════════════════════════════════════════════════════

/// Externally arbitrated leadership.
pub trait Leadership: Send + Sync {
    fn is_leader(&self) -> bool;
}

/// Leadership as last reported by `leader-changed` events.
#[derive(Debug, Default)]
pub struct ObservedLeadership {
    leader: AtomicBool,
}

impl ObservedLeadership {
    pub fn new(leader: bool) -> Self {
        Self {
            leader: AtomicBool::new(leader),
        }
    }

    pub fn set(&self, leader: bool) {
        self.leader.store(leader, Ordering::SeqCst);
    }
}

impl Leadership for ObservedLeadership {
    fn is_leader(&self) -> bool {
        self.leader.load(Ordering::SeqCst)
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Platform Trait
// ═══════════════════════════════════════════════════════════════════════

/// The orchestration platform's write side.
#[async_trait]
pub trait Platform: Send + Sync {
    /// Publish the unit status shown to operators.
    async fn set_status(&self, status: &UnitStatus) -> Result<()>;

    /// Replace this unit's data bag on a relation.
    async fn write_unit_data(&self, relation_id: u32, data: &RawData) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_observed_leadership_tracks_updates() {
        let l = ObservedLeadership::new(false);
        assert!(!l.is_leader());
        l.set(true);
        assert!(l.is_leader());
    }
}
