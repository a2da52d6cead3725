//! Reconciliation state machine.
//!
//! ```text
//!   Unconfigured ──start──▶ Waiting(reason) ──applied──▶ Ready ◀─┐
//!                               ▲   ▲                     │  │   │ unchanged
//!                               │   └──────not ready──────┘  └───┘
//!                               │                         │
//!                           not ready              apply failed
//!                               │                         ▼
//!                               └──────────────────── Degraded(reason)
//!
//!   fatal ──▶ Blocked(reason)         remove ──▶ Terminating (absorbing)
//! ```
//!
//! Transitions are pure: [`Phase::next`] maps the current phase and the
//! outcome of one reconciliation pass to the next phase, and
//! [`Phase::status`] maps a phase to the status the platform displays.

use serde::Serialize;

use crate::models::{StatusKind, UnitStatus};

/// Status message shown while the workload runs with the applied config.
pub const READY_MESSAGE: &str = "grafana started";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum WaitReason {
    Starting,
    Storage,
    Workload,
    Database,
    DatabaseCredentials,
    Migration,
}

impl WaitReason {
    pub fn message(&self) -> &'static str {
        match self {
            WaitReason::Starting => "starting",
            WaitReason::Storage => "waiting for storage",
            WaitReason::Workload => "waiting for workload container",
            WaitReason::Database => "waiting for database",
            WaitReason::DatabaseCredentials => "waiting for database credentials",
            WaitReason::Migration => "waiting for leader to migrate database",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "phase", content = "reason", rename_all = "kebab-case")]
pub enum Phase {
    Unconfigured,
    Waiting(WaitReason),
    Ready,
    /// Applying configuration failed; retried on the next event.
    Degraded(String),
    /// Needs operator intervention.
    Blocked(String),
    Terminating,
}

/// What a single reconciliation pass concluded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PassOutcome {
    /// A new configuration was applied and the workload is ready.
    Applied,
    /// The rendered fingerprint matched the last applied one; nothing done.
    Unchanged,
    NotReady(WaitReason),
    ApplyFailed(String),
    Fatal(String),
    Removed,
}

impl Phase {
    /// Unit start: leave `Unconfigured` for `Waiting`.
    pub fn on_start(&self) -> Phase {
        match self {
            Phase::Unconfigured => Phase::Waiting(WaitReason::Starting),
            other => other.clone(),
        }
    }

    pub fn next(&self, outcome: &PassOutcome) -> Phase {
        if *self == Phase::Terminating {
            return Phase::Terminating;
        }
        match outcome {
            PassOutcome::Removed => Phase::Terminating,
            PassOutcome::Applied | PassOutcome::Unchanged => Phase::Ready,
            PassOutcome::NotReady(reason) => Phase::Waiting(*reason),
            PassOutcome::ApplyFailed(reason) => Phase::Degraded(reason.clone()),
            PassOutcome::Fatal(reason) => Phase::Blocked(reason.clone()),
        }
    }

    pub fn status(&self) -> UnitStatus {
        match self {
            Phase::Unconfigured => UnitStatus::new(StatusKind::Maintenance, "unconfigured"),
            Phase::Waiting(reason) => UnitStatus::new(StatusKind::Waiting, reason.message()),
            Phase::Ready => UnitStatus::new(StatusKind::Active, READY_MESSAGE),
            Phase::Degraded(reason) => {
                UnitStatus::new(StatusKind::Error, format!("degraded: {}", reason))
            }
            Phase::Blocked(reason) => UnitStatus::new(StatusKind::Blocked, reason.clone()),
            Phase::Terminating => UnitStatus::new(StatusKind::Maintenance, "terminating"),
        }
    }

    pub fn is_degraded(&self) -> bool {
        matches!(self, Phase::Degraded(_))
    }

    pub fn is_terminating(&self) -> bool {
        *self == Phase::Terminating
    }
}

impl Default for Phase {
    fn default() -> Self {
        Phase::Unconfigured
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_start_moves_to_waiting() {
        assert_eq!(
            Phase::Unconfigured.on_start(),
            Phase::Waiting(WaitReason::Starting)
        );
        assert_eq!(Phase::Ready.on_start(), Phase::Ready);
    }

    #[test]
    fn test_waiting_to_ready_on_apply() {
        let p = Phase::Waiting(WaitReason::Database).next(&PassOutcome::Applied);
        assert_eq!(p, Phase::Ready);
        assert_eq!(p.status().kind, StatusKind::Active);
    }

    #[test]
    fn test_ready_self_loop_on_unchanged() {
        assert_eq!(Phase::Ready.next(&PassOutcome::Unchanged), Phase::Ready);
    }

    #[test]
    fn test_ready_to_waiting_when_database_removed() {
        let p = Phase::Ready.next(&PassOutcome::NotReady(WaitReason::Database));
        assert_eq!(p.status(), UnitStatus::new(StatusKind::Waiting, "waiting for database"));
    }

    #[test]
    fn test_apply_failure_degrades() {
        for start in [Phase::Ready, Phase::Waiting(WaitReason::Starting)] {
            let p = start.next(&PassOutcome::ApplyFailed("restart failed".to_string()));
            assert!(p.is_degraded());
            assert_eq!(p.status().kind, StatusKind::Error);
        }
    }

    #[test]
    fn test_terminating_is_absorbing() {
        let p = Phase::Ready.next(&PassOutcome::Removed);
        assert!(p.is_terminating());
        assert_eq!(p.next(&PassOutcome::Applied), Phase::Terminating);
    }

    #[test]
    fn test_fatal_blocks() {
        let p = Phase::Ready.next(&PassOutcome::Fatal("two leaders".to_string()));
        assert_eq!(p.status(), UnitStatus::new(StatusKind::Blocked, "two leaders"));
    }
}
