//! Single-consumer event loop.
//!
//! Events from the HTTP surface (or a replay file) are queued on an mpsc
//! channel; one task drains it and runs exactly one reconciliation pass per
//! event, so passes never overlap. After every pass the controller's
//! [`StatusReport`] is published on a `watch` channel.
//!
//! While the unit is degraded the loop also schedules up to
//! `periodic_retries` synthetic [`Event::Retry`] passes, one every
//! `retry_interval_secs`. The budget is refilled each time the unit newly
//! enters the degraded phase.

use anyhow::{Context, Result};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::config::{Config, ReconcileConfig};
use crate::controller::{Collaborators, Controller, StatusReport};
use crate::db;
use crate::events::Event;
use crate::migrate;
use crate::platform::JsonLinesPlatform;
use crate::server;
use crate::sqlite_store::SqliteStateStore;
use crate::traits::{ObservedLeadership, Platform, Workload};
use crate::workload::{DryRunWorkload, ProcessWorkload};

const QUEUE_DEPTH: usize = 256;

/// Sending side of the loop, cloned into the HTTP server.
#[derive(Clone)]
pub struct EventHandle {
    pub events: mpsc::Sender<Event>,
    pub status: watch::Receiver<StatusReport>,
}

pub struct EventLoop {
    controller: Controller,
    rx: mpsc::Receiver<Event>,
    status_tx: watch::Sender<StatusReport>,
    periodic_retries: u32,
    retry_interval: Duration,
}

impl EventLoop {
    pub fn new(controller: Controller, reconcile: &ReconcileConfig) -> (Self, EventHandle) {
        let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
        let (status_tx, status_rx) = watch::channel(controller.report());
        let event_loop = Self {
            controller,
            rx,
            status_tx,
            periodic_retries: reconcile.periodic_retries,
            retry_interval: Duration::from_secs(reconcile.retry_interval_secs),
        };
        let handle = EventHandle {
            events: tx,
            status: status_rx,
        };
        (event_loop, handle)
    }

    /// Process events until every sender is dropped or the unit is removed.
    /// Returns the controller so callers can inspect the final state.
    pub async fn run(mut self) -> Controller {
        let mut retries_left = 0u32;
        let mut next_retry: Option<Instant> = None;

        loop {
            let event = match next_retry {
                Some(deadline) if retries_left > 0 => {
                    tokio::select! {
                        ev = self.rx.recv() => match ev {
                            Some(ev) => ev,
                            None => break,
                        },
                        _ = tokio::time::sleep_until(deadline) => {
                            retries_left -= 1;
                            debug!(retries_left, "scheduling periodic retry");
                            Event::Retry
                        }
                    }
                }
                _ => match self.rx.recv().await {
                    Some(ev) => ev,
                    None => break,
                },
            };

            let was_degraded = self.controller.phase().is_degraded();
            self.controller.handle(event).await;
            let degraded = self.controller.phase().is_degraded();

            if degraded {
                if !was_degraded {
                    retries_left = self.periodic_retries;
                }
                next_retry = Some(Instant::now() + self.retry_interval);
            } else {
                retries_left = 0;
                next_retry = None;
            }

            self.status_tx.send_replace(self.controller.report());

            if self.controller.phase().is_terminating() {
                info!("unit removed; event loop stopping");
                break;
            }
        }

        self.controller
    }
}

/// Open the SQLite-backed state store and load the controller for the
/// configured unit.
pub async fn bootstrap(
    config: &Config,
    workload: Arc<dyn Workload>,
    platform: Arc<dyn Platform>,
) -> Result<Controller> {
    migrate::run_migrations(config).await?;
    let pool = db::connect(config).await?;
    let collaborators = Collaborators {
        workload,
        platform,
        store: Arc::new(SqliteStateStore::new(pool)),
        leadership: Arc::new(ObservedLeadership::default()),
    };
    Controller::load(config.clone(), collaborators).await
}

/// `serve`: run the event loop and the HTTP surface until the unit is
/// removed or the server fails.
pub async fn run_serve(config: &Config) -> Result<()> {
    let workload = Arc::new(ProcessWorkload::new(config)?);
    let platform = Arc::new(JsonLinesPlatform::stdout(&config.unit.name));
    let controller = bootstrap(config, workload, platform).await?;

    let (event_loop, handle) = EventLoop::new(controller, &config.reconcile);
    let loop_task = tokio::spawn(event_loop.run());
    handle
        .events
        .send(Event::Start)
        .await
        .context("event loop stopped before start")?;

    tokio::select! {
        result = server::run_server(&config.server.bind, handle) => result,
        finished = loop_task => {
            finished.context("event loop panicked")?;
            info!("event loop finished");
            Ok(())
        }
    }
}

/// `replay`: feed a JSON-lines event file through the controller.
///
/// Blank lines and lines starting with `#` are skipped. The platform's JSON
/// lines (one status line per event, plus relation-data writes) go to
/// stdout.
pub async fn run_replay(config: &Config, file: &Path, dry_run: bool) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("Failed to read event file: {}", file.display()))?;
    let events = parse_events(&content)?;

    let workload: Arc<dyn Workload> = if dry_run {
        Arc::new(DryRunWorkload::new(&config.workload.root))
    } else {
        Arc::new(ProcessWorkload::new(config)?)
    };
    let platform = Arc::new(JsonLinesPlatform::stdout(&config.unit.name));
    let controller = bootstrap(config, workload, platform).await?;

    let (event_loop, handle) = EventLoop::new(controller, &config.reconcile);
    let loop_task = tokio::spawn(event_loop.run());
    for event in events {
        if handle.events.send(event).await.is_err() {
            break;
        }
    }
    drop(handle);

    let controller = loop_task.await.context("event loop panicked")?;
    info!(status = %controller.phase().status(), "replay finished");
    Ok(())
}

pub fn parse_events(content: &str) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for (n, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let event: Event = serde_json::from_str(line)
            .with_context(|| format!("Invalid event on line {}", n + 1))?;
        events.push(event);
    }
    Ok(events)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_events_skips_comments() {
        let events = parse_events(
            "# boot\n{\"event\":\"start\"}\n\n{\"event\":\"leader-changed\",\"leader\":true}\n",
        )
        .unwrap();
        assert_eq!(
            events,
            vec![Event::Start, Event::LeaderChanged { leader: true }]
        );
    }

    #[test]
    fn test_parse_events_reports_line() {
        let err = parse_events("{\"event\":\"start\"}\nnot json\n").unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }
}
