//! Periodic background work: snapshots, stale sweeps and retention
//!
//! Every task owns its own interval and a child of one cancellation token.
//! A tick that has started runs to completion; cancellation is only observed
//! between ticks. Retention runs once at startup so a service restarted more
//! often than its retention interval still prunes.

use futures_util::future::join_all;
use log::{debug, error, info, warn};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::state::{AggregationState, SweepReport};
use crate::storage::{RetentionSweeper, Snapshotter};

#[derive(Debug, Clone, Copy)]
pub struct TaskSchedule {
    pub snapshot_interval: Duration,
    pub stale_sweep_interval: Duration,
    pub retention_interval: Duration,
    pub client_idle_timeout: Duration,
    pub device_idle_horizon: Duration,
}

pub struct BackgroundTasks {
    shutdown: CancellationToken,
    handles: Vec<(&'static str, JoinHandle<()>)>,
}

impl BackgroundTasks {
    pub fn spawn(
        schedule: TaskSchedule,
        state: Arc<AggregationState>,
        snapshotter: Arc<Snapshotter>,
        sweeper: Arc<RetentionSweeper>,
    ) -> Self {
        let shutdown = CancellationToken::new();
        let mut handles = Vec::new();

        let snapshot_state = state.clone();
        handles.push((
            "snapshot",
            spawn_periodic(
                "snapshot",
                schedule.snapshot_interval,
                false,
                shutdown.child_token(),
                move || {
                    let state = snapshot_state.clone();
                    let snapshotter = snapshotter.clone();
                    async move {
                        let snapshot = state.snapshot();
                        let report = snapshotter.persist(&snapshot).await;
                        if report.failed > 0 {
                            warn!(
                                "Snapshot finished with {} failures ({} partitions saved)",
                                report.failed, report.saved_partitions
                            );
                        } else {
                            debug!(
                                "Snapshot of {} devices saved {} partitions",
                                report.devices, report.saved_partitions
                            );
                        }
                    }
                },
            ),
        ));

        handles.push((
            "stale-sweep",
            spawn_periodic(
                "stale-sweep",
                schedule.stale_sweep_interval,
                false,
                shutdown.child_token(),
                move || {
                    let state = state.clone();
                    async move {
                        let report = state.sweep_stale(
                            schedule.client_idle_timeout,
                            schedule.device_idle_horizon,
                        );
                        if report != SweepReport::default() {
                            info!(
                                "Stale sweep: {} clients went inactive, {} clients and {} devices removed",
                                report.deactivated_clients,
                                report.removed_clients,
                                report.removed_devices
                            );
                        }
                    }
                },
            ),
        ));

        handles.push((
            "retention",
            spawn_periodic(
                "retention",
                schedule.retention_interval,
                true,
                shutdown.child_token(),
                move || {
                    let sweeper = sweeper.clone();
                    async move {
                        // Failures are logged by the sweeper and retried next tick
                        let _ = sweeper.run_once().await;
                    }
                },
            ),
        ));

        Self { shutdown, handles }
    }

    /// Cancel all tasks and wait up to `grace` for them to finish.
    ///
    /// Returns false when some task had to be aborted.
    pub async fn shutdown(self, grace: Duration) -> bool {
        self.shutdown.cancel();

        let names: Vec<&'static str> = self.handles.iter().map(|(name, _)| *name).collect();
        let aborts: Vec<_> = self
            .handles
            .iter()
            .map(|(_, handle)| handle.abort_handle())
            .collect();
        let joins = join_all(self.handles.into_iter().map(|(_, handle)| handle));

        match tokio::time::timeout(grace, joins).await {
            Ok(results) => {
                for (name, result) in names.iter().zip(results) {
                    if let Err(e) = result {
                        error!("Background task {} ended abnormally: {}", name, e);
                    }
                }
                info!("Background tasks stopped");
                true
            }
            Err(_) => {
                warn!(
                    "Background tasks did not stop within {}s, aborting",
                    grace.as_secs()
                );
                for abort in aborts {
                    abort.abort();
                }
                false
            }
        }
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    immediate: bool,
    shutdown: CancellationToken,
    tick: F,
) -> JoinHandle<()>
where
    F: Fn() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        // Unless immediate, the first tick is one period after start
        let start = if immediate {
            Instant::now()
        } else {
            Instant::now() + period
        };
        let mut interval = interval_at(start, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => tick().await,
                _ = shutdown.cancelled() => {
                    debug!("Background task {} shutting down", name);
                    break;
                }
            }
        }
    })
}
