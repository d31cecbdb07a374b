//! Congestion drain loop: periodic resubmission of parked I/O.
//!
//! I/O that cannot reach any path is parked as a shadow record on its
//! volume's congestion queue. A background task wakes once per drain
//! interval, skips volumes that are mid-failover, and pushes everything
//! else back through the command pipeline against the current active
//! path. Each record carries its own resubmission budget.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tracing::{debug, info, warn};

use crate::command::CommandPipeline;
use crate::config::MpathConfig;
use crate::registry::Registry;
use crate::shadow::{ShadowPool, ShadowRecord};
use crate::status::IoOutcome;
use crate::transport::PathTransport;
use crate::volume::LogicalVolume;

/// Fails every record parked on `volume` terminally. Used when the volume
/// is being torn down or has lost all of its paths.
pub(crate) fn cancel_parked(pool: &ShadowPool, volume: &LogicalVolume) {
    let queue = volume.detach_queue();
    if queue.is_empty() {
        return;
    }
    warn!(
        "volume {}: cancelling {} parked I/O(s)",
        volume.guid(),
        queue.len()
    );
    for id in queue {
        if let Some(record) = pool.take(id) {
            record.complete(IoOutcome::IoError);
        }
    }
}

/// The periodic drain task. Owns its own command pipeline so parked I/O
/// retries with the same budget rules as fresh submissions.
pub struct CongestionDrainer<T: PathTransport> {
    registry: Arc<Registry>,
    pool: Arc<ShadowPool>,
    pipeline: CommandPipeline<T>,
    config: MpathConfig,
}

/// Handle to a running drainer. Dropping it without calling [`stop`]
/// leaves the task running until the runtime shuts down.
///
/// [`stop`]: DrainerHandle::stop
pub struct DrainerHandle {
    shutdown: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl DrainerHandle {
    /// Signals the drain loop to exit and waits for it to finish.
    pub async fn stop(self) {
        let _ = self.shutdown.send(true);
        let _ = self.task.await;
    }
}

impl<T: PathTransport> CongestionDrainer<T> {
    /// Creates a drainer over the shared registry, pool, and transport.
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<T>,
        pool: Arc<ShadowPool>,
        config: MpathConfig,
    ) -> Self {
        let pipeline = CommandPipeline::new(transport, config.clone());
        Self {
            registry,
            pool,
            pipeline,
            config,
        }
    }

    /// Spawns the drain loop on the current runtime.
    pub fn spawn(self) -> DrainerHandle {
        let (shutdown, mut rx) = watch::channel(false);
        let task = tokio::spawn(async move {
            let mut tick = interval(self.config.drain_interval);
            // The first tick of a tokio interval fires immediately.
            tick.tick().await;
            info!("congestion drainer started");
            loop {
                tokio::select! {
                    _ = tick.tick() => self.drain_tick().await,
                    _ = rx.changed() => break,
                }
            }
            info!("congestion drainer stopped");
        });
        DrainerHandle { shutdown, task }
    }

    /// One pass over every congested volume.
    async fn drain_tick(&self) {
        for volume in self.registry.volumes() {
            if !volume.is_congested() {
                continue;
            }
            if volume.is_removing() {
                cancel_parked(&self.pool, &volume);
                continue;
            }
            if volume.failover_in_progress() || !volume.settled() {
                // A promotion is still confirming; leave the queue parked
                // rather than racing it onto a half-switched path.
                debug!("volume {}: drain deferred, failover pending", volume.guid());
                continue;
            }
            self.drain_volume(&volume).await;
        }
    }

    /// Resubmits everything parked on one volume.
    async fn drain_volume(&self, volume: &Arc<LogicalVolume>) {
        let queue = volume.detach_queue();
        debug!("volume {}: draining {} parked I/O(s)", volume.guid(), queue.len());

        for id in queue {
            // Records can disappear if the volume was cancelled between
            // detach and here.
            let Some(mut record) = self.pool.take(id) else {
                continue;
            };

            let Some(active) = self.registry.find_active(volume) else {
                self.retry_or_fail(volume, record, IoOutcome::IoError);
                continue;
            };

            record.attempted = Some(active.path_id());
            let completed = self.pipeline.submit(&active, &record.request).await;
            if completed.outcome == IoOutcome::Success {
                record.complete(IoOutcome::Success);
            } else if completed.aborted() {
                record.complete(completed.outcome);
            } else {
                self.retry_or_fail(volume, record, completed.outcome);
            }
        }
    }

    /// Re-parks the record if its budget allows, otherwise completes it
    /// with `outcome`.
    fn retry_or_fail(&self, volume: &LogicalVolume, mut record: ShadowRecord, outcome: IoOutcome) {
        if record.retries_left == 0 {
            record.complete(outcome);
            return;
        }
        record.retries_left -= 1;
        match self.pool.insert(record) {
            Ok(id) => volume.park(id),
            // Pool exhausted while re-parking: the record loses its slot
            // and fails now rather than blocking.
            Err(record) => record.complete(IoOutcome::IoError),
        }
    }
}
