//! Top-level multipath engine: wires the registry, command pipeline,
//! failover engine, congestion drainer, and keep-alive tasks together.

use std::sync::Arc;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::command::CommandPipeline;
use crate::config::MpathConfig;
use crate::controller::{Controller, CtrlId, CtrlState};
use crate::error::{MpathError, MpathResult};
use crate::failover::FailoverEngine;
use crate::namespace::Namespace;
use crate::registry::Registry;
use crate::request::{IoDone, IoRequest};
use crate::resubmit::{cancel_parked, CongestionDrainer, DrainerHandle};
use crate::shadow::{ShadowPool, ShadowPoolStats, ShadowRecord};
use crate::status::IoOutcome;
use crate::transport::{PathId, PathTransport};
use crate::volume::LogicalVolume;

/// Point-in-time engine counters, exposed for management tooling.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStats {
    /// Registered physical and aggregate controllers.
    pub controllers: usize,
    /// Logical volumes currently grouped.
    pub volumes: usize,
    /// Shadow pool occupancy.
    pub pool: ShadowPoolStats,
}

/// The multipath engine. One instance per process; clones of the inner
/// state are shared with the background tasks it spawns.
pub struct MultipathEngine<T: PathTransport> {
    registry: Arc<Registry>,
    transport: Arc<T>,
    pool: Arc<ShadowPool>,
    config: MpathConfig,
    pipeline: CommandPipeline<T>,
    failover: FailoverEngine<T>,
    drainer: Mutex<Option<DrainerHandle>>,
    // Keep-alive tasks all watch the same shutdown signal.
    shutdown: watch::Sender<bool>,
}

impl<T: PathTransport> MultipathEngine<T> {
    /// Builds an engine over `transport` with the given configuration.
    pub fn new(transport: Arc<T>, config: MpathConfig) -> Self {
        let registry = Arc::new(Registry::new());
        let pool = Arc::new(ShadowPool::new(config.shadow_pool_capacity));
        let pipeline = CommandPipeline::new(transport.clone(), config.clone());
        let failover = FailoverEngine::new(
            registry.clone(),
            transport.clone(),
            pool.clone(),
            config.clone(),
        );
        let (shutdown, _) = watch::channel(false);
        Self {
            registry,
            transport,
            pool,
            config,
            pipeline,
            failover,
            drainer: Mutex::new(None),
            shutdown,
        }
    }

    /// Starts the background congestion drainer. Idempotent.
    pub fn start(&self) {
        let mut slot = self.drainer.lock();
        if slot.is_some() {
            return;
        }
        let drainer = CongestionDrainer::new(
            self.registry.clone(),
            self.transport.clone(),
            self.pool.clone(),
            self.config.clone(),
        );
        *slot = Some(drainer.spawn());
        info!("multipath engine started");
    }

    /// Stops the drainer and every keep-alive task, then fails all parked
    /// I/O terminally.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(true);
        let handle = self.drainer.lock().take();
        if let Some(handle) = handle {
            handle.stop().await;
        }
        for volume in self.registry.volumes() {
            cancel_parked(&self.pool, &volume);
        }
        info!("multipath engine stopped");
    }

    /// Access to the controller and volume registry.
    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    /// Registers a new physical controller in `NEW` state with the
    /// configured keep-alive interval.
    pub fn add_controller(&self) -> Arc<Controller> {
        self.registry.register_controller(self.config.keep_alive_interval)
    }

    /// Attaches a namespace on `ctrl` into the volume identified by
    /// `guid`, creating the volume on first attach.
    pub fn attach_namespace(
        &self,
        ctrl: &Arc<Controller>,
        nsid: u32,
        guid: Uuid,
    ) -> Arc<Namespace> {
        let (ns, _) = self.registry.attach_namespace(ctrl, nsid, guid);
        ns
    }

    /// Submits one I/O to the volume's active path. The completion
    /// callback fires exactly once; congestion and failover park the I/O
    /// for background resubmission instead of failing it.
    ///
    /// Every submission reserves a shadow slot for its whole flight, so a
    /// burst that saturates the pool fails new I/O immediately instead of
    /// blocking the submitter.
    pub async fn submit_io(
        &self,
        guid: Uuid,
        request: IoRequest,
        done: IoDone,
    ) -> MpathResult<()> {
        let volume = self.registry.volume(guid)?;

        if volume.is_removing() {
            done(IoOutcome::IoError);
            return Ok(());
        }

        let record = ShadowRecord::new(request.clone(), done, self.config.mpath_io_retries);
        let id = match self.pool.insert(record) {
            Ok(id) => id,
            Err(record) => {
                warn!("volume {}: shadow pool exhausted, failing I/O", guid);
                record.complete(IoOutcome::IoError);
                return Ok(());
            }
        };

        if volume.failover_in_progress() || !volume.settled() {
            volume.park(id);
            return Ok(());
        }

        let Some(active) = self.registry.find_active(&volume) else {
            debug!("volume {}: no active path, parking I/O", guid);
            volume.park(id);
            return Ok(());
        };

        self.pool.update(id, |r| r.attempted = Some(active.path_id()));
        let completed = self.pipeline.submit(&active, &request).await;
        let Some(record) = self.pool.take(id) else {
            // The record was completed out from under us during teardown.
            return Ok(());
        };

        if completed.outcome == IoOutcome::Success || completed.aborted() {
            record.complete(completed.outcome);
            return Ok(());
        }

        // The active path just failed terminally: kick a failover and, if
        // the budget allows, park the I/O so the drainer can resubmit it
        // on the new path.
        warn!(
            "volume {}: I/O failed on {} with {}, triggering failover",
            guid,
            active.path_id(),
            completed.status
        );
        if let Some(ctrl) = active.controller() {
            self.failover.trigger_failover(&ctrl);
        }
        self.repark_or_fail(&volume, record, completed.outcome);
        Ok(())
    }

    /// Re-parks a record with one budget unit spent, or completes it with
    /// `outcome` when the budget is gone.
    fn repark_or_fail(&self, volume: &LogicalVolume, mut record: ShadowRecord, outcome: IoOutcome) {
        if record.retries_left == 0 {
            record.complete(outcome);
            return;
        }
        record.retries_left -= 1;
        match self.pool.insert(record) {
            Ok(id) => volume.park(id),
            Err(record) => {
                warn!(
                    "volume {}: shadow pool exhausted, failing I/O",
                    volume.guid()
                );
                record.complete(IoOutcome::IoError);
            }
        }
    }

    /// Spawns the periodic keep-alive task for a controller. The task
    /// exits when the controller starts dying or the engine shuts down.
    /// Aggregates have no hardware to probe and are skipped.
    pub fn start_keep_alive(&self, ctrl: &Arc<Controller>) {
        if ctrl.is_aggregate() {
            debug!("{}: no keep-alive for aggregate controller", ctrl.id());
            return;
        }
        let ctrl = ctrl.clone();
        let transport = self.transport.clone();
        let failover = self.failover.clone();
        let mut shutdown = self.shutdown.subscribe();
        tokio::spawn(async move {
            let mut tick = interval(ctrl.keep_alive_interval());
            tick.tick().await;
            loop {
                tokio::select! {
                    _ = tick.tick() => {}
                    _ = shutdown.changed() => break,
                }
                if ctrl.state().is_dying() {
                    break;
                }
                let status = transport.keep_alive(ctrl.id()).await;
                if status.is_success() {
                    // A controller that was resetting is reachable again.
                    if ctrl.state() == CtrlState::Resetting
                        || ctrl.state() == CtrlState::Reconnecting
                    {
                        if ctrl.change_state(CtrlState::Live) {
                            info!("{}: recovered, back to live", ctrl.id());
                            ctrl.request_scan();
                        }
                    }
                } else {
                    warn!("{}: keep-alive failed with {}", ctrl.id(), status);
                    if ctrl.state() == CtrlState::Live && ctrl.change_state(CtrlState::Resetting) {
                        failover.trigger_failover(&ctrl);
                    }
                }
            }
            debug!("{}: keep-alive task exited", ctrl.id());
        });
    }

    /// Removes one namespace from its controller and volume. An active
    /// member is demoted first so a surviving standby can take over.
    pub fn remove_namespace(&self, ns: &Arc<Namespace>) {
        let was_active = ns.is_active();
        if !ns.mark_removing() {
            return;
        }
        let volume = self.registry.volume(ns.guid()).ok();
        if was_active {
            if let Some(volume) = &volume {
                volume.with_members(|_| ns.set_active(false));
            }
        }

        if let Some(removed) = self.registry.detach_namespace(ns) {
            // Last member: the volume is gone, parked I/O cannot complete.
            cancel_parked(&self.pool, &removed);
            return;
        }

        if was_active {
            if let Some(volume) = volume {
                // The member is already detached, so the trigger goes
                // through the volume's aggregate controller.
                self.failover.trigger_failover(volume.aggregate_ctrl());
            }
        }
    }

    /// Tears a controller down: `DELETING`, namespaces detached (failing
    /// over as needed), then `DEAD` and unregistered.
    pub fn delete_controller(&self, id: CtrlId) -> MpathResult<()> {
        let ctrl = self.registry.controller(id)?;
        if !ctrl.change_state(CtrlState::Deleting) {
            return Err(MpathError::InvalidTransition {
                from: ctrl.state(),
                to: CtrlState::Deleting,
            });
        }
        for ns in ctrl.namespaces() {
            self.remove_namespace(&ns);
        }
        ctrl.change_state(CtrlState::Dead);
        self.registry.unregister_controller(id);
        info!("{}: deleted", id);
        Ok(())
    }

    /// Forces a controller reset, failing over if it carried the active
    /// path.
    pub fn force_reset(&self, id: CtrlId) -> MpathResult<()> {
        let ctrl = self.registry.controller(id)?;
        if !ctrl.change_state(CtrlState::Resetting) {
            return Err(MpathError::InvalidTransition {
                from: ctrl.state(),
                to: CtrlState::Resetting,
            });
        }
        self.failover.trigger_failover(&ctrl);
        Ok(())
    }

    /// Flags a controller for namespace rescan.
    pub fn force_rescan(&self, id: CtrlId) -> MpathResult<()> {
        let ctrl = self.registry.controller(id)?;
        ctrl.request_scan();
        Ok(())
    }

    /// Human-readable state of a controller, for management output.
    pub fn state_name(&self, id: CtrlId) -> MpathResult<&'static str> {
        Ok(self.registry.controller(id)?.state().name())
    }

    /// The path currently serving a volume's I/O.
    pub fn active_path(&self, guid: Uuid) -> MpathResult<PathId> {
        self.registry.active_path(guid)
    }

    /// Current counters.
    pub fn stats(&self) -> EngineStats {
        EngineStats {
            controllers: self.registry.controllers().len(),
            volumes: self.registry.volumes().len(),
            pool: self.pool.stats(),
        }
    }
}
