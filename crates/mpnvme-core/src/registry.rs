//! Process-wide registry of controllers and logical volumes.
//!
//! An explicit registry object replaces the driver-global lists: it is
//! created once, passed by reference to the components that need
//! enumeration, and torn down with the engine. Grouping happens here: a
//! physical namespace whose guid matches an existing volume joins it as a
//! standby; the first namespace of a guid creates the volume, its aggregate
//! controller, and its root namespace, and becomes the active member.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tracing::{info, warn};
use uuid::Uuid;

use crate::controller::{Controller, CtrlId, CtrlState};
use crate::error::{MpathError, MpathResult};
use crate::namespace::{Namespace, NsRole, PathState};
use crate::transport::PathId;
use crate::volume::LogicalVolume;

/// Aggregate controller instances are allocated from a separate range so
/// logs never confuse them with physical attachments.
const AGGREGATE_INSTANCE_BASE: u32 = 0x8000_0000;

/// Process-wide bookkeeping of controllers and volumes.
pub struct Registry {
    controllers: DashMap<u32, Arc<Controller>>,
    volumes: DashMap<Uuid, Arc<LogicalVolume>>,
    next_instance: AtomicU32,
    next_aggregate: AtomicU32,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self {
            controllers: DashMap::new(),
            volumes: DashMap::new(),
            next_instance: AtomicU32::new(0),
            next_aggregate: AtomicU32::new(AGGREGATE_INSTANCE_BASE),
        }
    }

    /// Attaches a new physical controller in the `New` state.
    pub fn register_controller(&self, keep_alive_interval: std::time::Duration) -> Arc<Controller> {
        let id = CtrlId(self.next_instance.fetch_add(1, Ordering::Relaxed));
        let ctrl = Controller::new_physical(id, keep_alive_interval);
        self.controllers.insert(id.0, ctrl.clone());
        info!("{}: registered", id);
        ctrl
    }

    /// Looks a controller up by instance id.
    pub fn controller(&self, id: CtrlId) -> MpathResult<Arc<Controller>> {
        self.controllers
            .get(&id.0)
            .map(|e| e.value().clone())
            .ok_or(MpathError::ControllerNotFound(id.0))
    }

    /// Drops a controller from the registry once teardown completed.
    pub fn unregister_controller(&self, id: CtrlId) {
        self.controllers.remove(&id.0);
    }

    /// Snapshot of all registered controllers.
    pub fn controllers(&self) -> Vec<Arc<Controller>> {
        self.controllers.iter().map(|e| e.value().clone()).collect()
    }

    /// Looks a volume up by guid.
    pub fn volume(&self, guid: Uuid) -> MpathResult<Arc<LogicalVolume>> {
        self.volumes
            .get(&guid)
            .map(|e| e.value().clone())
            .ok_or(MpathError::VolumeNotFound(guid))
    }

    /// Snapshot of all logical volumes, for the drain task.
    pub fn volumes(&self) -> Vec<Arc<LogicalVolume>> {
        self.volumes.iter().map(|e| e.value().clone()).collect()
    }

    /// Attaches a namespace discovered on `ctrl` and groups it into the
    /// volume identified by `guid`. The first member of a guid creates the
    /// volume and becomes active; later members join as standby.
    pub fn attach_namespace(
        &self,
        ctrl: &Arc<Controller>,
        nsid: u32,
        guid: Uuid,
    ) -> (Arc<Namespace>, Arc<LogicalVolume>) {
        let ns = Namespace::new(ctrl, nsid, guid, NsRole::Path);
        ctrl.add_namespace(ns.clone());

        let volume = self
            .volumes
            .entry(guid)
            .or_insert_with(|| {
                let agg_id = CtrlId(self.next_aggregate.fetch_add(1, Ordering::Relaxed));
                let aggregate = Controller::new_aggregate(agg_id);
                let root = Namespace::new(&aggregate, nsid, guid, NsRole::Root);
                aggregate.add_namespace(root.clone());
                self.controllers.insert(agg_id.0, aggregate.clone());
                info!("volume {}: created, fronted by {}", guid, agg_id);
                LogicalVolume::new(guid, aggregate, root)
            })
            .clone();

        ctrl.set_aggregate(volume.aggregate_ctrl());
        let first = volume.with_members(|members| {
            let first = members.is_empty();
            ns.set_multipath();
            if first {
                ns.set_active(true);
            }
            members.push(ns.clone());
            first
        });
        info!(
            "volume {}: attached {} as {}",
            guid,
            ns.path_id(),
            if first { "active" } else { "standby" }
        );
        (ns, volume)
    }

    /// Detaches a namespace from its volume. Returns the volume when this
    /// was the last member, meaning the volume is dying and its parked I/O
    /// must be cancelled by the caller.
    pub fn detach_namespace(&self, ns: &Arc<Namespace>) -> Option<Arc<LogicalVolume>> {
        let volume = self.volumes.get(&ns.guid()).map(|e| e.value().clone())?;
        if let Some(ctrl) = ns.controller() {
            ctrl.remove_namespace(ns.nsid());
        }
        let remaining = volume.remove_member(ns);
        if remaining == 0 {
            info!("volume {}: last member gone, destroying", volume.guid());
            volume.root_ns().mark_removing();
            self.volumes.remove(&volume.guid());
            let aggregate = volume.aggregate_ctrl();
            aggregate.change_state(CtrlState::Deleting);
            aggregate.change_state(CtrlState::Dead);
            self.controllers.remove(&aggregate.id().0);
            return Some(volume);
        }
        None
    }

    /// Scans the volume's members under the lock and returns the first
    /// ACTIVE one. `None` is a normal condition during failover windows.
    /// Duplicate active members are a recoverable anomaly: logged, first
    /// found wins.
    pub fn find_active(&self, volume: &LogicalVolume) -> Option<Arc<Namespace>> {
        volume.with_members(|members| {
            let mut found: Option<Arc<Namespace>> = None;
            for ns in members.iter() {
                if ns.is_removing() || !ns.is_multipath() {
                    continue;
                }
                if ns.path_state() == PathState::Active {
                    if let Some(existing) = &found {
                        warn!(
                            "volume {}: duplicate active members {} and {}, keeping first",
                            volume.guid(),
                            existing.path_id(),
                            ns.path_id()
                        );
                    } else {
                        found = Some(ns.clone());
                    }
                }
            }
            found
        })
    }

    /// Read-only controller state name for management tooling.
    pub fn state_name(&self, id: CtrlId) -> MpathResult<&'static str> {
        Ok(self.controller(id)?.state().name())
    }

    /// Identifier of the volume's current active path, for diagnostics.
    pub fn active_path(&self, guid: Uuid) -> MpathResult<PathId> {
        let volume = self.volume(guid)?;
        self.find_active(&volume)
            .map(|ns| ns.path_id())
            .ok_or(MpathError::NoActivePath(guid))
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}
