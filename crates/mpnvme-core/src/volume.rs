//! Logical volumes: the user-visible device fronting a multipath group.
//!
//! A volume owns the member list, the congestion queue of parked I/O, and
//! the failover-in-progress flag (carried by its root namespace). It exists
//! as long as at least one member path exists.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use uuid::Uuid;

use crate::controller::Controller;
use crate::namespace::Namespace;
use crate::shadow::ShadowId;

/// The user-visible block device formed by grouping paths that refer to the
/// same underlying storage.
pub struct LogicalVolume {
    guid: Uuid,
    aggregate_ctrl: Arc<Controller>,
    root_ns: Arc<Namespace>,
    members: Mutex<Vec<Arc<Namespace>>>,
    congestion: Mutex<VecDeque<ShadowId>>,
    /// "Queue non-empty" condition observed by the drain task.
    congested: AtomicBool,
}

impl LogicalVolume {
    /// Creates a volume fronted by the given aggregate controller and root
    /// namespace.
    pub fn new(guid: Uuid, aggregate_ctrl: Arc<Controller>, root_ns: Arc<Namespace>) -> Arc<Self> {
        Arc::new(Self {
            guid,
            aggregate_ctrl,
            root_ns,
            members: Mutex::new(Vec::new()),
            congestion: Mutex::new(VecDeque::new()),
            congested: AtomicBool::new(false),
        })
    }

    /// Global identifier of the underlying storage.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// The aggregate controller fronting this group.
    pub fn aggregate_ctrl(&self) -> &Arc<Controller> {
        &self.aggregate_ctrl
    }

    /// The root namespace carrying the failover-in-progress flag.
    pub fn root_ns(&self) -> &Arc<Namespace> {
        &self.root_ns
    }

    /// Whether a failover is in flight for this volume.
    pub fn failover_in_progress(&self) -> bool {
        self.root_ns.failover_in_progress()
    }

    /// Whether the last failover has fully settled.
    pub fn settled(&self) -> bool {
        self.aggregate_ctrl.settled()
    }

    /// Marks the volume settled or mid-failover.
    pub fn set_settled(&self, settled: bool) {
        self.aggregate_ctrl.set_settled(settled);
    }

    /// Whether the volume itself is being torn down.
    pub fn is_removing(&self) -> bool {
        self.root_ns.is_removing()
    }

    /// Adds a member path under the member lock.
    pub fn add_member(&self, ns: Arc<Namespace>) {
        ns.set_multipath();
        self.members.lock().push(ns);
    }

    /// Removes a member path, returning how many members remain.
    pub fn remove_member(&self, ns: &Arc<Namespace>) -> usize {
        let mut members = self.members.lock();
        members.retain(|m| !Arc::ptr_eq(m, ns));
        members.len()
    }

    /// Snapshot of the member paths.
    pub fn members(&self) -> Vec<Arc<Namespace>> {
        self.members.lock().clone()
    }

    /// Runs `f` with the member list held under the lock. Used where scan
    /// and mutation must be atomic, such as active/standby selection.
    pub fn with_members<R>(&self, f: impl FnOnce(&mut Vec<Arc<Namespace>>) -> R) -> R {
        f(&mut self.members.lock())
    }

    /// Number of member paths.
    pub fn member_count(&self) -> usize {
        self.members.lock().len()
    }

    /// Parks an I/O shadow handle on the congestion queue, signaling the
    /// non-empty condition when this is the first entry.
    pub fn park(&self, id: ShadowId) {
        let mut queue = self.congestion.lock();
        queue.push_back(id);
        if queue.len() == 1 {
            self.congested.store(true, Ordering::Release);
        }
    }

    /// Whether the congestion queue is signaled non-empty.
    pub fn is_congested(&self) -> bool {
        self.congested.load(Ordering::Acquire)
    }

    /// Atomically detaches the entire congestion queue and clears the
    /// non-empty signal.
    pub fn detach_queue(&self) -> VecDeque<ShadowId> {
        let mut queue = self.congestion.lock();
        self.congested.store(false, Ordering::Release);
        std::mem::take(&mut *queue)
    }
}

impl fmt::Debug for LogicalVolume {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LogicalVolume")
            .field("guid", &self.guid)
            .field("members", &self.member_count())
            .field("congested", &self.is_congested())
            .finish()
    }
}
