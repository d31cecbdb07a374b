//! Physical namespaces: one controller's view of a volume.
//!
//! A namespace is the unit of active/standby selection. Its `active` flag is
//! only mutated by the failover engine under the owning volume's member
//! lock; the independently-togglable conditions (removing, dead,
//! failover-in-progress) are atomics so completion paths can observe them
//! without taking that lock.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::controller::{Controller, CtrlId, CtrlState};
use crate::transport::PathId;

/// Whether a namespace is a real path or the root of a multipath group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NsRole {
    /// A physical path exposed by one controller.
    Path,
    /// The logical root namespace fronting a multipath group. Never
    /// submitted to directly.
    Root,
}

/// Tri-state path classification derived from the active flag and the
/// owning controller's lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathState {
    /// Active flag set and controller live.
    Active,
    /// Active flag clear and controller live; promotion candidate.
    Standby,
    /// Controller not live; the path cannot be classified.
    Undefined,
}

/// One addressable namespace.
pub struct Namespace {
    nsid: u32,
    ctrl_id: CtrlId,
    /// Weak: holding a namespace must not retain its controller.
    ctrl: Weak<Controller>,
    guid: Uuid,
    role: NsRole,
    active: AtomicBool,
    multipath: AtomicBool,
    removing: AtomicBool,
    dead: AtomicBool,
    failover_in_progress: AtomicBool,
    last_failover: Mutex<Option<Instant>>,
}

impl Namespace {
    /// Creates a namespace owned by `ctrl`, correlated into a logical
    /// volume by `guid`.
    pub fn new(ctrl: &Arc<Controller>, nsid: u32, guid: Uuid, role: NsRole) -> Arc<Self> {
        Arc::new(Self {
            nsid,
            ctrl_id: ctrl.id(),
            ctrl: Arc::downgrade(ctrl),
            guid,
            role,
            active: AtomicBool::new(false),
            multipath: AtomicBool::new(false),
            removing: AtomicBool::new(false),
            dead: AtomicBool::new(false),
            failover_in_progress: AtomicBool::new(false),
            last_failover: Mutex::new(None),
        })
    }

    /// Namespace id on the owning controller.
    pub fn nsid(&self) -> u32 {
        self.nsid
    }

    /// Global identifier correlating this path into its logical volume.
    pub fn guid(&self) -> Uuid {
        self.guid
    }

    /// Role of this namespace.
    pub fn role(&self) -> NsRole {
        self.role
    }

    /// Path identifier for transport submission.
    pub fn path_id(&self) -> PathId {
        PathId {
            ctrl: self.ctrl_id,
            nsid: self.nsid,
        }
    }

    /// Upgrades the weak back-reference to the owning controller.
    pub fn controller(&self) -> Option<Arc<Controller>> {
        self.ctrl.upgrade()
    }

    /// Whether this path currently carries the group's I/O.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Sets the active flag. Callers must hold the owning volume's member
    /// lock; the failover engine is the only writer during steady state.
    pub fn set_active(&self, active: bool) {
        self.active.store(active, Ordering::Release);
    }

    /// Whether this namespace belongs to an active/standby group.
    pub fn is_multipath(&self) -> bool {
        self.multipath.load(Ordering::Acquire)
    }

    /// Marks the namespace as part of a multipath group.
    pub fn set_multipath(&self) {
        self.multipath.store(true, Ordering::Release);
    }

    /// Whether removal has begun.
    pub fn is_removing(&self) -> bool {
        self.removing.load(Ordering::Acquire)
    }

    /// Begins removal. Returns false when removal was already in progress,
    /// making teardown idempotent.
    pub fn mark_removing(&self) -> bool {
        !self.removing.swap(true, Ordering::AcqRel)
    }

    /// Whether the namespace was declared dead during controller teardown.
    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Declares the namespace dead.
    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    /// Whether a failover is in flight for the group this root fronts.
    pub fn failover_in_progress(&self) -> bool {
        self.failover_in_progress.load(Ordering::Acquire)
    }

    /// Test-and-set entry into the failover critical section. Returns true
    /// when this caller won entry; false when a failover was already in
    /// flight.
    pub fn begin_failover(&self) -> bool {
        !self.failover_in_progress.swap(true, Ordering::AcqRel)
    }

    /// Leaves the failover critical section.
    pub fn end_failover(&self) {
        self.failover_in_progress.store(false, Ordering::Release);
    }

    /// Stamps the time this path last lost its active role.
    pub fn stamp_failover(&self) {
        *self.last_failover.lock() = Some(Instant::now());
    }

    /// When this path was last demoted, if ever.
    pub fn last_failover(&self) -> Option<Instant> {
        *self.last_failover.lock()
    }

    /// Classifies the path from its active flag and controller state.
    pub fn path_state(&self) -> PathState {
        match self.controller() {
            Some(ctrl) if ctrl.state() == CtrlState::Live => {
                if self.is_active() {
                    PathState::Active
                } else {
                    PathState::Standby
                }
            }
            _ => PathState::Undefined,
        }
    }
}

impl fmt::Debug for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Namespace")
            .field("path", &self.path_id())
            .field("guid", &self.guid)
            .field("role", &self.role)
            .field("active", &self.is_active())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn ctrl(id: u32) -> Arc<Controller> {
        Controller::new_physical(CtrlId(id), Duration::from_secs(5))
    }

    #[test]
    fn test_new_namespace() {
        let c = ctrl(0);
        let guid = Uuid::new_v4();
        let ns = Namespace::new(&c, 1, guid, NsRole::Path);
        assert_eq!(ns.nsid(), 1);
        assert_eq!(ns.guid(), guid);
        assert_eq!(ns.role(), NsRole::Path);
        assert!(!ns.is_active());
        assert!(!ns.is_removing());
        assert!(!ns.is_dead());
        assert!(!ns.failover_in_progress());
    }

    #[test]
    fn test_path_id() {
        let c = ctrl(3);
        let ns = Namespace::new(&c, 2, Uuid::new_v4(), NsRole::Path);
        let path = ns.path_id();
        assert_eq!(path.ctrl, CtrlId(3));
        assert_eq!(path.nsid, 2);
        assert_eq!(format!("{}", path), "nvme3n2");
    }

    #[test]
    fn test_weak_controller_reference() {
        let ns = {
            let c = ctrl(0);
            Namespace::new(&c, 1, Uuid::new_v4(), NsRole::Path)
        };
        // A held namespace must not retain its controller.
        assert!(ns.controller().is_none());
        assert_eq!(ns.path_state(), PathState::Undefined);
    }

    #[test]
    fn test_path_state_classification() {
        let c = ctrl(0);
        let ns = Namespace::new(&c, 1, Uuid::new_v4(), NsRole::Path);

        // Controller not live yet.
        assert_eq!(ns.path_state(), PathState::Undefined);

        assert!(c.change_state(CtrlState::Live));
        assert_eq!(ns.path_state(), PathState::Standby);

        ns.set_active(true);
        assert_eq!(ns.path_state(), PathState::Active);

        assert!(c.change_state(CtrlState::Resetting));
        assert_eq!(ns.path_state(), PathState::Undefined);
    }

    #[test]
    fn test_begin_failover_is_test_and_set() {
        let c = ctrl(0);
        let ns = Namespace::new(&c, 1, Uuid::new_v4(), NsRole::Root);
        assert!(ns.begin_failover());
        assert!(ns.failover_in_progress());
        assert!(!ns.begin_failover());
        ns.end_failover();
        assert!(!ns.failover_in_progress());
        assert!(ns.begin_failover());
    }

    #[test]
    fn test_mark_removing_idempotent() {
        let c = ctrl(0);
        let ns = Namespace::new(&c, 1, Uuid::new_v4(), NsRole::Path);
        assert!(ns.mark_removing());
        assert!(!ns.mark_removing());
        assert!(ns.is_removing());
    }

    #[test]
    fn test_failover_stamp() {
        let c = ctrl(0);
        let ns = Namespace::new(&c, 1, Uuid::new_v4(), NsRole::Path);
        assert!(ns.last_failover().is_none());
        ns.stamp_failover();
        let stamped = ns.last_failover().expect("stamp recorded");
        assert!(stamped.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn test_multipath_flag() {
        let c = ctrl(0);
        let ns = Namespace::new(&c, 1, Uuid::new_v4(), NsRole::Path);
        assert!(!ns.is_multipath());
        ns.set_multipath();
        assert!(ns.is_multipath());
    }
}
