//! Controller lifecycle state machine.
//!
//! Each physical path endpoint is owned by one controller. The controller's
//! state gates command submission, keep-alive, and failover eligibility;
//! transitions are only legal along the fixed graph enforced by
//! [`Controller::change_state`].

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::namespace::Namespace;

/// Controller instance id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CtrlId(pub u32);

impl fmt::Display for CtrlId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nvme{}", self.0)
    }
}

/// Lifecycle state of a controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CtrlState {
    /// Freshly attached, not yet serving I/O.
    New,
    /// Serving I/O; queues unlocked, periodic maintenance running.
    Live,
    /// A reset is scheduled or in progress.
    Resetting,
    /// The fabric connection dropped and is being re-established.
    Reconnecting,
    /// Teardown has begun; maintenance stopped, in-flight work failing.
    Deleting,
    /// Teardown finished; only the final release remains.
    Dead,
}

impl CtrlState {
    /// Read-only state name for management tooling.
    pub fn name(self) -> &'static str {
        match self {
            CtrlState::New => "new",
            CtrlState::Live => "live",
            CtrlState::Resetting => "resetting",
            CtrlState::Reconnecting => "reconnecting",
            CtrlState::Deleting => "deleting",
            CtrlState::Dead => "dead",
        }
    }

    /// Returns true when the requested transition is in the table.
    pub fn can_transition(self, to: CtrlState) -> bool {
        use CtrlState::*;
        matches!(
            (self, to),
            (New, Live)
                | (New, Resetting)
                | (New, Deleting)
                | (Live, Resetting)
                | (Live, Reconnecting)
                | (Live, Deleting)
                | (Resetting, Live)
                | (Resetting, Deleting)
                | (Reconnecting, Live)
                | (Reconnecting, Deleting)
                | (Deleting, Dead)
        )
    }

    /// Returns true once teardown has begun.
    #[inline]
    pub fn is_dying(self) -> bool {
        matches!(self, CtrlState::Deleting | CtrlState::Dead)
    }
}

impl fmt::Display for CtrlState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Whether a controller is a physical path endpoint or the aggregate that
/// fronts a multipath group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerKind {
    /// A physical controller owning real namespaces.
    Physical,
    /// The aggregate controller backing a logical volume.
    Aggregate,
}

/// One controller: a physical path endpoint or a multipath aggregate.
pub struct Controller {
    id: CtrlId,
    kind: ControllerKind,
    state: Mutex<CtrlState>,
    keep_alive_interval: Duration,
    /// Aggregate this controller's namespaces belong to, when it is a
    /// multipath child. Weak: the aggregate must not be kept alive through
    /// a child.
    aggregate: Mutex<Option<Weak<Controller>>>,
    /// No failover is mid-flight for the group this aggregate fronts.
    settled: AtomicBool,
    /// Set by the admin rescan trigger, cleared by the enumeration
    /// collaborator when it picks the request up.
    scan_requested: AtomicBool,
    namespaces: Mutex<Vec<Arc<Namespace>>>,
}

impl Controller {
    /// Creates a physical controller in the `New` state.
    pub fn new_physical(id: CtrlId, keep_alive_interval: Duration) -> Arc<Self> {
        debug!("attach physical controller {}", id);
        Arc::new(Self {
            id,
            kind: ControllerKind::Physical,
            state: Mutex::new(CtrlState::New),
            keep_alive_interval,
            aggregate: Mutex::new(None),
            settled: AtomicBool::new(true),
            scan_requested: AtomicBool::new(false),
            namespaces: Mutex::new(Vec::new()),
        })
    }

    /// Creates the aggregate controller fronting a multipath group. It is
    /// moved to `Live` immediately: the aggregate has no hardware to bring
    /// up.
    pub fn new_aggregate(id: CtrlId) -> Arc<Self> {
        debug!("create aggregate controller {}", id);
        Arc::new(Self {
            id,
            kind: ControllerKind::Aggregate,
            state: Mutex::new(CtrlState::Live),
            keep_alive_interval: Duration::ZERO,
            aggregate: Mutex::new(None),
            settled: AtomicBool::new(true),
            scan_requested: AtomicBool::new(false),
            namespaces: Mutex::new(Vec::new()),
        })
    }

    /// Controller instance id.
    pub fn id(&self) -> CtrlId {
        self.id
    }

    /// Returns true for the aggregate controller of a multipath group.
    pub fn is_aggregate(&self) -> bool {
        self.kind == ControllerKind::Aggregate
    }

    /// Keep-alive period configured for this controller.
    pub fn keep_alive_interval(&self) -> Duration {
        self.keep_alive_interval
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CtrlState {
        *self.state.lock()
    }

    /// Attempts the transition to `new_state` atomically under the
    /// controller lock. Returns whether the transition was legal and
    /// applied; illegal requests leave the state untouched.
    pub fn change_state(&self, new_state: CtrlState) -> bool {
        let mut state = self.state.lock();
        if !state.can_transition(new_state) {
            debug!(
                "{}: rejected state transition {} -> {}",
                self.id, *state, new_state
            );
            return false;
        }
        info!("{}: state {} -> {}", self.id, *state, new_state);
        *state = new_state;
        true
    }

    /// The aggregate controller this child belongs to, if any.
    pub fn aggregate(&self) -> Option<Arc<Controller>> {
        self.aggregate.lock().as_ref().and_then(Weak::upgrade)
    }

    /// Links this physical controller to its multipath aggregate. A
    /// controller belongs to at most one aggregate; relinking to a
    /// different one is rejected.
    pub fn set_aggregate(&self, aggregate: &Arc<Controller>) -> bool {
        let mut slot = self.aggregate.lock();
        if let Some(existing) = slot.as_ref().and_then(Weak::upgrade) {
            return Arc::ptr_eq(&existing, aggregate);
        }
        *slot = Some(Arc::downgrade(aggregate));
        true
    }

    /// Whether the group this aggregate fronts has settled from its last
    /// failover.
    pub fn settled(&self) -> bool {
        self.settled.load(Ordering::Acquire)
    }

    /// Marks the group settled or mid-failover.
    pub fn set_settled(&self, settled: bool) {
        self.settled.store(settled, Ordering::Release);
    }

    /// Requests a namespace rescan from the enumeration collaborator.
    pub fn request_scan(&self) {
        self.scan_requested.store(true, Ordering::Release);
    }

    /// Consumes a pending rescan request, returning whether one was set.
    pub fn take_scan_request(&self) -> bool {
        self.scan_requested.swap(false, Ordering::AcqRel)
    }

    /// Adds a namespace to this controller's list.
    pub fn add_namespace(&self, ns: Arc<Namespace>) {
        self.namespaces.lock().push(ns);
    }

    /// Removes a namespace by id, returning it when found.
    pub fn remove_namespace(&self, nsid: u32) -> Option<Arc<Namespace>> {
        let mut list = self.namespaces.lock();
        let idx = list.iter().position(|ns| ns.nsid() == nsid)?;
        Some(list.remove(idx))
    }

    /// Snapshot of the namespaces this controller owns.
    pub fn namespaces(&self) -> Vec<Arc<Namespace>> {
        self.namespaces.lock().clone()
    }
}

impl fmt::Debug for Controller {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Controller")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctrl() -> Arc<Controller> {
        Controller::new_physical(CtrlId(0), Duration::from_secs(5))
    }

    #[test]
    fn test_new_controller_state() {
        let c = ctrl();
        assert_eq!(c.state(), CtrlState::New);
        assert!(!c.is_aggregate());
    }

    #[test]
    fn test_aggregate_starts_live() {
        let a = Controller::new_aggregate(CtrlId(100));
        assert_eq!(a.state(), CtrlState::Live);
        assert!(a.is_aggregate());
    }

    #[test]
    fn test_legal_transition_chain() {
        let c = ctrl();
        assert!(c.change_state(CtrlState::Live));
        assert!(c.change_state(CtrlState::Resetting));
        assert!(c.change_state(CtrlState::Live));
        assert!(c.change_state(CtrlState::Reconnecting));
        assert!(c.change_state(CtrlState::Live));
        assert!(c.change_state(CtrlState::Deleting));
        assert!(c.change_state(CtrlState::Dead));
        assert_eq!(c.state(), CtrlState::Dead);
    }

    #[test]
    fn test_resetting_to_reconnecting_rejected() {
        let c = ctrl();
        assert!(c.change_state(CtrlState::Live));
        assert!(c.change_state(CtrlState::Resetting));
        assert!(!c.change_state(CtrlState::Reconnecting));
        assert_eq!(c.state(), CtrlState::Resetting);
    }

    #[test]
    fn test_new_to_deleting_allowed() {
        let c = ctrl();
        assert!(c.change_state(CtrlState::Deleting));
        assert!(c.change_state(CtrlState::Dead));
    }

    #[test]
    fn test_dead_is_terminal() {
        let c = ctrl();
        assert!(c.change_state(CtrlState::Deleting));
        assert!(c.change_state(CtrlState::Dead));
        for target in [
            CtrlState::New,
            CtrlState::Live,
            CtrlState::Resetting,
            CtrlState::Reconnecting,
            CtrlState::Deleting,
        ] {
            assert!(!c.change_state(target));
        }
        assert_eq!(c.state(), CtrlState::Dead);
    }

    #[test]
    fn test_illegal_transition_is_noop() {
        let c = ctrl();
        assert!(!c.change_state(CtrlState::Dead));
        assert_eq!(c.state(), CtrlState::New);
        assert!(!c.change_state(CtrlState::Reconnecting));
        assert_eq!(c.state(), CtrlState::New);
    }

    #[test]
    fn test_state_names() {
        assert_eq!(CtrlState::New.name(), "new");
        assert_eq!(CtrlState::Live.name(), "live");
        assert_eq!(CtrlState::Resetting.name(), "resetting");
        assert_eq!(CtrlState::Reconnecting.name(), "reconnecting");
        assert_eq!(CtrlState::Deleting.name(), "deleting");
        assert_eq!(CtrlState::Dead.name(), "dead");
    }

    #[test]
    fn test_is_dying() {
        assert!(CtrlState::Deleting.is_dying());
        assert!(CtrlState::Dead.is_dying());
        assert!(!CtrlState::Live.is_dying());
        assert!(!CtrlState::Resetting.is_dying());
    }

    #[test]
    fn test_set_aggregate_once() {
        let child = ctrl();
        let agg1 = Controller::new_aggregate(CtrlId(100));
        let agg2 = Controller::new_aggregate(CtrlId(101));

        assert!(child.set_aggregate(&agg1));
        // Relinking to the same aggregate is fine, a different one is not.
        assert!(child.set_aggregate(&agg1));
        assert!(!child.set_aggregate(&agg2));
        assert!(Arc::ptr_eq(&child.aggregate().unwrap(), &agg1));
    }

    #[test]
    fn test_aggregate_weak_reference() {
        let child = ctrl();
        {
            let agg = Controller::new_aggregate(CtrlId(100));
            assert!(child.set_aggregate(&agg));
            assert!(child.aggregate().is_some());
        }
        // The child must not keep the aggregate alive.
        assert!(child.aggregate().is_none());
    }

    #[test]
    fn test_settled_flag() {
        let a = Controller::new_aggregate(CtrlId(100));
        assert!(a.settled());
        a.set_settled(false);
        assert!(!a.settled());
        a.set_settled(true);
        assert!(a.settled());
    }

    #[test]
    fn test_scan_request() {
        let c = ctrl();
        assert!(!c.take_scan_request());
        c.request_scan();
        assert!(c.take_scan_request());
        assert!(!c.take_scan_request());
    }
}
