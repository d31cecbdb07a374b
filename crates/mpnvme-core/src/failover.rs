//! Failover engine: active/standby promotion with rate limiting.
//!
//! Per logical volume the engine moves `STABLE -> FAILOVER_IN_PROGRESS ->
//! STABLE`, tracked by the failover flag on the volume's root namespace.
//! The settled flag on the aggregate controller covers the tail of a
//! failover: until promotion confirms, the congestion subsystem must not
//! resubmit against a path that is mid-promotion.

use std::sync::Arc;

use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::config::MpathConfig;
use crate::controller::{Controller, CtrlState};
use crate::namespace::Namespace;
use crate::registry::Registry;
use crate::resubmit::cancel_parked;
use crate::shadow::ShadowPool;
use crate::transport::PathTransport;
use crate::volume::LogicalVolume;

/// Orchestrates promotion of standby paths. Cheap to clone; all state is
/// shared.
pub struct FailoverEngine<T: PathTransport> {
    registry: Arc<Registry>,
    transport: Arc<T>,
    pool: Arc<ShadowPool>,
    config: MpathConfig,
}

impl<T: PathTransport> Clone for FailoverEngine<T> {
    fn clone(&self) -> Self {
        Self {
            registry: self.registry.clone(),
            transport: self.transport.clone(),
            pool: self.pool.clone(),
            config: self.config.clone(),
        }
    }
}

/// What the member scan decided under the lock.
enum ScanDecision {
    /// Demoted `active`; promote `standby`.
    Promote(Arc<Namespace>),
    /// Promote `standby`; there was no active member left to demote.
    PromoteWithoutDemote(Arc<Namespace>),
    /// The standby was demoted too recently; retry after the backoff.
    RateLimited,
    /// Nothing to do or nothing promotable.
    None {
        /// Whether any member still classifies as active.
        have_active: bool,
    },
}

impl<T: PathTransport> FailoverEngine<T> {
    /// Creates a failover engine over the shared registry, transport, and
    /// shadow pool.
    pub fn new(
        registry: Arc<Registry>,
        transport: Arc<T>,
        pool: Arc<ShadowPool>,
        config: MpathConfig,
    ) -> Self {
        Self {
            registry,
            transport,
            pool,
            config,
        }
    }

    /// Resolves the logical volume a controller's namespaces belong to.
    fn volume_of(&self, ctrl: &Arc<Controller>) -> Option<Arc<LogicalVolume>> {
        let ns = ctrl.namespaces().into_iter().next()?;
        self.registry.volume(ns.guid()).ok()
    }

    /// Entry point for all failover triggers: terminal I/O error on the
    /// active path, removal of the active namespace, or loss of the active
    /// controller. Idempotent while a failover is already in flight.
    pub fn trigger_failover(&self, ctrl: &Arc<Controller>) {
        // Not part of a multipath group: nothing to do.
        if !ctrl.is_aggregate() && ctrl.aggregate().is_none() {
            return;
        }
        let Some(volume) = self.volume_of(ctrl) else {
            debug!("{}: no multipath volume resolved", ctrl.id());
            return;
        };

        if !ctrl.is_aggregate() && volume.settled() {
            // A settled group only fails over when this controller still
            // carries the active path.
            let carries_active = ctrl.namespaces().iter().any(|ns| ns.is_active());
            if !carries_active {
                debug!(
                    "{}: no failover, controller holds no active path of volume {}",
                    ctrl.id(),
                    volume.guid()
                );
                return;
            }
        }

        if !volume.root_ns().begin_failover() {
            debug!("volume {}: failover already in progress", volume.guid());
            return;
        }

        if !volume.settled() {
            // The previous failover never confirmed; skip selection and
            // promote whatever live standby exists.
            self.promote_any_live_standby(&volume, ctrl);
            return;
        }

        match self.scan_members(&volume) {
            ScanDecision::Promote(standby) | ScanDecision::PromoteWithoutDemote(standby) => {
                self.spawn_promotion(standby, volume, ctrl.clone());
            }
            ScanDecision::RateLimited => {
                warn!(
                    "volume {}: failover rejected, below minimum interval between \
                     failovers on the same paths",
                    volume.guid()
                );
                volume.root_ns().end_failover();
                self.schedule_retrigger(ctrl.clone(), volume.guid());
            }
            ScanDecision::None { have_active } => {
                volume.root_ns().end_failover();
                if !have_active && self.registry.find_active(&volume).is_none() {
                    // Total path loss: no active member and nothing
                    // promotable. Parked I/O cannot make progress.
                    warn!(
                        "volume {}: no active or promotable member, failing parked I/O",
                        volume.guid()
                    );
                    cancel_parked(&self.pool, &volume);
                }
            }
        }
    }

    /// Scans the member list under the lock, demoting the current active
    /// member when a promotion will follow.
    fn scan_members(&self, volume: &LogicalVolume) -> ScanDecision {
        volume.with_members(|members| {
            let active = members.iter().find(|ns| ns.is_active()).cloned();
            let standby = members
                .iter()
                .find(|ns| {
                    !ns.is_active()
                        && !ns.is_removing()
                        && !ns.is_dead()
                        && ns
                            .controller()
                            .map(|c| c.state() == CtrlState::Live)
                            .unwrap_or(false)
                })
                .cloned();

            match (active, standby) {
                (Some(active), Some(standby)) => {
                    if Arc::ptr_eq(&active, &standby) {
                        return ScanDecision::None { have_active: true };
                    }
                    if let Some(last) = standby.last_failover() {
                        if last.elapsed() < self.config.min_failover_interval {
                            return ScanDecision::RateLimited;
                        }
                    }
                    volume.set_settled(false);
                    active.set_active(false);
                    active.stamp_failover();
                    ScanDecision::Promote(standby)
                }
                (None, Some(standby)) => {
                    // The active member is already gone (removal or a prior
                    // demotion); promotion proceeds without a demote and
                    // without the rate-limit guard.
                    volume.set_settled(false);
                    ScanDecision::PromoteWithoutDemote(standby)
                }
                (active, None) => ScanDecision::None {
                    have_active: active.is_some(),
                },
            }
        })
    }

    /// Unsettled-volume path: find any live standby and promote it,
    /// bypassing the rate limit. Called with the failover flag held.
    fn promote_any_live_standby(&self, volume: &Arc<LogicalVolume>, ctrl: &Arc<Controller>) {
        let candidate = volume.with_members(|members| {
            members
                .iter()
                .find(|ns| {
                    !ns.is_active()
                        && !ns.is_removing()
                        && !ns.is_dead()
                        && ns
                            .controller()
                            .map(|c| c.state() == CtrlState::Live)
                            .unwrap_or(false)
                })
                .cloned()
        });

        match candidate {
            Some(standby) => {
                info!(
                    "volume {}: unsettled, promoting {}",
                    volume.guid(),
                    standby.path_id()
                );
                self.spawn_promotion(standby, volume.clone(), ctrl.clone());
            }
            None => {
                volume.root_ns().end_failover();
                if self.registry.find_active(volume).is_none() {
                    warn!(
                        "volume {}: unsettled with no live standby, failing parked I/O",
                        volume.guid()
                    );
                    cancel_parked(&self.pool, volume);
                }
            }
        }
    }

    /// Issues the asynchronous promotion command with a bounded retry
    /// count. Success marks the standby active and the volume settled;
    /// failure reschedules the whole trigger after the backoff.
    fn spawn_promotion(
        &self,
        standby: Arc<Namespace>,
        volume: Arc<LogicalVolume>,
        retrigger: Arc<Controller>,
    ) {
        let engine = self.clone();
        tokio::spawn(async move {
            let path = standby.path_id();
            info!("volume {}: set active ns {}", volume.guid(), path);

            let mut promoted = false;
            for attempt in 0..=engine.config.promotion_retries {
                let status = engine.transport.set_active(path).await;
                if status.is_success() {
                    promoted = true;
                    break;
                }
                warn!(
                    "volume {}: set active ns {} failed with {} (attempt {})",
                    volume.guid(),
                    path,
                    status,
                    attempt + 1
                );
            }

            if promoted {
                volume.with_members(|_| standby.set_active(true));
                volume.set_settled(true);
                volume.root_ns().end_failover();
                info!("volume {}: {} is now the active path", volume.guid(), path);
            } else {
                warn!(
                    "volume {}: failed to set active ns {}",
                    volume.guid(),
                    path
                );
                volume.root_ns().end_failover();
                engine.schedule_retrigger(retrigger, volume.guid());
            }
        });
    }

    /// Re-runs `trigger_failover` for the controller after the configured
    /// backoff.
    fn schedule_retrigger(&self, ctrl: Arc<Controller>, guid: uuid::Uuid) {
        let engine = self.clone();
        let delay = self.config.failover_retry_delay;
        debug!("volume {}: failover retry scheduled in {:?}", guid, delay);
        tokio::spawn(async move {
            sleep(delay).await;
            engine.trigger_failover(&ctrl);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::status::CommandStatus;
    use crate::transport::{MockPathTransport, PathBehavior};
    use std::time::Duration;
    use uuid::Uuid;

    struct Harness {
        registry: Arc<Registry>,
        transport: Arc<MockPathTransport>,
        engine: FailoverEngine<MockPathTransport>,
    }

    fn harness(config: MpathConfig) -> Harness {
        let registry = Arc::new(Registry::new());
        let transport = Arc::new(MockPathTransport::new());
        let pool = Arc::new(ShadowPool::new(config.shadow_pool_capacity));
        let engine = FailoverEngine::new(registry.clone(), transport.clone(), pool, config);
        Harness {
            registry,
            transport,
            engine,
        }
    }

    fn fast_config() -> MpathConfig {
        MpathConfig {
            min_failover_interval: Duration::from_millis(200),
            failover_retry_delay: Duration::from_millis(20),
            ..Default::default()
        }
    }

    struct TwoPath {
        guid: Uuid,
        ctrl_a: Arc<Controller>,
        ctrl_b: Arc<Controller>,
        ns_a: Arc<Namespace>,
        ns_b: Arc<Namespace>,
        volume: Arc<LogicalVolume>,
    }

    fn two_path(h: &Harness) -> TwoPath {
        let guid = Uuid::new_v4();
        let ctrl_a = h.registry.register_controller(Duration::from_secs(5));
        let ctrl_b = h.registry.register_controller(Duration::from_secs(5));
        assert!(ctrl_a.change_state(CtrlState::Live));
        assert!(ctrl_b.change_state(CtrlState::Live));
        let (ns_a, volume) = h.registry.attach_namespace(&ctrl_a, 1, guid);
        let (ns_b, _) = h.registry.attach_namespace(&ctrl_b, 1, guid);
        TwoPath {
            guid,
            ctrl_a,
            ctrl_b,
            ns_a,
            ns_b,
            volume,
        }
    }

    async fn settle(volume: &LogicalVolume) {
        for _ in 0..100 {
            if volume.settled() && !volume.failover_in_progress() {
                return;
            }
            sleep(Duration::from_millis(5)).await;
        }
        panic!("failover never settled");
    }

    #[tokio::test]
    async fn test_failover_promotes_standby() {
        let h = harness(fast_config());
        let tp = two_path(&h);

        h.engine.trigger_failover(&tp.ctrl_a);
        settle(&tp.volume).await;

        assert!(!tp.ns_a.is_active());
        assert!(tp.ns_b.is_active());
        assert_eq!(h.transport.promotion_count(tp.ns_b.path_id()), 1);
        assert_eq!(h.registry.active_path(tp.guid).unwrap(), tp.ns_b.path_id());
    }

    #[tokio::test]
    async fn test_failover_noop_without_multipath_group() {
        let h = harness(fast_config());
        let lone = h.registry.register_controller(Duration::from_secs(5));
        assert!(lone.change_state(CtrlState::Live));

        // No namespaces, no aggregate: must be a silent no-op.
        h.engine.trigger_failover(&lone);
        sleep(Duration::from_millis(20)).await;
        assert!(h.registry.volumes().is_empty());
    }

    #[tokio::test]
    async fn test_failover_noop_for_standby_controller() {
        let h = harness(fast_config());
        let tp = two_path(&h);

        // ctrl_b holds the standby; a settled volume ignores its failures.
        h.engine.trigger_failover(&tp.ctrl_b);
        sleep(Duration::from_millis(30)).await;

        assert!(tp.ns_a.is_active());
        assert!(!tp.ns_b.is_active());
        assert_eq!(h.transport.promotion_count(tp.ns_b.path_id()), 0);
    }

    #[tokio::test]
    async fn test_in_progress_flag_is_mutual_exclusion() {
        let h = harness(fast_config());
        let tp = two_path(&h);

        assert!(tp.volume.root_ns().begin_failover());
        // A concurrent trigger must return without touching anything.
        h.engine.trigger_failover(&tp.ctrl_a);
        sleep(Duration::from_millis(30)).await;
        assert!(tp.ns_a.is_active());
        assert_eq!(h.transport.promotion_count(tp.ns_b.path_id()), 0);
        tp.volume.root_ns().end_failover();
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_quick_second_failover() {
        let h = harness(MpathConfig {
            min_failover_interval: Duration::from_secs(60),
            failover_retry_delay: Duration::from_millis(10),
            ..Default::default()
        });
        let tp = two_path(&h);

        h.engine.trigger_failover(&tp.ctrl_a);
        settle(&tp.volume).await;
        assert!(tp.ns_b.is_active());

        // Second failover within the window: ns_a was demoted moments ago.
        h.engine.trigger_failover(&tp.ctrl_b);
        sleep(Duration::from_millis(50)).await;

        // Active path unchanged in between.
        assert!(tp.ns_b.is_active());
        assert!(!tp.ns_a.is_active());
        assert_eq!(h.transport.promotion_count(tp.ns_a.path_id()), 0);
        assert!(!tp.volume.failover_in_progress());
    }

    #[tokio::test]
    async fn test_rate_limited_failover_executes_after_window() {
        let h = harness(MpathConfig {
            min_failover_interval: Duration::from_millis(80),
            failover_retry_delay: Duration::from_millis(20),
            ..Default::default()
        });
        let tp = two_path(&h);

        h.engine.trigger_failover(&tp.ctrl_a);
        settle(&tp.volume).await;
        assert!(tp.ns_b.is_active());

        // Rejected now, but the scheduled retry fires once the window
        // elapses and promotes ns_a back.
        h.engine.trigger_failover(&tp.ctrl_b);
        sleep(Duration::from_millis(250)).await;

        assert!(tp.ns_a.is_active());
        assert!(!tp.ns_b.is_active());
    }

    #[tokio::test]
    async fn test_promotion_retries_then_succeeds() {
        let h = harness(fast_config());
        let tp = two_path(&h);
        h.transport.script_promotion(
            tp.ns_b.path_id(),
            PathBehavior::FailTimes(2, CommandStatus::NS_NOT_READY),
        );

        h.engine.trigger_failover(&tp.ctrl_a);
        settle(&tp.volume).await;

        assert!(tp.ns_b.is_active());
        assert_eq!(h.transport.promotion_count(tp.ns_b.path_id()), 3);
    }

    #[tokio::test]
    async fn test_promotion_failure_reschedules() {
        let h = harness(MpathConfig {
            promotion_retries: 1,
            failover_retry_delay: Duration::from_millis(20),
            min_failover_interval: Duration::from_millis(1),
            ..Default::default()
        });
        let tp = two_path(&h);

        // Exhaust the first promotion round against ns_b. The rescheduled
        // trigger runs the unsettled path, which promotes the first live
        // non-active member in list order: the just-demoted ns_a comes
        // back as the active path.
        h.transport.script_promotion(
            tp.ns_b.path_id(),
            PathBehavior::FailTimes(2, CommandStatus::NS_NOT_READY),
        );

        h.engine.trigger_failover(&tp.ctrl_a);
        sleep(Duration::from_millis(150)).await;
        settle(&tp.volume).await;

        assert!(tp.ns_a.is_active());
        assert!(!tp.ns_b.is_active());
        assert_eq!(h.transport.promotion_count(tp.ns_b.path_id()), 2);
        assert!(h.transport.promotion_count(tp.ns_a.path_id()) >= 1);
    }

    #[tokio::test]
    async fn test_promotion_failure_retries_standby_when_peer_down() {
        let h = harness(MpathConfig {
            promotion_retries: 1,
            failover_retry_delay: Duration::from_millis(20),
            min_failover_interval: Duration::from_millis(1),
            ..Default::default()
        });
        let tp = two_path(&h);
        // ctrl_a is down, so the demoted ns_a is never a candidate again
        // and the rescheduled trigger keeps hammering ns_b until the
        // promotion goes through.
        assert!(tp.ctrl_a.change_state(CtrlState::Resetting));
        h.transport.script_promotion(
            tp.ns_b.path_id(),
            PathBehavior::FailTimes(2, CommandStatus::NS_NOT_READY),
        );

        h.engine.trigger_failover(&tp.ctrl_a);
        sleep(Duration::from_millis(150)).await;
        settle(&tp.volume).await;

        assert!(tp.ns_b.is_active());
        assert!(!tp.ns_a.is_active());
        assert!(h.transport.promotion_count(tp.ns_b.path_id()) >= 3);
    }

    #[tokio::test]
    async fn test_no_standby_when_peer_controller_down() {
        let h = harness(fast_config());
        let tp = two_path(&h);
        assert!(tp.ctrl_b.change_state(CtrlState::Resetting));

        h.engine.trigger_failover(&tp.ctrl_a);
        sleep(Duration::from_millis(30)).await;

        // Nothing promotable; the flag must not leak.
        assert!(!tp.volume.failover_in_progress());
        assert!(tp.ns_a.is_active());
        assert_eq!(h.transport.promotion_count(tp.ns_b.path_id()), 0);
    }

    #[tokio::test]
    async fn test_single_active_invariant_through_failover() {
        let h = harness(fast_config());
        let tp = two_path(&h);

        for _ in 0..3 {
            let actives = tp
                .volume
                .members()
                .iter()
                .filter(|ns| ns.is_active())
                .count();
            assert!(actives <= 1);
            sleep(Duration::from_millis(10)).await;
        }

        h.engine.trigger_failover(&tp.ctrl_a);
        settle(&tp.volume).await;

        let actives = tp
            .volume
            .members()
            .iter()
            .filter(|ns| ns.is_active())
            .count();
        assert_eq!(actives, 1);
    }
}
