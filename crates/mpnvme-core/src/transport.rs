//! Transport boundary between the multipath core and the physical paths.
//!
//! Register I/O, command encoding, and fabric plumbing all live behind
//! [`PathTransport`]; the core only submits commands and observes completion
//! status words. [`MockPathTransport`] provides scripted per-path behavior
//! for tests.

use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::controller::CtrlId;
use crate::request::IoCommand;
use crate::status::CommandStatus;

/// Identifies one physical path: a namespace on a specific controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PathId {
    /// Controller instance owning the namespace.
    pub ctrl: CtrlId,
    /// Namespace id on that controller.
    pub nsid: u32,
}

impl fmt::Display for PathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "nvme{}n{}", self.ctrl.0, self.nsid)
    }
}

/// Capability consumed by the core to talk to one path endpoint.
///
/// Implementations can be a real fabric/PCIe transport or a mock for
/// testing. All futures must be `Send`; none of these calls may block the
/// submitting thread.
pub trait PathTransport: Send + Sync + 'static {
    /// Submits an I/O command on the given path and resolves with its
    /// completion status.
    fn submit(
        &self,
        path: PathId,
        cmd: IoCommand,
    ) -> impl std::future::Future<Output = CommandStatus> + Send;

    /// Issues the admin command that promotes the path's namespace to the
    /// active member of its group.
    fn set_active(
        &self,
        path: PathId,
    ) -> impl std::future::Future<Output = CommandStatus> + Send;

    /// Sends a keep-alive command to the controller.
    fn keep_alive(
        &self,
        ctrl: CtrlId,
    ) -> impl std::future::Future<Output = CommandStatus> + Send;
}

/// Scripted behavior for one path in the mock transport.
#[derive(Debug, Clone, Copy)]
pub enum PathBehavior {
    /// Every command succeeds.
    Succeed,
    /// The next N commands fail with the given status, then succeed.
    FailTimes(u32, CommandStatus),
    /// Every command fails with the given status.
    AlwaysFail(CommandStatus),
}

#[derive(Debug, Default)]
struct PathScript {
    behavior: Option<PathBehavior>,
    calls: u64,
}

impl PathScript {
    fn next_status(&mut self) -> CommandStatus {
        self.calls += 1;
        match self.behavior {
            None | Some(PathBehavior::Succeed) => CommandStatus::SUCCESS,
            Some(PathBehavior::FailTimes(ref mut n, status)) => {
                if *n > 0 {
                    *n -= 1;
                    status
                } else {
                    CommandStatus::SUCCESS
                }
            }
            Some(PathBehavior::AlwaysFail(status)) => status,
        }
    }
}

/// In-memory mock transport with scripted per-path behavior.
#[derive(Default)]
pub struct MockPathTransport {
    io: Mutex<HashMap<PathId, PathScript>>,
    promote: Mutex<HashMap<PathId, PathScript>>,
    ka: Mutex<HashMap<CtrlId, PathScript>>,
}

impl MockPathTransport {
    /// Creates a mock transport where every command succeeds.
    pub fn new() -> Self {
        Self::default()
    }

    /// Scripts I/O behavior for a path.
    pub fn script_io(&self, path: PathId, behavior: PathBehavior) {
        self.io.lock().entry(path).or_default().behavior = Some(behavior);
    }

    /// Scripts promotion (`set_active`) behavior for a path.
    pub fn script_promotion(&self, path: PathId, behavior: PathBehavior) {
        self.promote.lock().entry(path).or_default().behavior = Some(behavior);
    }

    /// Scripts keep-alive behavior for a controller.
    pub fn script_keep_alive(&self, ctrl: CtrlId, behavior: PathBehavior) {
        self.ka.lock().entry(ctrl).or_default().behavior = Some(behavior);
    }

    /// Number of I/O commands submitted on a path.
    pub fn io_count(&self, path: PathId) -> u64 {
        self.io.lock().get(&path).map(|s| s.calls).unwrap_or(0)
    }

    /// Number of promotion commands issued against a path.
    pub fn promotion_count(&self, path: PathId) -> u64 {
        self.promote.lock().get(&path).map(|s| s.calls).unwrap_or(0)
    }

    /// Number of keep-alive commands issued against a controller.
    pub fn keep_alive_count(&self, ctrl: CtrlId) -> u64 {
        self.ka.lock().get(&ctrl).map(|s| s.calls).unwrap_or(0)
    }
}

impl PathTransport for MockPathTransport {
    async fn submit(&self, path: PathId, cmd: IoCommand) -> CommandStatus {
        let status = self.io.lock().entry(path).or_default().next_status();
        debug!("mock submit {} on {} -> {}", cmd.id, path, status);
        status
    }

    async fn set_active(&self, path: PathId) -> CommandStatus {
        let status = self.promote.lock().entry(path).or_default().next_status();
        debug!("mock set_active on {} -> {}", path, status);
        status
    }

    async fn keep_alive(&self, ctrl: CtrlId) -> CommandStatus {
        self.ka.lock().entry(ctrl).or_default().next_status()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::request::{CommandId, IoCommand, IoRequest};

    fn cmd() -> IoCommand {
        IoCommand::build(CommandId(1), 1, &IoRequest::read(0, 1))
    }

    fn path(ctrl: u32, nsid: u32) -> PathId {
        PathId {
            ctrl: CtrlId(ctrl),
            nsid,
        }
    }

    #[tokio::test]
    async fn test_unscripted_path_succeeds() {
        let t = MockPathTransport::new();
        let status = t.submit(path(0, 1), cmd()).await;
        assert!(status.is_success());
        assert_eq!(t.io_count(path(0, 1)), 1);
    }

    #[tokio::test]
    async fn test_fail_times_then_succeed() {
        let t = MockPathTransport::new();
        t.script_io(path(0, 1), PathBehavior::FailTimes(2, CommandStatus::READ_ERROR));

        assert_eq!(t.submit(path(0, 1), cmd()).await, CommandStatus::READ_ERROR);
        assert_eq!(t.submit(path(0, 1), cmd()).await, CommandStatus::READ_ERROR);
        assert!(t.submit(path(0, 1), cmd()).await.is_success());
    }

    #[tokio::test]
    async fn test_always_fail() {
        let t = MockPathTransport::new();
        t.script_io(path(1, 1), PathBehavior::AlwaysFail(CommandStatus::WRITE_FAULT));
        for _ in 0..5 {
            assert_eq!(
                t.submit(path(1, 1), cmd()).await,
                CommandStatus::WRITE_FAULT
            );
        }
        assert_eq!(t.io_count(path(1, 1)), 5);
    }

    #[tokio::test]
    async fn test_promotion_script_independent_of_io() {
        let t = MockPathTransport::new();
        t.script_promotion(path(0, 1), PathBehavior::AlwaysFail(CommandStatus::ABORT_REQ));

        assert!(t.submit(path(0, 1), cmd()).await.is_success());
        assert_eq!(t.set_active(path(0, 1)).await, CommandStatus::ABORT_REQ);
        assert_eq!(t.promotion_count(path(0, 1)), 1);
    }

    #[tokio::test]
    async fn test_keep_alive_script() {
        let t = MockPathTransport::new();
        assert!(t.keep_alive(CtrlId(0)).await.is_success());
        t.script_keep_alive(CtrlId(0), PathBehavior::AlwaysFail(CommandStatus::ABORT_REQ));
        assert!(!t.keep_alive(CtrlId(0)).await.is_success());
    }

    #[test]
    fn test_path_id_display() {
        assert_eq!(format!("{}", path(2, 3)), "nvme2n3");
    }
}
