//! Command pipeline: build, submit, interpret completion, retry.
//!
//! A submitted request is retried locally until it exhausts its budget or
//! hits a do-not-retry status, then terminally completed with its mapped
//! outcome. Requests against a dying queue fail immediately with a
//! non-retryable abort.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, warn};

use crate::config::MpathConfig;
use crate::namespace::Namespace;
use crate::request::{CommandIdGen, IoCommand, IoRequest};
use crate::status::{CommandStatus, IoOutcome};
use crate::transport::PathTransport;

/// Terminal result of one pipeline submission.
#[derive(Debug, Clone, Copy)]
pub struct CompletedCommand {
    /// Outcome class the caller observes.
    pub outcome: IoOutcome,
    /// Last protocol status seen.
    pub status: CommandStatus,
    /// Retries spent before terminal completion.
    pub retries: u32,
}

impl CompletedCommand {
    fn abort() -> Self {
        Self {
            outcome: IoOutcome::Aborted,
            status: CommandStatus::ABORT_REQ.with_dnr(),
            retries: 0,
        }
    }

    /// Whether this completion must not be retried at any level: the
    /// request was aborted or the status carries the do-not-retry bit.
    pub fn aborted(&self) -> bool {
        self.outcome == IoOutcome::Aborted || self.status.do_not_retry()
    }
}

/// Builds transport commands from generic requests, dispatches them, and
/// owns the local retry decision.
pub struct CommandPipeline<T: PathTransport> {
    transport: Arc<T>,
    config: MpathConfig,
    ids: CommandIdGen,
}

impl<T: PathTransport> CommandPipeline<T> {
    /// Creates a pipeline dispatching through the given transport.
    pub fn new(transport: Arc<T>, config: MpathConfig) -> Self {
        Self {
            transport,
            config,
            ids: CommandIdGen::new(),
        }
    }

    /// Retry eligibility for one completion. A request is retried iff it is
    /// not marked no-retry, the status lacks the do-not-retry bit, the
    /// elapsed time since first attempt is under the I/O timeout, and the
    /// retry counter is below the configured maximum.
    fn needs_retry(
        &self,
        req: &IoRequest,
        status: CommandStatus,
        started: Instant,
        retries: u32,
    ) -> bool {
        if req.no_retry {
            return false;
        }
        if status.do_not_retry() {
            return false;
        }
        if started.elapsed() >= self.config.io_timeout {
            return false;
        }
        retries < self.config.max_retries
    }

    /// Whether the namespace's queue is dying: the namespace is being torn
    /// down or its controller no longer accepts work.
    fn queue_dying(ns: &Namespace) -> bool {
        if ns.is_dead() || ns.is_removing() {
            return true;
        }
        match ns.controller() {
            Some(ctrl) => ctrl.state().is_dying(),
            None => true,
        }
    }

    /// Submits a request on the given path and drives it to terminal
    /// completion. The same command, id included, is resubmitted unmodified
    /// on each retry; the caller observes exactly one terminal outcome.
    pub async fn submit(&self, ns: &Arc<Namespace>, req: &IoRequest) -> CompletedCommand {
        let cmd = IoCommand::build(self.ids.next_id(), ns.nsid(), req);
        let path = ns.path_id();
        let started = Instant::now();
        let mut retries = 0u32;

        loop {
            if Self::queue_dying(ns) {
                warn!("{}: queue dying, aborting {}", path, cmd.id);
                return CompletedCommand::abort();
            }

            let status = self.transport.submit(path, cmd.clone()).await;
            if status.is_success() {
                return CompletedCommand {
                    outcome: IoOutcome::Success,
                    status,
                    retries,
                };
            }

            if self.needs_retry(req, status, started, retries) {
                retries += 1;
                debug!("{}: {} status {}, retry {}", path, cmd.id, status, retries);
                continue;
            }

            let outcome = status.outcome();
            debug!(
                "{}: {} terminally completed {:?} after {} retries",
                path, cmd.id, outcome, retries
            );
            return CompletedCommand {
                outcome,
                status,
                retries,
            };
        }
    }
}
