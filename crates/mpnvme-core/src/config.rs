//! Configuration for the multipath driver core.
//!
//! Defaults mirror the module parameters of the driver this core models:
//! five command retries, a 30 second I/O timeout, a 60 second minimum
//! interval between failovers on the same path pair, and a once-per-second
//! congestion drain.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Tunable parameters consumed by the pipeline, failover engine, and
/// congestion subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MpathConfig {
    /// Maximum number of times the command pipeline retries a single command.
    pub max_retries: u32,
    /// Per-request I/O timeout. A command is not retried once this much time
    /// has elapsed since its first submission.
    pub io_timeout: Duration,
    /// Minimum interval between promoting the same standby path again.
    /// Guards against failover flapping between two misbehaving paths.
    pub min_failover_interval: Duration,
    /// Keep-alive command period for each live controller.
    pub keep_alive_interval: Duration,
    /// Delay before a rejected or failed failover attempt is retried.
    pub failover_retry_delay: Duration,
    /// Period of the congestion-queue drain task.
    pub drain_interval: Duration,
    /// Retry budget for an individual parked I/O redirected across paths.
    /// Independent of `max_retries`, which governs a single command.
    pub mpath_io_retries: u32,
    /// Retry budget for the promotion admin command itself.
    pub promotion_retries: u32,
    /// Number of pre-allocated shadow-record slots. Bounds the worst-case
    /// concurrent parked I/O; acquisition never blocks.
    pub shadow_pool_capacity: usize,
}

impl Default for MpathConfig {
    fn default() -> Self {
        Self {
            max_retries: 5,
            io_timeout: Duration::from_secs(30),
            min_failover_interval: Duration::from_secs(60),
            keep_alive_interval: Duration::from_secs(5),
            failover_retry_delay: Duration::from_secs(1),
            drain_interval: Duration::from_secs(1),
            mpath_io_retries: 3,
            promotion_retries: 3,
            shadow_pool_capacity: 256,
        }
    }
}
