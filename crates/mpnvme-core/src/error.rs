//! Error types for the multipath driver core.

use thiserror::Error;
use uuid::Uuid;

use crate::controller::CtrlState;

/// Result type alias for multipath core operations.
pub type MpathResult<T> = Result<T, MpathError>;

/// Error variants for multipath core operations.
#[derive(Debug, Error)]
pub enum MpathError {
    /// A controller state transition not present in the transition table.
    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        /// State the controller was in.
        from: CtrlState,
        /// State that was requested.
        to: CtrlState,
    },

    /// No controller registered under the given instance id.
    #[error("Controller nvme{0} not found")]
    ControllerNotFound(u32),

    /// No logical volume registered under the given guid.
    #[error("Logical volume {0} not found")]
    VolumeNotFound(Uuid),

    /// No member of the volume currently classifies as ACTIVE. This is a
    /// normal condition during failover windows, surfaced as an error only
    /// by admin queries.
    ///
    /// Data-path conditions (pool exhaustion, dying controllers, a
    /// failover in flight) are not errors here: they reach the submitter
    /// through the completion callback's outcome instead.
    #[error("No active path for volume {0}")]
    NoActivePath(Uuid),
}
