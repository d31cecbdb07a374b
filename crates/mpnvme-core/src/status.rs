//! Protocol status codes and their generic outcome classes.
//!
//! The wire encoding of commands lives below the transport boundary; this
//! module only carries the completion status word and the mapping from
//! protocol status to the outcome the block front end sees.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Completion status word returned by a path endpoint.
///
/// Bit 14 is the do-not-retry bit; the low 11 bits carry the status code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandStatus(pub u16);

impl CommandStatus {
    /// Command completed successfully.
    pub const SUCCESS: CommandStatus = CommandStatus(0x0000);
    /// Command was aborted.
    pub const ABORT_REQ: CommandStatus = CommandStatus(0x0007);
    /// Capacity exceeded.
    pub const CAP_EXCEEDED: CommandStatus = CommandStatus(0x0081);
    /// Namespace is not ready to accept commands.
    pub const NS_NOT_READY: CommandStatus = CommandStatus(0x0082);
    /// Optional command not supported by this controller.
    pub const ONCS_NOT_SUPPORTED: CommandStatus = CommandStatus(0x0182);
    /// Media write fault.
    pub const WRITE_FAULT: CommandStatus = CommandStatus(0x0280);
    /// Unrecovered read error.
    pub const READ_ERROR: CommandStatus = CommandStatus(0x0281);
    /// Read of a deallocated or unwritten block.
    pub const UNWRITTEN_BLOCK: CommandStatus = CommandStatus(0x0287);

    /// Do-not-retry bit.
    pub const DNR: u16 = 0x4000;

    /// Mask selecting the status-code field.
    pub const CODE_MASK: u16 = 0x07ff;

    /// Returns the status-code field without generic command status bits.
    #[inline]
    pub fn code(self) -> u16 {
        self.0 & Self::CODE_MASK
    }

    /// Returns true when the command completed successfully.
    #[inline]
    pub fn is_success(self) -> bool {
        self.code() == 0
    }

    /// Returns true when the do-not-retry bit is set.
    #[inline]
    pub fn do_not_retry(self) -> bool {
        self.0 & Self::DNR != 0
    }

    /// Returns a copy of this status with the do-not-retry bit set.
    #[inline]
    pub fn with_dnr(self) -> CommandStatus {
        CommandStatus(self.0 | Self::DNR)
    }

    /// Maps the protocol status to the outcome class the caller observes.
    pub fn outcome(self) -> IoOutcome {
        match CommandStatus(self.code()) {
            Self::SUCCESS => IoOutcome::Success,
            Self::CAP_EXCEEDED => IoOutcome::NoSpace,
            Self::ONCS_NOT_SUPPORTED => IoOutcome::NotSupported,
            Self::WRITE_FAULT | Self::READ_ERROR | Self::UNWRITTEN_BLOCK => IoOutcome::MediumError,
            Self::ABORT_REQ => IoOutcome::Aborted,
            _ => IoOutcome::IoError,
        }
    }
}

impl fmt::Display for CommandStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#06x}", self.0)
    }
}

/// Generic outcome class for a terminally completed I/O.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoOutcome {
    /// The I/O completed successfully.
    Success,
    /// The device has no capacity for the write.
    NoSpace,
    /// The operation is not supported by the path.
    NotSupported,
    /// Unrecoverable media error.
    MediumError,
    /// Generic I/O failure, including total path loss.
    IoError,
    /// The command was aborted, typically during controller teardown.
    Aborted,
}

impl IoOutcome {
    /// Returns true for the success outcome.
    #[inline]
    pub fn is_success(self) -> bool {
        matches!(self, IoOutcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_mapping() {
        assert_eq!(CommandStatus::SUCCESS.outcome(), IoOutcome::Success);
        assert!(CommandStatus::SUCCESS.is_success());
    }

    #[test]
    fn test_outcome_classes() {
        assert_eq!(CommandStatus::CAP_EXCEEDED.outcome(), IoOutcome::NoSpace);
        assert_eq!(
            CommandStatus::ONCS_NOT_SUPPORTED.outcome(),
            IoOutcome::NotSupported
        );
        assert_eq!(CommandStatus::WRITE_FAULT.outcome(), IoOutcome::MediumError);
        assert_eq!(CommandStatus::READ_ERROR.outcome(), IoOutcome::MediumError);
        assert_eq!(
            CommandStatus::UNWRITTEN_BLOCK.outcome(),
            IoOutcome::MediumError
        );
        assert_eq!(CommandStatus::ABORT_REQ.outcome(), IoOutcome::Aborted);
        assert_eq!(CommandStatus::NS_NOT_READY.outcome(), IoOutcome::IoError);
    }

    #[test]
    fn test_dnr_bit() {
        let status = CommandStatus::READ_ERROR.with_dnr();
        assert!(status.do_not_retry());
        assert_eq!(status.code(), CommandStatus::READ_ERROR.0);
        // DNR does not change the outcome class.
        assert_eq!(status.outcome(), IoOutcome::MediumError);
    }

    #[test]
    fn test_dnr_clear_by_default() {
        assert!(!CommandStatus::READ_ERROR.do_not_retry());
        assert!(!CommandStatus::SUCCESS.do_not_retry());
    }

    #[test]
    fn test_display() {
        assert_eq!(format!("{}", CommandStatus::ABORT_REQ), "0x0007");
    }
}
