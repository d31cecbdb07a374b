//! Generic I/O requests and the transport-level commands built from them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::status::IoOutcome;

/// Type of I/O operation accepted by the block front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoOp {
    /// Read a block range.
    Read,
    /// Write a block range.
    Write,
    /// Flush volatile write cache.
    Flush,
    /// Discard/deallocate a block range.
    Discard,
}

/// A generic I/O request as handed in by the block front end.
#[derive(Debug, Clone)]
pub struct IoRequest {
    /// Type of operation.
    pub op: IoOp,
    /// Starting logical block address.
    pub lba: u64,
    /// Number of logical blocks covered.
    pub num_blocks: u32,
    /// Payload for writes; `None` for reads, flushes, and discards.
    pub data: Option<Vec<u8>>,
    /// When set, the pipeline never retries this request.
    pub no_retry: bool,
}

impl IoRequest {
    /// Creates a read request for the given block range.
    pub fn read(lba: u64, num_blocks: u32) -> Self {
        Self {
            op: IoOp::Read,
            lba,
            num_blocks,
            data: None,
            no_retry: false,
        }
    }

    /// Creates a write request carrying the given payload.
    pub fn write(lba: u64, num_blocks: u32, data: Vec<u8>) -> Self {
        Self {
            op: IoOp::Write,
            lba,
            num_blocks,
            data: Some(data),
            no_retry: false,
        }
    }

    /// Creates a flush request.
    pub fn flush() -> Self {
        Self {
            op: IoOp::Flush,
            lba: 0,
            num_blocks: 0,
            data: None,
            no_retry: false,
        }
    }

    /// Creates a discard request for the given block range.
    pub fn discard(lba: u64, num_blocks: u32) -> Self {
        Self {
            op: IoOp::Discard,
            lba,
            num_blocks,
            data: None,
            no_retry: false,
        }
    }

    /// Marks the request as not eligible for retry.
    pub fn with_no_retry(mut self) -> Self {
        self.no_retry = true;
        self
    }
}

/// Monotonically-unique command identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub u64);

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cmd{}", self.0)
    }
}

/// Atomic generator for unique command identifiers.
#[derive(Debug)]
pub struct CommandIdGen {
    next: AtomicU64,
}

impl CommandIdGen {
    /// Creates a generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Returns the next unique command id.
    pub fn next_id(&self) -> CommandId {
        CommandId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CommandIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Transport-level command built from a generic request. Retries resubmit
/// the same command unmodified, id included.
#[derive(Debug, Clone)]
pub struct IoCommand {
    /// Unique command id attached at build time.
    pub id: CommandId,
    /// Namespace id the command targets.
    pub nsid: u32,
    /// Operation carried by the command.
    pub op: IoOp,
    /// Starting logical block address.
    pub lba: u64,
    /// Number of logical blocks covered.
    pub num_blocks: u32,
    /// Write payload, if any.
    pub data: Option<Vec<u8>>,
}

impl IoCommand {
    /// Builds the transport command for a request targeting `nsid`.
    pub fn build(id: CommandId, nsid: u32, req: &IoRequest) -> Self {
        Self {
            id,
            nsid,
            op: req.op,
            lba: req.lba,
            num_blocks: req.num_blocks,
            data: req.data.clone(),
        }
    }
}

/// Completion callback invoked exactly once with the terminal outcome.
pub type IoDone = Box<dyn FnOnce(IoOutcome) + Send + 'static>;
