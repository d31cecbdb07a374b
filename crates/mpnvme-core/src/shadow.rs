//! Shadow records and their bounded pre-allocated pool.
//!
//! A shadow record saves everything needed to redirect or retry an in-flight
//! I/O across paths: the original request, the caller's completion callback,
//! the multipath retry budget, and where the I/O was last attempted. Records
//! live in a fixed-capacity slot arena; acquisition never blocks and
//! exhaustion degrades to a terminal I/O error for the affected request.

use std::time::Instant;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::request::{IoDone, IoRequest};
use crate::status::IoOutcome;
use crate::transport::PathId;

/// Handle to a shadow record parked in the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShadowId(usize);

/// Saved state for one in-flight I/O on a multipath volume.
pub struct ShadowRecord {
    /// The original request, resubmitted unmodified across paths.
    pub request: IoRequest,
    /// Remaining cross-path retry budget. Independent of the command
    /// pipeline's per-command budget.
    pub retries_left: u32,
    /// When the record was created.
    pub enqueued_at: Instant,
    /// The path the I/O was last attempted against, if any.
    pub attempted: Option<PathId>,
    done: Option<IoDone>,
}

impl ShadowRecord {
    /// Wraps a request and its completion callback.
    pub fn new(request: IoRequest, done: IoDone, retries: u32) -> Self {
        Self {
            request,
            retries_left: retries,
            enqueued_at: Instant::now(),
            attempted: None,
            done: Some(done),
        }
    }

    /// Terminally completes the I/O, invoking the caller's callback exactly
    /// once.
    pub fn complete(mut self, outcome: IoOutcome) {
        if let Some(done) = self.done.take() {
            done(outcome);
        }
    }
}

impl std::fmt::Debug for ShadowRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShadowRecord")
            .field("request", &self.request)
            .field("retries_left", &self.retries_left)
            .field("attempted", &self.attempted)
            .finish()
    }
}

/// Counters for the shadow pool.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ShadowPoolStats {
    /// Slots currently holding a record.
    pub in_use: usize,
    /// Highest number of slots ever in use at once.
    pub high_water: usize,
    /// Acquisitions rejected because no slot was free.
    pub exhaustions: u64,
}

struct PoolInner {
    slots: Vec<Option<ShadowRecord>>,
    free: Vec<usize>,
    stats: ShadowPoolStats,
}

/// Fixed-capacity arena of shadow records with non-blocking acquire and
/// explicit release.
pub struct ShadowPool {
    inner: Mutex<PoolInner>,
    capacity: usize,
}

impl ShadowPool {
    /// Pre-allocates a pool with `capacity` slots.
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            inner: Mutex::new(PoolInner {
                slots,
                free: (0..capacity).rev().collect(),
                stats: ShadowPoolStats::default(),
            }),
            capacity,
        }
    }

    /// Number of slots in the pool.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Stores a record, returning its handle. Never blocks; on exhaustion
    /// the record is handed back so the caller can fail the I/O terminally.
    pub fn insert(&self, record: ShadowRecord) -> Result<ShadowId, ShadowRecord> {
        let mut inner = self.inner.lock();
        match inner.free.pop() {
            Some(slot) => {
                inner.slots[slot] = Some(record);
                inner.stats.in_use += 1;
                if inner.stats.in_use > inner.stats.high_water {
                    inner.stats.high_water = inner.stats.in_use;
                }
                Ok(ShadowId(slot))
            }
            None => {
                inner.stats.exhaustions += 1;
                warn!("shadow pool exhausted ({} slots)", self.capacity);
                Err(record)
            }
        }
    }

    /// Runs `f` on the record held in `id`'s slot, returning whether the
    /// record was present.
    pub fn update(&self, id: ShadowId, f: impl FnOnce(&mut ShadowRecord)) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(id.0).and_then(Option::as_mut) {
            Some(record) => {
                f(record);
                true
            }
            None => false,
        }
    }

    /// Takes a record out of the pool, freeing its slot.
    pub fn take(&self, id: ShadowId) -> Option<ShadowRecord> {
        let mut inner = self.inner.lock();
        let record = inner.slots.get_mut(id.0)?.take()?;
        inner.free.push(id.0);
        inner.stats.in_use -= 1;
        Some(record)
    }

    /// Current pool counters.
    pub fn stats(&self) -> ShadowPoolStats {
        self.inner.lock().stats
    }
}
