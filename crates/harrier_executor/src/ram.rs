//! Per-phase memory accounting.
//!
//! Every collect phase owns one `RamAccounting`; bytes buffered on behalf of
//! the phase are recorded against a limit and the total is reported when the
//! phase terminates. A breach returns a `Transient` error so the caller can
//! fail the query instead of the node.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use harrier_common::error::{HarrierError, HarrierResult};

pub struct RamAccounting {
    used: AtomicU64,
    /// 0 = unlimited.
    limit: u64,
    closed: AtomicBool,
}

impl RamAccounting {
    pub fn new(limit: u64) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicU64::new(0),
            limit,
            closed: AtomicBool::new(false),
        })
    }

    pub fn unlimited() -> Arc<Self> {
        Self::new(0)
    }

    /// Record an allocation. Returns an error when the phase budget is
    /// exceeded; the allocation is not counted in that case.
    pub fn record(&self, bytes: u64) -> HarrierResult<()> {
        let current = self.used.fetch_add(bytes, Ordering::Relaxed) + bytes;
        if self.limit > 0 && current > self.limit {
            self.used.fetch_sub(bytes, Ordering::Relaxed);
            return Err(HarrierError::MemoryPressure {
                used_bytes: current,
                limit_bytes: self.limit,
            });
        }
        Ok(())
    }

    pub fn release(&self, bytes: u64) {
        let current = self.used.load(Ordering::Relaxed);
        self.used.store(current.saturating_sub(bytes), Ordering::Relaxed);
    }

    /// Bytes currently accounted. Remains readable after `close` so the
    /// completion path can report what the phase used.
    pub fn total_bytes(&self) -> u64 {
        self.used.load(Ordering::Relaxed)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
