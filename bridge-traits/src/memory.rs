//! Memory Sampling
//!
//! Abstracts the source of memory statistics (GPU allocator, unified memory,
//! process RSS) so the pressure monitor can be driven by real hardware or by
//! a scripted probe in tests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Point-in-time memory reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemorySnapshot {
    pub timestamp: DateTime<Utc>,
    /// Bytes currently held by live allocations.
    pub active_bytes: u64,
    /// Highest `active_bytes` seen by the source.
    pub peak_bytes: u64,
    /// Bytes held in reclaimable caches.
    pub cached_bytes: u64,
}

impl MemorySnapshot {
    /// Snapshot stamped with the current time.
    pub fn now(active_bytes: u64, peak_bytes: u64, cached_bytes: u64) -> Self {
        Self {
            timestamp: Utc::now(),
            active_bytes,
            peak_bytes,
            cached_bytes,
        }
    }
}

/// Source of memory statistics.
///
/// Calls are synchronous and expected to be cheap; the monitor invokes
/// [`snapshot`](MemoryProbe::snapshot) once per sampling tick.
pub trait MemoryProbe: Send + Sync {
    fn snapshot(&self) -> Result<MemorySnapshot>;

    /// Ask the backend to drop reclaimable caches.
    fn reclaim(&self) -> Result<()> {
        Ok(())
    }
}
