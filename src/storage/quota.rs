//! Quota Ledger
//!
//! Byte budget shared by every object of one store. Allocation is a single
//! compare-and-swap, so concurrent writers can never jointly overshoot the
//! ceiling and a rejected allocation leaves the counter untouched.

use std::sync::atomic::{AtomicU64, Ordering};

use prometheus::IntGauge;

use crate::error::{Error, Result};
use crate::metrics;

/// Atomic committed-bytes counter bounded by a ceiling
#[derive(Debug)]
pub struct QuotaLedger {
    max: u64,
    current: AtomicU64,
    /// Mirrors `current`; moved by deltas so concurrent updates commute
    used_gauge: IntGauge,
}

impl QuotaLedger {
    /// Create an empty ledger
    pub fn new(max: u64) -> Self {
        Self::with_usage(max, 0)
    }

    /// Create a ledger that already accounts for `used` bytes.
    ///
    /// The caller validates `used <= max`.
    pub fn with_usage(max: u64, used: u64) -> Self {
        metrics::STORAGE_MAX_BYTES.set(max as i64);
        Self::with_gauge(max, used, metrics::STORAGE_USED_BYTES.clone())
    }

    pub(crate) fn with_gauge(max: u64, used: u64, used_gauge: IntGauge) -> Self {
        used_gauge.set(used as i64);
        Self {
            max,
            current: AtomicU64::new(used),
            used_gauge,
        }
    }

    /// Reserve `size` bytes, or fail without side effects
    pub fn allocate(&self, size: u64) -> Result<()> {
        let max = self.max;
        match self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current.checked_add(size).filter(|next| *next <= max)
            }) {
            Ok(_) => {
                self.used_gauge.add(size as i64);
                Ok(())
            }
            Err(current) => Err(Error::QuotaExceeded {
                requested: size,
                available: max.saturating_sub(current),
            }),
        }
    }

    /// Return `size` bytes to the budget.
    ///
    /// Releasing more than was allocated is a caller bug; the counter
    /// saturates at zero instead of wrapping.
    pub fn release(&self, size: u64) {
        if size == 0 {
            return;
        }
        let previous = self
            .current
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                Some(current.saturating_sub(size))
            })
            .unwrap_or_else(|current| current);
        self.used_gauge.sub(previous.min(size) as i64);
    }

    /// Remaining capacity, or `QuotaExceeded` when nothing is left.
    ///
    /// Nothing is reserved; the caller allocates what it actually uses.
    pub fn allocate_all(&self) -> Result<u64> {
        match self.available() {
            0 => Err(Error::QuotaExceeded {
                requested: 1,
                available: 0,
            }),
            n => Ok(n),
        }
    }

    /// Check that `size` more bytes would currently fit, without reserving them
    pub fn has_capacity(&self, size: u64) -> Result<()> {
        let available = self.available();
        if size > available {
            return Err(Error::QuotaExceeded {
                requested: size,
                available,
            });
        }
        Ok(())
    }

    /// Bytes currently committed
    pub fn current(&self) -> u64 {
        self.current.load(Ordering::Acquire)
    }

    /// Ceiling in bytes
    pub fn max(&self) -> u64 {
        self.max
    }

    /// Bytes still available
    pub fn available(&self) -> u64 {
        self.max.saturating_sub(self.current())
    }
}

// =============================================================================
// Tests
// =============================================================================
