//! A single zoned region and its sequential-append state machine.
//!
//! Mutating operations (`append`, `reset`, `finish`, `close`, lifetime
//! changes) require the caller to hold the zone's busy lease, acquired
//! with [`Zone::try_acquire`]. The lease is a plain CAS flag: a failed
//! acquire means "skip this zone", never "wait".

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use tracing::trace;
use zbdfs_backend::{ZoneBackend, ZoneInfo};
use zbdfs_error::{Result, ZbdError};
use zbdfs_types::{LifetimeHint, ZoneSnapshot};

use crate::device::Device;
use crate::metrics::QpsKind;

/// One zone of a zoned block device.
///
/// `start` and the device geometry are immutable; everything else is
/// interior-mutable and written only by the busy-lease holder. The busy
/// flag participates in release/acquire ordering, so a new lease holder
/// observes all writes made under the previous lease.
pub struct Zone {
    backend: Arc<dyn ZoneBackend>,
    start: u64,
    zone_size: u64,
    block_size: u32,

    wp: AtomicU64,
    capacity: AtomicU64,
    max_capacity: AtomicU64,
    used_capacity: AtomicU64,
    lifetime: AtomicU8,
    reset_count: AtomicU32,
    busy: AtomicBool,
}

impl std::fmt::Debug for Zone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Zone")
            .field("start", &self.start)
            .field("wp", &self.wp())
            .field("capacity", &self.capacity())
            .field("used_capacity", &self.used_capacity())
            .field("lifetime", &self.lifetime())
            .field("reset_count", &self.reset_count())
            .field("busy", &self.is_busy())
            .finish()
    }
}

impl Zone {
    /// Build a zone from one entry of the backend's zone report.
    pub(crate) fn from_info(backend: Arc<dyn ZoneBackend>, info: &ZoneInfo) -> Self {
        let zone_size = backend.zone_size();
        let block_size = backend.block_size();
        let capacity = if info.offline {
            0
        } else {
            info.max_capacity.saturating_sub(info.wp - info.start)
        };
        Self {
            backend,
            start: info.start,
            zone_size,
            block_size,
            wp: AtomicU64::new(info.wp),
            capacity: AtomicU64::new(capacity),
            max_capacity: AtomicU64::new(info.max_capacity),
            used_capacity: AtomicU64::new(0),
            lifetime: AtomicU8::new(LifetimeHint::NotSet.as_u8()),
            reset_count: AtomicU32::new(0),
            busy: AtomicBool::new(false),
        }
    }

    // ── Accessors ───────────────────────────────────────────────────────

    #[must_use]
    pub fn start(&self) -> u64 {
        self.start
    }

    #[must_use]
    pub fn wp(&self) -> u64 {
        self.wp.load(Ordering::Acquire)
    }

    /// Bytes remaining before the zone is full (0 if offline/finished).
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn max_capacity(&self) -> u64 {
        self.max_capacity.load(Ordering::Acquire)
    }

    /// Bytes currently live in this zone, as tracked by the file layer.
    #[must_use]
    pub fn used_capacity(&self) -> u64 {
        self.used_capacity.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn lifetime(&self) -> LifetimeHint {
        LifetimeHint::from_u8(self.lifetime.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn reset_count(&self) -> u32 {
        self.reset_count.load(Ordering::Acquire)
    }

    /// Overwrite the reset counter from a persisted wear snapshot.
    pub(crate) fn restore_reset_count(&self, count: u32) {
        self.reset_count.store(count, Ordering::Release);
    }

    /// Physical zone number.
    #[must_use]
    pub fn zone_nr(&self) -> u64 {
        self.start / self.zone_size
    }

    #[must_use]
    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.wp() == self.start
    }

    #[must_use]
    pub fn is_full(&self) -> bool {
        self.capacity() == 0
    }

    #[must_use]
    pub fn is_used(&self) -> bool {
        self.used_capacity() > 0
    }

    /// Whether `offset` falls inside this zone.
    #[must_use]
    pub fn contains(&self, offset: u64) -> bool {
        self.start <= offset && offset < self.start + self.zone_size
    }

    /// Bytes a reset of this zone would free.
    #[must_use]
    pub fn reclaimable_space(&self) -> u64 {
        if self.is_full() {
            self.max_capacity() - self.used_capacity()
        } else {
            self.wp() - self.start - self.used_capacity()
        }
    }

    /// Point-in-time record of the seven scalar fields.
    #[must_use]
    pub fn snapshot(&self) -> ZoneSnapshot {
        ZoneSnapshot {
            start: self.start,
            capacity: self.capacity(),
            max_capacity: self.max_capacity(),
            wp: self.wp(),
            lifetime: self.lifetime().as_u8(),
            used_capacity: self.used_capacity(),
            reset_count: self.reset_count(),
        }
    }

    // ── Busy lease ──────────────────────────────────────────────────────

    /// Try to take the exclusive short-term lease on this zone.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
    }

    /// Drop the busy lease.
    ///
    /// Releasing a lease that is not held is a programming invariant
    /// violation and surfaces as `Corruption`.
    pub fn check_release(&self) -> Result<()> {
        if self
            .busy
            .compare_exchange(true, false, Ordering::Release, Ordering::Relaxed)
            .is_err()
        {
            return Err(ZbdError::Corruption(format!(
                "failed to unset busy flag of zone {}",
                self.zone_nr()
            )));
        }
        Ok(())
    }

    /// Set the lifetime hint. Requires the busy lease.
    pub fn set_lifetime(&self, lifetime: LifetimeHint) {
        debug_assert!(self.is_busy());
        self.lifetime.store(lifetime.as_u8(), Ordering::Release);
    }

    // ── Live-byte accounting (driven by the file layer) ─────────────────

    /// Record `bytes` of this zone's contents becoming live.
    pub fn add_used_capacity(&self, bytes: u64) {
        self.used_capacity.fetch_add(bytes, Ordering::AcqRel);
    }

    /// Record `bytes` of this zone's contents turning to garbage.
    pub fn sub_used_capacity(&self, bytes: u64) {
        self.used_capacity.fetch_sub(bytes, Ordering::AcqRel);
    }

    // ── Mutations (require the busy lease) ──────────────────────────────

    /// Append `data` at the write pointer.
    ///
    /// `data` must be a multiple of the backend block size and fit in the
    /// remaining capacity; an oversized request fails with `NoSpace`
    /// before any byte is written. Partial backend writes are retried
    /// until the whole buffer is persisted.
    pub fn append(&self, dev: &Device, data: &[u8]) -> Result<()> {
        debug_assert!(self.is_busy());
        dev.qps().report(QpsKind::Write, 1);

        if data.is_empty() {
            return Ok(());
        }
        if data.len() as u64 > self.capacity() {
            return Err(ZbdError::NoSpace(format!(
                "not enough capacity for append of {} bytes to zone {}",
                data.len(),
                self.zone_nr()
            )));
        }
        if data.len() % self.block_size as usize != 0 {
            return Err(ZbdError::InvalidArgument(format!(
                "append size {} is not a multiple of the block size {}",
                data.len(),
                self.block_size
            )));
        }

        let mut left = data;
        while !left.is_empty() {
            let wp = self.wp.load(Ordering::Acquire);
            let written = self.backend.write(left, wp)?;
            self.wp.fetch_add(written as u64, Ordering::Release);
            self.capacity.fetch_sub(written as u64, Ordering::Release);
            dev.add_bytes_written(written as u64);
            left = &left[written..];
        }
        trace!(
            target: "zbdfs::zone",
            event = "append",
            zone = self.zone_nr(),
            bytes = data.len(),
            wp = self.wp()
        );
        Ok(())
    }

    /// Reset the zone to an empty writable state.
    ///
    /// Requires the busy lease and no live data. If the device takes the
    /// zone offline, capacity drops to 0 and the zone stays unusable.
    /// Every reset bumps the wear counters and re-evaluates the
    /// wear-leveling trigger.
    pub fn reset(&self, dev: &Device) -> Result<()> {
        debug_assert!(self.is_busy());
        debug_assert!(!self.is_used());

        let outcome = self.backend.reset(self.start)?;
        if outcome.offline {
            self.capacity.store(0, Ordering::Release);
        } else {
            self.max_capacity
                .store(outcome.max_capacity, Ordering::Release);
            self.capacity.store(outcome.max_capacity, Ordering::Release);
        }
        self.wp.store(self.start, Ordering::Release);
        self.lifetime
            .store(LifetimeHint::NotSet.as_u8(), Ordering::Release);
        self.reset_count.fetch_add(1, Ordering::AcqRel);

        trace!(
            target: "zbdfs::zone",
            event = "reset",
            zone = self.zone_nr(),
            offline = outcome.offline,
            reset_count = self.reset_count()
        );
        dev.note_zone_reset(self, outcome.offline);
        Ok(())
    }

    /// Finish the zone: no more writes until the next reset.
    pub fn finish(&self) -> Result<()> {
        debug_assert!(self.is_busy());

        self.backend.finish(self.start)?;
        self.capacity.store(0, Ordering::Release);
        self.wp.store(self.start + self.zone_size, Ordering::Release);
        trace!(target: "zbdfs::zone", event = "finish", zone = self.zone_nr());
        Ok(())
    }

    /// Close the zone on the device; a no-op for empty or full zones.
    pub fn close(&self) -> Result<()> {
        debug_assert!(self.is_busy());

        if !(self.is_empty() || self.is_full()) {
            self.backend.close(self.start)?;
        }
        Ok(())
    }
}
