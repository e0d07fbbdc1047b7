//! Device: owns all zones, the token accounting, the deferred error
//! latch and the wear/migration coordination state.

use std::io;
use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};
use zbdfs_backend::ZoneBackend;
use zbdfs_error::{Result, ZbdError};
use zbdfs_types::LifetimeHint;

use crate::config::DeviceConfig;
use crate::metrics::{QpsKind, QpsMeter};
use crate::wear::WearState;
use crate::zone::Zone;

/// Zones reserved out of the device's open/active budget: one for
/// metadata, one for migration.
pub(crate) const RESERVED_ZONES: i64 = 2;

/// A zoned block device with its zone set and resource accounting.
///
/// All shared state lives here, scoped to the device value; tests
/// construct fresh devices. Zones hold no back-pointer; operations that
/// need device-wide counters take `&Device`.
pub struct Device {
    pub(crate) backend: Arc<dyn ZoneBackend>,
    pub(crate) config: DeviceConfig,

    pub(crate) meta_zones: Vec<Arc<Zone>>,
    pub(crate) io_zones: Vec<Arc<Zone>>,

    pub(crate) max_open_io_zones: i64,
    pub(crate) max_active_io_zones: i64,
    pub(crate) open_io_zones: AtomicI64,
    pub(crate) active_io_zones: AtomicI64,
    /// Guards the token counters together with `zone_resources_cv`.
    zone_resources: Mutex<()>,
    zone_resources_cv: Condvar,

    /// True while a migration holds its target zone.
    pub(crate) migrating: Mutex<bool>,
    pub(crate) migrate_cv: Condvar,

    /// True while the wear-leveling worker has nothing to do.
    pub(crate) wl_worker_sleep: Mutex<bool>,
    pub(crate) wl_worker_cv: Condvar,

    pub(crate) wear: parking_lot::Mutex<WearState>,
    deferred: parking_lot::Mutex<Option<ZbdError>>,

    pub(crate) total_reset_count: AtomicU32,
    bytes_written: AtomicU64,
    qps: Arc<dyn QpsMeter>,
    pub(crate) start_time: Instant,
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("filename", &self.backend.filename())
            .field("nr_io_zones", &self.io_zones.len())
            .field("nr_meta_zones", &self.meta_zones.len())
            .field("open_io_zones", &self.open_io_zones.load(Ordering::Relaxed))
            .field(
                "active_io_zones",
                &self.active_io_zones.load(Ordering::Relaxed),
            )
            .finish_non_exhaustive()
    }
}

impl Device {
    /// Open the device and enumerate its zones.
    ///
    /// Write opens must be exclusive. The first `meta_zones` usable
    /// sequential-write-required zones are reserved for metadata; the
    /// rest become io zones. Io zones the device reports as open are
    /// closed to normalize state, and the open/active accounting starts
    /// from zero.
    pub fn open(
        backend: Arc<dyn ZoneBackend>,
        config: DeviceConfig,
        qps: Arc<dyn QpsMeter>,
        readonly: bool,
        exclusive: bool,
    ) -> Result<Self> {
        config.validate()?;
        if !readonly && !exclusive {
            return Err(ZbdError::InvalidArgument(
                "write opens must be exclusive".to_owned(),
            ));
        }

        let limits = backend.open(readonly, exclusive)?;
        let nr_zones = backend.nr_zones();
        if nr_zones < config.min_zones {
            return Err(ZbdError::NotSupported(format!(
                "too few zones on zoned backend ({} required, found {nr_zones})",
                config.min_zones
            )));
        }

        let max_active_io_zones = if limits.max_active == 0 {
            i64::from(nr_zones)
        } else {
            i64::from(limits.max_active) - RESERVED_ZONES
        };
        let max_open_io_zones = if limits.max_open == 0 {
            i64::from(nr_zones)
        } else {
            i64::from(limits.max_open) - RESERVED_ZONES
        };

        info!(
            target: "zbdfs::device",
            event = "device_open",
            filename = %backend.filename(),
            nr_zones,
            max_active = limits.max_active,
            max_open = limits.max_open
        );

        let report = backend.list_zones()?;
        if report.len() != nr_zones as usize {
            return Err(ZbdError::Io(io::Error::other("failed to list zones")));
        }

        let mut meta_zones = Vec::new();
        let mut io_zones = Vec::new();
        let mut meta_slots = 0_usize;
        let mut report_iter = report.iter();

        // The first `meta_zones` SWR slots are metadata territory; an
        // offline zone still consumes its slot.
        while meta_slots < config.meta_zones {
            let Some(zone_info) = report_iter.next() else {
                break;
            };
            if zone_info.swr {
                if !zone_info.offline {
                    meta_zones.push(Arc::new(Zone::from_info(Arc::clone(&backend), zone_info)));
                }
                meta_slots += 1;
            }
        }

        for zone_info in report_iter {
            if !zone_info.swr || zone_info.offline {
                continue;
            }
            let zone = Arc::new(Zone::from_info(Arc::clone(&backend), zone_info));
            if !zone.try_acquire() {
                return Err(ZbdError::Corruption(format!(
                    "failed to set busy flag of zone {}",
                    zone.zone_nr()
                )));
            }
            if zone_info.active && zone_info.open && !readonly {
                zone.close()?;
            }
            zone.check_release()?;
            io_zones.push(zone);
        }

        Ok(Self {
            backend,
            meta_zones,
            io_zones,
            max_open_io_zones,
            max_active_io_zones,
            open_io_zones: AtomicI64::new(0),
            active_io_zones: AtomicI64::new(0),
            zone_resources: Mutex::new(()),
            zone_resources_cv: Condvar::new(),
            migrating: Mutex::new(false),
            migrate_cv: Condvar::new(),
            wl_worker_sleep: Mutex::new(true),
            wl_worker_cv: Condvar::new(),
            wear: parking_lot::Mutex::new(WearState::new(config.reset_ratio_threshold)),
            deferred: parking_lot::Mutex::new(None),
            total_reset_count: AtomicU32::new(0),
            bytes_written: AtomicU64::new(0),
            qps,
            start_time: Instant::now(),
            config,
        })
    }

    // ── Geometry ────────────────────────────────────────────────────────

    #[must_use]
    pub fn block_size(&self) -> u32 {
        self.backend.block_size()
    }

    #[must_use]
    pub fn zone_size(&self) -> u64 {
        self.backend.zone_size()
    }

    #[must_use]
    pub fn nr_zones(&self) -> u32 {
        self.backend.nr_zones()
    }

    #[must_use]
    pub fn filename(&self) -> String {
        self.backend.filename()
    }

    #[must_use]
    pub fn meta_zones(&self) -> &[Arc<Zone>] {
        &self.meta_zones
    }

    #[must_use]
    pub fn io_zones(&self) -> &[Arc<Zone>] {
        &self.io_zones
    }

    /// The io zone containing byte `offset`, if any.
    #[must_use]
    pub fn io_zone_at(&self, offset: u64) -> Option<&Arc<Zone>> {
        self.io_zones.iter().find(|z| z.contains(offset))
    }

    #[must_use]
    pub(crate) fn qps(&self) -> &Arc<dyn QpsMeter> {
        &self.qps
    }

    /// Shared handle to the QPS meter (for idle detection).
    #[must_use]
    pub fn qps_meter(&self) -> Arc<dyn QpsMeter> {
        Arc::clone(&self.qps)
    }

    /// Idle-detector settings seeded from this device's configuration.
    #[must_use]
    pub fn idle_detector_config(&self) -> crate::idle::IdleDetectorConfig {
        crate::idle::IdleDetectorConfig {
            write_threshold: self.config.idle_qps_write_threshold,
            read_threshold: self.config.idle_qps_read_threshold,
            ..crate::idle::IdleDetectorConfig::default()
        }
    }

    // ── Token discipline ────────────────────────────────────────────────

    /// Block until an open-zone token is available, then take it.
    ///
    /// Non-prioritized callers leave one token of slack so WAL writers
    /// are never starved. May suspend indefinitely; there is no
    /// cancellation.
    pub fn wait_for_open_token(&self, prioritized: bool) {
        let limit = if prioritized {
            self.max_open_io_zones
        } else {
            self.max_open_io_zones - 1
        };

        let mut guard = self
            .zone_resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        loop {
            if self.open_io_zones.load(Ordering::Acquire) < limit {
                self.open_io_zones.fetch_add(1, Ordering::AcqRel);
                return;
            }
            guard = self
                .zone_resources_cv
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Take an active-zone token if one is available. Never blocks;
    /// callers finish zones to create slack instead.
    #[must_use]
    pub fn try_active_token(&self) -> bool {
        let _guard = self
            .zone_resources
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.active_io_zones.load(Ordering::Acquire) < self.max_active_io_zones {
            self.active_io_zones.fetch_add(1, Ordering::AcqRel);
            return true;
        }
        false
    }

    /// Return an open-zone token and wake one waiter.
    pub fn put_open_token(&self) {
        {
            let _guard = self
                .zone_resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.open_io_zones.fetch_sub(1, Ordering::AcqRel);
        }
        self.zone_resources_cv.notify_one();
    }

    /// Return an active-zone token and wake one waiter.
    pub fn put_active_token(&self) {
        {
            let _guard = self
                .zone_resources
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            self.active_io_zones.fetch_sub(1, Ordering::AcqRel);
        }
        self.zone_resources_cv.notify_one();
    }

    /// Current open-zone count.
    #[must_use]
    pub fn open_io_zone_count(&self) -> i64 {
        self.open_io_zones.load(Ordering::Acquire)
    }

    /// Open-zone budget for io allocations.
    #[must_use]
    pub fn open_io_zone_limit(&self) -> i64 {
        self.max_open_io_zones
    }

    /// Active-zone budget for io allocations.
    #[must_use]
    pub fn active_io_zone_limit(&self) -> i64 {
        self.max_active_io_zones
    }

    /// Current active-zone count.
    #[must_use]
    pub fn active_io_zone_count(&self) -> i64 {
        self.active_io_zones.load(Ordering::Acquire)
    }

    // ── Deferred error latch ────────────────────────────────────────────

    /// Fail fast if a background failure latched a deferred error.
    pub fn deferred_status(&self) -> Result<()> {
        match &*self.deferred.lock() {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }

    /// Latch `status`; only the first failure sticks.
    pub fn set_deferred_status(&self, status: ZbdError) {
        let mut deferred = self.deferred.lock();
        if deferred.is_none() {
            warn!(
                target: "zbdfs::device",
                event = "deferred_status_latched",
                error = %status
            );
            *deferred = Some(status);
        }
    }

    /// Clear the latch; only a higher layer decides when that is safe.
    pub fn clear_deferred_status(&self) {
        *self.deferred.lock() = None;
    }

    // ── Space accounting ────────────────────────────────────────────────

    /// Total writable bytes across io zones.
    #[must_use]
    pub fn free_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.capacity()).sum()
    }

    /// Total live bytes across io zones.
    #[must_use]
    pub fn used_space(&self) -> u64 {
        self.io_zones.iter().map(|z| z.used_capacity()).sum()
    }

    /// Garbage bytes in full zones, freed by resetting them.
    #[must_use]
    pub fn reclaimable_space(&self) -> u64 {
        self.io_zones
            .iter()
            .filter(|z| z.is_full())
            .map(|z| z.max_capacity() - z.used_capacity())
            .sum()
    }

    #[must_use]
    pub fn total_bytes_written(&self) -> u64 {
        self.bytes_written.load(Ordering::Relaxed)
    }

    pub(crate) fn add_bytes_written(&self, bytes: u64) {
        self.bytes_written.fetch_add(bytes, Ordering::Relaxed);
    }

    // ── Read path ───────────────────────────────────────────────────────

    /// Read into `buf` starting at `offset`, resuming transparently on
    /// EINTR. Returns the bytes read; short only at end of device.
    pub fn read(&self, buf: &mut [u8], offset: u64, direct: bool) -> Result<usize> {
        self.qps.report(QpsKind::Read, 1);

        let mut done = 0_usize;
        let mut pos = offset;
        while done < buf.len() {
            match self.backend.read(&mut buf[done..], pos, direct) {
                Ok(0) => break,
                Ok(n) => {
                    done += n;
                    pos += n as u64;
                }
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(ZbdError::Io(err)),
            }
        }
        Ok(done)
    }

    /// Drop page-cache pages for the byte range.
    pub fn invalidate_cache(&self, offset: u64, size: u64) -> Result<()> {
        self.backend.invalidate_cache(offset, size)
    }

    // ── Wear bookkeeping ────────────────────────────────────────────────

    /// Sum of per-io-zone reset counts right now.
    #[must_use]
    pub fn io_zone_reset_count_now(&self) -> u32 {
        self.io_zones.iter().map(|z| z.reset_count()).sum()
    }

    /// Sum of per-meta-zone reset counts right now.
    #[must_use]
    pub fn meta_zone_reset_count_now(&self) -> u32 {
        self.meta_zones.iter().map(|z| z.reset_count()).sum()
    }

    /// Device-wide reset count (io + meta) since open.
    #[must_use]
    pub fn total_reset_count(&self) -> u32 {
        self.total_reset_count.load(Ordering::Acquire)
    }

    /// Per-io-zone reset counters, in zone order. Used by the higher
    /// layer to persist wear state across remounts.
    #[must_use]
    pub fn io_zone_reset_counts(&self) -> Vec<u32> {
        self.io_zones.iter().map(|z| z.reset_count()).collect()
    }

    /// Restore per-io-zone reset counters from a persisted snapshot.
    pub fn set_io_zone_reset_counts(&self, counts: &[u32]) -> Result<()> {
        if counts.len() != self.io_zones.len() {
            return Err(ZbdError::InvalidArgument(format!(
                "expected {} reset counts, got {}",
                self.io_zones.len(),
                counts.len()
            )));
        }
        for (zone, &count) in self.io_zones.iter().zip(counts) {
            zone.restore_reset_count(count);
        }
        Ok(())
    }

    /// Standard deviation of the per-io-zone reset counts.
    #[must_use]
    pub fn reset_count_std_dev(&self) -> f64 {
        let n = self.io_zones.len();
        if n == 0 {
            return 0.0;
        }
        let counts: Vec<f64> = self
            .io_zones
            .iter()
            .map(|z| f64::from(z.reset_count()))
            .collect();
        let mean = counts.iter().sum::<f64>() / n as f64;
        let variance = counts.iter().map(|c| (c - mean).powi(2)).sum::<f64>() / n as f64;
        variance.sqrt()
    }

    /// Bookkeeping run by every zone reset: bump the device-wide counter,
    /// surface meta zones dropping offline, and re-evaluate the
    /// wear-leveling trigger.
    pub(crate) fn note_zone_reset(&self, zone: &Zone, offline: bool) {
        self.total_reset_count.fetch_add(1, Ordering::AcqRel);

        if offline && self.is_meta_zone(zone.start()) {
            let offline_meta = self
                .meta_zones
                .iter()
                .filter(|z| z.is_full() && z.is_empty())
                .count();
            if offline_meta + 1 >= self.meta_zones.len() {
                warn!(
                    target: "zbdfs::device",
                    event = "meta_zones_degraded",
                    offline_meta,
                    nr_meta = self.meta_zones.len(),
                    "one usable metadata zone left, device is close to read-only"
                );
            }
        }

        self.evaluate_wear_trigger();
    }

    fn is_meta_zone(&self, start: u64) -> bool {
        self.meta_zones.iter().any(|z| z.start() == start)
    }

    // ── Zero-lifetime reporting ─────────────────────────────────────────

    /// All used io zones whose lifetime hint was never set; the file
    /// layer retags their extents.
    #[must_use]
    pub fn zero_lifetime_zones(&self) -> Vec<Arc<Zone>> {
        self.io_zones
            .iter()
            .filter(|z| z.is_used() && z.lifetime() == LifetimeHint::NotSet)
            .map(Arc::clone)
            .collect()
    }

    // ── Debug reporting ─────────────────────────────────────────────────

    /// Per-zone used-capacity report at debug level.
    pub fn log_zone_usage(&self) {
        for zone in &self.io_zones {
            let used = zone.used_capacity();
            if used > 0 {
                debug!(
                    target: "zbdfs::device",
                    event = "zone_usage",
                    zone_start = format_args!("{:#x}", zone.start()),
                    used_bytes = used,
                    used_mb = used / zbdfs_types::MB
                );
            }
        }
    }
}
