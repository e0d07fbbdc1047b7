#![forbid(unsafe_code)]
//! Zoned block device backend contract.
//!
//! The allocator core depends only on the [`ZoneBackend`] trait; concrete
//! drivers (kernel ioctl over a raw block device, file-per-zone on zonefs)
//! live outside this workspace. The crate also ships [`MemZoneBackend`], an
//! in-memory emulation of a sequential-write-required zoned device that
//! enforces write-pointer sequencing, used by tests and benchmarks.

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::io;
use tracing::{debug, trace};
use zbdfs_error::{Result, ZbdError};

// ── Backend records ─────────────────────────────────────────────────────────

/// Device-reported limits on concurrently open/active zones.
///
/// A value of 0 means the device does not limit that resource; callers
/// substitute the zone count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneLimits {
    pub max_active: u32,
    pub max_open: u32,
}

/// One entry of a zone report, in physical zone order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ZoneInfo {
    /// First byte offset of the zone.
    pub start: u64,
    /// Initial writable size in bytes.
    pub max_capacity: u64,
    /// Current write pointer (absolute byte offset).
    pub wp: u64,
    /// Sequential-write-required zone.
    pub swr: bool,
    /// Hardware-marked unusable.
    pub offline: bool,
    /// Holds device write resources (implicitly or explicitly opened, or
    /// closed after being written).
    pub active: bool,
    /// Currently open.
    pub open: bool,
}

/// Outcome of a zone reset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetOutcome {
    /// The device took the zone offline instead of resetting it.
    pub offline: bool,
    /// Writable capacity after the reset (may differ from before).
    pub max_capacity: u64,
}

// ── Backend trait ───────────────────────────────────────────────────────────

/// Opaque driver for a zoned block device.
///
/// `write` and `read` use pread/pwrite semantics and may return short
/// counts; the core loops until the request is satisfied. `read` returns
/// `Ok(0)` at end of device and surfaces `ErrorKind::Interrupted` for the
/// caller's EINTR loop.
pub trait ZoneBackend: Send + Sync {
    /// Open the device and query its open/active zone limits.
    fn open(&self, readonly: bool, exclusive: bool) -> Result<ZoneLimits>;

    /// Report all zones in physical order.
    fn list_zones(&self) -> Result<Vec<ZoneInfo>>;

    /// Write `buf` at `offset`; returns the number of bytes accepted.
    fn write(&self, buf: &[u8], offset: u64) -> io::Result<usize>;

    /// Read into `buf` from `offset`; returns bytes read, 0 at EOF.
    fn read(&self, buf: &mut [u8], offset: u64, direct: bool) -> io::Result<usize>;

    /// Reset the zone starting at `start`.
    fn reset(&self, start: u64) -> Result<ResetOutcome>;

    /// Finish (close permanently until reset) the zone starting at `start`.
    fn finish(&self, start: u64) -> Result<()>;

    /// Close the open zone starting at `start`.
    fn close(&self, start: u64) -> Result<()>;

    /// Drop page-cache pages for the byte range.
    fn invalidate_cache(&self, offset: u64, size: u64) -> Result<()>;

    fn block_size(&self) -> u32;
    fn zone_size(&self) -> u64;
    fn nr_zones(&self) -> u32;
    fn nr_io_zones(&self) -> u32;
    fn filename(&self) -> String;
}

// ── In-memory emulator ──────────────────────────────────────────────────────

/// Geometry and limits of a [`MemZoneBackend`].
#[derive(Debug, Clone, Copy)]
pub struct MemBackendConfig {
    pub nr_zones: u32,
    pub zone_size: u64,
    pub block_size: u32,
    pub max_open: u32,
    pub max_active: u32,
    /// Zones reserved for metadata, subtracted when reporting
    /// `nr_io_zones`.
    pub meta_zones: u32,
}

impl Default for MemBackendConfig {
    fn default() -> Self {
        Self {
            nr_zones: 32,
            zone_size: 64 * 1024 * 1024,
            block_size: 4096,
            max_open: 4,
            max_active: 8,
            meta_zones: 3,
        }
    }
}

/// Emulated zone condition, mirroring the SWR state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum MemZoneCond {
    Empty,
    Open,
    Closed,
    Full,
    Offline,
}

#[derive(Debug)]
struct MemZone {
    cond: MemZoneCond,
    /// Write pointer relative to the zone start.
    wp: u64,
    /// Bytes written since the last reset; sparse, grows with the wp.
    data: Vec<u8>,
    /// Number of resets the emulated media has absorbed.
    resets: u32,
    /// Take the zone offline on its next reset.
    offline_on_reset: bool,
}

impl MemZone {
    fn new() -> Self {
        Self {
            cond: MemZoneCond::Empty,
            wp: 0,
            data: Vec::new(),
            resets: 0,
            offline_on_reset: false,
        }
    }
}

#[derive(Debug, Default)]
struct MemFaults {
    /// Errors handed out verbatim by the next write calls.
    write_errors: VecDeque<io::Error>,
    /// Number of reads to interrupt with `ErrorKind::Interrupted`.
    read_interrupts: u32,
    /// Cap on bytes accepted per write call, to exercise short-write loops.
    max_write_chunk: Option<usize>,
}

/// In-memory sequential-write-required zoned device.
///
/// Enforces the SWR contract: writes must land exactly at the zone's write
/// pointer, never cross a zone boundary, and are refused on full, offline
/// or finished zones. State transitions follow the zone state machine
/// (empty → open → closed/full, reset → empty).
pub struct MemZoneBackend {
    config: MemBackendConfig,
    zones: Mutex<Vec<MemZone>>,
    faults: Mutex<MemFaults>,
}

impl std::fmt::Debug for MemZoneBackend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemZoneBackend")
            .field("nr_zones", &self.config.nr_zones)
            .field("zone_size", &self.config.zone_size)
            .finish_non_exhaustive()
    }
}

impl MemZoneBackend {
    #[must_use]
    pub fn new(config: MemBackendConfig) -> Self {
        let zones = (0..config.nr_zones).map(|_| MemZone::new()).collect();
        Self {
            config,
            zones: Mutex::new(zones),
            faults: Mutex::new(MemFaults::default()),
        }
    }

    fn zone_index(&self, offset: u64) -> io::Result<usize> {
        let idx = offset / self.config.zone_size;
        if idx >= u64::from(self.config.nr_zones) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "offset past end of device",
            ));
        }
        Ok(usize::try_from(idx).unwrap_or(usize::MAX))
    }

    fn zone_index_for_start(&self, start: u64) -> Result<usize> {
        if start % self.config.zone_size != 0 {
            return Err(ZbdError::InvalidArgument(format!(
                "offset {start} is not zone-aligned"
            )));
        }
        self.zone_index(start).map_err(ZbdError::Io)
    }

    /// Queue an error for an upcoming write call.
    pub fn inject_write_error(&self, error: io::Error) {
        self.faults.lock().write_errors.push_back(error);
    }

    /// Interrupt the next `n` reads with `ErrorKind::Interrupted`.
    pub fn interrupt_next_reads(&self, n: u32) {
        self.faults.lock().read_interrupts = n;
    }

    /// Limit the bytes accepted per write call.
    pub fn set_max_write_chunk(&self, chunk: Option<usize>) {
        self.faults.lock().max_write_chunk = chunk;
    }

    /// Mark a zone so its next reset reports it offline.
    pub fn offline_zone_on_next_reset(&self, zone_index: usize) {
        self.zones.lock()[zone_index].offline_on_reset = true;
    }

    /// Force a zone into a written state, as if a previous mount left it
    /// there. `wp` is relative to the zone start; `open` leaves the zone
    /// in the open condition, otherwise closed.
    pub fn force_written_state(&self, zone_index: usize, wp: u64, open: bool) {
        let mut zones = self.zones.lock();
        let zone = &mut zones[zone_index];
        zone.wp = wp.min(self.config.zone_size);
        zone.data = vec![0_u8; usize::try_from(zone.wp).unwrap_or(0)];
        zone.cond = if zone.wp == 0 {
            MemZoneCond::Empty
        } else if zone.wp == self.config.zone_size {
            MemZoneCond::Full
        } else if open {
            MemZoneCond::Open
        } else {
            MemZoneCond::Closed
        };
    }

    /// Number of resets the emulated media absorbed for one zone.
    #[must_use]
    pub fn media_reset_count(&self, zone_index: usize) -> u32 {
        self.zones.lock()[zone_index].resets
    }
}

impl ZoneBackend for MemZoneBackend {
    fn open(&self, readonly: bool, exclusive: bool) -> Result<ZoneLimits> {
        debug!(
            target: "zbdfs::backend::mem",
            event = "open",
            readonly,
            exclusive,
            nr_zones = self.config.nr_zones
        );
        Ok(ZoneLimits {
            max_active: self.config.max_active,
            max_open: self.config.max_open,
        })
    }

    fn list_zones(&self) -> Result<Vec<ZoneInfo>> {
        let zones = self.zones.lock();
        Ok(zones
            .iter()
            .enumerate()
            .map(|(i, z)| {
                let start = i as u64 * self.config.zone_size;
                ZoneInfo {
                    start,
                    max_capacity: self.config.zone_size,
                    wp: start + z.wp,
                    swr: true,
                    offline: z.cond == MemZoneCond::Offline,
                    active: matches!(
                        z.cond,
                        MemZoneCond::Open | MemZoneCond::Closed
                    ),
                    open: z.cond == MemZoneCond::Open,
                }
            })
            .collect())
    }

    fn write(&self, buf: &[u8], offset: u64) -> io::Result<usize> {
        let chunk = {
            let mut faults = self.faults.lock();
            if let Some(err) = faults.write_errors.pop_front() {
                return Err(err);
            }
            faults.max_write_chunk
        };

        let idx = self.zone_index(offset)?;
        let mut zones = self.zones.lock();
        let zone = &mut zones[idx];
        let zone_start = idx as u64 * self.config.zone_size;

        match zone.cond {
            MemZoneCond::Offline => {
                return Err(io::Error::new(io::ErrorKind::Other, "zone is offline"));
            }
            MemZoneCond::Full => {
                return Err(io::Error::new(io::ErrorKind::Other, "zone is full"));
            }
            _ => {}
        }
        if offset != zone_start + zone.wp {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "write not at zone write pointer",
            ));
        }

        let remaining = self.config.zone_size - zone.wp;
        let mut accepted = buf.len().min(usize::try_from(remaining).unwrap_or(usize::MAX));
        if let Some(chunk) = chunk {
            accepted = accepted.min(chunk);
        }
        if accepted == 0 && !buf.is_empty() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                "write past zone capacity",
            ));
        }

        zone.data.extend_from_slice(&buf[..accepted]);
        zone.wp += accepted as u64;
        zone.cond = if zone.wp == self.config.zone_size {
            MemZoneCond::Full
        } else {
            MemZoneCond::Open
        };
        trace!(
            target: "zbdfs::backend::mem",
            event = "write",
            zone = idx,
            offset,
            accepted
        );
        Ok(accepted)
    }

    fn read(&self, buf: &mut [u8], offset: u64, _direct: bool) -> io::Result<usize> {
        {
            let mut faults = self.faults.lock();
            if faults.read_interrupts > 0 {
                faults.read_interrupts -= 1;
                return Err(io::Error::new(io::ErrorKind::Interrupted, "interrupted"));
            }
        }

        let device_end = u64::from(self.config.nr_zones) * self.config.zone_size;
        if offset >= device_end {
            return Ok(0);
        }
        let idx = self.zone_index(offset)?;
        let zones = self.zones.lock();
        let zone = &zones[idx];
        let zone_start = idx as u64 * self.config.zone_size;
        let in_zone = usize::try_from(offset - zone_start).unwrap_or(usize::MAX);

        // Clamp the read to this zone; callers loop across boundaries.
        let zone_remaining = usize::try_from(self.config.zone_size)
            .unwrap_or(usize::MAX)
            .saturating_sub(in_zone);
        let len = buf.len().min(zone_remaining);
        for (i, slot) in buf[..len].iter_mut().enumerate() {
            *slot = zone.data.get(in_zone + i).copied().unwrap_or(0);
        }
        Ok(len)
    }

    fn reset(&self, start: u64) -> Result<ResetOutcome> {
        let idx = self.zone_index_for_start(start)?;
        let mut zones = self.zones.lock();
        let zone = &mut zones[idx];

        if zone.cond == MemZoneCond::Offline {
            return Ok(ResetOutcome {
                offline: true,
                max_capacity: 0,
            });
        }
        if zone.offline_on_reset {
            zone.offline_on_reset = false;
            zone.cond = MemZoneCond::Offline;
            zone.wp = 0;
            zone.data.clear();
            return Ok(ResetOutcome {
                offline: true,
                max_capacity: 0,
            });
        }

        zone.cond = MemZoneCond::Empty;
        zone.wp = 0;
        zone.data.clear();
        zone.resets += 1;
        debug!(target: "zbdfs::backend::mem", event = "reset", zone = idx);
        Ok(ResetOutcome {
            offline: false,
            max_capacity: self.config.zone_size,
        })
    }

    fn finish(&self, start: u64) -> Result<()> {
        let idx = self.zone_index_for_start(start)?;
        let mut zones = self.zones.lock();
        let zone = &mut zones[idx];
        if zone.cond == MemZoneCond::Offline {
            return Err(ZbdError::Io(io::Error::new(
                io::ErrorKind::Other,
                "zone is offline",
            )));
        }
        zone.cond = MemZoneCond::Full;
        zone.wp = self.config.zone_size;
        debug!(target: "zbdfs::backend::mem", event = "finish", zone = idx);
        Ok(())
    }

    fn close(&self, start: u64) -> Result<()> {
        let idx = self.zone_index_for_start(start)?;
        let mut zones = self.zones.lock();
        let zone = &mut zones[idx];
        if zone.cond == MemZoneCond::Open {
            zone.cond = MemZoneCond::Closed;
        }
        Ok(())
    }

    fn invalidate_cache(&self, _offset: u64, _size: u64) -> Result<()> {
        Ok(())
    }

    fn block_size(&self) -> u32 {
        self.config.block_size
    }

    fn zone_size(&self) -> u64 {
        self.config.zone_size
    }

    fn nr_zones(&self) -> u32 {
        self.config.nr_zones
    }

    fn nr_io_zones(&self) -> u32 {
        self.config.nr_zones.saturating_sub(self.config.meta_zones)
    }

    fn filename(&self) -> String {
        "mem:zbd".to_owned()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn small_backend() -> MemZoneBackend {
        MemZoneBackend::new(MemBackendConfig {
            nr_zones: 4,
            zone_size: 4096 * 4,
            block_size: 4096,
            max_open: 2,
            max_active: 3,
            meta_zones: 1,
        })
    }

    #[test]
    fn write_at_wp_advances_and_reads_back() {
        let be = small_backend();
        let n = be.write(&[0xAB; 4096], 0).unwrap();
        assert_eq!(n, 4096);

        let mut buf = vec![0_u8; 4096];
        let n = be.read(&mut buf, 0, false).unwrap();
        assert_eq!(n, 4096);
        assert!(buf.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn write_off_wp_is_rejected() {
        let be = small_backend();
        let err = be.write(&[0_u8; 4096], 4096).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }

    #[test]
    fn write_fills_zone_and_refuses_more() {
        let be = small_backend();
        for i in 0..4u64 {
            be.write(&[1_u8; 4096], i * 4096).unwrap();
        }
        let zones = be.list_zones().unwrap();
        assert_eq!(zones[0].wp, 4096 * 4);
        assert!(be.write(&[1_u8; 4096], 4096 * 4).is_err());
    }

    #[test]
    fn reset_returns_zone_to_empty() {
        let be = small_backend();
        be.write(&[1_u8; 4096], 0).unwrap();
        let outcome = be.reset(0).unwrap();
        assert!(!outcome.offline);
        assert_eq!(outcome.max_capacity, 4096 * 4);
        let zones = be.list_zones().unwrap();
        assert_eq!(zones[0].wp, 0);
        assert!(!zones[0].active);
        assert_eq!(be.media_reset_count(0), 1);
    }

    #[test]
    fn offline_on_next_reset_takes_effect() {
        let be = small_backend();
        be.offline_zone_on_next_reset(1);
        let outcome = be.reset(4096 * 4).unwrap();
        assert!(outcome.offline);
        assert_eq!(outcome.max_capacity, 0);
        assert!(be.list_zones().unwrap()[1].offline);
    }

    #[test]
    fn finish_marks_zone_full() {
        let be = small_backend();
        be.write(&[1_u8; 4096], 0).unwrap();
        be.finish(0).unwrap();
        let zones = be.list_zones().unwrap();
        assert_eq!(zones[0].wp, 4096 * 4);
        assert!(!zones[0].open);
    }

    #[test]
    fn close_transitions_open_to_closed() {
        let be = small_backend();
        be.write(&[1_u8; 4096], 0).unwrap();
        assert!(be.list_zones().unwrap()[0].open);
        be.close(0).unwrap();
        let zones = be.list_zones().unwrap();
        assert!(zones[0].active);
        assert!(!zones[0].open);
    }

    #[test]
    fn short_write_chunking() {
        let be = small_backend();
        be.set_max_write_chunk(Some(1000));
        let n = be.write(&[2_u8; 4096], 0).unwrap();
        assert_eq!(n, 1000);
        let n = be.write(&[2_u8; 3096], 1000).unwrap();
        assert_eq!(n, 1000);
    }

    #[test]
    fn injected_write_error_surfaces_once() {
        let be = small_backend();
        be.inject_write_error(io::Error::from_raw_os_error(5));
        assert!(be.write(&[0_u8; 4096], 0).is_err());
        assert!(be.write(&[0_u8; 4096], 0).is_ok());
    }

    #[test]
    fn interrupted_reads_then_succeed() {
        let be = small_backend();
        be.write(&[7_u8; 4096], 0).unwrap();
        be.interrupt_next_reads(2);
        let mut buf = vec![0_u8; 16];
        assert_eq!(
            be.read(&mut buf, 0, false).unwrap_err().kind(),
            io::ErrorKind::Interrupted
        );
        assert_eq!(
            be.read(&mut buf, 0, false).unwrap_err().kind(),
            io::ErrorKind::Interrupted
        );
        assert_eq!(be.read(&mut buf, 0, false).unwrap(), 16);
    }

    #[test]
    fn read_past_device_end_is_eof() {
        let be = small_backend();
        let mut buf = vec![0_u8; 16];
        assert_eq!(be.read(&mut buf, 4 * 4096 * 4, false).unwrap(), 0);
    }

    #[test]
    fn forced_state_reported_by_list() {
        let be = small_backend();
        be.force_written_state(2, 8192, true);
        let zones = be.list_zones().unwrap();
        assert_eq!(zones[2].wp, 2 * 4 * 4096 + 8192);
        assert!(zones[2].active);
        assert!(zones[2].open);
    }

    #[test]
    fn geometry_accessors() {
        let be = small_backend();
        assert_eq!(be.block_size(), 4096);
        assert_eq!(be.zone_size(), 4096 * 4);
        assert_eq!(be.nr_zones(), 4);
        assert_eq!(be.nr_io_zones(), 3);
        assert_eq!(be.filename(), "mem:zbd");
    }
}
