//! Reporting: JSON snapshots, the Zonestats line and the garbage
//! histogram.

use tracing::info;
use zbdfs_error::{Result, ZbdError};
use zbdfs_types::{DeviceSnapshot, ZoneSnapshot, MB};

use crate::device::Device;

/// Number of garbage-rate buckets: empty, ten 10% steps, and 100%.
pub const GARBAGE_BUCKETS: usize = 12;

impl Device {
    /// Point-in-time record of every zone, meta first, in device order.
    #[must_use]
    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            meta: self.meta_zones.iter().map(|z| z.snapshot()).collect(),
            io: self.io_zones.iter().map(|z| z.snapshot()).collect(),
        }
    }

    /// Io-zone snapshots for external consumers.
    #[must_use]
    pub fn io_zone_snapshot(&self) -> Vec<ZoneSnapshot> {
        self.io_zones.iter().map(|z| z.snapshot()).collect()
    }

    /// Encode the device state as `{"meta":[…],"io":[…]}`.
    pub fn encode_json(&self) -> Result<String> {
        serde_json::to_string(&self.snapshot())
            .map_err(|err| ZbdError::Corruption(format!("snapshot encoding failed: {err}")))
    }

    /// One-line zone statistics summary.
    ///
    /// `avg_reclaimable` is the garbage percentage across zones holding
    /// live data; 0 when no zone does.
    #[must_use]
    pub fn zone_stats_line(&self) -> String {
        let mut used_capacity = 0_u64;
        let mut reclaimable_capacity = 0_u64;
        let mut reclaimables_max_capacity = 0_u64;
        let mut active = 0_u64;

        for zone in &self.io_zones {
            let used = zone.used_capacity();
            used_capacity += used;
            if used > 0 {
                reclaimable_capacity += zone.max_capacity() - used;
                reclaimables_max_capacity += zone.max_capacity();
            }
            if !(zone.is_full() || zone.is_empty()) {
                active += 1;
            }
        }

        let avg_reclaimable = if reclaimables_max_capacity == 0 {
            0
        } else {
            100 * reclaimable_capacity / reclaimables_max_capacity
        };

        format!(
            "[Zonestats:time(s),used_cap(MB),reclaimable_cap(MB), \
             avg_reclaimable(%), active(#), active_zones(#), open_zones(#)] \
             {} {} {} {} {} {} {}",
            self.start_time.elapsed().as_secs(),
            used_capacity / MB,
            reclaimable_capacity / MB,
            avg_reclaimable,
            active,
            self.active_io_zone_count(),
            self.open_io_zone_count()
        )
    }

    /// Emit the Zonestats line.
    pub fn log_zone_stats(&self) {
        info!(target: "zbdfs::stats", "{}", self.zone_stats_line());
    }

    /// Histogram of garbage rates across io zones.
    ///
    /// Bucket 0 counts empty zones, bucket 11 zones that are pure
    /// garbage; in between, bucket `i` counts zones with garbage in
    /// `[10·(i−1)%, 10·i%)`. Busy zones are skipped; the result is a
    /// best-effort sample, not a consistent cut.
    #[must_use]
    pub fn garbage_histogram(&self) -> [u32; GARBAGE_BUCKETS] {
        let mut histogram = [0_u32; GARBAGE_BUCKETS];

        for zone in &self.io_zones {
            if !zone.try_acquire() {
                continue;
            }
            if zone.is_empty() {
                histogram[0] += 1;
                let _ = zone.check_release();
                continue;
            }

            let garbage = if zone.is_full() {
                zone.max_capacity() - zone.used_capacity()
            } else {
                zone.wp() - zone.start() - zone.used_capacity()
            };
            #[expect(clippy::cast_precision_loss)]
            let garbage_rate = garbage as f64 / zone.max_capacity() as f64;
            #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
            let index = (((garbage_rate + 0.1) * 10.0) as usize).min(GARBAGE_BUCKETS - 1);
            histogram[index] += 1;

            let _ = zone.check_release();
        }

        histogram
    }

    /// One-line rendering of the garbage histogram.
    #[must_use]
    pub fn garbage_stats_line(&self) -> String {
        let histogram = self.garbage_histogram();
        let mut line = String::from("Zone Garbage Stats: [");
        for count in histogram {
            line.push_str(&count.to_string());
            line.push(' ');
        }
        line.push(']');
        line
    }

    /// Emit the garbage histogram line.
    pub fn log_garbage_info(&self) {
        info!(target: "zbdfs::stats", "{}", self.garbage_stats_line());
    }
}
