#![forbid(unsafe_code)]
//! Zone allocator and wear-leveling manager for zoned block devices.
//!
//! Sits beneath a log-structured file system layer: hands out append
//! targets for incoming writes, reclaims fully-garbage zones, migrates
//! live data off over-worn zones during idle periods, and enforces the
//! device's limits on concurrently open and active zones.
//!
//! ## Architecture
//!
//! - [`Zone`] — one zoned region: write pointer, capacity, live-byte and
//!   reset counters, busy lease.
//! - [`Device`] — owns all zones (meta + io), the open/active token
//!   accounting, the deferred error latch and the migration lock.
//! - Allocation — [`Device::allocate_io_zone`] matches lifetime hints to
//!   open zones and steers wear when opening empty ones;
//!   [`Device::allocate_meta_zone`] serves the metadata log.
//! - [`WearLeveler`] — background worker that migrates live long-lived
//!   data off worn zones, gated by the [`IdleDetector`].
//!
//! The driver itself is abstracted behind the `ZoneBackend` trait from
//! `zbdfs-backend`; the file layer above supplies a [`ZoneMigrator`] and
//! tracks live bytes per zone.

mod alloc;
mod config;
mod device;
mod idle;
mod metrics;
mod stats;
mod wear;
mod zone;

pub use alloc::{lifetime_diff, LIFETIME_DIFF_COULD_BE_WORSE, LIFETIME_DIFF_NOT_GOOD};
pub use config::{DeviceConfig, DEFAULT_META_ZONES, DEFAULT_MIN_ZONES};
pub use device::Device;
pub use idle::{
    IdleDetector, IdleDetectorConfig, DEFAULT_IDLE_QPS_READ_THRESHOLD,
    DEFAULT_IDLE_QPS_WRITE_THRESHOLD,
};
pub use metrics::{AtomicQpsMeter, QpsKind, QpsMeter};
pub use stats::GARBAGE_BUCKETS;
pub use wear::{WearLeveler, ZoneMigrator};
pub use zone::Zone;
