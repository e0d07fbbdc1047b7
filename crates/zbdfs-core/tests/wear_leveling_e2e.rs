#![forbid(unsafe_code)]
//! End-to-end wear-leveling: trigger -> worker wake -> idle check ->
//! migration -> source reset, with a file-layer migrator that really
//! copies bytes through the device.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zbdfs_backend::{MemBackendConfig, MemZoneBackend, ZoneBackend};
use zbdfs_core::{
    AtomicQpsMeter, Device, DeviceConfig, IdleDetector, IdleDetectorConfig, WearLeveler, Zone,
    ZoneMigrator,
};
use zbdfs_error::Result;
use zbdfs_types::{IoClass, LifetimeHint};

fn open_device() -> Arc<Device> {
    let backend: Arc<dyn ZoneBackend> = Arc::new(MemZoneBackend::new(MemBackendConfig {
        nr_zones: 32,
        zone_size: 64 * 1024,
        block_size: 4096,
        max_open: 6,
        max_active: 8,
        meta_zones: 3,
    }));
    Arc::new(
        Device::open(
            backend,
            DeviceConfig::default(),
            Arc::new(AtomicQpsMeter::new()),
            false,
            true,
        )
        .unwrap(),
    )
}

fn fast_idle_detector(device: &Device) -> IdleDetector {
    IdleDetector::new(
        device.qps_meter(),
        IdleDetectorConfig {
            sample_interval: Duration::from_millis(1),
            ..device.idle_detector_config()
        },
    )
}

/// Copies every live byte of the source zone to a migration target, the
/// way the extent manager would, then retags the live-byte accounting.
struct CopyingMigrator {
    migrations: AtomicU32,
}

impl CopyingMigrator {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            migrations: AtomicU32::new(0),
        })
    }
}

impl ZoneMigrator for CopyingMigrator {
    fn migrate_zone(&self, device: &Device, source: &Arc<Zone>) -> Result<()> {
        let live = source.used_capacity();
        let block_size = u64::from(device.block_size());
        let padded = live.div_ceil(block_size) * block_size;

        let target = device.take_migration_target(source.lifetime(), padded)?;

        let mut data = vec![0_u8; padded as usize];
        device.read(&mut data, source.start(), false)?;
        let append_result = target.append(device, &data);
        if append_result.is_ok() {
            target.add_used_capacity(live);
            source.sub_used_capacity(live);
        }
        device.release_migration_target(Some(&target))?;
        append_result?;

        self.migrations.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }
}

#[test]
fn wear_leveler_migrates_and_resets_worn_source() {
    let device = open_device();

    // A worn zone holding a little live long-lived data and a lot of
    // garbage: the canonical migration source.
    let source = device
        .allocate_io_zone(LifetimeHint::Extreme, IoClass::Misc)
        .unwrap()
        .unwrap();
    source.append(&device, &vec![0x5A_u8; 16384]).unwrap();
    source.add_used_capacity(4096);
    let source_start = source.start();
    device.release_io_zone(&source).unwrap();

    let mut counts = vec![0_u32; device.io_zones().len()];
    counts[0] = 3;
    device.set_io_zone_reset_counts(&counts).unwrap();

    let migrator = CopyingMigrator::new();
    let leveler = WearLeveler::start(
        Arc::clone(&device),
        Arc::clone(&migrator) as Arc<dyn ZoneMigrator>,
        fast_idle_detector(&device),
    )
    .unwrap();

    device.wakeup_wear_worker();

    // The idle device lets the worker run immediately; wait for the
    // source zone to be migrated away and reset.
    let deadline = Instant::now() + Duration::from_secs(5);
    let source_zone = Arc::clone(device.io_zone_at(source_start).unwrap());
    while Instant::now() < deadline {
        if source_zone.is_empty() && !source_zone.is_used() {
            break;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    leveler.shutdown();

    assert!(source_zone.is_empty(), "source zone was not reclaimed");
    assert!(!source_zone.is_used());
    assert!(migrator.migrations.load(Ordering::Acquire) >= 1);
    assert!(device.deferred_status().is_ok());
    assert!(!device.is_migrating());

    // The live bytes moved to exactly one other zone.
    let carriers: Vec<_> = device
        .io_zones()
        .iter()
        .filter(|z| z.used_capacity() > 0)
        .collect();
    assert_eq!(carriers.len(), 1);
    assert_ne!(carriers[0].start(), source_start);
    assert_eq!(carriers[0].used_capacity(), 4096);

    // Migrated bytes are really on the device.
    let mut data = vec![0_u8; 4096];
    device.read(&mut data, carriers[0].start(), false).unwrap();
    assert!(data.iter().all(|&b| b == 0x5A));
}

#[test]
fn wear_leveler_is_quiet_without_candidates() {
    let device = open_device();
    let migrator = CopyingMigrator::new();
    let leveler = WearLeveler::start(
        Arc::clone(&device),
        Arc::clone(&migrator) as Arc<dyn ZoneMigrator>,
        fast_idle_detector(&device),
    )
    .unwrap();

    device.wakeup_wear_worker();
    std::thread::sleep(Duration::from_millis(100));
    leveler.shutdown();

    assert_eq!(migrator.migrations.load(Ordering::Acquire), 0);
    assert!(device.deferred_status().is_ok());
    assert_eq!(device.open_io_zone_count(), 0);
    assert_eq!(device.active_io_zone_count(), 0);
}

#[test]
fn wear_leveler_shutdown_is_prompt_and_idempotent_on_drop() {
    let device = open_device();
    let migrator = CopyingMigrator::new();
    let leveler = WearLeveler::start(
        Arc::clone(&device),
        Arc::clone(&migrator) as Arc<dyn ZoneMigrator>,
        fast_idle_detector(&device),
    )
    .unwrap();

    let start = Instant::now();
    drop(leveler);
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "worker did not stop promptly"
    );
}
