//! Wear leveling.
//!
//! Every io-zone reset re-evaluates the trigger; when the reset rate runs
//! hot and lopsided, the background worker wakes, waits for an idle
//! window and migrates live long-lived data off the least-reclaimable
//! worn zones so they can be reset. Migration of the actual extents is
//! delegated to the file layer through [`ZoneMigrator`]; at most one
//! migration is in flight, serialized by the device's migration lock.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};
use zbdfs_error::{Result, ZbdError};
use zbdfs_types::LifetimeHint;

use crate::alloc::{lifetime_diff, LIFETIME_DIFF_NOT_GOOD};
use crate::device::Device;
use crate::idle::IdleDetector;
use crate::zone::Zone;

/// Reference standard deviation for the adaptive threshold damping.
const DAMPING_REFERENCE_STD_DEV: f64 = 1.5;

/// Floor for the damping divisor; a near-zero divisor would invert the
/// adjustment.
const DAMPING_DIVISOR_FLOOR: f64 = 0.1;

/// Trigger state, guarded by the device's wear mutex.
#[derive(Debug)]
pub(crate) struct WearState {
    /// Io-zone reset count at the last trigger crossing.
    pub(crate) check_reset_count: u32,
    /// Consecutive crossings since the threshold was last damped.
    pub(crate) trigger_count: u32,
    /// Percent trigger for the reset-rate condition; damped adaptively.
    pub(crate) reset_ratio_threshold: f64,
}

impl WearState {
    pub(crate) fn new(reset_ratio_threshold: f64) -> Self {
        Self {
            check_reset_count: 0,
            trigger_count: 0,
            reset_ratio_threshold,
        }
    }
}

impl Device {
    /// Current value of the adaptive reset-ratio threshold.
    #[must_use]
    pub fn reset_ratio_threshold(&self) -> f64 {
        self.wear.lock().reset_ratio_threshold
    }

    /// Re-evaluate the wear-leveling trigger. Runs inside every zone
    /// reset, after the counters were bumped.
    pub(crate) fn evaluate_wear_trigger(&self) {
        let nr_zones = self.nr_zones();
        let total = self.total_reset_count();
        if total <= nr_zones {
            return;
        }
        let io_resets = total.saturating_sub(self.meta_zone_reset_count_now());

        let mut wear = self.wear.lock();
        if wear.check_reset_count < nr_zones {
            wear.check_reset_count = nr_zones;
        }
        let diff = io_resets.saturating_sub(wear.check_reset_count);

        let rate_exceeded =
            100.0 * f64::from(diff) > f64::from(io_resets) * wear.reset_ratio_threshold;
        if !(rate_exceeded && diff >= nr_zones) {
            return;
        }

        if wear.trigger_count >= 2 {
            wear.trigger_count = 0;
            let std_dev = self.reset_count_std_dev();
            let divisor = (1.0 + (std_dev - DAMPING_REFERENCE_STD_DEV) / DAMPING_REFERENCE_STD_DEV)
                .max(DAMPING_DIVISOR_FLOOR);
            wear.reset_ratio_threshold /= divisor;
            debug!(
                target: "zbdfs::wear",
                event = "threshold_damped",
                std_dev,
                threshold = wear.reset_ratio_threshold
            );
        } else {
            wear.trigger_count += 1;
        }
        wear.check_reset_count = io_resets;
        drop(wear);

        debug!(
            target: "zbdfs::wear",
            event = "trigger_crossed",
            io_resets,
            diff
        );
        self.wakeup_wear_worker();
    }

    /// Wake the wear-leveling worker.
    pub fn wakeup_wear_worker(&self) {
        let mut sleeping = self
            .wl_worker_sleep
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *sleeping = false;
        self.wl_worker_cv.notify_one();
    }

    /// Park until woken or `timeout` elapses; returns whether a wakeup
    /// was consumed.
    pub(crate) fn wear_worker_wait(&self, timeout: Duration) -> bool {
        let mut sleeping = self
            .wl_worker_sleep
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if *sleeping {
            let (guard, _timed_out) = self
                .wl_worker_cv
                .wait_timeout(sleeping, timeout)
                .unwrap_or_else(PoisonError::into_inner);
            sleeping = guard;
        }
        if *sleeping {
            false
        } else {
            *sleeping = true;
            true
        }
    }

    // ── Source selection ────────────────────────────────────────────────

    /// The migration source: a worn zone pinned by live long-lived data.
    ///
    /// Among used io zones hinted `Extreme` with reclaimable garbage,
    /// minimizes `reset_count × max_capacity ÷ reclaimable`; a low score
    /// means the zone cannot reclaim itself. Ties prefer the larger
    /// reclaimable space. `NotFound` is the expected no-candidate
    /// outcome.
    pub fn least_reset_extreme_zone(&self) -> Result<Arc<Zone>> {
        let mut best: Option<(Arc<Zone>, u64)> = None;

        for zone in &self.io_zones {
            if zone.is_empty() || !zone.is_used() || zone.lifetime() != LifetimeHint::Extreme {
                continue;
            }
            let reclaimable = zone.reclaimable_space();
            if reclaimable == 0 {
                continue;
            }
            let score = u64::from(zone.reset_count()) * zone.max_capacity() / reclaimable;
            let better = match &best {
                None => true,
                Some((current, current_score)) => {
                    score < *current_score
                        || (score == *current_score
                            && reclaimable > current.reclaimable_space())
                }
            };
            if better {
                best = Some((Arc::clone(zone), score));
            }
        }

        best.map(|(zone, _)| zone).ok_or_else(|| {
            ZbdError::NotFound("no worn zone with live long-lived data".to_owned())
        })
    }

    // ── Target selection ────────────────────────────────────────────────

    /// Take the migration target zone, blocking until the previous
    /// migration releases. At most one migration is in flight.
    ///
    /// Prefers an empty zone with the highest reset count (balancing wear
    /// upward); if no empty zone or no active token is available, falls
    /// back to the non-empty zone maximizing
    /// `reset_count × reclaimable ÷ max_capacity` among lifetime-compatible
    /// zones with at least `min_capacity` left. The returned zone is
    /// busy-held and carries `file_lifetime`.
    pub fn take_migration_target(
        &self,
        file_lifetime: LifetimeHint,
        min_capacity: u64,
    ) -> Result<Arc<Zone>> {
        let mut migrating = self
            .migrating
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while *migrating {
            migrating = self
                .migrate_cv
                .wait(migrating)
                .unwrap_or_else(PoisonError::into_inner);
        }
        *migrating = true;
        drop(migrating);

        match self.select_migration_target(file_lifetime, min_capacity) {
            Ok(zone) => {
                info!(
                    target: "zbdfs::wear",
                    event = "migration_target_taken",
                    zone_start = zone.start()
                );
                Ok(zone)
            }
            Err(err) => {
                {
                    let mut migrating = self
                        .migrating
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner);
                    *migrating = false;
                }
                self.migrate_cv.notify_one();
                Err(err)
            }
        }
    }

    fn select_migration_target(
        &self,
        file_lifetime: LifetimeHint,
        min_capacity: u64,
    ) -> Result<Arc<Zone>> {
        self.wait_for_open_token(true);
        match self.select_migration_target_locked(file_lifetime, min_capacity) {
            Ok(Some(zone)) => Ok(zone),
            Ok(None) => {
                self.put_open_token();
                Err(ZbdError::NotFound(
                    "no migration target zone".to_owned(),
                ))
            }
            Err(err) => {
                self.put_open_token();
                Err(err)
            }
        }
    }

    fn select_migration_target_locked(
        &self,
        file_lifetime: LifetimeHint,
        min_capacity: u64,
    ) -> Result<Option<Arc<Zone>>> {
        // Empty zones first: migrating onto the most-worn empty zone
        // balances wear upward.
        let mut target: Option<Arc<Zone>> = None;
        for zone in &self.io_zones {
            if !zone.try_acquire() {
                continue;
            }
            if zone.is_empty()
                && target
                    .as_ref()
                    .map_or(true, |current| zone.reset_count() > current.reset_count())
            {
                if let Some(previous) = target.replace(Arc::clone(zone)) {
                    previous.check_release()?;
                }
            } else {
                zone.check_release()?;
            }
        }

        if let Some(zone) = target {
            if self.try_active_token() {
                zone.set_lifetime(file_lifetime);
                return Ok(Some(zone));
            }
            // No token for a fresh zone; fall back to a non-empty target.
            zone.check_release()?;
        }

        let mut best: Option<(Arc<Zone>, u64)> = None;
        for zone in &self.io_zones {
            if !zone.try_acquire() {
                continue;
            }
            if !zone.is_used() || zone.is_full() || zone.capacity() < min_capacity {
                zone.check_release()?;
                continue;
            }
            let score = u64::from(zone.reset_count()) * zone.reclaimable_space()
                / zone.max_capacity();
            let better = match &best {
                None => true,
                Some((current, current_score)) => {
                    score > *current_score
                        || (score == *current_score
                            && zone.reset_count() > current.reset_count())
                }
            };
            if better && lifetime_diff(zone.lifetime(), file_lifetime) != LIFETIME_DIFF_NOT_GOOD {
                if let Some((previous, _)) = best.replace((Arc::clone(zone), score)) {
                    previous.check_release()?;
                }
            } else {
                zone.check_release()?;
            }
        }

        Ok(best.map(|(zone, _)| {
            zone.set_lifetime(file_lifetime);
            zone
        }))
    }

    /// Release the migration target and wake the next waiting migration.
    ///
    /// Returns the open token taken by [`Device::take_migration_target`],
    /// and the zone's active token when the target stopped being active
    /// (full) or never became active (still empty).
    pub fn release_migration_target(&self, zone: Option<&Arc<Zone>>) -> Result<()> {
        let result = {
            let mut migrating = self
                .migrating
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            *migrating = false;
            if let Some(zone) = zone {
                if zone.is_full() || zone.is_empty() {
                    self.put_active_token();
                }
                self.put_open_token();
                info!(
                    target: "zbdfs::wear",
                    event = "migration_target_released",
                    zone_start = zone.start()
                );
                zone.check_release()
            } else {
                Ok(())
            }
        };
        self.migrate_cv.notify_one();
        result
    }

    /// Whether a migration currently holds its target.
    #[must_use]
    pub fn is_migrating(&self) -> bool {
        *self
            .migrating
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

// ── Migration delegate ──────────────────────────────────────────────────────

/// File-layer collaborator that moves live extents off a source zone.
///
/// Implementations obtain their destination with
/// [`Device::take_migration_target`], copy the source's live data there,
/// retag the extents, and call [`Device::release_migration_target`]. When
/// `migrate_zone` returns, the source zone must hold no live data.
pub trait ZoneMigrator: Send + Sync {
    fn migrate_zone(&self, device: &Device, source: &Arc<Zone>) -> Result<()>;
}

// ── Background worker ───────────────────────────────────────────────────────

/// Handle for the running wear-leveling worker thread.
///
/// The worker sleeps until a trigger crossing wakes it, then migrates
/// worn zones for as long as the device stays idle. Dropped or shut down,
/// it stops and joins.
pub struct WearLeveler {
    device: Arc<Device>,
    stop: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for WearLeveler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WearLeveler")
            .field("stopped", &self.stop.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl WearLeveler {
    /// Spawn the worker thread.
    pub fn start(
        device: Arc<Device>,
        migrator: Arc<dyn ZoneMigrator>,
        idle: IdleDetector,
    ) -> Result<Self> {
        let stop = Arc::new(AtomicBool::new(false));
        let stop_flag = Arc::clone(&stop);
        let worker_device = Arc::clone(&device);

        let join = thread::Builder::new()
            .name("zbdfs-wear-leveler".to_owned())
            .spawn(move || worker_loop(&worker_device, migrator.as_ref(), idle, &stop_flag))
            .map_err(ZbdError::Io)?;

        Ok(Self {
            device,
            stop,
            join: Some(join),
        })
    }

    /// Request shutdown and block until the worker exits.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.stop.store(true, Ordering::Release);
        self.device.wakeup_wear_worker();
        if let Some(join) = self.join.take() {
            let _ = join.join();
        }
    }
}

impl Drop for WearLeveler {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

fn worker_loop(
    device: &Device,
    migrator: &dyn ZoneMigrator,
    mut idle: IdleDetector,
    stop: &AtomicBool,
) {
    info!(target: "zbdfs::wear", event = "worker_started");

    while !stop.load(Ordering::Acquire) {
        if !device.wear_worker_wait(Duration::from_millis(250)) {
            continue;
        }
        if stop.load(Ordering::Acquire) {
            break;
        }
        debug!(target: "zbdfs::wear", event = "wear_leveling_round");
        run_wear_leveling_round(device, migrator, &mut idle, stop);
    }

    info!(target: "zbdfs::wear", event = "worker_stopped");
}

fn run_wear_leveling_round(
    device: &Device,
    migrator: &dyn ZoneMigrator,
    idle: &mut IdleDetector,
    stop: &AtomicBool,
) {
    while !stop.load(Ordering::Acquire) {
        if !idle.judge_qps_trend() {
            debug!(target: "zbdfs::wear", event = "device_busy_backing_off");
            return;
        }

        let source = match device.least_reset_extreme_zone() {
            Ok(zone) => zone,
            Err(err) if err.is_not_found() => return,
            Err(err) => {
                device.set_deferred_status(err);
                return;
            }
        };

        info!(
            target: "zbdfs::wear",
            event = "migrating_source_zone",
            zone_start = source.start(),
            reset_count = source.reset_count(),
            reclaimable = source.reclaimable_space()
        );
        if let Err(err) = migrator.migrate_zone(device, &source) {
            warn!(
                target: "zbdfs::wear",
                event = "migration_failed",
                zone_start = source.start(),
                error = %err
            );
            device.set_deferred_status(err);
            return;
        }

        // The source should hold garbage only now; reclaim it.
        if source.try_acquire() {
            if !source.is_used() && !source.is_empty() {
                let was_full = source.is_full();
                match source.reset(device) {
                    Ok(()) => {
                        if !was_full {
                            device.put_active_token();
                        }
                    }
                    Err(err) => {
                        warn!(
                            target: "zbdfs::wear",
                            event = "source_reset_failed",
                            zone_start = source.start(),
                            error = %err
                        );
                        device.set_deferred_status(err);
                    }
                }
            }
            if let Err(err) = source.check_release() {
                device.set_deferred_status(err);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{open_device, small_config, test_backend};
    use zbdfs_types::LifetimeHint as Hint;

    fn prime_live_extreme_zone(device: &Device, index: usize, live: u64, written: u64) {
        let zone = &device.io_zones()[index];
        assert!(zone.try_acquire());
        zone.append(device, &vec![0_u8; written as usize]).unwrap();
        zone.set_lifetime(Hint::Extreme);
        zone.add_used_capacity(live);
        zone.check_release().unwrap();
    }

    #[test]
    fn least_reset_extreme_picks_lowest_score() {
        let device = open_device(test_backend(small_config()));
        let mut counts = vec![0_u32; device.io_zones().len()];
        counts[0] = 10;
        counts[1] = 2;
        device.set_io_zone_reset_counts(&counts).unwrap();

        // Zone 0: worn, mostly garbage. Zone 1: fresh, mostly garbage.
        prime_live_extreme_zone(&device, 0, 4096, 32768);
        prime_live_extreme_zone(&device, 1, 4096, 32768);

        // score = reset_count * max / reclaimable; zone 1 scores lower.
        let source = device.least_reset_extreme_zone().unwrap();
        assert_eq!(source.start(), device.io_zones()[1].start());
    }

    #[test]
    fn least_reset_extreme_requires_extreme_live_reclaimable() {
        let device = open_device(test_backend(small_config()));
        assert!(device
            .least_reset_extreme_zone()
            .unwrap_err()
            .is_not_found());

        // Live data but a non-extreme hint does not qualify.
        let zone = &device.io_zones()[0];
        assert!(zone.try_acquire());
        zone.append(&device, &vec![0_u8; 8192]).unwrap();
        zone.set_lifetime(Hint::Medium);
        zone.add_used_capacity(4096);
        zone.check_release().unwrap();
        assert!(device
            .least_reset_extreme_zone()
            .unwrap_err()
            .is_not_found());
    }

    #[test]
    fn migration_target_prefers_most_worn_empty() {
        let device = open_device(test_backend(small_config()));
        let mut counts = vec![0_u32; device.io_zones().len()];
        counts[3] = 7;
        counts[5] = 2;
        device.set_io_zone_reset_counts(&counts).unwrap();

        let target = device
            .take_migration_target(Hint::Short, 4096)
            .unwrap();
        assert_eq!(target.start(), device.io_zones()[3].start());
        assert_eq!(target.lifetime(), Hint::Short);
        assert!(target.is_busy());
        assert!(device.is_migrating());

        device.release_migration_target(Some(&target)).unwrap();
        assert!(!device.is_migrating());
        assert_eq!(device.open_io_zone_count(), 0);
        assert_eq!(device.active_io_zone_count(), 0);
    }

    #[test]
    fn migration_target_scores_non_empty_when_no_active_token() {
        let device = open_device(test_backend(small_config()));
        // Exhaust the active budget so the empty-zone path cannot take a
        // token.
        let max_active = usize::try_from(device.active_io_zone_limit()).unwrap();
        for _ in 0..max_active {
            assert!(device.try_active_token());
        }

        // One compatible non-empty candidate with garbage.
        let zone = &device.io_zones()[2];
        assert!(zone.try_acquire());
        zone.append(&device, &vec![0_u8; 16384]).unwrap();
        zone.set_lifetime(Hint::Long);
        zone.add_used_capacity(4096);
        zone.check_release().unwrap();
        let mut counts = vec![0_u32; device.io_zones().len()];
        counts[2] = 3;
        device.set_io_zone_reset_counts(&counts).unwrap();

        let target = device.take_migration_target(Hint::Short, 4096).unwrap();
        assert_eq!(target.start(), zone.start());
        device.release_migration_target(Some(&target)).unwrap();

        for _ in 0..max_active {
            device.put_active_token();
        }
    }

    #[test]
    fn migration_release_wakes_pending_taker() {
        let device = Arc::new(open_device(test_backend(small_config())));

        let first = device.take_migration_target(Hint::Short, 4096).unwrap();

        let waiter = {
            let device = Arc::clone(&device);
            std::thread::spawn(move || {
                let second = device.take_migration_target(Hint::Short, 4096).unwrap();
                device.release_migration_target(Some(&second)).unwrap();
            })
        };
        std::thread::sleep(Duration::from_millis(20));
        assert!(!waiter.is_finished(), "second taker should block");

        device.release_migration_target(Some(&first)).unwrap();
        waiter.join().unwrap();
        assert!(!device.is_migrating());
    }

    #[test]
    fn migration_target_not_found_clears_migrating() {
        let device = open_device(test_backend(small_config()));
        // Make every zone non-empty and incompatible (unhinted data only
        // mixes with unhinted zones, and these are hinted).
        for zone in device.io_zones() {
            assert!(zone.try_acquire());
            zone.append(&device, &vec![0_u8; 4096]).unwrap();
            zone.set_lifetime(Hint::Short);
            zone.add_used_capacity(4096);
            zone.check_release().unwrap();
        }
        // Requesting a longer lifetime than any zone carries: all
        // candidates are NOT_GOOD, and no zone is empty.
        let err = device
            .take_migration_target(Hint::Extreme, 4096)
            .unwrap_err();
        assert!(err.is_not_found());
        assert!(!device.is_migrating());
        assert_eq!(device.open_io_zone_count(), 0);
    }

    #[test]
    fn wear_trigger_wakes_worker_on_crossing() {
        let device = open_device(test_backend(small_config()));
        let nr_zones = device.nr_zones();

        // Drive resets through one zone until the trigger crosses.
        let zone = &device.io_zones()[0];
        let mut woken = false;
        for _ in 0..=(2 * nr_zones + 2) {
            assert!(zone.try_acquire());
            zone.reset(&device).unwrap();
            zone.check_release().unwrap();
            if device.wear_worker_wait(Duration::from_millis(0)) {
                woken = true;
                break;
            }
        }
        assert!(woken, "trigger never crossed");
        assert!(device.total_reset_count() > nr_zones);
        // No second wakeup without a new crossing.
        assert!(!device.wear_worker_wait(Duration::from_millis(0)));
    }

    #[test]
    fn wear_threshold_damps_after_two_crossings() {
        let device = open_device(test_backend(small_config()));
        let initial = device.reset_ratio_threshold();
        let zone = &device.io_zones()[0];

        // Concentrated wear on one zone keeps the reset-count std dev
        // high, so each crossing is met and the third one damps.
        let mut crossings = 0;
        for _ in 0..1000 {
            assert!(zone.try_acquire());
            zone.reset(&device).unwrap();
            zone.check_release().unwrap();
            if device.wear_worker_wait(Duration::from_millis(0)) {
                crossings += 1;
                if crossings == 3 {
                    break;
                }
            }
        }
        assert_eq!(crossings, 3, "expected three trigger crossings");
        assert!(
            device.reset_ratio_threshold() < initial,
            "threshold should have been damped below {initial}"
        );
    }
}
