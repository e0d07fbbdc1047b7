//! Zone allocation.
//!
//! `allocate_io_zone` hands out append targets honoring the open/active
//! token limits and the lifetime-hint matching policy; `allocate_meta_zone`
//! serves the metadata log from its reserved zones. All scans use the
//! acquire-or-skip busy protocol: a zone another thread holds is simply
//! not a candidate.

use std::sync::Arc;
use tracing::{debug, info, warn};
use zbdfs_error::{Result, ZbdError};
use zbdfs_types::{IoClass, LifetimeHint};

use crate::device::Device;
use crate::zone::Zone;

/// Sentinel lifetime distance; a zone this far off is never selected.
pub const LIFETIME_DIFF_NOT_GOOD: u32 = 100;

/// Distance of an exact same-hint match: usable, but an empty zone with
/// the exact hint is preferred when an active token is available.
pub const LIFETIME_DIFF_COULD_BE_WORSE: u32 = 50;

/// Distance between a zone's hint and the data's hint.
///
/// Unhinted data (`NotSet`/`None`) only mixes with identically-unhinted
/// zones. Hinted data tolerates zones with longer hints (the shorter-lived
/// data turns to garbage first), scored by the hint gap; zones with
/// shorter hints would trap long-lived data and are ruled out.
#[must_use]
pub fn lifetime_diff(zone_lifetime: LifetimeHint, file_lifetime: LifetimeHint) -> u32 {
    if matches!(file_lifetime, LifetimeHint::NotSet | LifetimeHint::None) {
        return if file_lifetime == zone_lifetime {
            0
        } else {
            LIFETIME_DIFF_NOT_GOOD
        };
    }

    if zone_lifetime > file_lifetime {
        return u32::from(zone_lifetime.as_u8() - file_lifetime.as_u8());
    }
    if zone_lifetime == file_lifetime {
        return LIFETIME_DIFF_COULD_BE_WORSE;
    }
    LIFETIME_DIFF_NOT_GOOD
}

impl Device {
    /// Allocate a busy-held io zone for `file_lifetime` data.
    ///
    /// Returns `Ok(None)` when nothing is allocatable (an outcome, not an
    /// error). The caller owns the busy lease and one open token until it
    /// calls [`Device::release_io_zone`].
    pub fn allocate_io_zone(
        &self,
        file_lifetime: LifetimeHint,
        io_class: IoClass,
    ) -> Result<Option<Arc<Zone>>> {
        self.deferred_status()?;

        if !io_class.is_wal() {
            self.apply_finish_threshold()?;
        }

        self.wait_for_open_token(io_class.is_wal());

        let mut new_zone = false;
        let (best_diff, mut allocated) = match self.best_open_zone_match(file_lifetime, 0) {
            Ok(found) => found,
            Err(err) => {
                self.put_open_token();
                return Err(err);
            }
        };

        if best_diff >= LIFETIME_DIFF_COULD_BE_WORSE {
            let got_token = self.try_active_token();

            // Without a token, an open zone with the same hint is a better
            // choice than finishing a zone to open a new one.
            if let Some(zone) = allocated.take() {
                if !got_token && best_diff == LIFETIME_DIFF_COULD_BE_WORSE {
                    debug!(
                        target: "zbdfs::alloc",
                        event = "avoided_finish",
                        zone = zone.zone_nr()
                    );
                    allocated = Some(zone);
                } else if let Err(err) = zone.check_release() {
                    self.put_open_token();
                    if got_token {
                        self.put_active_token();
                    }
                    return Err(err);
                }
            }

            if allocated.is_none() {
                // Make sure we can open an empty zone.
                while !got_token && !self.try_active_token() {
                    if let Err(err) = self.finish_cheapest_io_zone() {
                        self.put_open_token();
                        return Err(err);
                    }
                }

                match self.allocate_empty_zone(file_lifetime) {
                    Ok(Some(zone)) => {
                        zone.set_lifetime(file_lifetime);
                        new_zone = true;
                        allocated = Some(zone);
                    }
                    Ok(None) => {
                        self.put_active_token();
                    }
                    Err(err) => {
                        self.put_active_token();
                        self.put_open_token();
                        return Err(err);
                    }
                }
            }
        }

        if let Some(zone) = &allocated {
            debug!(
                target: "zbdfs::alloc",
                event = "zone_allocated",
                new_zone,
                zone = zone.zone_nr(),
                wp = format_args!("{:#x}", zone.wp()),
                zone_lifetime = zone.lifetime().as_u8(),
                file_lifetime = file_lifetime.as_u8()
            );
        } else {
            self.put_open_token();
        }

        if !io_class.is_wal() {
            self.log_zone_stats();
        }

        Ok(allocated)
    }

    /// Return a zone allocated with [`Device::allocate_io_zone`].
    ///
    /// Closes the zone on the device when it is neither empty nor full,
    /// returns the caller's open token, and returns the zone's active
    /// token when the zone stopped being active (full) or never became
    /// active (still empty).
    pub fn release_io_zone(&self, zone: &Arc<Zone>) -> Result<()> {
        if zone.is_full() || zone.is_empty() {
            self.put_active_token();
        } else if let Err(err) = zone.close() {
            self.put_open_token();
            let release = zone.check_release();
            return release.and(Err(err));
        }
        self.put_open_token();
        zone.check_release()
    }

    /// Allocate a busy-held metadata zone, resetting a non-empty unused
    /// one before handing it out. Meta zones carry their own reservation:
    /// no tokens, no lifetime matching.
    pub fn allocate_meta_zone(&self) -> Result<Arc<Zone>> {
        for zone in &self.meta_zones {
            if !zone.try_acquire() {
                continue;
            }
            if zone.is_used() {
                zone.check_release()?;
                continue;
            }
            if !zone.is_empty() {
                if let Err(err) = zone.reset(self) {
                    warn!(
                        target: "zbdfs::alloc",
                        event = "meta_zone_reset_failed",
                        zone = zone.zone_nr(),
                        error = %err
                    );
                    zone.check_release()?;
                    continue;
                }
            }
            return Ok(Arc::clone(zone));
        }

        warn!(
            target: "zbdfs::alloc",
            event = "meta_zones_exhausted",
            "out of metadata zones, the device should go read-only"
        );
        Err(ZbdError::NoSpace("out of metadata zones".to_owned()))
    }

    /// Reset every io zone that holds garbage only. The garbage
    /// collector's entry point.
    pub fn reset_unused_io_zones(&self) -> Result<()> {
        for zone in &self.io_zones {
            if !zone.try_acquire() {
                continue;
            }
            if !zone.is_empty() && !zone.is_used() {
                let was_full = zone.is_full();
                let reset_status = zone.reset(self);
                let release_status = zone.check_release();
                reset_status?;
                release_status?;
                if !was_full {
                    self.put_active_token();
                }
            } else {
                zone.check_release()?;
            }
        }
        Ok(())
    }

    // ── Allocation sub-policies ─────────────────────────────────────────

    /// Proactively finish zones whose remaining capacity dropped below
    /// the configured percentage of their size, freeing their active
    /// tokens for future opens. Disabled when the threshold is 0.
    pub(crate) fn apply_finish_threshold(&self) -> Result<()> {
        if self.config.finish_threshold == 0 {
            return Ok(());
        }

        for zone in &self.io_zones {
            if !zone.try_acquire() {
                continue;
            }
            let within_threshold =
                zone.capacity() < zone.max_capacity() * self.config.finish_threshold / 100;
            if !(zone.is_empty() || zone.is_full()) && within_threshold {
                if let Err(err) = zone.finish() {
                    debug!(
                        target: "zbdfs::alloc",
                        event = "finish_threshold_failed",
                        zone = zone.zone_nr(),
                        error = %err
                    );
                    let _ = zone.check_release();
                    return Err(err);
                }
                zone.check_release()?;
                self.put_active_token();
            } else {
                zone.check_release()?;
            }
        }
        Ok(())
    }

    /// Finish the non-busy zone with the least remaining capacity to free
    /// an active token. A no-op when every non-busy zone is empty or full.
    pub(crate) fn finish_cheapest_io_zone(&self) -> Result<()> {
        let mut victim: Option<Arc<Zone>> = None;

        for zone in &self.io_zones {
            if !zone.try_acquire() {
                continue;
            }
            if zone.is_empty() || zone.is_full() {
                zone.check_release()?;
                continue;
            }
            match &victim {
                None => victim = Some(Arc::clone(zone)),
                Some(current) if current.capacity() > zone.capacity() => {
                    current.check_release()?;
                    victim = Some(Arc::clone(zone));
                }
                Some(_) => zone.check_release()?,
            }
        }

        let Some(victim) = victim else {
            info!(
                target: "zbdfs::alloc",
                event = "finish_cheapest_noop",
                "all non-busy zones are empty or full"
            );
            return Ok(());
        };

        let finish_status = victim.finish();
        let release_status = victim.check_release();
        if finish_status.is_ok() {
            self.put_active_token();
        }
        release_status?;
        finish_status
    }

    /// Best already-open zone for `file_lifetime`: used, not full, with at
    /// least `min_capacity` left, minimizing the lifetime distance. First
    /// candidate wins ties. The returned zone is busy-held.
    pub(crate) fn best_open_zone_match(
        &self,
        file_lifetime: LifetimeHint,
        min_capacity: u64,
    ) -> Result<(u32, Option<Arc<Zone>>)> {
        let mut best_diff = LIFETIME_DIFF_NOT_GOOD;
        let mut best: Option<Arc<Zone>> = None;

        for zone in &self.io_zones {
            if !zone.try_acquire() {
                continue;
            }
            if zone.is_used() && !zone.is_full() && zone.capacity() >= min_capacity {
                let diff = lifetime_diff(zone.lifetime(), file_lifetime);
                if diff < best_diff {
                    if let Some(previous) = best.replace(Arc::clone(zone)) {
                        previous.check_release()?;
                    }
                    best_diff = diff;
                } else {
                    zone.check_release()?;
                }
            } else {
                zone.check_release()?;
            }
        }

        Ok((best_diff, best))
    }

    /// Pick an empty zone, steering wear: long-lived (cold) data recycles
    /// the most-worn zone, short-lived (hot) data takes the least-worn
    /// one. The returned zone is busy-held.
    pub(crate) fn allocate_empty_zone(
        &self,
        file_lifetime: LifetimeHint,
    ) -> Result<Option<Arc<Zone>>> {
        let prefer_worn = file_lifetime < LifetimeHint::Short;
        let mut allocated: Option<Arc<Zone>> = None;

        for zone in &self.io_zones {
            if !zone.try_acquire() {
                continue;
            }
            if !zone.is_empty() {
                zone.check_release()?;
                continue;
            }
            let better = match &allocated {
                None => true,
                Some(current) if prefer_worn => zone.reset_count() > current.reset_count(),
                Some(current) => zone.reset_count() < current.reset_count(),
            };
            if better {
                if let Some(previous) = allocated.replace(Arc::clone(zone)) {
                    previous.check_release()?;
                }
                if !prefer_worn && zone.reset_count() == 0 {
                    break;
                }
            } else {
                zone.check_release()?;
            }
        }

        Ok(allocated)
    }
}
