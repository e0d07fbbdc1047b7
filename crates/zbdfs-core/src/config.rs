//! Device configuration.

use serde::{Deserialize, Serialize};
use zbdfs_error::{Result, ZbdError};

/// Default number of zones reserved for metadata.
///
/// Two non-offline meta zones are needed to roll the metadata log safely;
/// one extra covers a zone going offline.
pub const DEFAULT_META_ZONES: usize = 3;

/// Minimum number of zones that makes sense for a device.
pub const DEFAULT_MIN_ZONES: u32 = 32;

/// Tunables for a [`crate::Device`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Capacity percent below which non-open zones are finished
    /// proactively; 0 disables the sweep.
    pub finish_threshold: u64,
    /// Initial percent trigger for the wear-leveling control loop; damped
    /// adaptively as the reset-count distribution spreads.
    pub reset_ratio_threshold: f64,
    /// Initial write QPS below which the device is considered idle.
    pub idle_qps_write_threshold: u64,
    /// Initial read QPS below which the device is considered idle.
    pub idle_qps_read_threshold: u64,
    /// Zones reserved for metadata at the front of the device.
    pub meta_zones: usize,
    /// Refuse to open a device with fewer zones than this.
    pub min_zones: u32,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            finish_threshold: 0,
            reset_ratio_threshold: 10.0,
            idle_qps_write_threshold: crate::idle::DEFAULT_IDLE_QPS_WRITE_THRESHOLD,
            idle_qps_read_threshold: crate::idle::DEFAULT_IDLE_QPS_READ_THRESHOLD,
            meta_zones: DEFAULT_META_ZONES,
            min_zones: DEFAULT_MIN_ZONES,
        }
    }
}

impl DeviceConfig {
    /// Validate option ranges.
    pub fn validate(&self) -> Result<()> {
        if self.finish_threshold > 100 {
            return Err(ZbdError::InvalidArgument(format!(
                "finish_threshold must be 0..=100, got {}",
                self.finish_threshold
            )));
        }
        if self.reset_ratio_threshold <= 0.0 || self.reset_ratio_threshold.is_nan() {
            return Err(ZbdError::InvalidArgument(format!(
                "reset_ratio_threshold must be positive, got {}",
                self.reset_ratio_threshold
            )));
        }
        if self.meta_zones == 0 {
            return Err(ZbdError::InvalidArgument(
                "at least one meta zone is required".to_owned(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        DeviceConfig::default().validate().unwrap();
    }

    #[test]
    fn finish_threshold_over_100_is_rejected() {
        let config = DeviceConfig {
            finish_threshold: 101,
            ..DeviceConfig::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ZbdError::InvalidArgument(_))
        ));
    }

    #[test]
    fn config_deserializes_with_partial_fields() {
        let config: DeviceConfig =
            serde_json::from_str("{\"finish_threshold\":25}").unwrap();
        assert_eq!(config.finish_threshold, 25);
        assert_eq!(config.meta_zones, DEFAULT_META_ZONES);
        assert_eq!(config.idle_qps_write_threshold, 76);
    }
}
