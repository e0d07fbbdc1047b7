#![forbid(unsafe_code)]
//! Shared vocabulary types for zbdfs.
//!
//! Lifetime hints, I/O classes and the snapshot records exchanged with
//! external consumers. Numeric values of `LifetimeHint` follow the kernel
//! write-hint encoding so snapshots serialize hints as the same integers
//! the device stack reports.

use serde::{Deserialize, Serialize};

pub const KB: u64 = 1024;
pub const MB: u64 = 1024 * KB;

/// Caller's estimate of how soon written data becomes garbage.
///
/// Ordering matters: the allocator compares hints numerically when scoring
/// zone matches, and the wear-aware empty-zone policy splits on
/// `hint < Short`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
#[repr(u8)]
pub enum LifetimeHint {
    #[default]
    NotSet = 0,
    None = 1,
    Short = 2,
    Medium = 3,
    Long = 4,
    Extreme = 5,
}

impl LifetimeHint {
    /// Numeric encoding used in snapshots and scoring.
    #[must_use]
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Decode from the numeric encoding.
    #[must_use]
    pub fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::None,
            2 => Self::Short,
            3 => Self::Medium,
            4 => Self::Long,
            5 => Self::Extreme,
            _ => Self::NotSet,
        }
    }
}

/// I/O class of an allocation request.
///
/// WAL writes are prioritized: they may use the full open-zone budget,
/// while all other classes leave one token of slack to avoid starving the
/// log writer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IoClass {
    Wal,
    Flush,
    Compaction,
    Misc,
}

impl IoClass {
    #[must_use]
    pub fn is_wal(self) -> bool {
        matches!(self, Self::Wal)
    }
}

/// Value record for one zone, as exposed to external consumers.
///
/// Field order is the JSON key order; keep it in sync with the snapshot
/// format (`start, capacity, max_capacity, wp, lifetime, used_capacity,
/// reset_count`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ZoneSnapshot {
    pub start: u64,
    pub capacity: u64,
    pub max_capacity: u64,
    pub wp: u64,
    pub lifetime: u8,
    pub used_capacity: u64,
    pub reset_count: u32,
}

/// Whole-device snapshot: meta zones first, then io zones, both in device
/// order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub meta: Vec<ZoneSnapshot>,
    pub io: Vec<ZoneSnapshot>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lifetime_hint_roundtrips_numeric_encoding() {
        for hint in [
            LifetimeHint::NotSet,
            LifetimeHint::None,
            LifetimeHint::Short,
            LifetimeHint::Medium,
            LifetimeHint::Long,
            LifetimeHint::Extreme,
        ] {
            assert_eq!(LifetimeHint::from_u8(hint.as_u8()), hint);
        }
    }

    #[test]
    fn lifetime_hint_unknown_decodes_to_not_set() {
        assert_eq!(LifetimeHint::from_u8(42), LifetimeHint::NotSet);
    }

    #[test]
    fn lifetime_hint_ordering_matches_encoding() {
        assert!(LifetimeHint::NotSet < LifetimeHint::Short);
        assert!(LifetimeHint::Short < LifetimeHint::Extreme);
        assert!(LifetimeHint::None < LifetimeHint::Short);
    }

    #[test]
    fn zone_snapshot_serializes_fields_in_device_order() {
        let snap = ZoneSnapshot {
            start: 1 << 30,
            capacity: 0,
            max_capacity: 1 << 26,
            wp: (1 << 30) + (1 << 26),
            lifetime: 3,
            used_capacity: 1000,
            reset_count: 12,
        };
        let json = serde_json::to_string(&snap).unwrap();
        assert_eq!(
            json,
            "{\"start\":1073741824,\"capacity\":0,\"max_capacity\":67108864,\
             \"wp\":1140850688,\"lifetime\":3,\"used_capacity\":1000,\"reset_count\":12}"
        );
    }

    #[test]
    fn io_class_wal_predicate() {
        assert!(IoClass::Wal.is_wal());
        assert!(!IoClass::Flush.is_wal());
    }
}
