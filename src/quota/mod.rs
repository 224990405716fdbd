//! Byte-count bookkeeping for cache usage.
//!
//! A [`Quota`] is a plain byte counter, used both for configured limits and
//! for tracked usage. Tracked values are updated with signed deltas coming
//! from tile store/delete events, so a counter may transiently dip below
//! zero when a delete-driven decrement races ahead of its matching
//! increment; the value is not clamped and reconciles on the next add.

use std::fmt;

/// Binary storage units, from bytes up to exbibytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum StorageUnit {
    /// Bytes
    B,
    /// 1024 bytes
    KiB,
    /// 1024² bytes
    MiB,
    /// 1024³ bytes
    GiB,
    /// 1024⁴ bytes
    TiB,
    /// 1024⁵ bytes
    PiB,
    /// 1024⁶ bytes
    EiB,
}

impl StorageUnit {
    /// Number of bytes in one of this unit.
    pub fn bytes(&self) -> i128 {
        match self {
            StorageUnit::B => 1,
            StorageUnit::KiB => 1 << 10,
            StorageUnit::MiB => 1 << 20,
            StorageUnit::GiB => 1 << 30,
            StorageUnit::TiB => 1 << 40,
            StorageUnit::PiB => 1 << 50,
            StorageUnit::EiB => 1 << 60,
        }
    }

    /// The largest unit whose value is at least one for the given byte count.
    pub fn best_fit(bytes: i128) -> StorageUnit {
        let magnitude = bytes.abs();
        [
            StorageUnit::EiB,
            StorageUnit::PiB,
            StorageUnit::TiB,
            StorageUnit::GiB,
            StorageUnit::MiB,
            StorageUnit::KiB,
        ]
        .into_iter()
        .find(|unit| magnitude >= unit.bytes())
        .unwrap_or(StorageUnit::B)
    }
}

impl fmt::Display for StorageUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StorageUnit::B => "B",
            StorageUnit::KiB => "KiB",
            StorageUnit::MiB => "MiB",
            StorageUnit::GiB => "GiB",
            StorageUnit::TiB => "TiB",
            StorageUnit::PiB => "PiB",
            StorageUnit::EiB => "EiB",
        };
        f.write_str(s)
    }
}

/// A mutable byte counter.
///
/// Signed so that racing decrements are representable; `i128` leaves
/// overflow unreachable at any realistic cache size.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Quota {
    bytes: i128,
}

impl Quota {
    /// A zero-valued quota.
    pub fn new() -> Self {
        Self { bytes: 0 }
    }

    /// A quota holding exactly `bytes` bytes.
    pub fn from_bytes(bytes: i128) -> Self {
        Self { bytes }
    }

    /// A quota of `value` in the given unit, e.g. `Quota::from_value(500.0,
    /// StorageUnit::MiB)`.
    pub fn from_value(value: f64, unit: StorageUnit) -> Self {
        Self {
            bytes: (value * unit.bytes() as f64) as i128,
        }
    }

    /// The tracked byte count. May be negative transiently.
    pub fn bytes(&self) -> i128 {
        self.bytes
    }

    /// Add `bytes` (may be negative) to this quota.
    pub fn add_bytes(&mut self, bytes: i128) {
        self.bytes += bytes;
    }

    /// Add another quota's value to this one.
    pub fn add(&mut self, other: &Quota) {
        self.bytes += other.bytes;
    }

    /// Subtract another quota's value from this one. Not clamped at zero.
    pub fn subtract(&mut self, other: &Quota) {
        self.bytes -= other.bytes;
    }

    /// `self - other` as a new quota.
    pub fn difference(&self, other: &Quota) -> Quota {
        Quota {
            bytes: self.bytes - other.bytes,
        }
    }

    /// The smaller of the two quotas.
    pub fn min(&self, other: &Quota) -> Quota {
        if self.bytes <= other.bytes {
            *self
        } else {
            *other
        }
    }

    /// Human-friendly rendering with the best fitting unit, e.g. `1.5 GiB`.
    pub fn to_nice_string(&self) -> String {
        let unit = StorageUnit::best_fit(self.bytes);
        let value = self.bytes as f64 / unit.bytes() as f64;
        format!("{:.1} {}", value, unit)
    }
}

impl fmt::Display for Quota {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_nice_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quota_add_and_subtract() {
        let mut quota = Quota::new();
        quota.add_bytes(1_000_000);
        assert_eq!(quota.bytes(), 1_000_000);

        quota.subtract(&Quota::from_bytes(400_000));
        assert_eq!(quota.bytes(), 600_000);

        quota.add(&Quota::from_bytes(400_000));
        assert_eq!(quota.bytes(), 1_000_000);
    }

    #[test]
    fn quota_subtraction_may_go_negative() {
        let mut quota = Quota::new();
        quota.subtract(&Quota::from_bytes(100));
        assert_eq!(quota.bytes(), -100);

        // Reconciles on the next add.
        quota.add_bytes(100);
        assert_eq!(quota.bytes(), 0);
    }

    #[test]
    fn quota_difference() {
        let used = Quota::from_bytes(1_500);
        let limit = Quota::from_bytes(1_000);

        assert_eq!(used.difference(&limit).bytes(), 500);
        assert_eq!(limit.difference(&used).bytes(), -500);
    }

    #[test]
    fn quota_min() {
        let a = Quota::from_bytes(10);
        let b = Quota::from_bytes(20);

        assert_eq!(Quota::min(&a, &b), a);
        assert_eq!(Quota::min(&b, &a), a);
    }

    #[test]
    fn quota_ordering() {
        assert!(Quota::from_bytes(1) < Quota::from_bytes(2));
        assert!(Quota::from_bytes(-1) < Quota::from_bytes(0));
    }

    #[test]
    fn from_value_converts_units() {
        assert_eq!(Quota::from_value(1.0, StorageUnit::KiB).bytes(), 1024);
        assert_eq!(
            Quota::from_value(500.0, StorageUnit::MiB).bytes(),
            500 * 1024 * 1024
        );
        assert_eq!(Quota::from_value(0.5, StorageUnit::KiB).bytes(), 512);
    }

    #[test]
    fn best_fit_picks_largest_unit() {
        assert_eq!(StorageUnit::best_fit(512), StorageUnit::B);
        assert_eq!(StorageUnit::best_fit(2048), StorageUnit::KiB);
        assert_eq!(StorageUnit::best_fit(3 * 1024 * 1024), StorageUnit::MiB);
        assert_eq!(StorageUnit::best_fit(1 << 61), StorageUnit::EiB);
    }

    #[test]
    fn nice_string_formats_with_unit() {
        assert_eq!(Quota::from_bytes(1536).to_nice_string(), "1.5 KiB");
        assert_eq!(Quota::from_bytes(0).to_nice_string(), "0.0 B");
        assert_eq!(
            Quota::from_bytes(2 * 1024 * 1024 * 1024).to_nice_string(),
            "2.0 GiB"
        );
    }
}
