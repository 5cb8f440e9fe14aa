//! LabVIEW 128-bit fixed-point timestamps.

use std::time::{SystemTime, UNIX_EPOCH};

/// Seconds between the LabVIEW epoch (1904-01-01 UTC) and the unix epoch.
pub const LV_EPOCH_OFFSET: i64 = 2_082_844_800;

/// Encoded width of a timestamp on the wire.
pub const LV_TIMESTAMP_LEN: usize = 16;

/// Wall-clock instant as LabVIEW represents it: whole seconds since
/// 1904-01-01 UTC plus a binary fraction of a second scaled by 2^64.
///
/// The encoded layout is little-endian regardless of host order. Leap
/// seconds are not corrected.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LvTimestamp {
    seconds: i64,
    fraction: u64,
}

impl LvTimestamp {
    pub fn new(seconds: i64, fraction: u64) -> Self {
        Self { seconds, fraction }
    }

    /// The current UTC wall clock.
    pub fn now() -> Self {
        let since_epoch = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Self::from_unix_parts(since_epoch.as_secs() as i64, since_epoch.subsec_nanos())
    }

    pub fn from_unix_parts(unix_seconds: i64, subsec_nanos: u32) -> Self {
        let fraction = (u128::from(subsec_nanos) << 64) / 1_000_000_000;
        Self {
            seconds: unix_seconds + LV_EPOCH_OFFSET,
            fraction: fraction as u64,
        }
    }

    pub fn seconds(&self) -> i64 {
        self.seconds
    }

    pub fn fraction(&self) -> u64 {
        self.fraction
    }

    /// Whole unix seconds, dropping the fractional part.
    pub fn unix_seconds(&self) -> i64 {
        self.seconds - LV_EPOCH_OFFSET
    }

    pub fn to_le_bytes(&self) -> [u8; LV_TIMESTAMP_LEN] {
        let mut out = [0u8; LV_TIMESTAMP_LEN];
        out[..8].copy_from_slice(&self.seconds.to_le_bytes());
        out[8..].copy_from_slice(&self.fraction.to_le_bytes());
        out
    }

    pub fn from_le_bytes(bytes: [u8; LV_TIMESTAMP_LEN]) -> Self {
        Self {
            seconds: i64::from_le_bytes(bytes[..8].try_into().unwrap()),
            fraction: u64::from_le_bytes(bytes[8..].try_into().unwrap()),
        }
    }
}
