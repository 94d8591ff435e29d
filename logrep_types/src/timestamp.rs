//! Hybrid logical clock timestamps.

use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

/// A hybrid logical clock reading: nanoseconds of wall time since the unix epoch, with a logical
/// counter to order events that share a wall time.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Timestamp {
    pub wall_time: i64,
    pub logical: i32,
}

impl Timestamp {
    /// The zero timestamp, meaning "nothing resolved yet".
    pub const EMPTY: Self = Self {
        wall_time: 0,
        logical: 0,
    };

    pub const MAX: Self = Self {
        wall_time: i64::MAX,
        logical: i32::MAX,
    };

    pub const fn new(wall_time: i64, logical: i32) -> Self {
        Self {
            wall_time,
            logical,
        }
    }

    pub const fn from_wall(wall_time: i64) -> Self {
        Self::new(wall_time, 0)
    }

    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    pub fn from_system_time(t: SystemTime) -> Self {
        let nanos = t
            .duration_since(UNIX_EPOCH)
            .map(|d| i64::try_from(d.as_nanos()).unwrap_or(i64::MAX))
            .unwrap_or(0);
        Self::from_wall(nanos)
    }

    pub fn is_empty(&self) -> bool {
        *self == Self::EMPTY
    }

    /// Round down to a multiple of `granularity`, dropping the logical component. A zero
    /// granularity leaves the timestamp untouched.
    pub fn quantize(self, granularity: Duration) -> Self {
        let g = i64::try_from(granularity.as_nanos()).unwrap_or(i64::MAX);
        if g == 0 {
            return self;
        }
        Self::from_wall(self.wall_time - self.wall_time.rem_euclid(g))
    }

    /// Wall clock time elapsed between this timestamp and `now`, zero if this timestamp is in the
    /// future.
    pub fn elapsed_at(&self, now: Self) -> Duration {
        Duration::from_nanos(now.wall_time.saturating_sub(self.wall_time).max(0) as u64)
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let secs = self.wall_time.div_euclid(1_000_000_000);
        let nanos = self.wall_time.rem_euclid(1_000_000_000);
        write!(f, "{secs}.{nanos:09},{}", self.logical)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_uses_logical_to_break_ties() {
        assert!(Timestamp::new(1, 0) < Timestamp::new(1, 1));
        assert!(Timestamp::new(1, 5) < Timestamp::new(2, 0));
        assert!(Timestamp::EMPTY.is_empty());
        assert!(!Timestamp::new(0, 1).is_empty());
    }

    #[test]
    fn quantize_rounds_down() {
        let g = Duration::from_secs(5);
        let t = Timestamp::new(12_300_000_000, 4);
        assert_eq!(t.quantize(g), Timestamp::from_wall(10_000_000_000));
        let aligned = Timestamp::from_wall(15_000_000_000);
        assert_eq!(aligned.quantize(g), aligned);
        assert_eq!(t.quantize(Duration::ZERO), t);
    }

    #[test]
    fn display() {
        assert_eq!(Timestamp::new(1_500_000_000, 3).to_string(), "1.500000000,3");
    }

    #[test]
    fn elapsed() {
        let t = Timestamp::from_wall(1_000);
        assert_eq!(t.elapsed_at(Timestamp::from_wall(3_000)), Duration::from_nanos(2_000));
        assert_eq!(t.elapsed_at(Timestamp::from_wall(500)), Duration::ZERO);
    }
}
