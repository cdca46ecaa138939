use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt::{Display, Formatter};
use std::ops::{Add, Sub};
use std::time::{Duration, SystemTime};

/// A Unix timestamp in milliseconds, used for proposal ages, claim retry
/// deadlines, and sub-channel bookkeeping.
///
/// Millisecond resolution matches the rest of the wire protocol: pending
/// proposal TTLs and claim backoff delays are both configured in milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TimestampMs(pub u64);

impl TimestampMs {
    /// Current wall-clock time. Falls back to the epoch if the system clock
    /// reports a time before 1970, rather than failing the request path.
    pub fn now() -> Self {
        let millis = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        TimestampMs(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed from `earlier` to `self`, saturating at zero.
    pub fn saturating_elapsed_since(&self, earlier: TimestampMs) -> u64 {
        self.0.saturating_sub(earlier.0)
    }
}

impl Add<Duration> for TimestampMs {
    type Output = Self;

    fn add(self, rhs: Duration) -> Self::Output {
        TimestampMs(self.0.saturating_add(rhs.as_millis() as u64))
    }
}

impl Sub<TimestampMs> for TimestampMs {
    type Output = Duration;

    fn sub(self, rhs: TimestampMs) -> Self::Output {
        Duration::from_millis(self.0.saturating_sub(rhs.0))
    }
}

impl Display for TimestampMs {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Serialize for TimestampMs {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for TimestampMs {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(TimestampMs(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_elapsed_saturates() {
        let earlier = TimestampMs(1_000);
        let later = TimestampMs(4_500);
        assert_eq!(later.saturating_elapsed_since(earlier), 3_500);
        assert_eq!(earlier.saturating_elapsed_since(later), 0);
    }

    #[test]
    fn test_add_duration() {
        let t = TimestampMs(10);
        assert_eq!(t + Duration::from_millis(90), TimestampMs(100));
    }
}
