//! Sensor timing utilities
//!
//! Monotonic clock producing nanosecond sensor timestamps.

use std::sync::Arc;
use std::time::{Duration, Instant};

/// Monotonic clock for sensor timestamps
///
/// Buffers and result frames stamped from the same clock can be matched by
/// timestamp, which is what the ZSL queue relies on.
#[derive(Debug, Clone)]
pub struct SensorClock {
    start: Arc<Instant>,
}

impl SensorClock {
    /// Create a new clock with the current instant as time zero
    pub fn new() -> Self {
        Self {
            start: Arc::new(Instant::now()),
        }
    }

    /// Create a clock from an existing start instant
    ///
    /// Use this to share the same timebase between components.
    pub fn from_instant(start: Instant) -> Self {
        Self {
            start: Arc::new(start),
        }
    }

    /// Nanoseconds elapsed since the clock was created
    #[inline]
    pub fn now_ns(&self) -> i64 {
        i64::try_from(self.start.elapsed().as_nanos()).unwrap_or(i64::MAX)
    }

    /// Timestamp for a given instant
    ///
    /// Instants before the clock start map to zero.
    #[inline]
    pub fn timestamp_at(&self, instant: Instant) -> i64 {
        let elapsed = instant.saturating_duration_since(*self.start);
        i64::try_from(elapsed.as_nanos()).unwrap_or(i64::MAX)
    }

    /// Get the start instant for sharing with other components
    pub fn start_instant(&self) -> Instant {
        *self.start
    }
}

impl Default for SensorClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Remaining time until `deadline`, or `None` once it has passed.
pub fn remaining(deadline: Instant) -> Option<Duration> {
    let now = Instant::now();
    if now >= deadline {
        None
    } else {
        Some(deadline - now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clock_is_monotonic() {
        let clock = SensorClock::new();
        let a = clock.now_ns();
        std::thread::sleep(Duration::from_millis(1));
        let b = clock.now_ns();
        assert!(b > a);
    }

    #[test]
    fn test_shared_timebase() {
        let clock = SensorClock::new();
        let shared = SensorClock::from_instant(clock.start_instant());
        let instant = Instant::now();
        assert_eq!(clock.timestamp_at(instant), shared.timestamp_at(instant));
    }

    #[test]
    fn test_remaining_expires() {
        assert!(remaining(Instant::now()).is_none());
        assert!(remaining(Instant::now() + Duration::from_secs(5)).is_some());
    }
}
