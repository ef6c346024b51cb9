//! Request id ranges
//!
//! Preview, recording and still-capture requests each draw their ids from a
//! disjoint range so that a result frame can be routed by id alone. Counters
//! wrap back to the start of their range once they reach the end.

use crate::assert_invariant;

/// Half-open id range `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestIdRange {
    pub start: i32,
    pub end: i32,
}

pub const PREVIEW_REQUEST_IDS: RequestIdRange = RequestIdRange {
    start: 10_000_000,
    end: 20_000_000,
};

pub const RECORDING_REQUEST_IDS: RequestIdRange = RequestIdRange {
    start: 20_000_000,
    end: 30_000_000,
};

pub const CAPTURE_REQUEST_IDS: RequestIdRange = RequestIdRange {
    start: 30_000_000,
    end: 40_000_000,
};

impl RequestIdRange {
    pub const fn new(start: i32, end: i32) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, id: i32) -> bool {
        id >= self.start && id < self.end
    }

    pub fn overlaps(&self, other: &RequestIdRange) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// The id following `id`, wrapping to `start` at the boundary.
    pub fn next_after(&self, id: i32) -> i32 {
        let next = id.saturating_add(1);
        if next >= self.end {
            self.start
        } else {
            next
        }
    }
}

/// A wrapping counter confined to one [`RequestIdRange`].
#[derive(Debug, Clone)]
pub struct RequestIdCounter {
    range: RequestIdRange,
    current: i32,
}

impl RequestIdCounter {
    pub fn new(range: RequestIdRange) -> Self {
        Self {
            range,
            current: range.start,
        }
    }

    pub fn current(&self) -> i32 {
        self.current
    }

    pub fn range(&self) -> RequestIdRange {
        self.range
    }

    /// Move to the next id and return it.
    pub fn advance(&mut self) -> i32 {
        self.current = self.range.next_after(self.current);
        assert_invariant!(
            self.range.contains(self.current),
            "Request id stays inside its reserved range",
            "RequestIdCounter::advance"
        );
        self.current
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ranges_are_disjoint() {
        assert!(!PREVIEW_REQUEST_IDS.overlaps(&RECORDING_REQUEST_IDS));
        assert!(!PREVIEW_REQUEST_IDS.overlaps(&CAPTURE_REQUEST_IDS));
        assert!(!RECORDING_REQUEST_IDS.overlaps(&CAPTURE_REQUEST_IDS));
    }

    #[test]
    fn test_counter_wraps_at_end() {
        let mut counter = RequestIdCounter::new(RequestIdRange::new(5, 8));
        assert_eq!(counter.current(), 5);
        assert_eq!(counter.advance(), 6);
        assert_eq!(counter.advance(), 7);
        assert_eq!(counter.advance(), 5);
    }

    #[test]
    fn test_contains_is_half_open() {
        assert!(CAPTURE_REQUEST_IDS.contains(30_000_000));
        assert!(!CAPTURE_REQUEST_IDS.contains(40_000_000));
        assert!(!CAPTURE_REQUEST_IDS.contains(0));
    }
}
