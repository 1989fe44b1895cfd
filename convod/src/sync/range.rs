use std::fmt;

use serde::Serialize;

use super::SyncError;

/// Closed range of unix seconds; both ends are included and `start <= end`.
///
/// Ranges are discrete: `[a, b]` and `[b + 1, c]` are adjacent and never share
/// a second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct TimeRange {
    start: i64,
    end: i64,
}

impl TimeRange {
    pub fn new(start: i64, end: i64) -> Result<Self, SyncError> {
        if start > end {
            return Err(SyncError::InvalidInterval(format!(
                "start {start} is after end {end}"
            )));
        }
        Ok(Self { start, end })
    }

    pub(crate) fn between(start: i64, end: i64) -> Self {
        debug_assert!(start <= end, "inverted range [{start}, {end}]");
        Self { start, end }
    }

    /// Validates a caller-supplied range.
    ///
    /// A zero-width request (`start == end`) is rejected; an inverted one is
    /// empty and yields `None`.
    pub fn request(start: i64, end: i64) -> Result<Option<Self>, SyncError> {
        if start == end {
            return Err(SyncError::InvalidInterval(format!(
                "zero-width interval at {start}"
            )));
        }
        if start > end {
            return Ok(None);
        }
        Ok(Some(Self { start, end }))
    }

    pub fn start(&self) -> i64 {
        self.start
    }

    pub fn end(&self) -> i64 {
        self.end
    }

    pub fn contains(&self, other: &TimeRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn contains_point(&self, at: i64) -> bool {
        self.start <= at && at <= self.end
    }

    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start <= other.end && other.start <= self.end
    }

    /// Overlapping or directly adjacent.
    pub fn touches(&self, other: &TimeRange) -> bool {
        self.start <= other.end.saturating_add(1) && other.start <= self.end.saturating_add(1)
    }

    pub fn intersect(&self, other: &TimeRange) -> Option<TimeRange> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start <= end).then_some(TimeRange { start, end })
    }

    /// Smallest range containing both; only meaningful when they touch.
    pub fn span(&self, other: &TimeRange) -> TimeRange {
        TimeRange {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    /// Parts of `self` not inside `other`, in order.
    pub fn subtract(&self, other: &TimeRange) -> Vec<TimeRange> {
        let Some(overlap) = self.intersect(other) else {
            return vec![*self];
        };
        let mut out = Vec::with_capacity(2);
        if self.start < overlap.start {
            out.push(TimeRange {
                start: self.start,
                end: overlap.start - 1,
            });
        }
        if overlap.end < self.end {
            out.push(TimeRange {
                start: overlap.end + 1,
                end: self.end,
            });
        }
        out
    }

    /// Drops everything after `limit`.
    pub fn clamp_end(&self, limit: i64) -> Option<TimeRange> {
        (self.start <= limit).then(|| TimeRange {
            start: self.start,
            end: self.end.min(limit),
        })
    }
}

impl fmt::Display for TimeRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::new(start, end).unwrap()
    }

    #[test]
    fn request_rejects_zero_width_and_empties_inverted() {
        assert!(matches!(
            TimeRange::request(5, 5),
            Err(SyncError::InvalidInterval(_))
        ));
        assert_eq!(TimeRange::request(9, 5).unwrap(), None);
        assert_eq!(TimeRange::request(1, 5).unwrap(), Some(range(1, 5)));
    }

    #[test]
    fn adjacency_counts_as_touching() {
        assert!(range(1, 4).touches(&range(5, 9)));
        assert!(!range(1, 4).overlaps(&range(5, 9)));
        assert!(!range(1, 4).touches(&range(6, 9)));
    }

    #[test]
    fn subtract_splits_around_the_hole() {
        assert_eq!(
            range(0, 10).subtract(&range(3, 5)),
            vec![range(0, 2), range(6, 10)]
        );
        assert_eq!(range(0, 10).subtract(&range(0, 10)), Vec::new());
        assert_eq!(range(0, 10).subtract(&range(20, 30)), vec![range(0, 10)]);
    }

    #[test]
    fn clamp_end_drops_future() {
        assert_eq!(range(0, 100).clamp_end(40), Some(range(0, 40)));
        assert_eq!(range(50, 100).clamp_end(40), None);
    }
}
