//! Bookkeeping of which time ranges of each stream are known to be synced.
//!
//! A [`CoverageSet`] keeps disjoint spans in a `BTreeMap` keyed by start. Each
//! span carries the time it was last verified against the remote. Marking a
//! range merges it with touching spans whose `verified_at` lies within the
//! merge tolerance; where verification times disagree the overlap takes the
//! newer one and the rest keeps its own, so spans are split rather than
//! blurred.
//!
//! Gap computation treats a span verified before `now - max_age` as absent.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};

use super::range::TimeRange;
use super::store::{Store, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CoverageSpan {
    pub range: TimeRange,
    pub verified_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Entry {
    end: i64,
    verified_at: i64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CoverageSet {
    spans: BTreeMap<i64, Entry>,
}

impl CoverageSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds a set from possibly unnormalised spans.
    pub fn from_spans(spans: impl IntoIterator<Item = CoverageSpan>, tolerance: i64) -> Self {
        let mut set = Self::new();
        for span in spans {
            set.mark(span.range, span.verified_at, tolerance);
        }
        set
    }

    pub fn is_empty(&self) -> bool {
        self.spans.is_empty()
    }

    pub fn len(&self) -> usize {
        self.spans.len()
    }

    pub fn spans(&self) -> impl Iterator<Item = CoverageSpan> + '_ {
        self.spans.iter().map(|(start, entry)| CoverageSpan {
            range: TimeRange::between(*start, entry.end),
            verified_at: entry.verified_at,
        })
    }

    pub fn last_verified_at(&self) -> Option<i64> {
        self.spans.values().map(|entry| entry.verified_at).max()
    }

    /// Spans intersecting `range`, clipped to it.
    pub fn overlapping(&self, range: TimeRange) -> Vec<CoverageSpan> {
        self.spans
            .range(..=range.end())
            .filter(|(_, entry)| entry.end >= range.start())
            .filter_map(|(start, entry)| {
                TimeRange::between(*start, entry.end)
                    .intersect(&range)
                    .map(|clipped| CoverageSpan {
                        range: clipped,
                        verified_at: entry.verified_at,
                    })
            })
            .collect()
    }

    /// Sub-ranges of `range` not covered by a span verified at or after
    /// `fresh_since`. Gaps are sorted, disjoint and never empty.
    ///
    /// With `live_slack`, a span verified at most that many seconds after its
    /// own end reached the present when it was synced and covers the rest of
    /// `range`.
    pub fn gaps(
        &self,
        range: TimeRange,
        fresh_since: i64,
        live_slack: Option<i64>,
    ) -> Vec<TimeRange> {
        let mut out = Vec::new();
        let mut cursor = Some(range.start());
        for (start, entry) in self.spans.range(..=range.end()) {
            if entry.verified_at < fresh_since {
                continue;
            }
            let Some(from) = cursor else {
                break;
            };
            let live = live_slack.is_some_and(|slack| {
                entry.verified_at >= entry.end && entry.verified_at - entry.end <= slack
            });
            let end = if live {
                entry.end.max(range.end())
            } else {
                entry.end
            };
            if end < from {
                continue;
            }
            if from < *start {
                out.push(TimeRange::between(from, start - 1));
            }
            cursor = end.checked_add(1);
        }
        if let Some(from) = cursor
            && from <= range.end()
        {
            out.push(TimeRange::between(from, range.end()));
        }
        out
    }

    pub fn mark(&mut self, range: TimeRange, verified_at: i64, tolerance: i64) {
        let lo = range.start().saturating_sub(1);
        let hi = range.end().saturating_add(1);
        let mut affected: Vec<CoverageSpan> = self
            .spans
            .range(..=hi)
            .rev()
            .take_while(|(_, entry)| entry.end >= lo)
            .map(|(start, entry)| CoverageSpan {
                range: TimeRange::between(*start, entry.end),
                verified_at: entry.verified_at,
            })
            .collect();
        affected.reverse();
        for span in &affected {
            self.spans.remove(&span.range.start());
        }

        let mut pieces = Vec::with_capacity(affected.len() * 2 + 1);
        let mut cursor = Some(range.start());
        let mut tail = None;
        for old in &affected {
            if old.range.start() < range.start() {
                pieces.push(CoverageSpan {
                    range: TimeRange::between(
                        old.range.start(),
                        old.range.end().min(range.start() - 1),
                    ),
                    verified_at: old.verified_at,
                });
            }
            if let Some(inner) = old.range.intersect(&range) {
                if let Some(from) = cursor
                    && from < inner.start()
                {
                    pieces.push(CoverageSpan {
                        range: TimeRange::between(from, inner.start() - 1),
                        verified_at,
                    });
                }
                pieces.push(CoverageSpan {
                    range: inner,
                    verified_at: verified_at.max(old.verified_at),
                });
                cursor = inner.end().checked_add(1);
            }
            if old.range.end() > range.end() {
                tail = Some(CoverageSpan {
                    range: TimeRange::between(
                        old.range.start().max(range.end() + 1),
                        old.range.end(),
                    ),
                    verified_at: old.verified_at,
                });
            }
        }
        if let Some(from) = cursor
            && from <= range.end()
        {
            pieces.push(CoverageSpan {
                range: TimeRange::between(from, range.end()),
                verified_at,
            });
        }
        pieces.extend(tail);

        let mut merged: Vec<CoverageSpan> = Vec::with_capacity(pieces.len());
        for piece in pieces {
            if let Some(last) = merged.last_mut()
                && last.range.touches(&piece.range)
                && last.verified_at.abs_diff(piece.verified_at) <= tolerance.unsigned_abs()
            {
                last.range = last.range.span(&piece.range);
                last.verified_at = last.verified_at.min(piece.verified_at);
                continue;
            }
            merged.push(piece);
        }
        for span in merged {
            self.spans.insert(
                span.range.start(),
                Entry {
                    end: span.range.end(),
                    verified_at: span.verified_at,
                },
            );
        }
    }
}

#[derive(Debug, Clone)]
pub struct CoveragePolicy {
    pub default_max_age: Duration,
    pub stream_max_age: HashMap<String, Duration>,
    pub merge_tolerance: Duration,
}

impl CoveragePolicy {
    pub fn max_age(&self, stream_id: &str) -> Duration {
        self.stream_max_age
            .get(stream_id)
            .copied()
            .unwrap_or(self.default_max_age)
    }

    /// Earliest `verified_at` still considered fresh at `now`.
    pub fn fresh_since(&self, stream_id: &str, now: i64) -> i64 {
        now.saturating_sub(secs(self.max_age(stream_id)))
    }

    /// Missing or stale parts of `range` in `set` at `now`.
    pub fn gaps(
        &self,
        set: &CoverageSet,
        stream_id: &str,
        range: TimeRange,
        now: i64,
    ) -> Vec<TimeRange> {
        set.gaps(
            range,
            self.fresh_since(stream_id, now),
            Some(self.tolerance_secs()),
        )
    }

    fn tolerance_secs(&self) -> i64 {
        secs(self.merge_tolerance)
    }
}

fn secs(duration: Duration) -> i64 {
    i64::try_from(duration.as_secs()).unwrap_or(i64::MAX)
}

#[derive(Default)]
struct StreamCoverage {
    writer: Mutex<()>,
    current: RwLock<Arc<CoverageSet>>,
}

/// Per-stream coverage backed by the store.
///
/// Writers for one stream are serialised; readers take an `Arc` snapshot and
/// never observe a half-applied merge.
pub struct CoverageTracker {
    store: Store,
    policy: CoveragePolicy,
    streams: DashMap<String, Arc<StreamCoverage>>,
}

impl CoverageTracker {
    pub async fn load(store: Store, policy: CoveragePolicy) -> Result<Self, StoreError> {
        let tracker = Self {
            store,
            policy,
            streams: DashMap::new(),
        };
        for stream_id in tracker.store.coverage_streams().await? {
            let spans = tracker.store.load_coverage(&stream_id).await?;
            let set = CoverageSet::from_spans(spans, tracker.policy.tolerance_secs());
            tracing::debug!(stream = %stream_id, spans = set.len(), "coverage loaded");
            tracker.streams.insert(
                stream_id,
                Arc::new(StreamCoverage {
                    writer: Mutex::new(()),
                    current: RwLock::new(Arc::new(set)),
                }),
            );
        }
        Ok(tracker)
    }

    pub fn policy(&self) -> &CoveragePolicy {
        &self.policy
    }

    pub fn stream_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.streams.iter().map(|entry| entry.key().clone()).collect();
        ids.sort();
        ids
    }

    pub async fn snapshot(&self, stream_id: &str) -> Arc<CoverageSet> {
        let Some(slot) = self
            .streams
            .get(stream_id)
            .map(|entry| Arc::clone(entry.value()))
        else {
            return Arc::default();
        };
        let current = slot.current.read().await;
        Arc::clone(&current)
    }

    /// Parts of `range` that are missing or stale at `now`.
    pub async fn uncovered(&self, stream_id: &str, range: TimeRange, now: i64) -> Vec<TimeRange> {
        let snapshot = self.snapshot(stream_id).await;
        self.policy.gaps(&snapshot, stream_id, range, now)
    }

    /// Records `range` as synced at `verified_at`, persisting before publishing.
    pub async fn mark_covered(
        &self,
        stream_id: &str,
        range: TimeRange,
        verified_at: i64,
    ) -> Result<(), StoreError> {
        let slot = self.slot(stream_id);
        let _writer = slot.writer.lock().await;
        let current = Arc::clone(&*slot.current.read().await);
        let mut next = CoverageSet::clone(&current);
        next.mark(range, verified_at, self.policy.tolerance_secs());

        let spans: Vec<CoverageSpan> = next.spans().collect();
        self.store.replace_coverage(stream_id, &spans).await?;
        *slot.current.write().await = Arc::new(next);
        tracing::debug!(stream = stream_id, %range, verified_at, spans = spans.len(), "coverage marked");
        Ok(())
    }

    fn slot(&self, stream_id: &str) -> Arc<StreamCoverage> {
        if let Some(slot) = self.streams.get(stream_id) {
            return Arc::clone(slot.value());
        }
        Arc::clone(
            self.streams
                .entry(stream_id.to_string())
                .or_default()
                .value(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::new(start, end).unwrap()
    }

    fn spans(set: &CoverageSet) -> Vec<(i64, i64, i64)> {
        set.spans()
            .map(|span| (span.range.start(), span.range.end(), span.verified_at))
            .collect()
    }

    #[test]
    fn adjacent_compatible_spans_merge() {
        let mut set = CoverageSet::new();
        set.mark(range(0, 9), 100, 5);
        set.mark(range(10, 19), 103, 5);
        assert_eq!(spans(&set), vec![(0, 19, 100)]);
    }

    #[test]
    fn incompatible_spans_stay_split() {
        let mut set = CoverageSet::new();
        set.mark(range(0, 9), 100, 5);
        set.mark(range(10, 19), 500, 5);
        assert_eq!(spans(&set), vec![(0, 9, 100), (10, 19, 500)]);
    }

    #[test]
    fn newer_verification_takes_over_the_overlap() {
        let mut set = CoverageSet::new();
        set.mark(range(0, 100), 100, 5);
        set.mark(range(40, 60), 900, 5);
        assert_eq!(
            spans(&set),
            vec![(0, 39, 100), (40, 60, 900), (61, 100, 100)]
        );

        // An older verification does not downgrade what is already fresher.
        set.mark(range(30, 70), 50, 5);
        assert_eq!(
            spans(&set),
            vec![(0, 39, 100), (40, 60, 900), (61, 100, 100)]
        );
    }

    #[test]
    fn bridging_range_joins_neighbours() {
        let mut set = CoverageSet::new();
        set.mark(range(0, 10), 100, 5);
        set.mark(range(20, 30), 100, 5);
        set.mark(range(11, 19), 101, 5);
        assert_eq!(spans(&set), vec![(0, 30, 100)]);
    }

    #[test]
    fn gaps_report_holes_and_stale_spans() {
        let mut set = CoverageSet::new();
        set.mark(range(10, 19), 1_000, 0);
        set.mark(range(30, 39), 10, 0);

        assert_eq!(
            set.gaps(range(0, 49), 500, None),
            vec![range(0, 9), range(20, 49)]
        );
        assert_eq!(
            set.gaps(range(0, 49), 0, None),
            vec![range(0, 9), range(20, 29), range(40, 49)]
        );
        assert_eq!(set.gaps(range(12, 15), 500, None), Vec::new());
    }

    #[test]
    fn synced_range_has_no_gaps_until_max_age_passes() {
        let policy = CoveragePolicy {
            default_max_age: Duration::from_secs(60),
            stream_max_age: HashMap::new(),
            merge_tolerance: Duration::from_secs(5),
        };
        let mut set = CoverageSet::new();
        set.mark(range(1_000, 2_000), 5_000, 5);

        let fresh = policy.fresh_since("conversations", 5_060);
        assert!(set.gaps(range(1_000, 2_000), fresh, None).is_empty());

        let expired = policy.fresh_since("conversations", 5_061);
        assert_eq!(
            set.gaps(range(1_000, 2_000), expired, None),
            vec![range(1_000, 2_000)]
        );
    }

    #[test]
    fn span_synced_up_to_the_present_covers_the_tail() {
        let policy = CoveragePolicy {
            default_max_age: Duration::from_secs(900),
            stream_max_age: HashMap::new(),
            merge_tolerance: Duration::from_secs(60),
        };
        let mut set = CoverageSet::new();
        set.mark(range(1_000, 5_000), 5_010, 60);

        assert!(policy.gaps(&set, "conversations", range(2_000, 5_300), 5_300).is_empty());
        assert_eq!(
            set.gaps(range(2_000, 5_300), 0, None),
            vec![range(5_001, 5_300)]
        );

        // A historical span verified long after its end does not reach the present.
        let mut old = CoverageSet::new();
        old.mark(range(1_000, 2_000), 5_000, 60);
        assert_eq!(
            policy.gaps(&old, "conversations", range(1_000, 3_000), 5_100),
            vec![range(2_001, 3_000)]
        );
    }

    #[test]
    fn merged_span_ages_from_its_oldest_part() {
        let policy = CoveragePolicy {
            default_max_age: Duration::from_secs(100),
            stream_max_age: HashMap::new(),
            merge_tolerance: Duration::from_secs(10),
        };
        let mut set = CoverageSet::new();
        set.mark(range(0, 9), 1_000, 10);
        set.mark(range(10, 19), 1_010, 10);
        assert_eq!(spans(&set), vec![(0, 19, 1_000)]);

        // The later half expires with the earlier one, at most the tolerance early.
        assert!(policy.gaps(&set, "conversations", range(10, 19), 1_100).is_empty());
        assert_eq!(
            policy.gaps(&set, "conversations", range(10, 19), 1_101),
            vec![range(10, 19)]
        );
    }

    #[test]
    fn per_stream_max_age_overrides_default() {
        let policy = CoveragePolicy {
            default_max_age: Duration::from_secs(60),
            stream_max_age: HashMap::from([("articles".to_string(), Duration::from_secs(3_600))]),
            merge_tolerance: Duration::ZERO,
        };
        assert_eq!(policy.max_age("articles"), Duration::from_secs(3_600));
        assert_eq!(policy.max_age("conversations"), Duration::from_secs(60));
    }

    #[test]
    fn random_marks_keep_spans_disjoint_and_sorted() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let mut set = CoverageSet::new();
            let mut marked = Vec::new();
            for _ in 0..rng.gen_range(1..30) {
                let start = rng.gen_range(0..500);
                let end = start + rng.gen_range(0..60);
                let verified_at = rng.gen_range(0..50);
                set.mark(range(start, end), verified_at, rng.gen_range(0..5));
                marked.push(range(start, end));
            }

            let all: Vec<CoverageSpan> = set.spans().collect();
            for pair in all.windows(2) {
                assert!(pair[0].range.end() < pair[1].range.start());
            }
            for marked in marked {
                assert!(set.gaps(marked, i64::MIN, None).is_empty());
            }
        }
    }

    #[test]
    fn gaps_never_overlap_or_go_empty() {
        let mut rng = StdRng::seed_from_u64(11);
        let mut set = CoverageSet::new();
        for _ in 0..40 {
            let start = rng.gen_range(0..1_000);
            set.mark(range(start, start + rng.gen_range(0..40)), rng.gen_range(0..10), 1);
        }
        for _ in 0..100 {
            let start = rng.gen_range(0..1_000);
            let request = range(start, start + rng.gen_range(1..200));
            let gaps = set.gaps(request, 5, Some(rng.gen_range(0..3)));
            for gap in &gaps {
                assert!(request.contains(gap));
                assert!(gap.start() <= gap.end());
            }
            for pair in gaps.windows(2) {
                assert!(pair[0].end() < pair[1].start());
            }
        }
    }
}
