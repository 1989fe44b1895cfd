use std::sync::Arc;
use std::time::Duration;

use convo_core::ConversationRecord;
use serde::Serialize;

use super::coverage::CoverageSpan;
use super::engine::{SyncEngine, ensure_stream};
use super::range::TimeRange;
use super::store::SearchFilters;
use super::{SyncError, now_unix};

/// How current the records in a [`QueryResult`] are.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Freshness {
    /// Oldest verification time among the spans served.
    pub as_of: Option<i64>,
    /// A sync touching the requested range is still running.
    pub syncing: bool,
    /// Part of the range was missing or past its max age when read.
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QueryResult {
    pub records: Vec<ConversationRecord>,
    pub freshness: Freshness,
}

/// Read path in front of the store: answers from covered data, blocks only
/// when nothing in the range has ever been synced.
#[derive(Clone)]
pub struct QueryDispatcher {
    engine: Arc<SyncEngine>,
    wait_timeout: Duration,
}

impl QueryDispatcher {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let wait_timeout = engine.config().sync_wait;
        Self {
            engine,
            wait_timeout,
        }
    }

    pub fn with_wait_timeout(mut self, wait_timeout: Duration) -> Self {
        self.wait_timeout = wait_timeout;
        self
    }

    pub fn engine(&self) -> &Arc<SyncEngine> {
        &self.engine
    }

    pub async fn query(
        &self,
        stream_id: &str,
        range: TimeRange,
        filters: &SearchFilters,
        limit: u32,
    ) -> Result<QueryResult, SyncError> {
        ensure_stream(stream_id)?;
        let now = now_unix();
        let Some(range) = range.clamp_end(now) else {
            return Ok(QueryResult {
                records: Vec::new(),
                freshness: Freshness::default(),
            });
        };
        let coverage = self.engine.coverage();
        let snapshot = coverage.snapshot(stream_id).await;
        let covered = snapshot.overlapping(range);

        if covered.is_empty() {
            return self.query_blocking(stream_id, range, filters, limit).await;
        }

        let gaps = coverage.policy().gaps(&snapshot, stream_id, range, now);
        let mut freshness = Freshness {
            as_of: covered.iter().map(|span| span.verified_at).min(),
            ..Freshness::default()
        };
        if !gaps.is_empty() {
            freshness.stale = true;
            freshness.syncing = !self
                .engine
                .refresh_in_background(stream_id, range)
                .await
                .is_empty();
            freshness.last_error = self.engine.last_error(stream_id);
        }
        let records = self.read_covered(&covered, filters, limit).await?;
        Ok(QueryResult { records, freshness })
    }

    async fn query_blocking(
        &self,
        stream_id: &str,
        range: TimeRange,
        filters: &SearchFilters,
        limit: u32,
    ) -> Result<QueryResult, SyncError> {
        tracing::debug!(stream = stream_id, %range, "no coverage, waiting for sync");
        let outcome = self
            .engine
            .sync(stream_id, range, false, self.wait_timeout)
            .await;

        match outcome {
            Ok(_) => {}
            Err(SyncError::SyncTimeout(waited)) => {
                // Pages committed so far are real data even without coverage.
                tracing::debug!(stream = stream_id, %range, waited_ms = waited.as_millis() as u64, "sync still running, serving partial data");
                let records = self.engine.store().search(range, filters, limit).await?;
                return Ok(QueryResult {
                    records,
                    freshness: Freshness {
                        as_of: None,
                        syncing: true,
                        stale: true,
                        last_error: None,
                    },
                });
            }
            Err(err) => {
                let covered = self
                    .engine
                    .coverage()
                    .snapshot(stream_id)
                    .await
                    .overlapping(range);
                if covered.is_empty() {
                    tracing::error!(stream = stream_id, %range, error = %err, "query failed with no cached data");
                    return Err(err);
                }
                let records = self.read_covered(&covered, filters, limit).await?;
                return Ok(QueryResult {
                    records,
                    freshness: Freshness {
                        as_of: covered.iter().map(|span| span.verified_at).min(),
                        syncing: false,
                        stale: true,
                        last_error: Some(err.to_string()),
                    },
                });
            }
        }

        let now = now_unix();
        let coverage = self.engine.coverage();
        let snapshot = coverage.snapshot(stream_id).await;
        let covered = snapshot.overlapping(range);
        let remaining = coverage.policy().gaps(&snapshot, stream_id, range, now);
        let mut freshness = Freshness {
            as_of: covered.iter().map(|span| span.verified_at).min(),
            ..Freshness::default()
        };
        // A truncated job leaves the tail for a follow-up.
        if !remaining.is_empty() {
            freshness.stale = true;
            freshness.syncing = !self
                .engine
                .refresh_in_background(stream_id, range)
                .await
                .is_empty();
        }
        let records = self.read_covered(&covered, filters, limit).await?;
        Ok(QueryResult { records, freshness })
    }

    /// Point lookup; falls back to a remote fetch when the record is absent.
    pub async fn get_by_id(&self, id: &str) -> Result<Option<ConversationRecord>, SyncError> {
        if let Some(record) = self.engine.store().get(id).await? {
            return Ok(Some(record));
        }
        self.engine.fetch_point(id).await
    }

    async fn read_covered(
        &self,
        covered: &[CoverageSpan],
        filters: &SearchFilters,
        limit: u32,
    ) -> Result<Vec<ConversationRecord>, SyncError> {
        let mut records = Vec::new();
        // Spans are disjoint in time, so no record is read twice.
        for span in covered {
            records.extend(self.engine.store().search(span.range, filters, limit).await?);
        }
        records.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| a.id.cmp(&b.id)));
        records.truncate(limit as usize);
        Ok(records)
    }
}
