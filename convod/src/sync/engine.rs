use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use convo_core::{ConversationRecord, ConvoClient};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

use super::coverage::{CoverageSpan, CoverageTracker};
use super::fetch::FetchClient;
use super::job::{JobId, JobOutcome, JobRegistry, JobReport, JobSnapshot, SyncTicket};
use super::range::TimeRange;
use super::rate_limit::TokenBucket;
use super::store::Store;
use super::{CONVERSATIONS, SyncError, now_unix};
use crate::config::EngineConfig;

#[derive(Default)]
struct EngineMetrics {
    jobs_started: AtomicU64,
    jobs_coalesced: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_truncated: AtomicU64,
    pages_fetched: AtomicU64,
    records_applied: AtomicU64,
    records_skipped: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub jobs_started: u64,
    pub jobs_coalesced: u64,
    pub jobs_failed: u64,
    pub jobs_truncated: u64,
    pub pages_fetched: u64,
    pub records_applied: u64,
    pub records_skipped: u64,
    pub remote_calls: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StreamStatus {
    pub covered_ranges: Vec<CoverageSpan>,
    pub last_verified_at: Option<i64>,
    pub active_jobs: Vec<JobSnapshot>,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineStatus {
    pub streams: BTreeMap<String, StreamStatus>,
    pub metrics: MetricsSnapshot,
}

/// Pagination state of one running job.
#[derive(Default)]
struct Progress {
    pages: u64,
    records: u64,
    max_seen_updated_at: Option<i64>,
    truncated: bool,
}

impl Progress {
    /// Span confirmed by the pages committed so far. Records sharing the last
    /// seen second may still sit on the next page, so that second is excluded.
    fn confirmed_prefix(&self, range: TimeRange) -> Option<TimeRange> {
        let last = self.max_seen_updated_at?.checked_sub(1)?;
        range.clamp_end(last)
    }
}

/// Owns coverage, the active-job registries, the fetch client and the worker
/// pool. Construct one per store; nothing here is global.
pub struct SyncEngine {
    config: EngineConfig,
    store: Store,
    coverage: CoverageTracker,
    fetch: FetchClient,
    registries: DashMap<String, Arc<Mutex<JobRegistry>>>,
    workers: Arc<Semaphore>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
    next_job_id: AtomicU64,
    metrics: EngineMetrics,
    last_errors: DashMap<String, String>,
    point_attempts: DashMap<String, Instant>,
}

impl SyncEngine {
    /// Loads persisted coverage and builds the engine around `api`.
    pub async fn open(
        config: EngineConfig,
        store: Store,
        api: ConvoClient,
    ) -> Result<Arc<Self>, SyncError> {
        let coverage = CoverageTracker::load(store.clone(), config.coverage_policy()).await?;
        let fetch = FetchClient::new(
            api,
            TokenBucket::new(config.rate_limit()),
            config.retry_policy(),
            config.page_size,
        );
        tracing::info!(
            streams = coverage.stream_ids().len(),
            workers = config.workers,
            "sync engine ready"
        );
        Ok(Arc::new(Self {
            workers: Arc::new(Semaphore::new(config.workers.max(1))),
            config,
            store,
            coverage,
            fetch,
            registries: DashMap::new(),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
            next_job_id: AtomicU64::new(1),
            metrics: EngineMetrics::default(),
            last_errors: DashMap::new(),
            point_attempts: DashMap::new(),
        }))
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn coverage(&self) -> &CoverageTracker {
        &self.coverage
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Starts or joins the work needed to make `range` fresh and returns
    /// without waiting. With `force`, fresh spans are re-verified too.
    pub async fn request_sync(
        self: &Arc<Self>,
        stream_id: &str,
        range: TimeRange,
        force: bool,
    ) -> Result<SyncTicket, SyncError> {
        ensure_stream(stream_id)?;
        if self.shutdown.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        let now = now_unix();
        let Some(range) = range.clamp_end(now) else {
            return Ok(SyncTicket::new(stream_id, Vec::new(), Vec::new()));
        };

        let registry = self.registry(stream_id);
        let mut registry = registry.lock().await;
        let gaps = if force {
            vec![range]
        } else {
            self.coverage.uncovered(stream_id, range, now).await
        };
        let mut waiters = Vec::new();
        let mut created = Vec::new();
        for gap in &gaps {
            let plan = registry.plan(stream_id, *gap, now, || {
                self.next_job_id.fetch_add(1, Ordering::Relaxed)
            });
            self.metrics
                .jobs_coalesced
                .fetch_add(plan.coalesced as u64, Ordering::Relaxed);
            waiters.extend(plan.waiters);
            created.extend(plan.created);
        }
        drop(registry);

        if !gaps.is_empty() {
            tracing::debug!(
                stream = stream_id,
                %range,
                gaps = gaps.len(),
                created = created.len(),
                force,
                "sync requested"
            );
        }
        for job_id in created {
            self.spawn_job(stream_id, job_id);
        }
        Ok(SyncTicket::new(stream_id, gaps, waiters))
    }

    /// Foreground sync: waits up to `timeout` for every job involved.
    pub async fn sync(
        self: &Arc<Self>,
        stream_id: &str,
        range: TimeRange,
        force: bool,
        timeout: Duration,
    ) -> Result<Vec<JobReport>, SyncError> {
        self.request_sync(stream_id, range, force)
            .await?
            .wait(timeout)
            .await
    }

    /// Fire-and-forget refresh; failures surface through job logging and
    /// [`SyncEngine::last_error`].
    pub async fn refresh_in_background(
        self: &Arc<Self>,
        stream_id: &str,
        range: TimeRange,
    ) -> Vec<JobId> {
        match self.request_sync(stream_id, range, false).await {
            Ok(ticket) => ticket.job_ids(),
            Err(err) => {
                tracing::warn!(stream = stream_id, %range, error = %err, "background refresh not started");
                Vec::new()
            }
        }
    }

    /// Requeues stale covered spans of every hot stream within the sweep
    /// lookback. Missing ranges are left to queries.
    pub async fn sweep_stale(self: &Arc<Self>) -> Vec<JobId> {
        let now = now_unix();
        let lookback = i64::try_from(self.config.sweep_lookback.as_secs()).unwrap_or(i64::MAX);
        let window = TimeRange::between(now.saturating_sub(lookback), now);
        let mut job_ids = Vec::new();
        for stream_id in &self.config.hot_streams {
            let fresh_since = self.coverage.policy().fresh_since(stream_id, now);
            let stale: Vec<TimeRange> = self
                .coverage
                .snapshot(stream_id)
                .await
                .overlapping(window)
                .into_iter()
                .filter(|span| span.verified_at < fresh_since)
                .map(|span| span.range)
                .collect();
            if stale.is_empty() {
                continue;
            }
            tracing::info!(stream = %stream_id, stale = stale.len(), "sweeping stale coverage");
            for range in stale {
                job_ids.extend(self.refresh_in_background(stream_id, range).await);
            }
        }
        job_ids
    }

    /// Fetches a single record by id unless one was attempted within the
    /// cooldown. Returns what the store holds afterwards.
    pub async fn fetch_point(&self, id: &str) -> Result<Option<ConversationRecord>, SyncError> {
        if self.shutdown.is_cancelled() {
            return Err(SyncError::ShuttingDown);
        }
        let cooldown = self.config.point_lookup_cooldown;
        let recent = self
            .point_attempts
            .get(id)
            .is_some_and(|attempted| attempted.elapsed() < cooldown);
        if recent {
            tracing::warn!(id, "point lookup skipped, attempted recently");
            return Ok(None);
        }
        self.point_attempts
            .retain(|_, attempted| attempted.elapsed() < cooldown);
        self.point_attempts.insert(id.to_string(), Instant::now());

        let Some(record) = self.fetch.fetch_one(id).await? else {
            tracing::debug!(id, "point lookup found nothing remotely");
            return Ok(None);
        };
        if self.store.upsert(&record).await? {
            self.metrics.records_applied.fetch_add(1, Ordering::Relaxed);
        } else {
            self.metrics.records_skipped.fetch_add(1, Ordering::Relaxed);
        }
        Ok(self.store.get(id).await?)
    }

    pub fn last_error(&self, stream_id: &str) -> Option<String> {
        self.last_errors
            .get(stream_id)
            .map(|entry| entry.value().clone())
    }

    pub async fn active_jobs(&self, stream_id: &str) -> Vec<JobSnapshot> {
        let registry = self
            .registries
            .get(stream_id)
            .map(|entry| Arc::clone(entry.value()));
        match registry {
            Some(registry) => registry.lock().await.snapshots(),
            None => Vec::new(),
        }
    }

    pub async fn active_job_count(&self) -> usize {
        let registries: Vec<Arc<Mutex<JobRegistry>>> = self
            .registries
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        let mut total = 0;
        for registry in registries {
            total += registry.lock().await.len();
        }
        total
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            jobs_started: self.metrics.jobs_started.load(Ordering::Relaxed),
            jobs_coalesced: self.metrics.jobs_coalesced.load(Ordering::Relaxed),
            jobs_failed: self.metrics.jobs_failed.load(Ordering::Relaxed),
            jobs_truncated: self.metrics.jobs_truncated.load(Ordering::Relaxed),
            pages_fetched: self.metrics.pages_fetched.load(Ordering::Relaxed),
            records_applied: self.metrics.records_applied.load(Ordering::Relaxed),
            records_skipped: self.metrics.records_skipped.load(Ordering::Relaxed),
            remote_calls: self.fetch.calls(),
        }
    }

    pub async fn status(&self) -> EngineStatus {
        let mut stream_ids: BTreeSet<String> = self.coverage.stream_ids().into_iter().collect();
        stream_ids.extend(self.config.hot_streams.iter().cloned());
        stream_ids.extend(self.registries.iter().map(|entry| entry.key().clone()));

        let mut streams = BTreeMap::new();
        for stream_id in stream_ids {
            let snapshot = self.coverage.snapshot(&stream_id).await;
            let status = StreamStatus {
                covered_ranges: snapshot.spans().collect(),
                last_verified_at: snapshot.last_verified_at(),
                active_jobs: self.active_jobs(&stream_id).await,
                last_error: self.last_error(&stream_id),
            };
            streams.insert(stream_id, status);
        }
        EngineStatus {
            streams,
            metrics: self.metrics(),
        }
    }

    /// Stops new pages from starting and waits up to `grace` for in-flight
    /// page writes. Returns whether every job drained.
    pub async fn shutdown(&self, grace: Duration) -> bool {
        self.shutdown.cancel();
        self.tasks.close();
        let drained = tokio::time::timeout(grace, self.tasks.wait()).await.is_ok();
        if drained {
            tracing::info!("sync engine stopped");
        } else {
            tracing::warn!(grace_ms = grace.as_millis() as u64, "sync jobs still running at shutdown");
        }
        drained
    }

    fn registry(&self, stream_id: &str) -> Arc<Mutex<JobRegistry>> {
        Arc::clone(
            self.registries
                .entry(stream_id.to_string())
                .or_default()
                .value(),
        )
    }

    fn spawn_job(self: &Arc<Self>, stream_id: &str, job_id: JobId) {
        self.metrics.jobs_started.fetch_add(1, Ordering::Relaxed);
        let engine = Arc::clone(self);
        let stream_id = stream_id.to_string();
        self.tasks.spawn(async move {
            engine.drive_job(&stream_id, job_id).await;
        });
    }

    async fn drive_job(&self, stream_id: &str, job_id: JobId) {
        // Pending jobs stay open to widening for the coalesce window.
        tokio::select! {
            _ = self.shutdown.cancelled() => {
                self.finish_job(stream_id, job_id, Err(SyncError::ShuttingDown)).await;
                return;
            }
            _ = tokio::time::sleep(self.config.coalesce_window) => {}
        }
        let permit = tokio::select! {
            _ = self.shutdown.cancelled() => None,
            permit = Arc::clone(&self.workers).acquire_owned() => permit.ok(),
        };
        let Some(permit) = permit else {
            self.finish_job(stream_id, job_id, Err(SyncError::ShuttingDown)).await;
            return;
        };

        let started_at = now_unix();
        let Some(range) = self.registry(stream_id).lock().await.start(job_id, started_at) else {
            return;
        };
        tracing::info!(stream = stream_id, job_id, start = range.start(), end = range.end(), "sync job started");

        let outcome = self.execute(stream_id, job_id, range, started_at).await;
        drop(permit);

        match &outcome {
            Ok(report) => {
                self.last_errors.remove(stream_id);
                if report.truncated {
                    self.metrics.jobs_truncated.fetch_add(1, Ordering::Relaxed);
                }
                tracing::info!(
                    stream = stream_id,
                    job_id,
                    pages = report.pages,
                    records = report.records,
                    truncated = report.truncated,
                    "sync job finished"
                );
            }
            Err(err) => {
                self.metrics.jobs_failed.fetch_add(1, Ordering::Relaxed);
                self.last_errors
                    .insert(stream_id.to_string(), err.to_string());
                tracing::warn!(stream = stream_id, job_id, error = %err, "sync job failed");
            }
        }
        self.finish_job(stream_id, job_id, outcome).await;
    }

    async fn finish_job(&self, stream_id: &str, job_id: JobId, outcome: JobOutcome) {
        self.registry(stream_id).lock().await.finish(job_id, outcome);
    }

    /// Pages through `range` oldest first, committing each page before asking
    /// for the next, then records what was confirmed in coverage.
    async fn execute(
        &self,
        stream_id: &str,
        job_id: JobId,
        range: TimeRange,
        started_at: i64,
    ) -> JobOutcome {
        let deadline = Instant::now() + self.config.max_job_duration;
        let max_pages = u64::from(self.config.max_pages_per_job.max(1));
        let mut progress = Progress::default();
        let mut cursor: Option<String> = None;

        let result: Result<(), SyncError> = loop {
            if self.shutdown.is_cancelled() {
                break Err(SyncError::ShuttingDown);
            }
            if progress.pages >= max_pages || Instant::now() >= deadline {
                progress.truncated = true;
                break Ok(());
            }
            // Rate-limit waits and retry sleeps give way to shutdown; page writes do not.
            let fetched = tokio::select! {
                _ = self.shutdown.cancelled() => break Err(SyncError::ShuttingDown),
                fetched = self.fetch.fetch_page(range, cursor.as_deref()) => fetched,
            };
            let page = match fetched {
                Ok(page) => page,
                Err(err) => break Err(err.into()),
            };
            let applied = match self.store.upsert_page(&page.records).await {
                Ok(applied) => applied,
                Err(err) => break Err(err.into()),
            };

            progress.pages += 1;
            progress.records += page.records.len() as u64;
            if let Some(newest) = page.records.iter().map(|record| record.updated_at).max() {
                progress.max_seen_updated_at =
                    Some(progress.max_seen_updated_at.map_or(newest, |seen| seen.max(newest)));
            }
            self.metrics.pages_fetched.fetch_add(1, Ordering::Relaxed);
            self.metrics
                .records_applied
                .fetch_add(applied.applied, Ordering::Relaxed);
            self.metrics
                .records_skipped
                .fetch_add(applied.skipped, Ordering::Relaxed);
            tracing::debug!(
                stream = stream_id,
                job_id,
                page = progress.pages,
                records = page.records.len(),
                skipped = applied.skipped,
                "page committed"
            );

            match page.next_cursor {
                Some(next) => cursor = Some(next),
                None => break Ok(()),
            }
        };

        let complete = result.is_ok() && !progress.truncated;
        let verified = if complete {
            Some(range)
        } else {
            progress.confirmed_prefix(range)
        };
        if let Some(verified) = verified
            && let Err(err) = self
                .coverage
                .mark_covered(stream_id, verified, started_at)
                .await
        {
            return Err(err.into());
        }

        result.map(|()| JobReport {
            job_id,
            stream_id: stream_id.to_string(),
            requested: range,
            verified,
            pages: progress.pages,
            records: progress.records,
            truncated: progress.truncated,
        })
    }
}

pub(crate) fn ensure_stream(stream_id: &str) -> Result<(), SyncError> {
    if stream_id == CONVERSATIONS {
        Ok(())
    } else {
        Err(SyncError::UnknownStream(stream_id.to_string()))
    }
}
