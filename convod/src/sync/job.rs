//! In-flight sync jobs and the per-stream registry that coalesces them.
//!
//! Active jobs of one stream never overlap. A request is split against the
//! active jobs: overlapping parts attach to the job already doing the work,
//! leftovers either widen a still-pending job they touch or start a new one.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Duration;

use futures_util::future::join_all;
use serde::Serialize;
use tokio::sync::watch;

use super::SyncError;
use super::range::TimeRange;

pub type JobId = u64;
pub type JobOutcome = Result<JobReport, SyncError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
        }
    }
}

/// What a finished job actually did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job_id: JobId,
    pub stream_id: String,
    pub requested: TimeRange,
    /// Span marked covered; `None` when nothing was confirmed.
    pub verified: Option<TimeRange>,
    pub pages: u64,
    pub records: u64,
    /// Stopped early on a page or time limit.
    pub truncated: bool,
}

pub struct SyncJob {
    pub id: JobId,
    pub stream_id: String,
    pub range: TimeRange,
    pub status: JobStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    sender: watch::Sender<Option<JobOutcome>>,
}

impl SyncJob {
    fn new(id: JobId, stream_id: &str, range: TimeRange, now: i64) -> Self {
        let (sender, _) = watch::channel(None);
        Self {
            id,
            stream_id: stream_id.to_string(),
            range,
            status: JobStatus::Pending,
            created_at: now,
            started_at: None,
            sender,
        }
    }

    fn waiter(&self) -> JobWaiter {
        JobWaiter {
            job_id: self.id,
            receiver: self.sender.subscribe(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobSnapshot {
    pub job_id: JobId,
    pub range: TimeRange,
    pub status: JobStatus,
    pub created_at: i64,
    pub started_at: Option<i64>,
    pub waiters: usize,
}

/// Handle on one job's eventual outcome.
#[derive(Debug)]
pub struct JobWaiter {
    job_id: JobId,
    receiver: watch::Receiver<Option<JobOutcome>>,
}

impl JobWaiter {
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub async fn wait(mut self) -> JobOutcome {
        match self.receiver.wait_for(Option::is_some).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(SyncError::ShuttingDown)),
            // Sender dropped without publishing: the job was abandoned.
            Err(_) => Err(SyncError::ShuttingDown),
        }
    }
}

/// Result of planning one gap against the registry.
#[derive(Default)]
pub struct Plan {
    pub waiters: Vec<JobWaiter>,
    pub created: Vec<JobId>,
    /// Jobs that already existed and absorbed part of the request.
    pub coalesced: usize,
}

#[derive(Default)]
pub struct JobRegistry {
    jobs: BTreeMap<JobId, SyncJob>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn range_of(&self, id: JobId) -> Option<TimeRange> {
        self.jobs.get(&id).map(|job| job.range)
    }

    /// Routes `gap` onto active jobs, creating at most one job per leftover
    /// piece. `next_id` is only called for new jobs.
    pub fn plan(
        &mut self,
        stream_id: &str,
        gap: TimeRange,
        now: i64,
        mut next_id: impl FnMut() -> JobId,
    ) -> Plan {
        let mut plan = Plan::default();
        let mut involved = BTreeSet::new();
        let mut pieces = vec![gap];

        for job in self.jobs.values() {
            if pieces.iter().any(|piece| piece.overlaps(&job.range)) {
                involved.insert(job.id);
                pieces = pieces
                    .iter()
                    .flat_map(|piece| piece.subtract(&job.range))
                    .collect();
            }
        }

        for piece in pieces {
            let pending = self
                .jobs
                .values_mut()
                .find(|job| job.status == JobStatus::Pending && job.range.touches(&piece));
            match pending {
                Some(job) => {
                    tracing::debug!(
                        stream = stream_id,
                        job_id = job.id,
                        from = %job.range,
                        to = %job.range.span(&piece),
                        "widening pending job"
                    );
                    job.range = job.range.span(&piece);
                    involved.insert(job.id);
                }
                None => {
                    let id = next_id();
                    self.jobs.insert(id, SyncJob::new(id, stream_id, piece, now));
                    plan.created.push(id);
                    involved.insert(id);
                }
            }
        }

        plan.coalesced = involved.len() - plan.created.len();
        plan.waiters = involved
            .iter()
            .filter_map(|id| self.jobs.get(id))
            .map(SyncJob::waiter)
            .collect();
        plan
    }

    /// Freezes a pending job's range and marks it running.
    pub fn start(&mut self, id: JobId, now: i64) -> Option<TimeRange> {
        let job = self.jobs.get_mut(&id)?;
        job.status = JobStatus::Running;
        job.started_at = Some(now);
        Some(job.range)
    }

    /// Removes the job and wakes every waiter with the same outcome.
    pub fn finish(&mut self, id: JobId, outcome: JobOutcome) {
        if let Some(mut job) = self.jobs.remove(&id) {
            job.status = if outcome.is_ok() {
                JobStatus::Succeeded
            } else {
                JobStatus::Failed
            };
            tracing::debug!(
                stream = %job.stream_id,
                job_id = id,
                status = job.status.as_str(),
                waiters = job.sender.receiver_count(),
                "job finished"
            );
            job.sender.send_replace(Some(outcome));
        }
    }

    pub fn snapshots(&self) -> Vec<JobSnapshot> {
        self.jobs
            .values()
            .map(|job| JobSnapshot {
                job_id: job.id,
                range: job.range,
                status: job.status,
                created_at: job.created_at,
                started_at: job.started_at,
                waiters: job.sender.receiver_count(),
            })
            .collect()
    }
}

/// Everything a caller needs to wait on after requesting a sync.
#[derive(Debug)]
pub struct SyncTicket {
    pub stream_id: String,
    pub gaps: Vec<TimeRange>,
    waiters: Vec<JobWaiter>,
}

impl SyncTicket {
    pub(crate) fn new(stream_id: &str, gaps: Vec<TimeRange>, waiters: Vec<JobWaiter>) -> Self {
        Self {
            stream_id: stream_id.to_string(),
            gaps,
            waiters,
        }
    }

    /// Nothing to fetch: the range was already fresh.
    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }

    pub fn job_ids(&self) -> Vec<JobId> {
        self.waiters.iter().map(JobWaiter::job_id).collect()
    }

    /// Waits for every job involved. Timing out abandons only the wait; the
    /// jobs keep running.
    pub async fn wait(self, timeout: Duration) -> Result<Vec<JobReport>, SyncError> {
        let outcomes = tokio::time::timeout(
            timeout,
            join_all(self.waiters.into_iter().map(JobWaiter::wait)),
        )
        .await
        .map_err(|_| SyncError::SyncTimeout(timeout))?;
        outcomes.into_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn range(start: i64, end: i64) -> TimeRange {
        TimeRange::new(start, end).unwrap()
    }

    fn ids() -> impl FnMut() -> JobId {
        let mut next = 0;
        move || {
            next += 1;
            next
        }
    }

    fn report(job_id: JobId, requested: TimeRange) -> JobReport {
        JobReport {
            job_id,
            stream_id: "conversations".into(),
            requested,
            verified: Some(requested),
            pages: 1,
            records: 3,
            truncated: false,
        }
    }

    #[test]
    fn overlapping_request_widens_pending_job() {
        let mut registry = JobRegistry::new();
        let mut next = ids();

        let first = registry.plan("conversations", range(0, 30), 0, &mut next);
        let second = registry.plan("conversations", range(20, 40), 0, &mut next);

        assert_eq!(first.created, vec![1]);
        assert!(second.created.is_empty());
        assert_eq!(second.coalesced, 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.range_of(1), Some(range(0, 40)));
    }

    #[test]
    fn running_job_is_frozen_and_remainder_gets_a_new_job() {
        let mut registry = JobRegistry::new();
        let mut next = ids();

        registry.plan("conversations", range(0, 30), 0, &mut next);
        assert_eq!(registry.start(1, 5), Some(range(0, 30)));

        let plan = registry.plan("conversations", range(20, 40), 6, &mut next);
        assert_eq!(plan.created, vec![2]);
        assert_eq!(plan.coalesced, 1);
        assert_eq!(plan.waiters.len(), 2);
        assert_eq!(registry.range_of(1), Some(range(0, 30)));
        assert_eq!(registry.range_of(2), Some(range(31, 40)));
    }

    #[test]
    fn contained_request_only_attaches() {
        let mut registry = JobRegistry::new();
        let mut next = ids();

        registry.plan("conversations", range(0, 100), 0, &mut next);
        registry.start(1, 1);
        let plan = registry.plan("conversations", range(10, 20), 2, &mut next);

        assert!(plan.created.is_empty());
        assert_eq!(plan.waiters.len(), 1);
        assert_eq!(plan.waiters[0].job_id(), 1);
    }

    #[test]
    fn active_jobs_never_overlap() {
        let mut registry = JobRegistry::new();
        let mut next = ids();
        let requests = [(0, 50), (40, 90), (10, 20), (85, 200), (300, 400), (150, 310)];
        for (i, (start, end)) in requests.into_iter().enumerate() {
            registry.plan("conversations", range(start, end), 0, &mut next);
            if i % 2 == 0 {
                let newest = registry.snapshots().last().map(|job| job.job_id).unwrap();
                registry.start(newest, 0);
            }
        }

        let jobs = registry.snapshots();
        for (i, a) in jobs.iter().enumerate() {
            for b in &jobs[i + 1..] {
                assert!(!a.range.overlaps(&b.range), "{} overlaps {}", a.range, b.range);
            }
        }
    }

    #[tokio::test]
    async fn every_waiter_sees_the_same_outcome() {
        let mut registry = JobRegistry::new();
        let mut next = ids();
        let a = registry.plan("conversations", range(0, 10), 0, &mut next);
        let b = registry.plan("conversations", range(5, 10), 0, &mut next);
        let ticket_a = SyncTicket::new("conversations", vec![range(0, 10)], a.waiters);
        let ticket_b = SyncTicket::new("conversations", vec![range(5, 10)], b.waiters);

        registry.finish(1, Ok(report(1, range(0, 10))));

        let reports_a = ticket_a.wait(Duration::from_secs(1)).await.unwrap();
        let reports_b = ticket_b.wait(Duration::from_secs(1)).await.unwrap();
        assert_eq!(reports_a, reports_b);
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn failure_reaches_waiters_and_timeout_leaves_job_alone() {
        let mut registry = JobRegistry::new();
        let mut next = ids();
        let plan = registry.plan("conversations", range(0, 10), 0, &mut next);
        let ticket = SyncTicket::new("conversations", vec![range(0, 10)], plan.waiters);

        let err = ticket.wait(Duration::from_millis(10)).await.unwrap_err();
        assert!(matches!(err, SyncError::SyncTimeout(_)));
        assert_eq!(registry.len(), 1);

        let late = registry.plan("conversations", range(0, 10), 0, &mut next);
        registry.finish(1, Err(SyncError::PermanentFetch("gone".into())));
        let outcome = late.waiters.into_iter().next().unwrap().wait().await;
        assert!(matches!(outcome, Err(SyncError::PermanentFetch(_))));
    }
}
