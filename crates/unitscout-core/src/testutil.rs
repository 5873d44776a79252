//! Test utilities: mock implementations of all core traits.
//!
//! Handwritten mocks for dependency injection in unit tests.
//! All mocks use `Arc<Mutex<_>>` for interior mutability, allowing
//! test assertions on recorded calls.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::time::Instant;

use crate::error::AppError;
use crate::job::{FailureDisposition, Job, JobKind, JobPayload, JobState, NewJob, QueueCounts};
use crate::job_queue::{JobQueue, dedup_by_id};
use crate::traits::{Discoverer, ScrapeFailure, ScrapeFailureKind, SessionLauncher, UnitScraper};
use crate::worker::{WorkerEvent, WorkerReporter};

// ---------------------------------------------------------------------------
// MockLauncher
// ---------------------------------------------------------------------------

/// Stand-in for a browser session.
#[derive(Debug)]
pub struct MockSession {
    pub id: u64,
}

/// Launcher that counts sessions created and destroyed.
#[derive(Clone, Default)]
pub struct MockLauncher {
    launched: Arc<AtomicU64>,
    destroyed: Arc<AtomicU64>,
    failures_left: Arc<AtomicU32>,
    launch_delay: Duration,
}

impl MockLauncher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Launcher whose first `n` launches fail.
    pub fn failing_first(n: u32) -> Self {
        let launcher = Self::default();
        launcher.failures_left.store(n, Ordering::SeqCst);
        launcher
    }

    /// Launcher whose every launch takes `delay`.
    pub fn slow(delay: Duration) -> Self {
        Self {
            launch_delay: delay,
            ..Self::default()
        }
    }

    pub fn launched(&self) -> u64 {
        self.launched.load(Ordering::SeqCst)
    }

    pub fn destroyed(&self) -> u64 {
        self.destroyed.load(Ordering::SeqCst)
    }
}

impl SessionLauncher for MockLauncher {
    type Session = MockSession;

    async fn launch(&self) -> Result<MockSession, AppError> {
        if !self.launch_delay.is_zero() {
            tokio::time::sleep(self.launch_delay).await;
        }
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(AppError::BrowserError("launch failed".into()));
        }
        let id = self.launched.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(MockSession { id })
    }

    async fn destroy(&self, _session: MockSession) {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
    }
}

// ---------------------------------------------------------------------------
// MockScraper
// ---------------------------------------------------------------------------

/// Recorded scrape call: (university_id, unit_code, when).
pub type ScrapeCall = (String, String, Instant);

/// Scraper that replays scripted results, then falls back to a default.
#[derive(Clone)]
pub struct MockScraper {
    responses: Arc<Mutex<VecDeque<Result<(), ScrapeFailure>>>>,
    fallback: Result<(), ScrapeFailure>,
    pub calls: Arc<Mutex<Vec<ScrapeCall>>>,
}

impl MockScraper {
    pub fn succeeding() -> Self {
        Self::with_responses(Vec::new(), Ok(()))
    }

    pub fn always_failing(kind: ScrapeFailureKind) -> Self {
        Self::with_responses(
            Vec::new(),
            Err(ScrapeFailure::new(kind, format!("scripted {kind} failure"))),
        )
    }

    pub fn with_responses(
        responses: Vec<Result<(), ScrapeFailure>>,
        fallback: Result<(), ScrapeFailure>,
    ) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            fallback,
            calls: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn call_times(&self) -> Vec<Instant> {
        self.calls.lock().unwrap().iter().map(|c| c.2).collect()
    }
}

impl UnitScraper<MockSession> for MockScraper {
    async fn scrape_unit(
        &self,
        university_id: &str,
        unit_code: &str,
        _session: &MockSession,
    ) -> Result<(), ScrapeFailure> {
        self.calls.lock().unwrap().push((
            university_id.to_string(),
            unit_code.to_string(),
            Instant::now(),
        ));
        let scripted = self.responses.lock().unwrap().pop_front();
        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}

// ---------------------------------------------------------------------------
// MockDiscoverer
// ---------------------------------------------------------------------------

/// Discoverer returning a fixed code list, or an error.
#[derive(Clone)]
pub struct MockDiscoverer {
    codes: Vec<String>,
    error: Arc<Mutex<Option<AppError>>>,
    pub calls: Arc<AtomicU32>,
}

impl MockDiscoverer {
    pub fn new(codes: &[&str]) -> Self {
        Self {
            codes: codes.iter().map(|c| c.to_string()).collect(),
            error: Arc::new(Mutex::new(None)),
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    /// Discoverer whose next call fails with `error`.
    pub fn with_error(error: AppError) -> Self {
        let discoverer = Self::new(&[]);
        *discoverer.error.lock().unwrap() = Some(error);
        discoverer
    }
}

impl Discoverer<MockSession> for MockDiscoverer {
    async fn discover(
        &self,
        _university_id: &str,
        _session: &MockSession,
    ) -> Result<Vec<String>, AppError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(e) = self.error.lock().unwrap().take() {
            return Err(e);
        }
        Ok(self.codes.clone())
    }
}

// ---------------------------------------------------------------------------
// MemoryJobQueue
// ---------------------------------------------------------------------------

fn wall_clock_after(delay: Duration) -> DateTime<Utc> {
    TimeDelta::from_std(delay)
        .ok()
        .and_then(|d| Utc::now().checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn instant_after(delay: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(delay)
        .unwrap_or(now + Duration::from_secs(100 * 365 * 24 * 3600))
}

struct StoredJob {
    job: Job,
    ready_at: Option<Instant>,
}

#[derive(Default)]
struct MemoryQueueState {
    jobs: Vec<StoredJob>,
    index: HashMap<String, usize>,
}

impl MemoryQueueState {
    fn find_mut(&mut self, job_id: &str) -> Result<&mut StoredJob, AppError> {
        let pos = *self
            .index
            .get(job_id)
            .ok_or_else(|| AppError::JobNotFound(job_id.to_string()))?;
        Ok(&mut self.jobs[pos])
    }

    fn insert(&mut self, new: &NewJob) -> bool {
        let now = Utc::now();
        let job = Job {
            id: new.id.clone(),
            kind: new.kind,
            payload: new.payload.clone(),
            state: new.initial_state(),
            attempts_made: 0,
            max_attempts: new.max_attempts,
            backoff: new.backoff,
            run_at: new.delay.map(wall_clock_after),
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
            last_error: None,
            worker_id: None,
        };
        let stored = StoredJob {
            job,
            ready_at: new.delay.map(instant_after),
        };

        match self.index.get(&new.id) {
            Some(&pos) if !self.jobs[pos].job.state.is_terminal() => false,
            Some(&pos) => {
                self.jobs[pos] = stored;
                true
            }
            None => {
                self.index.insert(new.id.clone(), self.jobs.len());
                self.jobs.push(stored);
                true
            }
        }
    }
}

/// In-memory queue with the same dedup, delay and backoff semantics as the
/// durable one. Time follows `tokio::time`, so paused-clock tests work.
#[derive(Clone, Default)]
pub struct MemoryJobQueue {
    state: Arc<Mutex<MemoryQueueState>>,
    bulk_calls: Arc<Mutex<Vec<(usize, Instant)>>>,
    claim_delay: Duration,
}

impl MemoryJobQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue whose every claim takes `delay` before touching the store.
    pub fn with_claim_delay(delay: Duration) -> Self {
        Self {
            claim_delay: delay,
            ..Self::default()
        }
    }

    /// Store a job as-is, bypassing `NewJob` validation.
    pub fn insert_raw(&self, job: Job) {
        let mut state = self.state.lock().unwrap();
        let pos = state.jobs.len();
        state.index.insert(job.id.clone(), pos);
        state.jobs.push(StoredJob {
            job,
            ready_at: None,
        });
    }

    /// Ids of all stored jobs, in insertion order.
    pub fn job_ids(&self) -> Vec<String> {
        let state = self.state.lock().unwrap();
        state.jobs.iter().map(|s| s.job.id.clone()).collect()
    }

    /// Recorded bulk enqueues: (jobs in call, when).
    pub fn bulk_calls(&self) -> Vec<(usize, Instant)> {
        self.bulk_calls.lock().unwrap().clone()
    }

    pub fn clear_bulk_calls(&self) {
        self.bulk_calls.lock().unwrap().clear();
    }
}

impl JobQueue for MemoryJobQueue {
    async fn enqueue(&self, job: NewJob) -> Result<bool, AppError> {
        Ok(self.state.lock().unwrap().insert(&job))
    }

    async fn enqueue_bulk(&self, jobs: &[NewJob]) -> Result<u64, AppError> {
        self.bulk_calls
            .lock()
            .unwrap()
            .push((jobs.len(), Instant::now()));

        let mut state = self.state.lock().unwrap();
        let recorded = dedup_by_id(jobs)
            .into_iter()
            .filter(|job| state.insert(job))
            .count();
        Ok(recorded as u64)
    }

    async fn claim_job(&self, worker_id: &str) -> Result<Option<Job>, AppError> {
        if !self.claim_delay.is_zero() {
            tokio::time::sleep(self.claim_delay).await;
        }
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let deliverable = state.jobs.iter_mut().find(|s| match s.job.state {
            JobState::Waiting => true,
            JobState::Delayed => s.ready_at.is_none_or(|at| at <= now),
            _ => false,
        });

        Ok(deliverable.map(|stored| {
            stored.job.state = JobState::Active;
            stored.job.worker_id = Some(worker_id.to_string());
            stored.job.started_at = Some(Utc::now());
            stored.job.updated_at = Utc::now();
            stored.job.clone()
        }))
    }

    async fn complete_job(&self, job_id: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let stored = state.find_mut(job_id)?;
        stored.job.state = JobState::Completed;
        stored.job.attempts_made += 1;
        stored.job.finished_at = Some(Utc::now());
        stored.job.worker_id = None;
        stored.job.last_error = None;
        Ok(())
    }

    async fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> Result<JobState, AppError> {
        let mut state = self.state.lock().unwrap();
        let stored = state.find_mut(job_id)?;
        let disposition = stored.job.disposition_after_failure(retryable);

        stored.job.attempts_made += 1;
        stored.job.last_error = Some(error.to_string());
        stored.job.worker_id = None;
        stored.job.updated_at = Utc::now();
        match disposition {
            FailureDisposition::Retry { delay } => {
                stored.job.state = JobState::Delayed;
                stored.job.run_at = Some(wall_clock_after(delay));
                stored.ready_at = Some(instant_after(delay));
            }
            FailureDisposition::Exhausted => {
                stored.job.state = JobState::Failed;
                stored.job.finished_at = Some(Utc::now());
            }
        }
        Ok(stored.job.state)
    }

    async fn release_job(&self, job_id: &str) -> Result<(), AppError> {
        let mut state = self.state.lock().unwrap();
        let stored = state.find_mut(job_id)?;
        if stored.job.state == JobState::Active {
            stored.job.state = JobState::Waiting;
            stored.job.worker_id = None;
            stored.job.started_at = None;
        }
        Ok(())
    }

    async fn release_worker_jobs(&self, worker_id: &str) -> Result<u64, AppError> {
        let mut state = self.state.lock().unwrap();
        let mut count = 0u64;
        for stored in state.jobs.iter_mut() {
            if stored.job.worker_id.as_deref() == Some(worker_id)
                && stored.job.state == JobState::Active
            {
                stored.job.state = JobState::Waiting;
                stored.job.worker_id = None;
                stored.job.started_at = None;
                count += 1;
            }
        }
        Ok(count)
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<Job>, AppError> {
        let state = self.state.lock().unwrap();
        Ok(state
            .index
            .get(job_id)
            .map(|&pos| state.jobs[pos].job.clone()))
    }

    async fn list_jobs(&self, state: Option<JobState>, limit: usize) -> Result<Vec<Job>, AppError> {
        let guard = self.state.lock().unwrap();
        Ok(guard
            .jobs
            .iter()
            .map(|s| &s.job)
            .filter(|j| state.is_none_or(|s| j.state == s))
            .take(limit)
            .cloned()
            .collect())
    }

    async fn counts(&self) -> Result<QueueCounts, AppError> {
        let state = self.state.lock().unwrap();
        let mut counts = QueueCounts::default();
        for stored in &state.jobs {
            counts.add(stored.job.state, 1);
        }
        Ok(counts)
    }
}

// ---------------------------------------------------------------------------
// MockReporter
// ---------------------------------------------------------------------------

/// Mock worker reporter that records event labels.
#[derive(Default)]
pub struct MockReporter {
    pub events: Arc<Mutex<Vec<String>>>,
}

impl MockReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn labels(&self) -> Vec<String> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, label: &str) -> usize {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|l| l.as_str() == label)
            .count()
    }
}

impl WorkerReporter for MockReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        let label = match &event {
            WorkerEvent::Started { .. } => "Started",
            WorkerEvent::Polling { .. } => "Polling",
            WorkerEvent::JobClaimed { .. } => "JobClaimed",
            WorkerEvent::Throttled { .. } => "Throttled",
            WorkerEvent::JobCompleted { .. } => "JobCompleted",
            WorkerEvent::JobFailed { .. } => "JobFailed",
            WorkerEvent::Discovered { .. } => "Discovered",
            WorkerEvent::ShuttingDown { .. } => "ShuttingDown",
            WorkerEvent::Stopped { .. } => "Stopped",
        };
        self.events.lock().unwrap().push(label.to_string());
    }
}

// ---------------------------------------------------------------------------
// Test helpers
// ---------------------------------------------------------------------------

/// Owned code list from string literals.
pub fn codes(codes: &[&str]) -> Vec<String> {
    codes.iter().map(|c| c.to_string()).collect()
}

/// Create a waiting scrape Job for testing.
pub fn make_test_job(university_id: &str, unit_code: &str) -> Job {
    let new = NewJob::scrape(university_id, unit_code).unwrap();
    Job {
        id: new.id,
        kind: JobKind::Scrape,
        payload: JobPayload {
            university_id: university_id.to_string(),
            unit_code: Some(unit_code.to_string()),
        },
        state: JobState::Waiting,
        attempts_made: 0,
        max_attempts: new.max_attempts,
        backoff: new.backoff,
        run_at: None,
        created_at: Utc::now(),
        updated_at: Utc::now(),
        started_at: None,
        finished_at: None,
        last_error: None,
        worker_id: None,
    }
}
