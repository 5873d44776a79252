use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;

/// Attempt budget for scrape jobs.
pub const SCRAPE_MAX_ATTEMPTS: u32 = 5;

/// Attempt budget for discovery jobs unless overridden.
pub const DISCOVERY_MAX_ATTEMPTS: u32 = 1;

/// Base delay of the exponential retry backoff.
pub const DEFAULT_BACKOFF_BASE: Duration = Duration::from_secs(5);

/// What a job does when it runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobKind {
    /// Fetch one unit page.
    Scrape,
    /// Enumerate the unit codes of one university.
    Discovery,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Scrape => "scrape",
            JobKind::Discovery => "discovery",
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "scrape" => Ok(JobKind::Scrape),
            "discovery" => Ok(JobKind::Discovery),
            _ => Err(format!("Unknown job kind: {}", s)),
        }
    }
}

/// Lifecycle state of a job in the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    Waiting,
    Delayed,
    Active,
    Completed,
    Failed,
}

impl JobState {
    pub const ALL: [JobState; 5] = [
        JobState::Waiting,
        JobState::Delayed,
        JobState::Active,
        JobState::Completed,
        JobState::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Waiting => "waiting",
            JobState::Delayed => "delayed",
            JobState::Active => "active",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobState::Completed | JobState::Failed)
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for JobState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "waiting" => Ok(JobState::Waiting),
            "delayed" => Ok(JobState::Delayed),
            "active" => Ok(JobState::Active),
            "completed" => Ok(JobState::Completed),
            "failed" => Ok(JobState::Failed),
            _ => Err(format!("Unknown job state: {}", s)),
        }
    }
}

/// Deterministic id of the scrape job for one unit. Re-submitting the same
/// unit yields the same id, which is what makes enqueueing idempotent.
pub fn scrape_job_id(university_id: &str, unit_code: &str) -> String {
    format!("scrape-{university_id}-{unit_code}")
}

/// Deterministic id of the discovery job for one university.
pub fn discovery_job_id(university_id: &str) -> String {
    format!("discovery-{university_id}")
}

/// Exponential retry backoff: `base * 2^(attempts_made - 1)`.
///
/// With the default 5s base the schedule is 5s, 10s, 20s, 40s, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackoffPolicy {
    pub base: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self::exponential(DEFAULT_BACKOFF_BASE)
    }
}

impl BackoffPolicy {
    pub fn exponential(base: Duration) -> Self {
        Self { base }
    }

    /// Delay before the next attempt once `attempts_made` attempts have failed.
    pub fn delay_for_attempt(&self, attempts_made: u32) -> Duration {
        let exponent = attempts_made.saturating_sub(1);
        1u32.checked_shl(exponent)
            .and_then(|factor| self.base.checked_mul(factor))
            .unwrap_or(Duration::MAX)
    }

    pub fn base_ms(&self) -> u64 {
        self.base.as_millis() as u64
    }

    pub fn from_base_ms(ms: u64) -> Self {
        Self::exponential(Duration::from_millis(ms))
    }
}

/// Job parameters handed to the handlers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobPayload {
    pub university_id: String,
    /// Required and non-empty for scrape jobs, absent for discovery jobs.
    pub unit_code: Option<String>,
}

/// A job about to be submitted to the queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Deferred start; the job is not delivered before this elapses.
    pub delay: Option<Duration>,
}

impl NewJob {
    /// Scrape job for one unit, with the standard attempt budget and backoff.
    pub fn scrape(university_id: &str, unit_code: &str) -> Result<Self, AppError> {
        let university_id = validate_university_id(university_id)?;
        let unit_code = unit_code.trim();
        if unit_code.is_empty() {
            return Err(AppError::InvalidJob(format!(
                "scrape job for '{university_id}' requires a unit code"
            )));
        }

        Ok(Self {
            id: scrape_job_id(university_id, unit_code),
            kind: JobKind::Scrape,
            payload: JobPayload {
                university_id: university_id.to_string(),
                unit_code: Some(unit_code.to_string()),
            },
            max_attempts: SCRAPE_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            delay: None,
        })
    }

    /// Discovery job for one university.
    pub fn discovery(university_id: &str) -> Result<Self, AppError> {
        let university_id = validate_university_id(university_id)?;

        Ok(Self {
            id: discovery_job_id(university_id),
            kind: JobKind::Discovery,
            payload: JobPayload {
                university_id: university_id.to_string(),
                unit_code: None,
            },
            max_attempts: DISCOVERY_MAX_ATTEMPTS,
            backoff: BackoffPolicy::default(),
            delay: None,
        })
    }

    pub fn with_delay(mut self, delay: Option<Duration>) -> Self {
        self.delay = delay.filter(|d| !d.is_zero());
        self
    }

    pub fn with_max_attempts(mut self, max: u32) -> Self {
        self.max_attempts = max.max(1);
        self
    }

    /// State the job enters the queue in.
    pub fn initial_state(&self) -> JobState {
        if self.delay.is_some() {
            JobState::Delayed
        } else {
            JobState::Waiting
        }
    }
}

fn validate_university_id(university_id: &str) -> Result<&str, AppError> {
    let trimmed = university_id.trim();
    if trimmed.is_empty() {
        return Err(AppError::InvalidJob("university id must not be empty".into()));
    }
    Ok(trimmed)
}

/// What the queue does with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureDisposition {
    /// Re-queue as `delayed` after the given backoff.
    Retry { delay: Duration },
    /// Attempts exhausted (or failure not retryable): terminally `failed`.
    Exhausted,
}

/// A job stored in the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub state: JobState,
    pub attempts_made: u32,
    pub max_attempts: u32,
    pub backoff: BackoffPolicy,
    /// Earliest delivery time of a delayed job.
    pub run_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub worker_id: Option<String>,
}

impl Job {
    pub fn university_id(&self) -> &str {
        &self.payload.university_id
    }

    /// Unit code of a scrape job. Its absence is a programming error and
    /// must not be retried.
    pub fn unit_code(&self) -> Result<&str, AppError> {
        match self.payload.unit_code.as_deref() {
            Some(code) if !code.trim().is_empty() => Ok(code),
            _ => Err(AppError::InvalidJob(format!(
                "{} job {} has no unit code",
                self.kind, self.id
            ))),
        }
    }

    /// Decide the fate of the attempt currently running.
    pub fn disposition_after_failure(&self, retryable: bool) -> FailureDisposition {
        let attempts_made = self.attempts_made + 1;
        if retryable && attempts_made < self.max_attempts {
            FailureDisposition::Retry {
                delay: self.backoff.delay_for_attempt(attempts_made),
            }
        } else {
            FailureDisposition::Exhausted
        }
    }
}

/// Per-state job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueCounts {
    /// Jobs counted against the fan-out capacity guard.
    pub fn pending(&self) -> u64 {
        self.waiting + self.active
    }

    pub fn get(&self, state: JobState) -> u64 {
        match state {
            JobState::Waiting => self.waiting,
            JobState::Delayed => self.delayed,
            JobState::Active => self.active,
            JobState::Completed => self.completed,
            JobState::Failed => self.failed,
        }
    }

    pub fn add(&mut self, state: JobState, n: u64) {
        match state {
            JobState::Waiting => self.waiting += n,
            JobState::Delayed => self.delayed += n,
            JobState::Active => self.active += n,
            JobState::Completed => self.completed += n,
            JobState::Failed => self.failed += n,
        }
    }
}

/// Configuration for a worker process.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub worker_id: String,
    /// Number of execution slots; also the browser pool's `max`.
    pub concurrency: usize,
    pub poll_interval: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: format!("worker-{}", &Uuid::new_v4().to_string()[..8]),
            concurrency: 2,
            poll_interval: Duration::from_secs(2),
        }
    }
}

impl WorkerConfig {
    pub fn with_worker_id(mut self, id: impl Into<String>) -> Self {
        self.worker_id = id.into();
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }
}
