use std::future::Future;

use crate::error::AppError;
use crate::job::{Job, JobState, NewJob, QueueCounts};

/// Durable multi-producer/multi-consumer job store.
///
/// Implementations must guarantee:
/// - at most one non-terminal job per id: enqueueing an id that is
///   `waiting`, `delayed` or `active` is a no-op, while a terminal job with
///   that id is reset to a fresh run;
/// - atomic claiming (`SELECT FOR UPDATE SKIP LOCKED` or equivalent) so a
///   job is never delivered to two execution slots at once;
/// - delayed jobs are not delivered before their `run_at`.
pub trait JobQueue: Send + Sync + Clone {
    /// Submit one job. Returns `true` if the job was recorded, `false` if a
    /// non-terminal job with the same id already exists.
    fn enqueue(&self, job: NewJob) -> impl Future<Output = Result<bool, AppError>> + Send;

    /// Submit many jobs as one operation. Either every new job is recorded
    /// or an error is returned. Returns the number of jobs recorded.
    fn enqueue_bulk(&self, jobs: &[NewJob]) -> impl Future<Output = Result<u64, AppError>> + Send;

    /// Atomically claim the next deliverable job for processing.
    ///
    /// Returns `None` if no jobs are available.
    fn claim_job(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    fn complete_job(&self, job_id: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Record a failed attempt. A retryable failure with attempts left moves
    /// the job to `delayed` using its backoff policy; otherwise the job is
    /// terminally `failed`. Returns the state the job ended up in.
    fn fail_job(
        &self,
        job_id: &str,
        error: &str,
        retryable: bool,
    ) -> impl Future<Output = Result<JobState, AppError>> + Send;

    /// Hand an `active` job back to `waiting` without consuming an attempt.
    fn release_job(&self, job_id: &str) -> impl Future<Output = Result<(), AppError>> + Send;

    /// Release all jobs held by a specific worker (for graceful shutdown).
    fn release_worker_jobs(
        &self,
        worker_id: &str,
    ) -> impl Future<Output = Result<u64, AppError>> + Send;

    fn get_job(&self, job_id: &str) -> impl Future<Output = Result<Option<Job>, AppError>> + Send;

    fn list_jobs(
        &self,
        state: Option<JobState>,
        limit: usize,
    ) -> impl Future<Output = Result<Vec<Job>, AppError>> + Send;

    /// Current number of jobs in each state.
    fn counts(&self) -> impl Future<Output = Result<QueueCounts, AppError>> + Send;
}

/// Collapse jobs sharing an id, keeping the first occurrence.
pub fn dedup_by_id(jobs: &[NewJob]) -> Vec<&NewJob> {
    let mut seen = std::collections::HashSet::with_capacity(jobs.len());
    jobs.iter().filter(|job| seen.insert(job.id.as_str())).collect()
}
