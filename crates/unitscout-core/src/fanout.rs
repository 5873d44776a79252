//! Turns one discovery result into deduplicated scrape jobs.
//!
//! Two safety limits apply to every fan-out:
//! - capacity guard: if `waiting + active + batch > max_queue_size` the
//!   whole batch is rejected and nothing is enqueued;
//! - chunking: jobs are submitted in fixed-size bulk operations with a short
//!   pause between consecutive chunks.
//!
//! Job ids are `scrape-{university}-{code}`, so fanning out the same codes
//! twice relies on the queue's idempotent enqueue and schedules nothing new.

use std::collections::HashSet;
use std::time::Duration;

use crate::error::AppError;
use crate::job::NewJob;
use crate::job_queue::JobQueue;

/// Configuration for the fan-out pipeline.
#[derive(Debug, Clone)]
pub struct FanoutConfig {
    /// Ceiling on `waiting + active` jobs after the fan-out.
    pub max_queue_size: u64,

    /// Jobs per bulk enqueue.
    pub chunk_size: usize,

    /// Pause between consecutive bulk enqueues.
    pub chunk_pause: Duration,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            max_queue_size: 10_000,
            chunk_size: 1_000,
            chunk_pause: Duration::from_millis(100),
        }
    }
}

/// Result of a fan-out.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutSummary {
    /// Distinct scrape jobs built from the batch.
    pub requested: usize,
    /// Jobs newly recorded by the queue (duplicates of live jobs excluded).
    pub enqueued: u64,
    /// Bulk enqueue operations issued.
    pub chunks: usize,
}

#[derive(Clone)]
pub struct FanoutPipeline<Q: JobQueue> {
    queue: Q,
    config: FanoutConfig,
}

impl<Q: JobQueue> FanoutPipeline<Q> {
    pub fn new(queue: Q, config: FanoutConfig) -> Self {
        Self { queue, config }
    }

    pub fn config(&self) -> &FanoutConfig {
        &self.config
    }

    /// Enqueue one scrape job per distinct code, optionally deferring all of
    /// them by `delay`.
    pub async fn fan_out(
        &self,
        university_id: &str,
        codes: &[String],
        delay: Option<Duration>,
    ) -> Result<FanoutSummary, AppError> {
        let jobs = build_scrape_jobs(university_id, codes, delay)?;
        if jobs.is_empty() {
            tracing::info!(%university_id, "No unit codes to fan out");
            return Ok(FanoutSummary::default());
        }

        let current = self.queue.counts().await?.pending();
        let requested = jobs.len() as u64;
        if current + requested > self.config.max_queue_size {
            tracing::warn!(
                %university_id,
                current,
                requested,
                limit = self.config.max_queue_size,
                "Fan-out rejected, queue would exceed capacity"
            );
            return Err(AppError::CapacityExceeded {
                current,
                requested,
                limit: self.config.max_queue_size,
            });
        }

        let mut summary = FanoutSummary {
            requested: jobs.len(),
            ..FanoutSummary::default()
        };

        for (i, chunk) in jobs.chunks(self.config.chunk_size.max(1)).enumerate() {
            if i > 0 {
                tokio::time::sleep(self.config.chunk_pause).await;
            }
            let recorded = self.queue.enqueue_bulk(chunk).await?;
            summary.enqueued += recorded;
            summary.chunks += 1;
            tracing::debug!(
                %university_id,
                chunk = i + 1,
                size = chunk.len(),
                recorded,
                "Enqueued scrape chunk"
            );
        }

        tracing::info!(
            %university_id,
            requested = summary.requested,
            enqueued = summary.enqueued,
            chunks = summary.chunks,
            "Fan-out complete"
        );
        Ok(summary)
    }
}

/// Build scrape jobs for the distinct, non-blank codes, in batch order.
pub fn build_scrape_jobs(
    university_id: &str,
    codes: &[String],
    delay: Option<Duration>,
) -> Result<Vec<NewJob>, AppError> {
    let mut seen = HashSet::with_capacity(codes.len());
    let mut jobs = Vec::with_capacity(codes.len());
    let mut blank = 0usize;

    for code in codes {
        let code = code.trim();
        if code.is_empty() {
            blank += 1;
            continue;
        }
        if seen.insert(code) {
            jobs.push(NewJob::scrape(university_id, code)?.with_delay(delay));
        }
    }

    if blank > 0 {
        tracing::warn!(%university_id, blank, "Skipped blank unit codes");
    }
    Ok(jobs)
}
