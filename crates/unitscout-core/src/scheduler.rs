use std::time::Duration;

use crate::error::AppError;
use crate::fanout::{FanoutConfig, FanoutPipeline, FanoutSummary};
use crate::job::{DISCOVERY_MAX_ATTEMPTS, NewJob, QueueCounts};
use crate::job_queue::JobQueue;

/// Job submission entry points for the rest of the system (CLI, template
/// schedulers, operators).
#[derive(Clone)]
pub struct CrawlScheduler<Q: JobQueue> {
    queue: Q,
    fanout: FanoutPipeline<Q>,
    discovery_attempts: u32,
}

impl<Q: JobQueue> CrawlScheduler<Q> {
    pub fn new(queue: Q, fanout_config: FanoutConfig) -> Self {
        Self {
            fanout: FanoutPipeline::new(queue.clone(), fanout_config),
            queue,
            discovery_attempts: DISCOVERY_MAX_ATTEMPTS,
        }
    }

    pub fn with_discovery_attempts(mut self, attempts: u32) -> Self {
        self.discovery_attempts = attempts.max(1);
        self
    }

    pub fn fanout(&self) -> &FanoutPipeline<Q> {
        &self.fanout
    }

    /// Submit one discovery job. Returns `false` if a discovery for this
    /// university is already queued or running.
    pub async fn submit_discovery(&self, university_id: &str) -> Result<bool, AppError> {
        let job = NewJob::discovery(university_id)?.with_max_attempts(self.discovery_attempts);
        let job_id = job.id.clone();
        let created = self.queue.enqueue(job).await?;

        if created {
            tracing::info!(%job_id, "Discovery job submitted");
        } else {
            tracing::info!(%job_id, "Discovery job already pending, not resubmitted");
        }
        Ok(created)
    }

    /// Submit scrape jobs for a batch of unit codes, optionally delayed.
    pub async fn submit_scrape_batch(
        &self,
        university_id: &str,
        codes: &[String],
        delay: Option<Duration>,
    ) -> Result<FanoutSummary, AppError> {
        self.fanout.fan_out(university_id, codes, delay).await
    }

    /// Current queue depth per state.
    pub async fn queue_depth(&self) -> Result<QueueCounts, AppError> {
        self.queue.counts().await
    }
}
