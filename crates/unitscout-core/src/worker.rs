use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio_util::sync::CancellationToken;

use crate::error::AppError;
use crate::fanout::FanoutPipeline;
use crate::job::{Job, JobKind, JobState, WorkerConfig};
use crate::job_queue::JobQueue;
use crate::pool::{BrowserPool, SessionHealth};
use crate::throttle::ThrottleController;
use crate::traits::{Discoverer, ScrapeFailureKind, SessionLauncher, UnitScraper};

/// Result of running one job's handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Success,
    /// The queue retries the job under its backoff policy.
    RetryableFailure(String),
    /// The job fails terminally, whatever attempts remain.
    FatalFailure(String),
}

/// Events emitted by the worker for monitoring/logging.
#[derive(Debug, Clone)]
pub enum WorkerEvent<'a> {
    Started {
        worker_id: &'a str,
        slots: usize,
    },
    Polling {
        slot: usize,
    },
    JobClaimed {
        slot: usize,
        job: &'a Job,
    },
    Throttled {
        slot: usize,
        job_id: &'a str,
        delay: Duration,
    },
    JobCompleted {
        slot: usize,
        job_id: &'a str,
    },
    JobFailed {
        slot: usize,
        job_id: &'a str,
        error: &'a str,
        will_retry: bool,
    },
    Discovered {
        job_id: &'a str,
        university_id: &'a str,
        codes: usize,
        enqueued: u64,
    },
    ShuttingDown {
        worker_id: &'a str,
        jobs_released: u64,
    },
    Stopped {
        worker_id: &'a str,
        sessions_destroyed: usize,
    },
}

/// Trait for receiving worker events (decoupled logging).
pub trait WorkerReporter: Send + Sync {
    fn report(&self, event: WorkerEvent<'_>) {
        let _ = event;
    }
}

/// Reporter that uses the `tracing` crate.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingWorkerReporter;

impl WorkerReporter for TracingWorkerReporter {
    fn report(&self, event: WorkerEvent<'_>) {
        match event {
            WorkerEvent::Started { worker_id, slots } => {
                tracing::info!(%worker_id, slots, "Worker started");
            }
            WorkerEvent::Polling { slot } => {
                tracing::trace!(slot, "Polling for jobs");
            }
            WorkerEvent::JobClaimed { slot, job } => {
                tracing::info!(
                    slot,
                    job_id = %job.id,
                    kind = %job.kind,
                    attempt = job.attempts_made + 1,
                    max_attempts = job.max_attempts,
                    "Job claimed"
                );
            }
            WorkerEvent::Throttled {
                slot,
                job_id,
                delay,
            } => {
                tracing::warn!(
                    slot,
                    %job_id,
                    delay_secs = delay.as_secs(),
                    "Throttling before job"
                );
            }
            WorkerEvent::JobCompleted { slot, job_id } => {
                tracing::info!(slot, %job_id, "Job completed");
            }
            WorkerEvent::JobFailed {
                slot,
                job_id,
                error,
                will_retry,
            } => {
                tracing::warn!(slot, %job_id, %error, %will_retry, "Job failed");
            }
            WorkerEvent::Discovered {
                job_id,
                university_id,
                codes,
                enqueued,
            } => {
                tracing::info!(%job_id, %university_id, codes, enqueued, "Discovery fanned out");
            }
            WorkerEvent::ShuttingDown {
                worker_id,
                jobs_released,
            } => {
                tracing::info!(%worker_id, %jobs_released, "Worker shutting down");
            }
            WorkerEvent::Stopped {
                worker_id,
                sessions_destroyed,
            } => {
                tracing::info!(%worker_id, sessions_destroyed, "Worker stopped");
            }
        }
    }
}

/// Worker that runs `concurrency` execution slots against one queue, sharing
/// a browser pool and a throttle controller.
pub struct WorkerService<Q, L, D, S>
where
    Q: JobQueue,
    L: SessionLauncher,
    D: Discoverer<L::Session>,
    S: UnitScraper<L::Session>,
{
    queue: Q,
    pool: BrowserPool<L>,
    discoverer: D,
    scraper: S,
    throttle: Arc<ThrottleController>,
    fanout: FanoutPipeline<Q>,
    config: WorkerConfig,
}

impl<Q, L, D, S> WorkerService<Q, L, D, S>
where
    Q: JobQueue,
    L: SessionLauncher,
    D: Discoverer<L::Session>,
    S: UnitScraper<L::Session>,
{
    pub fn new(
        queue: Q,
        pool: BrowserPool<L>,
        discoverer: D,
        scraper: S,
        throttle: Arc<ThrottleController>,
        fanout: FanoutPipeline<Q>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            pool,
            discoverer,
            scraper,
            throttle,
            fanout,
            config,
        }
    }

    pub fn pool(&self) -> &BrowserPool<L> {
        &self.pool
    }

    pub fn throttle(&self) -> &ThrottleController {
        &self.throttle
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run every slot until cancellation, then hand claimed jobs back to the
    /// queue and drain the pool.
    pub async fn run<WR: WorkerReporter>(
        &self,
        cancel_token: CancellationToken,
        reporter: &WR,
    ) -> Result<(), AppError> {
        reporter.report(WorkerEvent::Started {
            worker_id: &self.config.worker_id,
            slots: self.config.concurrency,
        });

        if let Err(e) = self.pool.warm_up().await {
            tracing::warn!(error = %e, "Failed to pre-launch browser sessions");
        }

        let slots = (0..self.config.concurrency)
            .map(|slot| self.run_slot(slot, &cancel_token, reporter));
        tokio::join!(
            join_all(slots),
            self.pool.run_maintenance(cancel_token.clone())
        );

        // Graceful shutdown: release all claimed jobs
        let released = match self.queue.release_worker_jobs(&self.config.worker_id).await {
            Ok(n) => n,
            Err(e) => {
                tracing::error!(error = %e, "Failed to release claimed jobs");
                0
            }
        };
        reporter.report(WorkerEvent::ShuttingDown {
            worker_id: &self.config.worker_id,
            jobs_released: released,
        });

        let destroyed = self.pool.drain().await;
        reporter.report(WorkerEvent::Stopped {
            worker_id: &self.config.worker_id,
            sessions_destroyed: destroyed,
        });

        Ok(())
    }

    async fn run_slot<WR: WorkerReporter>(
        &self,
        slot: usize,
        cancel_token: &CancellationToken,
        reporter: &WR,
    ) {
        loop {
            if cancel_token.is_cancelled() {
                break;
            }

            reporter.report(WorkerEvent::Polling { slot });

            match self.queue.claim_job(&self.config.worker_id).await {
                Ok(Some(job)) => {
                    reporter.report(WorkerEvent::JobClaimed { slot, job: &job });

                    // Shutdown may have arrived while the claim was in flight.
                    let proceed = !cancel_token.is_cancelled()
                        && self.throttle_gate(slot, &job, cancel_token, reporter).await;
                    if !proceed {
                        if let Err(e) = self.queue.release_job(&job.id).await {
                            tracing::error!(job_id = %job.id, error = %e, "Failed to release job");
                        }
                        break;
                    }
                    self.process_job(slot, &job, reporter).await;
                }
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
                Err(e) => {
                    tracing::error!(slot, error = %e, "Failed to claim job");
                    tokio::select! {
                        () = tokio::time::sleep(self.config.poll_interval * 2) => {}
                        () = cancel_token.cancelled() => break,
                    }
                }
            }
        }
    }

    /// Sleep out the throttle pause, if any, before a scrape job. Returns
    /// `false` when cancelled mid-pause.
    async fn throttle_gate<WR: WorkerReporter>(
        &self,
        slot: usize,
        job: &Job,
        cancel_token: &CancellationToken,
        reporter: &WR,
    ) -> bool {
        if job.kind != JobKind::Scrape {
            return true;
        }
        let Some(delay) = self.throttle.pause_before_job() else {
            return true;
        };

        reporter.report(WorkerEvent::Throttled {
            slot,
            job_id: &job.id,
            delay,
        });
        tokio::select! {
            () = tokio::time::sleep(delay) => true,
            () = cancel_token.cancelled() => false,
        }
    }

    /// Execute a claimed job and acknowledge its outcome to the queue.
    pub async fn process_job<WR: WorkerReporter>(
        &self,
        slot: usize,
        job: &Job,
        reporter: &WR,
    ) -> Outcome {
        let outcome = self.execute(job, reporter).await;

        match &outcome {
            Outcome::Success => {
                if let Err(e) = self.queue.complete_job(&job.id).await {
                    tracing::error!(job_id = %job.id, error = %e, "Failed to mark job completed");
                }
                reporter.report(WorkerEvent::JobCompleted {
                    slot,
                    job_id: &job.id,
                });
            }
            Outcome::RetryableFailure(error) => self.fail(slot, job, error, true, reporter).await,
            Outcome::FatalFailure(error) => self.fail(slot, job, error, false, reporter).await,
        }
        outcome
    }

    async fn fail<WR: WorkerReporter>(
        &self,
        slot: usize,
        job: &Job,
        error: &str,
        retryable: bool,
        reporter: &WR,
    ) {
        let will_retry = match self.queue.fail_job(&job.id, error, retryable).await {
            Ok(state) => state == JobState::Delayed,
            Err(e) => {
                tracing::error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
                false
            }
        };
        reporter.report(WorkerEvent::JobFailed {
            slot,
            job_id: &job.id,
            error,
            will_retry,
        });
    }

    async fn execute<WR: WorkerReporter>(&self, job: &Job, reporter: &WR) -> Outcome {
        match job.kind {
            JobKind::Scrape => self.run_scrape(job).await,
            JobKind::Discovery => self.run_discovery(job, reporter).await,
        }
    }

    async fn run_scrape(&self, job: &Job) -> Outcome {
        let unit_code = match job.unit_code() {
            Ok(code) => code,
            Err(e) => return Outcome::FatalFailure(e.to_string()),
        };

        let lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => return Outcome::RetryableFailure(e.to_string()),
        };
        let result = self
            .scraper
            .scrape_unit(job.university_id(), unit_code, &*lease)
            .await;

        let health = match &result {
            Err(failure) if failure.kind == ScrapeFailureKind::Timeout => SessionHealth::Suspect,
            _ => SessionHealth::Healthy,
        };
        self.pool.release(lease, health).await;

        match result {
            Ok(()) => {
                self.throttle.record_success();
                Outcome::Success
            }
            Err(failure) => {
                if failure.kind.is_transient() {
                    let state = self.throttle.record_blocking();
                    tracing::warn!(
                        job_id = %job.id,
                        kind = %failure.kind,
                        consecutive = state.consecutive_blocking_errors,
                        "Blocking failure recorded"
                    );
                }
                Outcome::RetryableFailure(failure.to_string())
            }
        }
    }

    async fn run_discovery<WR: WorkerReporter>(&self, job: &Job, reporter: &WR) -> Outcome {
        let university_id = job.university_id();

        let lease = match self.pool.acquire().await {
            Ok(lease) => lease,
            Err(e) => return Outcome::RetryableFailure(e.to_string()),
        };
        let discovered = self.discoverer.discover(university_id, &*lease).await;
        self.pool.release(lease, SessionHealth::Healthy).await;

        let codes = match discovered {
            Ok(codes) => codes,
            Err(e) if e.is_retryable() => return Outcome::RetryableFailure(e.to_string()),
            Err(e) => return Outcome::FatalFailure(e.to_string()),
        };

        match self.fanout.fan_out(university_id, &codes, None).await {
            Ok(summary) => {
                reporter.report(WorkerEvent::Discovered {
                    job_id: &job.id,
                    university_id,
                    codes: codes.len(),
                    enqueued: summary.enqueued,
                });
                Outcome::Success
            }
            Err(e) => Outcome::RetryableFailure(e.to_string()),
        }
    }
}
