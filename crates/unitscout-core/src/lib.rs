pub mod config;
pub mod error;
pub mod fanout;
pub mod job;
pub mod job_queue;
pub mod pool;
pub mod scheduler;
pub mod throttle;
pub mod traits;
pub mod worker;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::CrawlerConfig;
pub use error::AppError;
pub use fanout::{FanoutConfig, FanoutPipeline, FanoutSummary};
pub use job::{
    BackoffPolicy, Job, JobKind, JobPayload, JobState, NewJob, QueueCounts, WorkerConfig,
    discovery_job_id, scrape_job_id,
};
pub use job_queue::JobQueue;
pub use pool::{BrowserPool, Lease, PoolConfig, PoolStats, SessionHealth};
pub use scheduler::CrawlScheduler;
pub use throttle::{ThrottleConfig, ThrottleController, ThrottleState};
pub use traits::{Discoverer, ScrapeFailure, ScrapeFailureKind, SessionLauncher, UnitScraper};
pub use worker::{Outcome, TracingWorkerReporter, WorkerEvent, WorkerReporter, WorkerService};
