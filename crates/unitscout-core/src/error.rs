use thiserror::Error;

/// Application-wide error types for unitscout.
#[derive(Error, Debug)]
pub enum AppError {
    /// Page navigation failed (DNS, connection reset, aborted load).
    #[error("Navigation failed: {0}")]
    NavigationFailed(String),

    /// Operation timed out.
    #[error("Timed out after {0} seconds")]
    Timeout(u64),

    /// The source site rate-limited or blocked the request (HTTP 429/403).
    #[error("Rate limited by source site: {0}")]
    RateLimited(String),

    /// Browser session could not be launched or misbehaved.
    #[error("Browser error: {0}")]
    BrowserError(String),

    /// No browser session became available within the acquire timeout.
    #[error("Browser pool exhausted after waiting {waited_ms}ms")]
    PoolExhausted { waited_ms: u64 },

    /// The browser pool is draining and no longer hands out sessions.
    #[error("Browser pool is closed")]
    PoolClosed,

    /// Fan-out would push the queue past its configured ceiling.
    #[error("Queue capacity exceeded: {current} queued + {requested} requested > {limit}")]
    CapacityExceeded {
        current: u64,
        requested: u64,
        limit: u64,
    },

    /// Job is malformed (e.g. scrape job without a unit code).
    #[error("Invalid job: {0}")]
    InvalidJob(String),

    /// Job id does not exist in the queue.
    #[error("Job not found: {0}")]
    JobNotFound(String),

    /// JSON serialization/deserialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Invalid or missing configuration.
    #[error("Configuration error: {0}")]
    ConfigError(String),

    /// Generic error.
    #[error("{0}")]
    Generic(String),
}

impl AppError {
    /// Returns true if this error signals the source site is pushing back on
    /// the crawler (rate limiting, timeouts, failed navigation).
    pub fn is_blocking(&self) -> bool {
        matches!(
            self,
            AppError::RateLimited(_) | AppError::Timeout(_) | AppError::NavigationFailed(_)
        )
    }

    /// Returns true if retrying the job later may succeed.
    ///
    /// Malformed jobs and configuration problems are permanent.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            AppError::InvalidJob(_) | AppError::ConfigError(_) | AppError::SerializationError(_)
        )
    }
}
