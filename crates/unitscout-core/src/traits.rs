use std::fmt;
use std::future::Future;

use crate::error::AppError;

/// Creates and destroys the expensive execution handles held by the
/// [`BrowserPool`](crate::pool::BrowserPool).
pub trait SessionLauncher: Send + Sync {
    type Session: Send + Sync;

    /// Start a new session. This is the slowest and most failure-prone step
    /// of the pipeline.
    fn launch(&self) -> impl Future<Output = Result<Self::Session, AppError>> + Send;

    /// Tear a session down. Must not fail; implementations log and move on.
    fn destroy(&self, session: Self::Session) -> impl Future<Output = ()> + Send;
}

/// Enumerates the candidate unit codes of one university.
pub trait Discoverer<S>: Send + Sync {
    fn discover(
        &self,
        university_id: &str,
        session: &S,
    ) -> impl Future<Output = Result<Vec<String>, AppError>> + Send;
}

/// Fetches and processes the page of one unit.
pub trait UnitScraper<S>: Send + Sync {
    fn scrape_unit(
        &self,
        university_id: &str,
        unit_code: &str,
        session: &S,
    ) -> impl Future<Output = Result<(), ScrapeFailure>> + Send;
}

/// Why a scrape attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScrapeFailureKind {
    /// HTTP 429/403 or a block page.
    RateLimited,
    Timeout,
    NavigationFailed,
    Other,
}

impl ScrapeFailureKind {
    /// Transient failures signal that the source site is blocking the
    /// crawler; they feed the throttle controller.
    pub fn is_transient(&self) -> bool {
        !matches!(self, ScrapeFailureKind::Other)
    }

    /// Classify free-text error messages (e.g. CDP error strings) by the
    /// signatures source sites and browsers use for blocking.
    pub fn classify_message(message: &str) -> Self {
        let msg = message.to_lowercase();
        if msg.contains("429")
            || msg.contains("403")
            || msg.contains("too many requests")
            || msg.contains("forbidden")
            || msg.contains("rate limit")
        {
            ScrapeFailureKind::RateLimited
        } else if msg.contains("timeout") || msg.contains("timed out") {
            ScrapeFailureKind::Timeout
        } else if msg.contains("navigation") || msg.contains("net::err_") {
            ScrapeFailureKind::NavigationFailed
        } else {
            ScrapeFailureKind::Other
        }
    }
}

impl fmt::Display for ScrapeFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ScrapeFailureKind::RateLimited => "rate_limited",
            ScrapeFailureKind::Timeout => "timeout",
            ScrapeFailureKind::NavigationFailed => "navigation_failed",
            ScrapeFailureKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// Failed scrape attempt, tagged with its cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapeFailure {
    pub kind: ScrapeFailureKind,
    pub message: String,
}

impl ScrapeFailure {
    pub fn new(kind: ScrapeFailureKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        Self {
            kind: ScrapeFailureKind::classify_message(&message),
            message,
        }
    }
}

impl fmt::Display for ScrapeFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.kind, self.message)
    }
}

impl std::error::Error for ScrapeFailure {}

impl From<AppError> for ScrapeFailure {
    fn from(err: AppError) -> Self {
        let kind = match &err {
            AppError::RateLimited(_) => ScrapeFailureKind::RateLimited,
            AppError::Timeout(_) => ScrapeFailureKind::Timeout,
            AppError::NavigationFailed(_) => ScrapeFailureKind::NavigationFailed,
            _ => ScrapeFailureKind::Other,
        };
        Self::new(kind, err.to_string())
    }
}
